//! Background batches (full recalculation, report generation).
//!
//! A batch runs to completion on its own thread with its own connection.
//! Item failures are recorded and the loop moves on; the interactive side
//! polls the shared status.

use crate::calc::recalc;
use crate::report;
use crate::store::{GradeStore, SqliteStore};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemFailure {
    pub item: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub percent: u8,
    pub current: String,
    pub processed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub processed: usize,
    pub succeeded: usize,
    pub failures: Vec<ItemFailure>,
}

fn percent_of(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done * 100) / total).min(100) as u8
}

/// Runs `work` over every item. A failing item is recorded in the outcome
/// and never stops the loop.
pub fn run_items<T, L, W, P>(items: &[T], label: L, mut work: W, mut progress: P) -> BatchOutcome
where
    L: Fn(&T) -> String,
    W: FnMut(&T) -> anyhow::Result<()>,
    P: FnMut(Progress),
{
    let total = items.len();
    let mut outcome = BatchOutcome::default();
    for (i, item) in items.iter().enumerate() {
        let name = label(item);
        progress(Progress {
            percent: percent_of(i, total),
            current: name.clone(),
            processed: i,
            total,
        });
        match work(item) {
            Ok(()) => outcome.succeeded += 1,
            Err(e) => {
                warn!(item = %name, error = %e, "batch item failed");
                outcome.failures.push(ItemFailure {
                    item: name,
                    message: format!("{e:#}"),
                });
            }
        }
        outcome.processed += 1;
    }
    progress(Progress {
        percent: 100,
        current: String::new(),
        processed: total,
        total,
    });
    outcome
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobKind {
    RecalculateAll,
    GenerateReports { assignment_id: String },
}

impl JobKind {
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::RecalculateAll => "recalculateAll",
            JobKind::GenerateReports { .. } => "generateReports",
        }
    }

    fn assignment_id(&self) -> Option<&str> {
        match self {
            JobKind::RecalculateAll => None,
            JobKind::GenerateReports { assignment_id } => Some(assignment_id),
        }
    }

    /// A full sweep touches every assignment, so it conflicts with anything.
    fn conflicts_with(&self, other: &JobKind) -> bool {
        match (self.assignment_id(), other.assignment_id()) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Running,
    Finished,
    FinishedWithWarnings,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub id: String,
    pub kind: String,
    pub assignment_id: Option<String>,
    pub state: JobState,
    pub percent: u8,
    pub current: String,
    pub processed: usize,
    pub total: usize,
    pub failures: Vec<ItemFailure>,
    pub messages: Vec<String>,
    pub error: Option<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
}

impl JobStatus {
    fn new(id: String, kind: &JobKind) -> Self {
        Self {
            id,
            kind: kind.name().to_string(),
            assignment_id: kind.assignment_id().map(str::to_string),
            state: JobState::Running,
            percent: 0,
            current: String::new(),
            processed: 0,
            total: 0,
            failures: Vec::new(),
            messages: Vec::new(),
            error: None,
            started_at: crate::db::now_rfc3339(),
            finished_at: None,
        }
    }

    /// Keeps the newest `MAX_MESSAGES` lines.
    fn push_message(&mut self, message: String) {
        if self.messages.len() >= MAX_MESSAGES {
            let excess = self.messages.len() + 1 - MAX_MESSAGES;
            self.messages.drain(..excess);
        }
        self.messages.push(message);
    }

    fn apply_progress(&mut self, p: &Progress) {
        self.percent = p.percent;
        self.processed = p.processed;
        self.total = p.total;
        if !p.current.is_empty() {
            self.push_message(format!("[{}%] {}", p.percent, p.current));
        }
        self.current = p.current.clone();
    }

    fn finish(&mut self, result: anyhow::Result<BatchOutcome>) {
        self.finished_at = Some(crate::db::now_rfc3339());
        match result {
            Ok(outcome) => {
                self.percent = 100;
                self.processed = outcome.processed;
                self.state = if outcome.failures.is_empty() {
                    JobState::Finished
                } else {
                    JobState::FinishedWithWarnings
                };
                self.push_message(format!(
                    "{} of {} item(s) done, {} failure(s)",
                    outcome.succeeded,
                    outcome.processed,
                    outcome.failures.len()
                ));
                self.failures = outcome.failures;
            }
            Err(e) => {
                self.state = JobState::Failed;
                self.error = Some(format!("{e:#}"));
            }
        }
    }
}

const MAX_MESSAGES: usize = 50;
/// Finished jobs kept for `batch.status` / `batch.list`; older ones are dropped.
const MAX_FINISHED_JOBS: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchBusy {
    pub running_job_id: String,
}

type SharedStatus = Arc<Mutex<JobStatus>>;

fn lock(status: &SharedStatus) -> MutexGuard<'_, JobStatus> {
    status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
pub struct BatchRegistry {
    jobs: HashMap<String, (JobKind, SharedStatus)>,
    order: Vec<String>,
}

impl BatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns the job on a worker thread. `open` runs on that thread and
    /// must hand back a fresh connection to the workspace.
    pub fn start<O>(&mut self, kind: JobKind, open: O) -> Result<String, BatchBusy>
    where
        O: FnOnce() -> anyhow::Result<Connection> + Send + 'static,
    {
        if let Some(busy) = self.busy_with(&kind) {
            return Err(busy);
        }
        self.prune_finished();

        let job_id = Uuid::new_v4().to_string();
        let status = Arc::new(Mutex::new(JobStatus::new(job_id.clone(), &kind)));
        self.jobs
            .insert(job_id.clone(), (kind.clone(), Arc::clone(&status)));
        self.order.push(job_id.clone());

        info!(job = %job_id, kind = kind.name(), "batch started");
        let worker_status = Arc::clone(&status);
        let spawned = std::thread::Builder::new()
            .name(format!("notad-batch-{}", kind.name()))
            .spawn(move || {
                let result = open().and_then(|conn| {
                    run_job(&conn, &kind, |p| lock(&worker_status).apply_progress(&p))
                });
                let mut st = lock(&worker_status);
                st.finish(result);
                info!(
                    job = %st.id,
                    state = ?st.state,
                    failures = st.failures.len(),
                    "batch finished"
                );
            });
        if let Err(e) = spawned {
            lock(&status).finish(Err(anyhow::anyhow!("could not spawn worker: {e}")));
        }
        Ok(job_id)
    }

    /// The running job `kind` would conflict with, if any.
    pub fn busy_with(&self, kind: &JobKind) -> Option<BatchBusy> {
        self.order.iter().find_map(|id| {
            let (running_kind, status) = self.jobs.get(id)?;
            (lock(status).state == JobState::Running && running_kind.conflicts_with(kind)).then(
                || BatchBusy {
                    running_job_id: id.clone(),
                },
            )
        })
    }

    fn prune_finished(&mut self) {
        let finished: Vec<String> = self
            .order
            .iter()
            .filter(|id| {
                self.jobs
                    .get(*id)
                    .is_some_and(|(_, s)| lock(s).state != JobState::Running)
            })
            .cloned()
            .collect();
        if finished.len() < MAX_FINISHED_JOBS {
            return;
        }
        // Make room for the job about to start.
        let drop_count = finished.len() + 1 - MAX_FINISHED_JOBS;
        for id in finished.iter().take(drop_count) {
            self.jobs.remove(id);
        }
        self.order.retain(|id| self.jobs.contains_key(id));
    }

    pub fn status(&self, job_id: &str) -> Option<JobStatus> {
        self.jobs.get(job_id).map(|(_, s)| lock(s).clone())
    }

    pub fn list(&self) -> Vec<JobStatus> {
        self.order
            .iter()
            .filter_map(|id| self.status(id))
            .collect()
    }
}

fn run_job<P: FnMut(Progress)>(
    conn: &Connection,
    kind: &JobKind,
    progress: P,
) -> anyhow::Result<BatchOutcome> {
    match kind {
        JobKind::RecalculateAll => Ok(recalc::recalculate_all(conn, progress)?),
        JobKind::GenerateReports { assignment_id } => {
            let store = SqliteStore::new(conn);
            if store.get_assignment(assignment_id)?.is_none() {
                anyhow::bail!("assignment not found");
            }
            report::generate_reports(conn, assignment_id, progress)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_temp;
    use crate::store::fixtures::*;

    #[test]
    fn failing_items_do_not_stop_the_batch() {
        let items = vec!["a", "b", "c", "d"];
        let mut seen = Vec::new();
        let mut percents = Vec::new();
        let outcome = run_items(
            &items,
            |s| s.to_string(),
            |s| {
                seen.push(s.to_string());
                if *s == "b" {
                    anyhow::bail!("render failed");
                }
                Ok(())
            },
            |p| percents.push(p.percent),
        );
        assert_eq!(seen, vec!["a", "b", "c", "d"]);
        assert_eq!(outcome.processed, 4);
        assert_eq!(outcome.succeeded, 3);
        assert_eq!(
            outcome.failures,
            vec![ItemFailure {
                item: "b".to_string(),
                message: "render failed".to_string(),
            }]
        );
        assert_eq!(percents, vec![0, 25, 50, 75, 100]);
    }

    #[test]
    fn empty_batches_report_full_progress() {
        let items: Vec<u8> = Vec::new();
        let mut last = None;
        let outcome = run_items(&items, |_| String::new(), |_| Ok(()), |p| last = Some(p));
        assert_eq!(outcome, BatchOutcome::default());
        assert_eq!(last.map(|p| p.percent), Some(100));
    }

    #[test]
    fn sweeps_conflict_with_everything_reports_only_per_assignment() {
        let sweep = JobKind::RecalculateAll;
        let a1 = JobKind::GenerateReports {
            assignment_id: "a1".to_string(),
        };
        let a2 = JobKind::GenerateReports {
            assignment_id: "a2".to_string(),
        };
        assert!(sweep.conflicts_with(&a1));
        assert!(a1.conflicts_with(&sweep));
        assert!(a1.conflicts_with(&a1.clone()));
        assert!(!a1.conflicts_with(&a2));
    }

    fn wait_done(registry: &BatchRegistry, job_id: &str) -> JobStatus {
        let mut status = registry.status(job_id).expect("status");
        for _ in 0..200 {
            if status.state != JobState::Running {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
            status = registry.status(job_id).expect("status");
        }
        status
    }

    fn reports_for(assignment_id: &str) -> JobKind {
        JobKind::GenerateReports {
            assignment_id: assignment_id.to_string(),
        }
    }

    #[test]
    fn a_failed_open_marks_the_job_failed() {
        let mut registry = BatchRegistry::new();
        let job_id = registry
            .start(JobKind::RecalculateAll, || anyhow::bail!("disk gone"))
            .expect("start");
        let status = wait_done(&registry, &job_id);
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.error.as_deref(), Some("disk gone"));
    }

    #[test]
    fn a_second_report_batch_on_the_same_assignment_is_busy() {
        let mut registry = BatchRegistry::new();
        let (release, held) = std::sync::mpsc::channel::<()>();
        let first = registry
            .start(reports_for("a1"), move || {
                let _ = held.recv();
                anyhow::bail!("released")
            })
            .expect("start");

        assert_eq!(
            registry.start(reports_for("a1"), || anyhow::bail!("unused")),
            Err(BatchBusy {
                running_job_id: first.clone(),
            })
        );
        assert_eq!(
            registry.busy_with(&JobKind::RecalculateAll),
            Some(BatchBusy {
                running_job_id: first.clone(),
            })
        );
        let other = registry
            .start(reports_for("a2"), || anyhow::bail!("no workspace"))
            .expect("other assignment");

        release.send(()).expect("release");
        assert_eq!(wait_done(&registry, &first).state, JobState::Failed);
        assert_eq!(wait_done(&registry, &other).state, JobState::Failed);
        assert_eq!(registry.busy_with(&reports_for("a1")), None);
        registry
            .start(reports_for("a1"), || anyhow::bail!("again"))
            .expect("free once finished");
    }

    #[test]
    fn one_failing_report_finishes_with_warnings() {
        let conn = open_temp();
        class(&conn, "c1", "Terminale");
        student(&conn, "s1", "c1", "Abel");
        student(&conn, "s2", "c1", "Blanc");
        assignment(&conn, "a1", "c1", "Bac blanc");
        question(&conn, "q1", "a1", "1", 10.0, 1.0);
        score(&conn, "s1", "q1", 8.0);
        score(&conn, "s2", "q1", 6.0);
        conn.execute_batch(
            "CREATE TRIGGER refuse_blanc BEFORE INSERT ON reports
             WHEN NEW.student_id = 's2'
             BEGIN SELECT RAISE(ABORT, 'render failed'); END;",
        )
        .expect("trigger");

        let mut registry = BatchRegistry::new();
        let job_id = registry
            .start(reports_for("a1"), move || Ok(conn))
            .expect("start");
        let status = wait_done(&registry, &job_id);

        assert_eq!(status.state, JobState::FinishedWithWarnings);
        assert_eq!(status.processed, 2);
        assert_eq!(status.percent, 100);
        assert_eq!(status.failures.len(), 1);
        assert_eq!(status.failures[0].item, "Blanc X");
        assert!(status.error.is_none());
        assert!(status
            .messages
            .last()
            .is_some_and(|m| m.contains("1 of 2 item(s) done, 1 failure(s)")));
    }

    #[test]
    fn progress_messages_keep_only_the_newest() {
        let mut status = JobStatus::new("j1".to_string(), &JobKind::RecalculateAll);
        for i in 0..(MAX_MESSAGES + 30) {
            status.apply_progress(&Progress {
                percent: 0,
                current: format!("item {i}"),
                processed: i,
                total: MAX_MESSAGES + 30,
            });
        }
        assert_eq!(status.messages.len(), MAX_MESSAGES);
        assert_eq!(status.messages[0], "[0%] item 30");
        status.finish(Ok(BatchOutcome::default()));
        assert_eq!(status.messages.len(), MAX_MESSAGES);
        assert_eq!(status.messages[0], "[0%] item 31");
    }

    #[test]
    fn old_finished_jobs_are_dropped() {
        let mut registry = BatchRegistry::new();
        let mut ids = Vec::new();
        for _ in 0..(MAX_FINISHED_JOBS + 5) {
            let id = registry
                .start(JobKind::RecalculateAll, || anyhow::bail!("no workspace"))
                .expect("start");
            wait_done(&registry, &id);
            ids.push(id);
        }
        assert_eq!(registry.list().len(), MAX_FINISHED_JOBS);
        assert!(registry.status(&ids[0]).is_none());
        assert!(registry.status(&ids[ids.len() - 1]).is_some());
    }
}
