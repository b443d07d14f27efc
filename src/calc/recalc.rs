//! Keeps the cached `assignments.average` column in step with the scores.
//!
//! This is the only writer of that column. Reads never depend on it.

use crate::batch::{run_items, BatchOutcome, Progress};
use crate::calc::aggregate::average_for_assignment;
use crate::store::{Assignment, GradeStore, SqliteStore, StoreError, StoreResult};
use rusqlite::Connection;
use tracing::{debug, info};

pub fn recalculate_assignment_average<S: GradeStore>(
    store: &S,
    assignment_id: &str,
) -> StoreResult<Option<f64>> {
    let average = average_for_assignment(store, assignment_id)?;
    store.write_assignment_average(assignment_id, average)?;
    debug!(assignment = assignment_id, ?average, "assignment average recalculated");
    Ok(average)
}

/// Used when a student joins or leaves a class.
pub fn recalculate_class<S: GradeStore>(store: &S, class_id: &str) -> StoreResult<usize> {
    let assignments = store.list_assignments_in_class(class_id)?;
    for a in &assignments {
        recalculate_assignment_average(store, &a.id)?;
    }
    Ok(assignments.len())
}

fn all_assignments<S: GradeStore>(store: &S) -> StoreResult<Vec<Assignment>> {
    let mut out = Vec::new();
    for c in store.list_classes()? {
        out.extend(store.list_assignments_in_class(&c.id)?);
    }
    Ok(out)
}

/// Full consistency sweep. Each assignment is recomputed in its own
/// transaction; one failing assignment is reported and the sweep goes on.
pub fn recalculate_all<P: FnMut(Progress)>(
    conn: &Connection,
    progress: P,
) -> StoreResult<BatchOutcome> {
    let assignments = all_assignments(&SqliteStore::new(conn))?;
    let outcome = run_items(
        &assignments,
        |a| a.name.clone(),
        |a| {
            let tx = conn.unchecked_transaction()?;
            recalculate_assignment_average(&SqliteStore::new(&tx), &a.id)?;
            tx.commit()?;
            Ok(())
        },
        progress,
    );
    info!(
        assignments = outcome.processed,
        failures = outcome.failures.len(),
        "recalculation sweep done"
    );
    Ok(outcome)
}

/// Deletes every score of the assignment and refreshes its average, all in
/// one transaction. Returns the number of deleted scores and the new average.
pub fn clear_assignment_scores(
    conn: &Connection,
    assignment_id: &str,
) -> StoreResult<(usize, Option<f64>)> {
    let tx = conn.unchecked_transaction()?;
    let store = SqliteStore::new(&tx);
    if store.get_assignment(assignment_id)?.is_none() {
        return Err(StoreError::not_found("assignment", assignment_id));
    }
    let deleted = store.delete_scores_for_assignment(assignment_id)?;
    let average = recalculate_assignment_average(&store, assignment_id)?;
    tx.commit()?;
    info!(assignment = assignment_id, deleted, "assignment scores cleared");
    Ok((deleted, average))
}
