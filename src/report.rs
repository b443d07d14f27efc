//! Per-student report (compte-rendu) model.
//!
//! Rendering to a printable document happens in the UI process. Here the
//! model is assembled from live engine values and cached, as JSON, in the
//! report row so a renderer can pick it up without recomputing.

use crate::batch::{run_items, BatchOutcome, Progress};
use crate::calc::aggregate::{correction_progress, distribution_stats, grade_distribution};
use crate::calc::completion::sheet_is_complete;
use crate::calc::scoring::{final_grade_aligned, scale_total};
use crate::store::{GradeStore, SqliteStore, Student, StoreError, StoreResult};
use rusqlite::Connection;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportLine {
    pub question_id: String,
    pub number: String,
    pub title: String,
    pub points: f64,
    pub points_max: f64,
    pub coefficient: f64,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportModel {
    pub assignment_id: String,
    pub assignment_name: String,
    pub date: String,
    pub student_id: String,
    pub student_name: String,
    pub lines: Vec<ReportLine>,
    pub final_grade: f64,
    pub scale_total: f64,
    pub class_average: Option<f64>,
    pub class_min: Option<f64>,
    pub class_max: Option<f64>,
    pub appreciation: String,
}

/// `Ok(None)` when the student is not fully graded on the assignment.
pub fn build_report_model<S: GradeStore>(
    store: &S,
    assignment_id: &str,
    student_id: &str,
) -> StoreResult<Option<ReportModel>> {
    let assignment = store
        .get_assignment(assignment_id)?
        .ok_or_else(|| StoreError::not_found("assignment", assignment_id))?;
    let student = store
        .get_student(student_id)?
        .ok_or_else(|| StoreError::not_found("student", student_id))?;

    let questions = store.list_questions(assignment_id)?;
    let aligned = store.list_scores(student_id, assignment_id)?;
    if !sheet_is_complete(&aligned) {
        return Ok(None);
    }
    let Some(final_grade) = final_grade_aligned(&questions, &aligned) else {
        return Ok(None);
    };

    let lines = questions
        .iter()
        .zip(aligned.iter().flatten())
        .map(|(q, s)| ReportLine {
            question_id: q.id.clone(),
            number: q.number.clone(),
            title: q.title.clone(),
            points: s.points,
            points_max: q.points_max,
            coefficient: q.coefficient,
            comment: s.comment.clone(),
        })
        .collect();

    let stats = distribution_stats(&grade_distribution(store, assignment_id)?);
    let appreciation = store
        .get_report(assignment_id, student_id)?
        .map(|r| r.appreciation)
        .unwrap_or_default();

    Ok(Some(ReportModel {
        assignment_id: assignment.id,
        assignment_name: assignment.name,
        date: assignment.date,
        student_id: student.id.clone(),
        student_name: student.display_name(),
        lines,
        final_grade,
        scale_total: scale_total(&questions),
        class_average: stats.mean,
        class_min: stats.min,
        class_max: stats.max,
        appreciation,
    }))
}

/// Builds the model and stores it as the report's cached document, keeping
/// the appreciation already on file.
pub fn cache_report_document(
    conn: &Connection,
    assignment_id: &str,
    student_id: &str,
) -> anyhow::Result<ReportModel> {
    let tx = conn.unchecked_transaction()?;
    let store = SqliteStore::new(&tx);
    let Some(model) = build_report_model(&store, assignment_id, student_id)? else {
        anyhow::bail!("student is not fully graded");
    };
    let document = serde_json::to_vec(&model)?;
    store.upsert_report(assignment_id, student_id, &model.appreciation, Some(&document))?;
    tx.commit()?;
    Ok(model)
}

/// One report per fully graded student. Fails outright only when nobody is
/// graded yet.
pub fn generate_reports<P: FnMut(Progress)>(
    conn: &Connection,
    assignment_id: &str,
    progress: P,
) -> anyhow::Result<BatchOutcome> {
    let graded: Vec<Student> = correction_progress(&SqliteStore::new(conn), assignment_id)?
        .into_iter()
        .filter(|p| p.complete && p.total > 0)
        .map(|p| p.student)
        .collect();
    if graded.is_empty() {
        anyhow::bail!("no student is fully graded for this assignment");
    }
    Ok(run_items(
        &graded,
        Student::display_name,
        |s| cache_report_document(conn, assignment_id, &s.id).map(|_| ()),
        progress,
    ))
}
