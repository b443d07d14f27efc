use crate::calc::aggregate::grade_for_pair;
use crate::calc::completion::{entered_count, is_complete};
use crate::calc::recalc::recalculate_assignment_average;
use crate::calc::scoring::{scale_total, validate_score};
use crate::ipc::error::{respond, HandlerErr, HandlerResult};
use crate::ipc::handlers::assignments::require_assignment;
use crate::ipc::handlers::questions::require_question;
use crate::ipc::helpers::{f64_param, opt_str_param, require_conn, str_param};
use crate::ipc::types::{AppState, Request};
use crate::store::{Assignment, GradeStore, SqliteStore, Student};
use serde_json::json;
use std::collections::HashMap;

pub(crate) fn require_student_on(
    store: &SqliteStore<'_>,
    student_id: &str,
    assignment: &Assignment,
) -> Result<Student, HandlerErr> {
    let student = store.get_student(student_id)?.ok_or_else(|| {
        HandlerErr::new("not_found", "student not found")
            .with_details(json!({ "studentId": student_id }))
    })?;
    if student.class_id != assignment.class_id {
        return Err(HandlerErr::new(
            "constraint_violation",
            "student is not in the assignment's class",
        )
        .with_details(json!({ "studentId": student_id, "assignmentId": assignment.id })));
    }
    Ok(student)
}

fn scores_get(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let student_id = str_param(req, "studentId")?;
    let assignment_id = str_param(req, "assignmentId")?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let store = SqliteStore::new(&tx);
    let assignment = require_assignment(&store, assignment_id)?;
    require_student_on(&store, student_id, &assignment)?;

    let questions = store.list_questions(assignment_id)?;
    let aligned = store.list_scores(student_id, assignment_id)?;
    let final_grade = grade_for_pair(&store, student_id, assignment_id)?;
    let lines: Vec<serde_json::Value> = questions
        .iter()
        .zip(aligned.iter())
        .map(|(q, s)| {
            json!({
                "questionId": q.id,
                "number": q.number,
                "title": q.title,
                "pointsMax": q.points_max,
                "coefficient": q.coefficient,
                "points": s.as_ref().map(|e| e.points),
                "comment": s.as_ref().and_then(|e| e.comment.clone()),
            })
        })
        .collect();

    Ok(json!({
        "lines": lines,
        "entered": entered_count(&aligned),
        "complete": is_complete(&store, student_id, assignment_id)?,
        "finalGrade": final_grade,
        "scaleTotal": scale_total(&questions),
    }))
}

fn scores_upsert(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let student_id = str_param(req, "studentId")?;
    let question_id = str_param(req, "questionId")?;
    let points = f64_param(req, "points")?;
    let comment = opt_str_param(req, "comment")?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let question = require_question(&tx, question_id)?;
    validate_score(points, question.points_max).map_err(|e| {
        HandlerErr::from(e).with_details(json!({
            "kind": e.code(),
            "questionId": question_id,
            "pointsMax": question.points_max,
        }))
    })?;

    let store = SqliteStore::new(&tx);
    let assignment = require_assignment(&store, &question.assignment_id)?;
    require_student_on(&store, student_id, &assignment)?;
    store.upsert_score(student_id, question_id, points, comment)?;
    let average = recalculate_assignment_average(&store, &assignment.id)?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "ok": true, "average": average }))
}

struct SheetEntry<'a> {
    question_id: &'a str,
    points: f64,
    comment: Option<&'a str>,
}

fn parse_sheet(req: &Request) -> Result<Vec<SheetEntry<'_>>, HandlerErr> {
    let Some(items) = req.params.get("scores").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::new("bad_params", "missing scores"));
    };
    let mut out = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let question_id = item.get("questionId").and_then(|v| v.as_str());
        let points = item.get("points").and_then(|v| v.as_f64());
        let (Some(question_id), Some(points)) = (question_id, points) else {
            return Err(HandlerErr::new(
                "bad_params",
                "scores[] needs questionId and numeric points",
            )
            .with_details(json!({ "index": i })));
        };
        out.push(SheetEntry {
            question_id,
            points,
            comment: item.get("comment").and_then(|v| v.as_str()),
        });
    }
    Ok(out)
}

/// Saves one student's whole sheet. Every entry is checked before anything
/// is written; one bad entry rejects the sheet.
fn scores_save_sheet(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let student_id = str_param(req, "studentId")?;
    let assignment_id = str_param(req, "assignmentId")?;
    let appreciation = opt_str_param(req, "appreciation")?;
    let entries = parse_sheet(req)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let store = SqliteStore::new(&tx);
    let assignment = require_assignment(&store, assignment_id)?;
    require_student_on(&store, student_id, &assignment)?;

    let maxima: HashMap<String, f64> = store
        .list_questions(assignment_id)?
        .into_iter()
        .map(|q| (q.id, q.points_max))
        .collect();
    for (i, entry) in entries.iter().enumerate() {
        let Some(&max) = maxima.get(entry.question_id) else {
            return Err(HandlerErr::new("not_found", "question not found on assignment")
                .with_details(json!({ "index": i, "questionId": entry.question_id })));
        };
        validate_score(entry.points, max).map_err(|e| {
            HandlerErr::from(e).with_details(json!({
                "kind": e.code(),
                "index": i,
                "questionId": entry.question_id,
                "pointsMax": max,
            }))
        })?;
    }

    for entry in &entries {
        store.upsert_score(student_id, entry.question_id, entry.points, entry.comment)?;
    }
    if let Some(text) = appreciation {
        // Scores moved, so any cached document is stale and gets dropped.
        store.upsert_report(assignment_id, student_id, text.trim(), None)?;
    }
    let average = recalculate_assignment_average(&store, assignment_id)?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "saved": entries.len(), "average": average }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "scores.get" => scores_get(state, req),
        "scores.upsert" => scores_upsert(state, req),
        "scores.saveSheet" => scores_save_sheet(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
