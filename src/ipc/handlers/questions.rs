use crate::calc::recalc::recalculate_assignment_average;
use crate::calc::scoring::Question;
use crate::calc::validate::validate_question;
use crate::ipc::error::{respond, HandlerErr, HandlerResult};
use crate::ipc::handlers::assignments::{insert_question, require_assignment};
use crate::ipc::helpers::{f64_param, opt_f64_param, require_conn, str_param, to_json};
use crate::ipc::types::{AppState, Request};
use crate::store::{GradeStore, SqliteStore};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

pub(crate) fn require_question(
    conn: &Connection,
    question_id: &str,
) -> Result<Question, HandlerErr> {
    conn.query_row(
        "SELECT id, assignment_id, number, title, points_max, coefficient
         FROM questions WHERE id = ?",
        [question_id],
        |r| {
            Ok(Question {
                id: r.get(0)?,
                assignment_id: r.get(1)?,
                number: r.get(2)?,
                title: r.get(3)?,
                points_max: r.get(4)?,
                coefficient: r.get(5)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| {
        HandlerErr::new("not_found", "question not found")
            .with_details(json!({ "questionId": question_id }))
    })
}

fn questions_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let assignment_id = str_param(req, "assignmentId")?;
    let store = SqliteStore::new(conn);
    require_assignment(&store, assignment_id)?;
    Ok(json!({ "questions": to_json(&store.list_questions(assignment_id)?)? }))
}

fn questions_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let assignment_id = str_param(req, "assignmentId")?;
    let number = str_param(req, "number")?;
    let title = str_param(req, "title")?;
    let points_max = f64_param(req, "pointsMax")?;
    let coefficient = opt_f64_param(req, "coefficient")?.unwrap_or(1.0);
    validate_question(number, title, points_max, coefficient)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let store = SqliteStore::new(&tx);
    require_assignment(&store, assignment_id)?;
    let question_id = insert_question(
        &tx,
        assignment_id,
        number.trim(),
        title.trim(),
        points_max,
        coefficient,
    )?;
    // Students complete before the new question no longer are.
    let average = recalculate_assignment_average(&store, assignment_id)?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "questionId": question_id, "average": average }))
}

fn questions_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let question_id = str_param(req, "questionId")?;
    let number = str_param(req, "number")?;
    let title = str_param(req, "title")?;
    let points_max = f64_param(req, "pointsMax")?;
    let coefficient = opt_f64_param(req, "coefficient")?.unwrap_or(1.0);
    validate_question(number, title, points_max, coefficient)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let question = require_question(&tx, question_id)?;

    let over_max: i64 = tx.query_row(
        "SELECT COUNT(*) FROM scores WHERE question_id = ? AND points > ?",
        (question_id, points_max),
        |r| r.get(0),
    )?;
    if over_max > 0 {
        return Err(HandlerErr::new(
            "constraint_violation",
            "recorded scores exceed the new maximum",
        )
        .with_details(json!({ "scoreCount": over_max, "pointsMax": points_max })));
    }

    tx.execute(
        "UPDATE questions SET number = ?, title = ?, points_max = ?, coefficient = ?
         WHERE id = ?",
        (number.trim(), title.trim(), points_max, coefficient, question_id),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    let average = recalculate_assignment_average(&SqliteStore::new(&tx), &question.assignment_id)?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "ok": true, "average": average }))
}

fn questions_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let question_id = str_param(req, "questionId")?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let question = require_question(&tx, question_id)?;
    let store = SqliteStore::new(&tx);
    let deleted_scores = store.delete_scores_for_question(question_id)?;
    tx.execute("DELETE FROM questions WHERE id = ?", [question_id])
        .map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string())
                .with_details(json!({ "table": "questions" }))
        })?;
    let average = recalculate_assignment_average(&store, &question.assignment_id)?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "ok": true, "deletedScores": deleted_scores, "average": average }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "questions.list" => questions_list(state, req),
        "questions.create" => questions_create(state, req),
        "questions.update" => questions_update(state, req),
        "questions.delete" => questions_delete(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
