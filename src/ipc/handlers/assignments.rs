use crate::calc::aggregate::{correction_progress, scale_total};
use crate::calc::recalc::{clear_assignment_scores, recalculate_assignment_average};
use crate::calc::validate::{validate_date, validate_name, validate_question};
use crate::db::now_rfc3339;
use crate::ipc::error::{ok, respond, HandlerErr, HandlerResult};
use crate::ipc::helpers::{
    like_pattern, opt_f64_param, opt_str_param, require_conn, str_param, to_json,
};
use crate::ipc::types::{AppState, Request};
use crate::store::{Assignment, GradeStore, SqliteStore};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub(crate) fn require_assignment(
    store: &SqliteStore<'_>,
    assignment_id: &str,
) -> Result<Assignment, HandlerErr> {
    store.get_assignment(assignment_id)?.ok_or_else(|| {
        HandlerErr::new("not_found", "assignment not found")
            .with_details(json!({ "assignmentId": assignment_id }))
    })
}

fn assignment_summary(store: &SqliteStore<'_>, a: &Assignment) -> HandlerResult {
    let questions = store.list_questions(&a.id)?;
    let progress = correction_progress(store, &a.id)?;
    let corrected = progress.iter().filter(|p| p.complete).count();
    let class_name: Option<String> = store
        .conn()
        .query_row("SELECT name FROM classes WHERE id = ?", [&a.class_id], |r| {
            r.get(0)
        })
        .optional()?;
    Ok(json!({
        "id": a.id,
        "classId": a.class_id,
        "className": class_name,
        "name": a.name,
        "date": a.date,
        "scale": a.scale,
        "average": a.average,
        "questionCount": questions.len(),
        "correctedCount": corrected,
        "studentCount": progress.len(),
        "scaleTotal": crate::calc::scoring::scale_total(&questions),
    }))
}

fn handle_assignments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "assignments": [] }));
    };

    let result = (|| -> HandlerResult {
        let class_id = opt_str_param(req, "classId")?;
        let search = like_pattern(opt_str_param(req, "search")?);

        let mut sql = String::from(
            "SELECT id, class_id, name, date, scale, average
             FROM assignments
             WHERE 1=1",
        );
        let mut bind_values: Vec<Value> = Vec::new();
        if let Some(cid) = class_id {
            sql.push_str(" AND class_id = ?");
            bind_values.push(Value::Text(cid.to_string()));
        }
        if let Some(pattern) = search {
            sql.push_str(" AND name LIKE ?");
            bind_values.push(Value::Text(pattern));
        }
        sql.push_str(" ORDER BY date DESC, name, id");

        let tx = conn
            .unchecked_transaction()
            .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
        let assignments = {
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(bind_values), |r| {
                    Ok(Assignment {
                        id: r.get(0)?,
                        class_id: r.get(1)?,
                        name: r.get(2)?,
                        date: r.get(3)?,
                        scale: r.get(4)?,
                        average: r.get(5)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        let store = SqliteStore::new(&tx);
        let mut out = Vec::with_capacity(assignments.len());
        for a in &assignments {
            out.push(assignment_summary(&store, a)?);
        }
        Ok(json!({ "assignments": out }))
    })();
    respond(&req.id, result)
}

fn assignments_get(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let assignment_id = str_param(req, "assignmentId")?;
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let store = SqliteStore::new(&tx);
    let a = require_assignment(&store, assignment_id)?;
    let summary = assignment_summary(&store, &a)?;
    let questions = to_json(&store.list_questions(assignment_id)?)?;
    Ok(json!({ "assignment": summary, "questions": questions }))
}

struct NewQuestion {
    number: String,
    title: String,
    points_max: f64,
    coefficient: f64,
}

fn parse_new_questions(req: &Request) -> Result<Vec<NewQuestion>, HandlerErr> {
    let Some(raw) = req.params.get("questions") else {
        return Ok(Vec::new());
    };
    if raw.is_null() {
        return Ok(Vec::new());
    }
    let Some(items) = raw.as_array() else {
        return Err(HandlerErr::new("bad_params", "questions must be an array"));
    };
    let mut out = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let number = item.get("number").and_then(|v| v.as_str()).unwrap_or("");
        let title = item.get("title").and_then(|v| v.as_str()).unwrap_or("");
        let Some(points_max) = item.get("pointsMax").and_then(|v| v.as_f64()) else {
            return Err(HandlerErr::new("bad_params", "questions[].pointsMax must be a number")
                .with_details(json!({ "index": i })));
        };
        let coefficient = item
            .get("coefficient")
            .and_then(|v| v.as_f64())
            .unwrap_or(1.0);
        validate_question(number, title, points_max, coefficient)
            .map_err(|e| HandlerErr::from(e).with_details(json!({ "index": i })))?;
        out.push(NewQuestion {
            number: number.trim().to_string(),
            title: title.trim().to_string(),
            points_max,
            coefficient,
        });
    }
    Ok(out)
}

pub(crate) fn insert_question(
    conn: &Connection,
    assignment_id: &str,
    number: &str,
    title: &str,
    points_max: f64,
    coefficient: f64,
) -> Result<String, HandlerErr> {
    let question_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO questions(id, assignment_id, number, title, points_max, coefficient)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&question_id, assignment_id, number, title, points_max, coefficient),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "questions" }))
    })?;
    Ok(question_id)
}

fn validate_scale(scale: Option<f64>) -> Result<Option<f64>, HandlerErr> {
    match scale {
        Some(v) if v <= 0.0 => Err(HandlerErr::new("invalid_input", "scale must be > 0")
            .with_details(json!({ "scale": v }))),
        other => Ok(other),
    }
}

fn assignments_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let class_id = str_param(req, "classId")?;
    let name = validate_name("name", str_param(req, "name")?)?;
    let date = validate_date("date", str_param(req, "date")?)?;
    let scale = validate_scale(opt_f64_param(req, "scale")?)?;
    let questions = parse_new_questions(req)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let class_exists: Option<i64> = tx
        .query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
            r.get(0)
        })
        .optional()?;
    if class_exists.is_none() {
        return Err(HandlerErr::new("not_found", "class not found"));
    }

    let assignment_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO assignments(id, class_id, name, date, scale, average, updated_at)
         VALUES(?, ?, ?, ?, ?, NULL, ?)",
        (&assignment_id, class_id, &name, &date, scale, now_rfc3339()),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "assignments" }))
    })?;
    let mut question_ids = Vec::with_capacity(questions.len());
    for q in &questions {
        question_ids.push(insert_question(
            &tx,
            &assignment_id,
            &q.number,
            &q.title,
            q.points_max,
            q.coefficient,
        )?);
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "assignmentId": assignment_id, "questionIds": question_ids }))
}

fn assignments_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let assignment_id = str_param(req, "assignmentId")?;
    let name = validate_name("name", str_param(req, "name")?)?;
    let date = validate_date("date", str_param(req, "date")?)?;
    let scale = validate_scale(opt_f64_param(req, "scale")?)?;

    let changed = conn
        .execute(
            "UPDATE assignments SET name = ?, date = ?, scale = ?, updated_at = ? WHERE id = ?",
            (&name, &date, scale, now_rfc3339(), assignment_id),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    if changed == 0 {
        return Err(HandlerErr::new("not_found", "assignment not found"));
    }
    Ok(json!({ "ok": true }))
}

/// Refused while any question carries a score; otherwise questions and
/// reports are removed with the assignment.
fn assignments_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let assignment_id = str_param(req, "assignmentId")?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    require_assignment(&SqliteStore::new(&tx), assignment_id)?;

    let score_count: i64 = tx.query_row(
        "SELECT COUNT(*)
         FROM scores s
         JOIN questions q ON q.id = s.question_id
         WHERE q.assignment_id = ?",
        [assignment_id],
        |r| r.get(0),
    )?;
    if score_count > 0 {
        return Err(
            HandlerErr::new("constraint_violation", "assignment has scores")
                .with_details(json!({ "scoreCount": score_count })),
        );
    }

    let mut deleted_questions = 0;
    for (table, sql) in [
        ("reports", "DELETE FROM reports WHERE assignment_id = ?"),
        ("questions", "DELETE FROM questions WHERE assignment_id = ?"),
        ("assignments", "DELETE FROM assignments WHERE id = ?"),
    ] {
        let n = tx.execute(sql, [assignment_id]).map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string()).with_details(json!({ "table": table }))
        })?;
        if table == "questions" {
            deleted_questions = n;
        }
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true, "deletedQuestions": deleted_questions }))
}

fn assignments_clear_scores(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let assignment_id = str_param(req, "assignmentId")?;
    let (deleted, average) = clear_assignment_scores(conn, assignment_id)?;
    Ok(json!({ "deletedScores": deleted, "average": average }))
}

fn assignments_recalculate(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let assignment_id = str_param(req, "assignmentId")?;
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let store = SqliteStore::new(&tx);
    require_assignment(&store, assignment_id)?;
    let average = recalculate_assignment_average(&store, assignment_id)?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "average": average }))
}

fn assignments_progress(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let assignment_id = str_param(req, "assignmentId")?;
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let store = SqliteStore::new(&tx);
    require_assignment(&store, assignment_id)?;
    let rows = correction_progress(&store, assignment_id)?;
    let corrected = rows.iter().filter(|p| p.complete).count();
    Ok(json!({
        "students": to_json(&rows)?,
        "correctedCount": corrected,
        "studentCount": rows.len(),
        "scaleTotal": scale_total(&store, assignment_id)?,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "assignments.list" => return Some(handle_assignments_list(state, req)),
        "assignments.get" => assignments_get(state, req),
        "assignments.create" => assignments_create(state, req),
        "assignments.update" => assignments_update(state, req),
        "assignments.delete" => assignments_delete(state, req),
        "assignments.clearScores" => assignments_clear_scores(state, req),
        "assignments.recalculate" => assignments_recalculate(state, req),
        "assignments.progress" => assignments_progress(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
