use crate::calc::aggregate::class_stats;
use crate::calc::validate::validate_name;
use crate::ipc::error::{ok, respond, HandlerErr, HandlerResult};
use crate::ipc::helpers::{require_conn, str_param, to_json};
use crate::ipc::types::{AppState, Request};
use crate::store::SqliteStore;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn class_exists(conn: &Connection, class_id: &str) -> Result<bool, HandlerErr> {
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
            r.get(0)
        })
        .optional()?;
    Ok(exists.is_some())
}

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "classes": [] }));
    };

    // Correlated subqueries avoid double-counting from joins.
    let result = (|| -> HandlerResult {
        let mut stmt = conn.prepare(
            "SELECT
               c.id,
               c.name,
               (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count,
               (SELECT COUNT(*) FROM assignments a WHERE a.class_id = c.id) AS assignment_count
             FROM classes c
             ORDER BY c.name",
        )?;
        let classes = stmt
            .query_map([], |row| {
                let id: String = row.get(0)?;
                let name: String = row.get(1)?;
                let student_count: i64 = row.get(2)?;
                let assignment_count: i64 = row.get(3)?;
                Ok(json!({
                    "id": id,
                    "name": name,
                    "studentCount": student_count,
                    "assignmentCount": assignment_count
                }))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(json!({ "classes": classes }))
    })();
    respond(&req.id, result)
}

fn classes_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let name = validate_name("name", str_param(req, "name")?)?;

    let class_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO classes(id, name) VALUES(?, ?)",
        (&class_id, &name),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "classes" }))
    })?;

    Ok(json!({ "classId": class_id, "name": name }))
}

fn classes_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let class_id = str_param(req, "classId")?;
    let name = validate_name("name", str_param(req, "name")?)?;

    let changed = conn
        .execute("UPDATE classes SET name = ? WHERE id = ?", (&name, class_id))
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    if changed == 0 {
        return Err(HandlerErr::new("not_found", "class not found"));
    }
    Ok(json!({ "ok": true }))
}

/// Refused while students remain, or while its assignments still hold scores
/// (left behind by students who moved class). Otherwise assignments,
/// questions and reports go with it.
fn classes_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let class_id = str_param(req, "classId")?;

    if !class_exists(conn, class_id)? {
        return Err(HandlerErr::new("not_found", "class not found"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    let student_count: i64 = tx.query_row(
        "SELECT COUNT(*) FROM students WHERE class_id = ?",
        [class_id],
        |r| r.get(0),
    )?;
    if student_count > 0 {
        return Err(
            HandlerErr::new("constraint_violation", "class still has students")
                .with_details(json!({ "studentCount": student_count })),
        );
    }

    let score_count: i64 = tx.query_row(
        "SELECT COUNT(*)
         FROM scores s
         JOIN questions q ON q.id = s.question_id
         JOIN assignments a ON a.id = q.assignment_id
         WHERE a.class_id = ?",
        [class_id],
        |r| r.get(0),
    )?;
    if score_count > 0 {
        return Err(
            HandlerErr::new("constraint_violation", "class assignments still have scores")
                .with_details(json!({ "scoreCount": score_count })),
        );
    }

    // Explicit dependency order (no ON DELETE CASCADE).
    let steps: [(&str, &str); 3] = [
        (
            "reports",
            "DELETE FROM reports
             WHERE assignment_id IN (SELECT id FROM assignments WHERE class_id = ?)",
        ),
        (
            "questions",
            "DELETE FROM questions
             WHERE assignment_id IN (SELECT id FROM assignments WHERE class_id = ?)",
        ),
        ("assignments", "DELETE FROM assignments WHERE class_id = ?"),
    ];
    for (table, sql) in steps {
        tx.execute(sql, [class_id]).map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string()).with_details(json!({ "table": table }))
        })?;
    }
    tx.execute("DELETE FROM classes WHERE id = ?", [class_id])
        .map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string())
                .with_details(json!({ "table": "classes" }))
        })?;

    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

fn classes_stats(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let class_id = str_param(req, "classId")?;
    if !class_exists(conn, class_id)? {
        return Err(HandlerErr::new("not_found", "class not found"));
    }
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let stats = class_stats(&SqliteStore::new(&tx), class_id)?;
    to_json(&stats)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "classes.list" => return Some(handle_classes_list(state, req)),
        "classes.create" => classes_create(state, req),
        "classes.update" => classes_update(state, req),
        "classes.delete" => classes_delete(state, req),
        "classes.stats" => classes_stats(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
