use crate::calc::aggregate::{average_for_student, count_graded_assignments};
use crate::calc::recalc::recalculate_class;
use crate::calc::validate::validate_name;
use crate::db::now_rfc3339;
use crate::ipc::error::{ok, respond, HandlerErr, HandlerResult};
use crate::ipc::helpers::{like_pattern, opt_str_param, require_conn, str_param};
use crate::ipc::types::{AppState, Request};
use crate::store::{GradeStore, SqliteStore};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "students": [] }));
    };

    let result = (|| -> HandlerResult {
        let class_id = opt_str_param(req, "classId")?;
        let search = like_pattern(opt_str_param(req, "search")?);

        let mut sql = String::from(
            "SELECT e.id, e.class_id, e.last_name, e.first_name, c.name
             FROM students e
             LEFT JOIN classes c ON c.id = e.class_id
             WHERE 1=1",
        );
        let mut bind_values: Vec<Value> = Vec::new();
        if let Some(cid) = class_id {
            sql.push_str(" AND e.class_id = ?");
            bind_values.push(Value::Text(cid.to_string()));
        }
        if let Some(pattern) = search {
            sql.push_str(" AND (e.last_name LIKE ? OR e.first_name LIKE ?)");
            bind_values.push(Value::Text(pattern.clone()));
            bind_values.push(Value::Text(pattern));
        }
        sql.push_str(" ORDER BY e.last_name, e.first_name, e.id");

        let mut stmt = conn.prepare(&sql)?;
        let students = stmt
            .query_map(params_from_iter(bind_values), |r| {
                let id: String = r.get(0)?;
                let class_id: String = r.get(1)?;
                let last_name: String = r.get(2)?;
                let first_name: String = r.get(3)?;
                let class_name: Option<String> = r.get(4)?;
                Ok(json!({
                    "id": id,
                    "classId": class_id,
                    "lastName": last_name,
                    "firstName": first_name,
                    "className": class_name
                }))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(json!({ "students": students }))
    })();
    respond(&req.id, result)
}

fn students_get(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let student_id = str_param(req, "studentId")?;
    let row = conn
        .query_row(
            "SELECT e.id, e.class_id, e.last_name, e.first_name, c.name
             FROM students e
             LEFT JOIN classes c ON c.id = e.class_id
             WHERE e.id = ?",
            [student_id],
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "classId": r.get::<_, String>(1)?,
                    "lastName": r.get::<_, String>(2)?,
                    "firstName": r.get::<_, String>(3)?,
                    "className": r.get::<_, Option<String>>(4)?
                }))
            },
        )
        .optional()?;
    row.map(|student| json!({ "student": student }))
        .ok_or_else(|| HandlerErr::new("not_found", "student not found"))
}

fn require_class(conn: &rusqlite::Connection, class_id: &str) -> Result<(), HandlerErr> {
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
            r.get(0)
        })
        .optional()?;
    if exists.is_none() {
        return Err(HandlerErr::new("not_found", "class not found")
            .with_details(json!({ "classId": class_id })));
    }
    Ok(())
}

fn students_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let class_id = str_param(req, "classId")?;
    let last_name = validate_name("lastName", str_param(req, "lastName")?)?;
    let first_name = validate_name("firstName", str_param(req, "firstName")?)?;
    require_class(conn, class_id)?;

    // Nothing is scored yet, so no cached average moves.
    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, class_id, last_name, first_name, updated_at)
         VALUES(?, ?, ?, ?, ?)",
        (&student_id, class_id, &last_name, &first_name, now_rfc3339()),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "students" }))
    })?;

    Ok(json!({ "studentId": student_id }))
}

fn students_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let student_id = str_param(req, "studentId")?;
    let last_name = validate_name("lastName", str_param(req, "lastName")?)?;
    let first_name = validate_name("firstName", str_param(req, "firstName")?)?;
    let new_class_id = str_param(req, "classId")?;
    require_class(conn, new_class_id)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let store = SqliteStore::new(&tx);
    let Some(before) = store.get_student(student_id)? else {
        return Err(HandlerErr::new("not_found", "student not found"));
    };

    tx.execute(
        "UPDATE students SET last_name = ?, first_name = ?, class_id = ?, updated_at = ?
         WHERE id = ?",
        (&last_name, &first_name, new_class_id, now_rfc3339(), student_id),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    // Changing class changes which students both classes' averages cover.
    let mut recalculated = 0;
    if before.class_id != new_class_id {
        recalculated += recalculate_class(&store, &before.class_id)?;
        recalculated += recalculate_class(&store, new_class_id)?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "ok": true, "recalculatedAssignments": recalculated }))
}

/// Refused while the student has any score. Their reports go with them.
fn students_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let student_id = str_param(req, "studentId")?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    if SqliteStore::new(&tx).get_student(student_id)?.is_none() {
        return Err(HandlerErr::new("not_found", "student not found"));
    }
    let score_count: i64 = tx.query_row(
        "SELECT COUNT(*) FROM scores WHERE student_id = ?",
        [student_id],
        |r| r.get(0),
    )?;
    if score_count > 0 {
        return Err(
            HandlerErr::new("constraint_violation", "student has scores")
                .with_details(json!({ "scoreCount": score_count })),
        );
    }

    tx.execute("DELETE FROM reports WHERE student_id = ?", [student_id])
        .map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string())
                .with_details(json!({ "table": "reports" }))
        })?;
    tx.execute("DELETE FROM students WHERE id = ?", [student_id])
        .map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string())
                .with_details(json!({ "table": "students" }))
        })?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

fn students_average(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let student_id = str_param(req, "studentId")?;
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let store = SqliteStore::new(&tx);
    let average = average_for_student(&store, student_id)?;
    let graded = count_graded_assignments(&store, student_id)?;
    Ok(json!({ "average": average, "gradedAssignments": graded }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "students.list" => return Some(handle_students_list(state, req)),
        "students.get" => students_get(state, req),
        "students.create" => students_create(state, req),
        "students.update" => students_update(state, req),
        "students.delete" => students_delete(state, req),
        "students.average" => students_average(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
