use crate::ipc::error::{respond, HandlerErr, HandlerResult};
use crate::ipc::handlers::assignments::require_assignment;
use crate::ipc::handlers::scores::require_student_on;
use crate::ipc::helpers::{opt_str_param, require_conn, str_param, to_json};
use crate::ipc::types::{AppState, Request};
use crate::store::{list_reports_for_assignment, read_report_document, GradeStore, SqliteStore};
use serde_json::json;

fn reports_get(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let assignment_id = str_param(req, "assignmentId")?;
    let student_id = str_param(req, "studentId")?;
    let store = SqliteStore::new(conn);
    let Some(report) = store.get_report(assignment_id, student_id)? else {
        return Ok(json!({ "report": null }));
    };
    let document = read_report_document(conn, &report.id)?
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
    Ok(json!({ "report": to_json(&report)?, "document": document }))
}

fn reports_upsert(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let assignment_id = str_param(req, "assignmentId")?;
    let student_id = str_param(req, "studentId")?;
    let appreciation = str_param(req, "appreciation")?.trim();
    let document = opt_str_param(req, "document")?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let store = SqliteStore::new(&tx);
    let assignment = require_assignment(&store, assignment_id)?;
    require_student_on(&store, student_id, &assignment)?;
    store.upsert_report(
        assignment_id,
        student_id,
        appreciation,
        document.map(str::as_bytes),
    )?;
    let report = store.get_report(assignment_id, student_id)?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "report": to_json(&report)? }))
}

fn reports_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let assignment_id = str_param(req, "assignmentId")?;
    require_assignment(&SqliteStore::new(conn), assignment_id)?;
    let reports: Vec<serde_json::Value> = list_reports_for_assignment(conn, assignment_id)?
        .into_iter()
        .map(|(report, student)| {
            let mut row = to_json(&report)?;
            row["studentName"] = json!(student.display_name());
            Ok(row)
        })
        .collect::<Result<_, HandlerErr>>()?;
    Ok(json!({ "reports": reports }))
}

fn reports_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let report_id = str_param(req, "reportId")?;
    let changed = conn
        .execute("DELETE FROM reports WHERE id = ?", [report_id])
        .map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string())
                .with_details(json!({ "table": "reports" }))
        })?;
    if changed == 0 {
        return Err(HandlerErr::new("not_found", "report not found"));
    }
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "reports.get" => reports_get(state, req),
        "reports.upsert" => reports_upsert(state, req),
        "reports.list" => reports_list(state, req),
        "reports.delete" => reports_delete(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
