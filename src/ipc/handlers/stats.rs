use crate::batch::JobKind;
use crate::calc::aggregate::{
    average_for_assignment, average_for_class, distribution_stats, global_stats,
    grade_distribution,
};
use crate::calc::recalc::recalculate_all;
use crate::ipc::error::{respond, HandlerErr, HandlerResult};
use crate::ipc::handlers::assignments::require_assignment;
use crate::ipc::handlers::batch::busy_err;
use crate::ipc::helpers::{require_conn, str_param, to_json};
use crate::ipc::types::{AppState, Request};
use crate::store::SqliteStore;
use rusqlite::OptionalExtension;
use serde_json::json;

fn stats_assignment(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let assignment_id = str_param(req, "assignmentId")?;
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let store = SqliteStore::new(&tx);
    require_assignment(&store, assignment_id)?;

    let distribution = grade_distribution(&store, assignment_id)?;
    let summary = distribution_stats(&distribution);
    Ok(json!({
        "average": average_for_assignment(&store, assignment_id)?,
        "distribution": distribution,
        "stats": to_json(&summary)?,
    }))
}

fn stats_class(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let class_id = str_param(req, "classId")?;
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let exists: Option<i64> = tx
        .query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
            r.get(0)
        })
        .optional()?;
    if exists.is_none() {
        return Err(HandlerErr::new("not_found", "class not found"));
    }
    Ok(json!({ "average": average_for_class(&SqliteStore::new(&tx), class_id)? }))
}

fn stats_global(state: &mut AppState, _req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    to_json(&global_stats(&SqliteStore::new(&tx))?)
}

/// Synchronous sweep. Refused while any batch it conflicts with is running.
fn stats_recalculate_all(state: &mut AppState, _req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    if let Some(busy) = state.batches.busy_with(&JobKind::RecalculateAll) {
        return Err(busy_err(busy));
    }
    let outcome = recalculate_all(conn, |_| {})?;
    to_json(&outcome)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "stats.assignment" => stats_assignment(state, req),
        "stats.class" => stats_class(state, req),
        "stats.global" => stats_global(state, req),
        "stats.recalculateAll" => stats_recalculate_all(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
