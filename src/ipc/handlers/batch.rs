use crate::batch::{BatchBusy, JobKind};
use crate::db;
use crate::ipc::error::{respond, HandlerErr, HandlerResult};
use crate::ipc::helpers::{opt_str_param, require_conn, str_param, to_json};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn parse_kind(req: &Request) -> Result<JobKind, HandlerErr> {
    match str_param(req, "kind")? {
        "recalculateAll" => Ok(JobKind::RecalculateAll),
        "generateReports" => {
            let Some(assignment_id) = opt_str_param(req, "assignmentId")? else {
                return Err(HandlerErr::new(
                    "bad_params",
                    "generateReports needs assignmentId",
                ));
            };
            Ok(JobKind::GenerateReports {
                assignment_id: assignment_id.to_string(),
            })
        }
        other => Err(HandlerErr::new("bad_params", "unknown batch kind")
            .with_details(json!({ "kind": other }))),
    }
}

/// Starts `kind` against the selected workspace. The worker opens its own
/// connection; busy_timeout covers contention with this one.
pub(crate) fn start_job(state: &mut AppState, kind: JobKind) -> Result<String, HandlerErr> {
    let Some(workspace) = state.workspace.clone() else {
        return Err(HandlerErr::new("no_workspace", "select a workspace first"));
    };
    let db_file_name = state.config.db_file_name.clone();
    let busy_timeout = state.config.busy_timeout();
    state
        .batches
        .start(kind, move || {
            db::open_db(&workspace, &db_file_name, busy_timeout)
        })
        .map_err(busy_err)
}

pub(crate) fn busy_err(busy: BatchBusy) -> HandlerErr {
    HandlerErr::new("batch_busy", "a conflicting batch is already running")
        .with_details(json!({ "runningJobId": busy.running_job_id }))
}

fn batch_start(state: &mut AppState, req: &Request) -> HandlerResult {
    require_conn(state)?;
    let kind = parse_kind(req)?;
    let job_id = start_job(state, kind)?;
    Ok(json!({ "jobId": job_id }))
}

fn batch_status(state: &mut AppState, req: &Request) -> HandlerResult {
    let job_id = str_param(req, "jobId")?;
    let Some(status) = state.batches.status(job_id) else {
        return Err(HandlerErr::new("not_found", "batch job not found")
            .with_details(json!({ "jobId": job_id })));
    };
    to_json(&status)
}

fn batch_list(state: &mut AppState, _req: &Request) -> HandlerResult {
    Ok(json!({ "jobs": to_json(&state.batches.list())? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "batch.start" => batch_start(state, req),
        "batch.status" => batch_status(state, req),
        "batch.list" => batch_list(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
