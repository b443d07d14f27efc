use crate::batch::JobKind;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::batch::start_job;
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
        }),
    )
}

/// Opens (or creates) the workspace database and, when configured, starts
/// the consistency sweep as a background batch. A sweep that cannot start
/// never blocks the open.
pub fn open_workspace(state: &mut AppState, path: &Path) -> anyhow::Result<serde_json::Value> {
    let conn = db::open_db(path, &state.config.db_file_name, state.config.busy_timeout())?;
    info!(workspace = %path.display(), "workspace opened");
    state.workspace = Some(path.to_path_buf());
    state.db = Some(conn);

    let mut sweep_job_id = None;
    if state.config.recalculate_on_open {
        match start_job(state, JobKind::RecalculateAll) {
            Ok(job_id) => sweep_job_id = Some(job_id),
            Err(e) => warn!(code = e.code, error = %e.message, "startup recalculation not started"),
        }
    }

    Ok(json!({
        "workspacePath": path.to_string_lossy(),
        "recalculationJobId": sweep_job_id,
    }))
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match open_workspace(state, &path) {
        Ok(result) => ok(&req.id, result),
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        _ => None,
    }
}
