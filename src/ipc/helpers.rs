use crate::ipc::error::HandlerErr;
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::json;

pub fn require_conn(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn str_param<'a>(req: &'a Request, key: &str) -> Result<&'a str, HandlerErr> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {key}")))
}

pub fn opt_str_param<'a>(req: &'a Request, key: &str) -> Result<Option<&'a str>, HandlerErr> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v.as_str().map(Some).ok_or_else(|| {
            HandlerErr::new("bad_params", format!("{key} must be a string"))
                .with_details(json!({ key: v }))
        }),
    }
}

pub fn f64_param(req: &Request, key: &str) -> Result<f64, HandlerErr> {
    opt_f64_param(req, key)?.ok_or_else(|| HandlerErr::new("bad_params", format!("missing {key}")))
}

pub fn opt_f64_param(req: &Request, key: &str) -> Result<Option<f64>, HandlerErr> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v.as_f64().map(Some).ok_or_else(|| {
            HandlerErr::new("bad_params", format!("{key} must be a number"))
                .with_details(json!({ key: v }))
        }),
    }
}

pub fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value, HandlerErr> {
    serde_json::to_value(value).map_err(|e| HandlerErr::new("internal", e.to_string()))
}

/// `LIKE` pattern for a free-text search box; `None` when the box is empty.
pub fn like_pattern(search: Option<&str>) -> Option<String> {
    let t = search.map(str::trim).unwrap_or("");
    if t.is_empty() {
        return None;
    }
    Some(format!("%{t}%"))
}
