use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::flow;
use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn opt_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Clock for time-sensitive decisions. Callers (and tests) may pin `now`
/// explicitly via params; otherwise wall clock.
pub fn now_param(req: &Request) -> Result<DateTime<Utc>, serde_json::Value> {
    match req.params.get("now").and_then(|v| v.as_str()) {
        None => Ok(Utc::now()),
        Some(raw) => flow::parse_timestamp(raw)
            .ok_or_else(|| err(&req.id, "bad_params", "now must be RFC 3339", None)),
    }
}

pub fn now_ts() -> String {
    Utc::now().to_rfc3339()
}
