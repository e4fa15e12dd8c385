pub mod attendance;
pub mod backup_exchange;
pub mod commission;
pub mod core;
pub mod ledger;
pub mod payroll;
pub mod schedule;
pub mod teachers;

use crate::ipc::error::HandlerErr;
use crate::ipc::types::AppState;
use chrono::NaiveDate;
use rusqlite::Connection;

pub(crate) fn db_conn(state: &AppState) -> Result<&Connection, HandlerErr> {
    state.db.as_ref().ok_or_else(|| HandlerErr {
        code: "no_workspace",
        message: "select a workspace first".to_string(),
        details: None,
    })
}

pub(crate) fn required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub(crate) fn optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub(crate) fn required_f64(params: &serde_json::Value, key: &str) -> Result<f64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub(crate) fn required_date(params: &serde_json::Value, key: &str) -> Result<NaiveDate, HandlerErr> {
    let raw = required_str(params, key)?;
    parse_date(&raw, key)
}

pub(crate) fn parse_date(raw: &str, key: &str) -> Result<NaiveDate, HandlerErr> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| HandlerErr::bad_params(format!("{} must be YYYY-MM-DD", key)))
}
