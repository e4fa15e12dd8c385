use crate::db;
use serde_json::json;
use std::time::Duration;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

/// Typed handler failure carried through the request-scoped Result chain and
/// rendered onto the response envelope at the end.
#[derive(Debug)]
pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }

    fn new(code: &'static str, message: impl Into<String>) -> Self {
        HandlerErr {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }

    pub fn already_marked(message: impl Into<String>) -> Self {
        Self::new("already_marked", message)
    }

    pub fn inactive_teacher(message: impl Into<String>) -> Self {
        Self::new("inactive_teacher", message)
    }

    pub fn invalid_amount(message: impl Into<String>) -> Self {
        Self::new("invalid_amount", message)
    }

    pub fn overpayment_rejected(message: impl Into<String>) -> Self {
        Self::new("overpayment_rejected", message)
    }

    pub fn missing_total_fees(message: impl Into<String>) -> Self {
        Self::new("missing_total_fees", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new("conflict", message)
    }

    pub fn db_query(e: rusqlite::Error) -> Self {
        Self::from_sqlite("db_query_failed", e)
    }

    pub fn db_update(e: rusqlite::Error) -> Self {
        Self::from_sqlite("db_update_failed", e)
    }

    pub fn db_tx(e: rusqlite::Error) -> Self {
        Self::from_sqlite("db_tx_failed", e)
    }

    pub fn db_commit(e: rusqlite::Error) -> Self {
        Self::from_sqlite("db_commit_failed", e)
    }

    fn from_sqlite(code: &'static str, e: rusqlite::Error) -> Self {
        if db::is_busy(&e) {
            Self::new("conflict", "database is locked by another writer")
        } else {
            Self::new(code, e.to_string())
        }
    }
}

const CONFLICT_RETRIES: usize = 3;

/// Runs a transactional operation, retrying a lock conflict a small bounded
/// number of times before surfacing `conflict` to the caller. Anything else
/// passes through on the first attempt.
pub fn with_conflict_retry<T>(
    mut op: impl FnMut() -> Result<T, HandlerErr>,
) -> Result<T, HandlerErr> {
    let mut last = None;
    for attempt in 0..CONFLICT_RETRIES {
        match op() {
            Err(e) if e.code == "conflict" => {
                last = Some(e);
                if attempt + 1 < CONFLICT_RETRIES {
                    std::thread::sleep(Duration::from_millis(25 * (attempt as u64 + 1)));
                }
            }
            other => return other,
        }
    }
    Err(last.unwrap_or_else(|| HandlerErr::conflict("database is locked by another writer")))
}
