use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;

type Family = fn(&mut AppState, &Request) -> Option<serde_json::Value>;

const FAMILIES: &[Family] = &[
    handlers::core::try_handle,
    handlers::teachers::try_handle,
    handlers::schedule::try_handle,
    handlers::attendance::try_handle,
    handlers::payroll::try_handle,
    handlers::ledger::try_handle,
    handlers::commission::try_handle,
    handlers::backup_exchange::try_handle,
];

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    for family in FAMILIES {
        if let Some(resp) = family(state, &req) {
            return resp;
        }
    }
    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}
