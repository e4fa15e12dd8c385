use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn health(state: &AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "service": "academyd",
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state
                .workspace
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
        }),
    )
}

fn workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(path) = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
    else {
        return err(&req.id, "bad_params", "missing path", None);
    };

    match db::open_db(&path) {
        Ok(conn) => {
            state.db = Some(conn);
            let shown = path.to_string_lossy().into_owned();
            state.workspace = Some(path);
            ok(
                &req.id,
                json!({ "workspacePath": shown, "dbFile": db::DB_FILE_NAME }),
            )
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:#}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(health(state, req)),
        "workspace.select" => Some(workspace_select(state, req)),
        _ => None,
    }
}
