use crate::backup;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn param_path(req: &Request, key: &str) -> Result<PathBuf, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn handle_export_bundle(_state: &mut AppState, req: &Request) -> serde_json::Value {
    let workspace = match param_path(req, "workspacePath") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let out_path = match param_path(req, "outPath") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match backup::export_workspace_bundle(&workspace, &out_path) {
        Ok(summary) => ok(
            &req.id,
            json!({
                "bundleFormat": summary.bundle_format,
                "dbSha256": summary.db_sha256,
                "outPath": out_path.to_string_lossy(),
            }),
        ),
        Err(e) => err(&req.id, "backup_export_failed", format!("{e:#}"), None),
    }
}

fn handle_import_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let workspace = match param_path(req, "workspacePath") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let in_path = match param_path(req, "inPath") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    // Drop any open handle before swapping the database file underneath it.
    let selected = state.workspace.as_deref() == Some(workspace.as_path());
    if selected {
        state.db = None;
    }

    let imported = backup::import_workspace_bundle(&in_path, &workspace);

    // Reopen whether or not the import went through; a refused bundle must
    // not leave the selected workspace unusable.
    if selected {
        match db::open_db(&workspace) {
            Ok(conn) => state.db = Some(conn),
            Err(e) => return err(&req.id, "db_open_failed", format!("{e:?}"), None),
        }
    }

    match imported {
        Ok(summary) => ok(
            &req.id,
            json!({ "bundleFormatDetected": summary.bundle_format_detected }),
        ),
        Err(e) => err(&req.id, "backup_import_failed", format!("{e:#}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.exportWorkspaceBundle" => Some(handle_export_bundle(state, req)),
        "backup.importWorkspaceBundle" => Some(handle_import_bundle(state, req)),
        _ => None,
    }
}
