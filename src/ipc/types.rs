use rusqlite::Connection;
use serde::Deserialize;
use std::path::PathBuf;

/// One request line read from stdin.
#[derive(Debug, Deserialize)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Daemon-lifetime state: the selected workspace and its open database.
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
}
