mod backup;
mod db;
mod ipc;
mod payroll;

use std::io::{self, BufRead, Write};

fn main() {
    let mut state = ipc::AppState {
        workspace: None,
        db: None,
    };

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    // One request per line in, one response per line out. A line that is not
    // valid JSON gets a bad_json reply without an id; the loop keeps going.
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<ipc::Request>(line) {
            Ok(req) => ipc::handle_request(&mut state, req),
            Err(e) => serde_json::json!({
                "ok": false,
                "error": { "code": "bad_json", "message": e.to_string() }
            }),
        };

        if writeln!(out, "{}", reply).is_err() {
            break;
        }
        let _ = out.flush();
    }
}
