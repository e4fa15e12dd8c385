use super::schedule::load_occurrence;
use super::{db_conn, required_str};
use crate::db;
use crate::ipc::error::{ok, with_conflict_retry, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

/// The one code path allowed to flip `is_present`/`is_proxy`. Everything
/// downstream (payroll, absence stats) trusts what this writes.
fn attendance_mark(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let occurrence_id = required_str(params, "occurrenceId")?;
    let acting_teacher_id = required_str(params, "actingTeacherId")?;

    let tx = db::immediate_tx(conn).map_err(HandlerErr::db_tx)?;

    let row: Option<(i64, String)> = tx
        .query_row(
            "SELECT o.is_present, t.teacher_id
             FROM occurrences o
             JOIN schedule_templates t ON t.id = o.template_id
             WHERE o.id = ?",
            [&occurrence_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    let Some((is_present, assigned_teacher_id)) = row else {
        return Err(HandlerErr::not_found("occurrence not found"));
    };
    if is_present != 0 {
        // Terminal state; retried submissions land here instead of
        // double-counting pay or rewriting who taught.
        return Err(HandlerErr::already_marked("occurrence is already marked"));
    }

    let updated = if acting_teacher_id == assigned_teacher_id {
        tx.execute(
            "UPDATE occurrences
             SET is_present = 1, is_proxy = 0, substitute_teacher_id = NULL
             WHERE id = ? AND is_present = 0",
            [&occurrence_id],
        )
        .map_err(HandlerErr::db_update)?
    } else {
        let active: Option<i64> = tx
            .query_row(
                "SELECT active FROM teachers WHERE id = ?",
                [&acting_teacher_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(HandlerErr::db_query)?;
        match active {
            None => return Err(HandlerErr::not_found("acting teacher not found")),
            Some(0) => {
                return Err(HandlerErr::inactive_teacher(
                    "substitute teacher is deactivated",
                ))
            }
            Some(_) => {}
        }
        tx.execute(
            "UPDATE occurrences
             SET is_present = 1, is_proxy = 1, substitute_teacher_id = ?
             WHERE id = ? AND is_present = 0",
            (&acting_teacher_id, &occurrence_id),
        )
        .map_err(HandlerErr::db_update)?
    };
    if updated == 0 {
        // Another writer marked it between our read and the guarded update.
        return Err(HandlerErr::already_marked("occurrence is already marked"));
    }

    tx.commit().map_err(HandlerErr::db_commit)?;

    let record = load_occurrence(conn, &occurrence_id)?
        .ok_or_else(|| HandlerErr::not_found("occurrence not found"))?;
    Ok(json!({ "occurrence": record.to_json() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.mark" => {
            let resp = match db_conn(state)
                .and_then(|conn| with_conflict_retry(|| attendance_mark(conn, &req.params)))
            {
                Ok(result) => ok(&req.id, result),
                Err(e) => e.response(&req.id),
            };
            Some(resp)
        }
        _ => None,
    }
}
