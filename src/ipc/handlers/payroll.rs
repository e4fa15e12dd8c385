use super::{db_conn, required_date, required_str};
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::payroll::{self, OccurrenceRow};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

/// Read-only snapshot over `[from, to)`; recomputed on every call, never
/// persisted.
fn payroll_compute(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = required_str(params, "teacherId")?;
    let from = required_date(params, "from")?;
    let to = required_date(params, "to")?;
    if to < from {
        return Err(HandlerErr::bad_params("to must not precede from"));
    }

    let teacher: Option<(String, f64, i64)> = conn
        .query_row(
            "SELECT name, pay_per_lecture, active FROM teachers WHERE id = ?",
            [&teacher_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    let Some((teacher_name, pay_per_lecture, active)) = teacher else {
        return Err(HandlerErr::not_found("teacher not found"));
    };

    let rows = load_period_rows(conn, &teacher_id, from, to)?;
    let summary = payroll::summarize_period(&rows, &teacher_id, pay_per_lecture);

    Ok(json!({
        "teacher": {
            "id": teacher_id,
            "name": teacher_name,
            "payPerLecture": pay_per_lecture,
            "active": active != 0,
        },
        "from": from.format("%Y-%m-%d").to_string(),
        "to": to.format("%Y-%m-%d").to_string(),
        "summary": summary,
    }))
}

fn load_period_rows(
    conn: &Connection,
    teacher_id: &str,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<OccurrenceRow>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT o.date, t.subject, t.grade, t.teacher_id,
                    o.is_present, o.is_proxy, o.substitute_teacher_id
             FROM occurrences o
             JOIN schedule_templates t ON t.id = o.template_id
             WHERE o.date >= ?1 AND o.date < ?2
               AND (t.teacher_id = ?3 OR o.substitute_teacher_id = ?3)
             ORDER BY o.date",
        )
        .map_err(HandlerErr::db_query)?;
    let from_str = from.format("%Y-%m-%d").to_string();
    let to_str = to.format("%Y-%m-%d").to_string();
    let raw = stmt
        .query_map((&from_str, &to_str, teacher_id), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, i64>(4)? != 0,
                r.get::<_, i64>(5)? != 0,
                r.get::<_, Option<String>>(6)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    let mut rows = Vec::with_capacity(raw.len());
    for (date, subject, grade, assigned, is_present, is_proxy, substitute) in raw {
        let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
            .map_err(|_| HandlerErr::bad_params(format!("stored date is malformed: {}", date)))?;
        rows.push(OccurrenceRow {
            date,
            subject,
            grade,
            assigned_teacher_id: assigned,
            is_present,
            is_proxy,
            substitute_teacher_id: substitute,
        });
    }
    Ok(rows)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "payroll.compute" => {
            let resp = match db_conn(state).and_then(|conn| payroll_compute(conn, &req.params)) {
                Ok(result) => ok(&req.id, result),
                Err(e) => e.response(&req.id),
            };
            Some(resp)
        }
        _ => None,
    }
}
