use super::{db_conn, optional_str, required_date, required_str};
use crate::db;
use crate::ipc::error::{ok, with_conflict_retry, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::payroll;
use chrono::NaiveTime;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub(crate) struct OccurrenceRecord {
    pub id: String,
    pub template_id: String,
    pub date: String,
    pub is_present: bool,
    pub is_proxy: bool,
    pub substitute_teacher_id: Option<String>,
}

impl OccurrenceRecord {
    pub fn state(&self) -> &'static str {
        match (self.is_present, self.is_proxy) {
            (false, _) => "unmarked",
            (true, false) => "present_regular",
            (true, true) => "present_substitute",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "templateId": self.template_id,
            "date": self.date,
            "state": self.state(),
            "isPresent": self.is_present,
            "isProxy": self.is_proxy,
            "substituteTeacherId": self.substitute_teacher_id,
        })
    }
}

pub(crate) fn load_occurrence(
    conn: &Connection,
    occurrence_id: &str,
) -> Result<Option<OccurrenceRecord>, HandlerErr> {
    conn.query_row(
        "SELECT id, template_id, date, is_present, is_proxy, substitute_teacher_id
         FROM occurrences WHERE id = ?",
        [occurrence_id],
        occurrence_from_row,
    )
    .optional()
    .map_err(HandlerErr::db_query)
}

fn occurrence_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<OccurrenceRecord> {
    Ok(OccurrenceRecord {
        id: r.get(0)?,
        template_id: r.get(1)?,
        date: r.get(2)?,
        is_present: r.get::<_, i64>(3)? != 0,
        is_proxy: r.get::<_, i64>(4)? != 0,
        substitute_teacher_id: r.get(5)?,
    })
}

fn template_exists(conn: &Connection, template_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM schedule_templates WHERE id = ?",
        [template_id],
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::db_query)
}

fn parse_day_of_week(params: &serde_json::Value, key: &str) -> Result<i64, HandlerErr> {
    let day = params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))?;
    if !(0..=6).contains(&day) {
        return Err(HandlerErr::bad_params(
            "dayOfWeek must be 0 (Monday) .. 6 (Sunday)",
        ));
    }
    Ok(day)
}

fn parse_start_time(raw: &str) -> Result<String, HandlerErr> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map(|t| t.format("%H:%M").to_string())
        .map_err(|_| HandlerErr::bad_params("startTime must be HH:MM"))
}

fn templates_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let subject = required_str(params, "subject")?;
    let grade = required_str(params, "grade")?;
    let teacher_id = required_str(params, "teacherId")?;
    let day_of_week = parse_day_of_week(params, "dayOfWeek")?;
    let start_time = parse_start_time(&required_str(params, "startTime")?)?;

    let teacher_known: Option<i64> = conn
        .query_row("SELECT 1 FROM teachers WHERE id = ?", [&teacher_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db_query)?;
    if teacher_known.is_none() {
        return Err(HandlerErr::not_found("teacher not found"));
    }

    let template_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO schedule_templates(id, subject, grade, teacher_id, day_of_week, start_time)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&template_id, &subject, &grade, &teacher_id, day_of_week, &start_time),
    )
    .map_err(HandlerErr::db_update)?;

    Ok(json!({
        "template": {
            "id": template_id,
            "subject": subject,
            "grade": grade,
            "teacherId": teacher_id,
            "dayOfWeek": day_of_week,
            "startTime": start_time,
        }
    }))
}

fn templates_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let teacher_filter = optional_str(params, "teacherId");
    let sql = "SELECT t.id, t.subject, t.grade, t.teacher_id, te.name, t.day_of_week, t.start_time
               FROM schedule_templates t
               JOIN teachers te ON te.id = t.teacher_id
               WHERE (?1 IS NULL OR t.teacher_id = ?1)
               ORDER BY t.day_of_week, t.start_time, t.subject";
    let mut stmt = conn.prepare(sql).map_err(HandlerErr::db_query)?;
    let templates = stmt
        .query_map([&teacher_filter], |r| {
            let day: i64 = r.get(5)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "subject": r.get::<_, String>(1)?,
                "grade": r.get::<_, String>(2)?,
                "teacherId": r.get::<_, String>(3)?,
                "teacherName": r.get::<_, String>(4)?,
                "dayOfWeek": day,
                "dayLabel": payroll::day_of_week_label(day as u32),
                "startTime": r.get::<_, String>(6)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;
    Ok(json!({ "templates": templates }))
}

fn count_occurrences(conn: &Connection, template_id: &str) -> Result<(i64, i64), HandlerErr> {
    conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(is_present), 0) FROM occurrences WHERE template_id = ?",
        [template_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )
    .map_err(HandlerErr::db_query)
}

fn templates_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let template_id = required_str(params, "templateId")?;
    let force = params.get("force").and_then(|v| v.as_bool()).unwrap_or(false);
    let patch = params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::bad_params("missing patch"))?;

    let row: Option<(String, String, String, i64, String)> = conn
        .query_row(
            "SELECT subject, grade, teacher_id, day_of_week, start_time
             FROM schedule_templates WHERE id = ?",
            [&template_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    let Some((mut subject, mut grade, mut teacher_id, mut day_of_week, mut start_time)) = row
    else {
        return Err(HandlerErr::not_found("template not found"));
    };

    // Templates freeze once occurrences reference them; editing the past out
    // from under the ledger needs an explicit override.
    let (occurrence_count, _) = count_occurrences(conn, &template_id)?;
    if occurrence_count > 0 && !force {
        return Err(HandlerErr::conflict(
            "template already has occurrences; pass force to override",
        ));
    }

    if let Some(v) = patch.get("subject").and_then(|v| v.as_str()) {
        let v = v.trim();
        if v.is_empty() {
            return Err(HandlerErr::bad_params("subject must not be empty"));
        }
        subject = v.to_string();
    }
    if let Some(v) = patch.get("grade").and_then(|v| v.as_str()) {
        let v = v.trim();
        if v.is_empty() {
            return Err(HandlerErr::bad_params("grade must not be empty"));
        }
        grade = v.to_string();
    }
    if let Some(v) = patch.get("teacherId").and_then(|v| v.as_str()) {
        let known: Option<i64> = conn
            .query_row("SELECT 1 FROM teachers WHERE id = ?", [v], |r| r.get(0))
            .optional()
            .map_err(HandlerErr::db_query)?;
        if known.is_none() {
            return Err(HandlerErr::not_found("teacher not found"));
        }
        teacher_id = v.to_string();
    }
    if patch.contains_key("dayOfWeek") {
        day_of_week = parse_day_of_week(&serde_json::Value::Object(patch.clone()), "dayOfWeek")?;
    }
    if let Some(v) = patch.get("startTime").and_then(|v| v.as_str()) {
        start_time = parse_start_time(v)?;
    }

    conn.execute(
        "UPDATE schedule_templates
         SET subject = ?, grade = ?, teacher_id = ?, day_of_week = ?, start_time = ?
         WHERE id = ?",
        (&subject, &grade, &teacher_id, day_of_week, &start_time, &template_id),
    )
    .map_err(HandlerErr::db_update)?;

    Ok(json!({
        "template": {
            "id": template_id,
            "subject": subject,
            "grade": grade,
            "teacherId": teacher_id,
            "dayOfWeek": day_of_week,
            "startTime": start_time,
        }
    }))
}

fn templates_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let template_id = required_str(params, "templateId")?;
    let force = params.get("force").and_then(|v| v.as_bool()).unwrap_or(false);

    if !template_exists(conn, &template_id)? {
        return Err(HandlerErr::not_found("template not found"));
    }

    let (occurrence_count, marked_count) = count_occurrences(conn, &template_id)?;
    if occurrence_count > 0 && !force {
        return Err(HandlerErr::conflict(
            "template already has occurrences; pass force to override",
        ));
    }
    // Marked occurrences feed payroll; no override removes them.
    if marked_count > 0 {
        return Err(HandlerErr::conflict(
            "template has marked occurrences and cannot be deleted",
        ));
    }

    let tx = db::immediate_tx(conn).map_err(HandlerErr::db_tx)?;
    tx.execute("DELETE FROM occurrences WHERE template_id = ?", [&template_id])
        .map_err(HandlerErr::db_update)?;
    tx.execute("DELETE FROM schedule_templates WHERE id = ?", [&template_id])
        .map_err(HandlerErr::db_update)?;
    tx.commit().map_err(HandlerErr::db_commit)?;

    Ok(json!({ "ok": true }))
}

/// Idempotent materialization: the UNIQUE(template_id, date) key plus
/// ON CONFLICT DO NOTHING make concurrent calls agree on one row.
fn occurrences_ensure(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let template_id = required_str(params, "templateId")?;
    let date = required_date(params, "date")?.format("%Y-%m-%d").to_string();

    if !template_exists(conn, &template_id)? {
        return Err(HandlerErr::not_found("template not found"));
    }

    let occurrence_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO occurrences(id, template_id, date, is_present, is_proxy)
         VALUES(?, ?, ?, 0, 0)
         ON CONFLICT(template_id, date) DO NOTHING",
        (&occurrence_id, &template_id, &date),
    )
    .map_err(HandlerErr::db_update)?;

    let record = conn
        .query_row(
            "SELECT id, template_id, date, is_present, is_proxy, substitute_teacher_id
             FROM occurrences WHERE template_id = ? AND date = ?",
            (&template_id, &date),
            occurrence_from_row,
        )
        .map_err(HandlerErr::db_query)?;

    Ok(json!({ "occurrence": record.to_json() }))
}

/// Rolling-window expansion for one calendar day: every template scheduled on
/// that weekday gets its occurrence materialized, then the day is returned as
/// the attendance sheet the front end renders.
fn timetable_open_day(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let date = required_date(params, "date")?;
    let date_str = date.format("%Y-%m-%d").to_string();
    let day = payroll::day_of_week_index(date) as i64;

    let template_ids: Vec<String> = {
        let mut stmt = conn
            .prepare("SELECT id FROM schedule_templates WHERE day_of_week = ?")
            .map_err(HandlerErr::db_query)?;
        stmt.query_map([day], |r| r.get(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::db_query)?
    };

    let tx = db::immediate_tx(conn).map_err(HandlerErr::db_tx)?;
    for template_id in &template_ids {
        let occurrence_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO occurrences(id, template_id, date, is_present, is_proxy)
             VALUES(?, ?, ?, 0, 0)
             ON CONFLICT(template_id, date) DO NOTHING",
            (&occurrence_id, template_id, &date_str),
        )
        .map_err(HandlerErr::db_update)?;
    }
    tx.commit().map_err(HandlerErr::db_commit)?;

    let mut stmt = conn
        .prepare(
            "SELECT o.id, o.template_id, o.date, o.is_present, o.is_proxy,
                    o.substitute_teacher_id,
                    t.subject, t.grade, t.start_time,
                    t.teacher_id, te.name, sub.name
             FROM occurrences o
             JOIN schedule_templates t ON t.id = o.template_id
             JOIN teachers te ON te.id = t.teacher_id
             LEFT JOIN teachers sub ON sub.id = o.substitute_teacher_id
             WHERE o.date = ?
             ORDER BY t.start_time, t.subject",
        )
        .map_err(HandlerErr::db_query)?;
    let lectures = stmt
        .query_map([&date_str], |r| {
            let record = occurrence_from_row(r)?;
            let mut v = record.to_json();
            v["subject"] = json!(r.get::<_, String>(6)?);
            v["grade"] = json!(r.get::<_, String>(7)?);
            v["startTime"] = json!(r.get::<_, String>(8)?);
            v["teacherId"] = json!(r.get::<_, String>(9)?);
            v["teacherName"] = json!(r.get::<_, String>(10)?);
            v["substituteTeacherName"] = json!(r.get::<_, Option<String>>(11)?);
            Ok(v)
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    Ok(json!({
        "date": date_str,
        "dayOfWeek": day,
        "dayLabel": payroll::day_of_week_label(day as u32),
        "lectures": lectures,
    }))
}

/// Unmarked occurrences are scaffolding and may be removed; marked ones are
/// ledger input and append-only.
fn occurrences_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let occurrence_id = required_str(params, "occurrenceId")?;

    let deleted = conn
        .execute(
            "DELETE FROM occurrences WHERE id = ? AND is_present = 0",
            [&occurrence_id],
        )
        .map_err(HandlerErr::db_update)?;
    if deleted == 0 {
        return match load_occurrence(conn, &occurrence_id)? {
            Some(_) => Err(HandlerErr::already_marked(
                "occurrence is marked and cannot be deleted",
            )),
            None => Err(HandlerErr::not_found("occurrence not found")),
        };
    }
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let run = |f: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>| {
        match db_conn(state).and_then(|conn| with_conflict_retry(|| f(conn, &req.params))) {
            Ok(result) => ok(&req.id, result),
            Err(e) => e.response(&req.id),
        }
    };

    match req.method.as_str() {
        "templates.create" => Some(run(templates_create)),
        "templates.list" => Some(run(templates_list)),
        "templates.update" => Some(run(templates_update)),
        "templates.delete" => Some(run(templates_delete)),
        "occurrences.ensure" => Some(run(occurrences_ensure)),
        "occurrences.delete" => Some(run(occurrences_delete)),
        "timetable.openDay" => Some(run(timetable_open_day)),
        _ => None,
    }
}
