use super::{db_conn, required_f64, required_str};
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn teacher_json(
    id: &str,
    name: &str,
    email: &str,
    pay_per_lecture: f64,
    active: bool,
) -> serde_json::Value {
    json!({
        "id": id,
        "name": name,
        "email": email,
        "payPerLecture": pay_per_lecture,
        "active": active
    })
}

fn email_in_use(conn: &Connection, email: &str, exclude_id: Option<&str>) -> Result<bool, HandlerErr> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM teachers WHERE email = ?",
            [email],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    Ok(match existing {
        Some(id) => exclude_id != Some(id.as_str()),
        None => false,
    })
}

fn teachers_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = required_str(params, "name")?;
    let email = required_str(params, "email")?.to_lowercase();
    let pay_per_lecture = required_f64(params, "payPerLecture")?;
    if pay_per_lecture < 0.0 {
        return Err(HandlerErr::invalid_amount(
            "payPerLecture cannot be negative",
        ));
    }
    if email_in_use(conn, &email, None)? {
        return Err(HandlerErr::bad_params("email already exists"));
    }

    let teacher_id = Uuid::new_v4().to_string();
    let created_at = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO teachers(id, name, email, pay_per_lecture, active, created_at)
         VALUES(?, ?, ?, ?, 1, ?)",
        (&teacher_id, &name, &email, pay_per_lecture, &created_at),
    )
    .map_err(HandlerErr::db_update)?;

    Ok(json!({
        "teacher": teacher_json(&teacher_id, &name, &email, pay_per_lecture, true)
    }))
}

fn teachers_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name, email, pay_per_lecture, active
             FROM teachers
             ORDER BY created_at DESC, id",
        )
        .map_err(HandlerErr::db_query)?;
    let teachers = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let name: String = r.get(1)?;
            let email: String = r.get(2)?;
            let pay: f64 = r.get(3)?;
            let active: i64 = r.get(4)?;
            Ok(teacher_json(&id, &name, &email, pay, active != 0))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;
    Ok(json!({ "teachers": teachers }))
}

fn teachers_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = required_str(params, "teacherId")?;
    let patch = params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::bad_params("missing patch"))?;

    let row: Option<(String, String, f64, i64)> = conn
        .query_row(
            "SELECT name, email, pay_per_lecture, active FROM teachers WHERE id = ?",
            [&teacher_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    let Some((mut name, mut email, mut pay, active)) = row else {
        return Err(HandlerErr::not_found("teacher not found"));
    };

    if let Some(v) = patch.get("name").and_then(|v| v.as_str()) {
        let v = v.trim();
        if v.is_empty() {
            return Err(HandlerErr::bad_params("name must not be empty"));
        }
        name = v.to_string();
    }
    if let Some(v) = patch.get("email").and_then(|v| v.as_str()) {
        let v = v.trim().to_lowercase();
        if v.is_empty() {
            return Err(HandlerErr::bad_params("email must not be empty"));
        }
        if email_in_use(conn, &v, Some(&teacher_id))? {
            return Err(HandlerErr::bad_params("email already in use"));
        }
        email = v;
    }
    if let Some(v) = patch.get("payPerLecture") {
        let v = v
            .as_f64()
            .ok_or_else(|| HandlerErr::bad_params("payPerLecture must be a number"))?;
        if v < 0.0 {
            return Err(HandlerErr::invalid_amount(
                "payPerLecture cannot be negative",
            ));
        }
        pay = v;
    }

    conn.execute(
        "UPDATE teachers SET name = ?, email = ?, pay_per_lecture = ? WHERE id = ?",
        (&name, &email, pay, &teacher_id),
    )
    .map_err(HandlerErr::db_update)?;

    Ok(json!({
        "teacher": teacher_json(&teacher_id, &name, &email, pay, active != 0)
    }))
}

fn teachers_set_active(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = required_str(params, "teacherId")?;
    let active = params
        .get("active")
        .and_then(|v| v.as_bool())
        .ok_or_else(|| HandlerErr::bad_params("missing active"))?;

    let updated = conn
        .execute(
            "UPDATE teachers SET active = ? WHERE id = ?",
            (active as i64, &teacher_id),
        )
        .map_err(HandlerErr::db_update)?;
    if updated == 0 {
        return Err(HandlerErr::not_found("teacher not found"));
    }
    Ok(json!({ "teacherId": teacher_id, "active": active }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let run = |f: fn(&rusqlite::Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>| {
        match db_conn(state).and_then(|conn| f(conn, &req.params)) {
            Ok(result) => ok(&req.id, result),
            Err(e) => e.response(&req.id),
        }
    };

    match req.method.as_str() {
        "teachers.create" => Some(run(teachers_create)),
        "teachers.list" => Some(run(|conn, _| teachers_list(conn))),
        "teachers.update" => Some(run(teachers_update)),
        "teachers.setActive" => Some(run(teachers_set_active)),
        _ => None,
    }
}
