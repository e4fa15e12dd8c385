use super::{db_conn, optional_str, parse_date, required_f64, required_str};
use crate::db;
use crate::ipc::error::{ok, with_conflict_retry, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::payroll::{round2, MONEY_EPSILON};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StudentRow {
    id: String,
    fname: String,
    lname: String,
    grade: String,
    total_fees: f64,
    fees_paid: f64,
}

impl StudentRow {
    fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "fname": self.fname,
            "lname": self.lname,
            "grade": self.grade,
            "totalFees": self.total_fees,
            "feesPaid": self.fees_paid,
            "remainingFee": round2(self.total_fees - self.fees_paid),
        })
    }
}

fn student_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<StudentRow> {
    Ok(StudentRow {
        id: r.get(0)?,
        fname: r.get(1)?,
        lname: r.get(2)?,
        grade: r.get(3)?,
        total_fees: r.get(4)?,
        fees_paid: r.get(5)?,
    })
}

const STUDENT_COLS: &str = "id, fname, lname, grade, total_fees, fees_paid";

fn find_student_by_name(
    conn: &Connection,
    grade: &str,
    fname: &str,
    lname: &str,
) -> Result<Option<StudentRow>, HandlerErr> {
    conn.query_row(
        &format!(
            "SELECT {STUDENT_COLS} FROM students
             WHERE LOWER(grade) = LOWER(?) AND LOWER(fname) = LOWER(?) AND LOWER(lname) = LOWER(?)"
        ),
        (grade, fname, lname),
        student_from_row,
    )
    .optional()
    .map_err(HandlerErr::db_query)
}

fn load_student(conn: &Connection, student_id: &str) -> Result<Option<StudentRow>, HandlerErr> {
    conn.query_row(
        &format!("SELECT {STUDENT_COLS} FROM students WHERE id = ?"),
        [student_id],
        student_from_row,
    )
    .optional()
    .map_err(HandlerErr::db_query)
}

fn students_lookup(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let grade = required_str(params, "grade")?;
    let fname = required_str(params, "fname")?;
    let lname = required_str(params, "lname")?;

    match find_student_by_name(conn, &grade, &fname, &lname)? {
        Some(student) => {
            let mut v = student.to_json();
            v["exists"] = json!(true);
            Ok(v)
        }
        None => Ok(json!({ "exists": false })),
    }
}

fn students_find_or_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let grade = required_str(params, "grade")?;
    let fname = required_str(params, "fname")?;
    let lname = required_str(params, "lname")?;

    // Serialize lookup and insert so two clerks entering the same new student
    // cannot both create a row.
    let tx = db::immediate_tx(conn).map_err(HandlerErr::db_tx)?;
    if let Some(student) = {
        tx.query_row(
            &format!(
                "SELECT {STUDENT_COLS} FROM students
                 WHERE LOWER(grade) = LOWER(?) AND LOWER(fname) = LOWER(?) AND LOWER(lname) = LOWER(?)"
            ),
            (&grade, &fname, &lname),
            student_from_row,
        )
        .optional()
        .map_err(HandlerErr::db_query)?
    } {
        return Ok(json!({ "created": false, "student": student.to_json() }));
    }

    let total_fees = match params.get("totalFees") {
        Some(v) if !v.is_null() => v
            .as_f64()
            .ok_or_else(|| HandlerErr::bad_params("totalFees must be a number"))?,
        _ => {
            return Err(HandlerErr::missing_total_fees(
                "totalFees required for a new student",
            ))
        }
    };
    if total_fees <= 0.0 {
        return Err(HandlerErr::invalid_amount("totalFees must be > 0"));
    }

    let student_id = Uuid::new_v4().to_string();
    let created_at = chrono::Utc::now().to_rfc3339();
    tx.execute(
        "INSERT INTO students(id, fname, lname, grade, total_fees, fees_paid, created_at)
         VALUES(?, ?, ?, ?, ?, 0, ?)",
        (&student_id, &fname, &lname, &grade, total_fees, &created_at),
    )
    .map_err(HandlerErr::db_update)?;
    tx.commit().map_err(HandlerErr::db_commit)?;

    let student = StudentRow {
        id: student_id,
        fname,
        lname,
        grade,
        total_fees,
        fees_paid: 0.0,
    };
    Ok(json!({ "created": true, "student": student.to_json() }))
}

fn payment_json(
    id: &str,
    student_id: &str,
    date: &str,
    amount: f64,
    recorded_by: Option<&str>,
) -> serde_json::Value {
    json!({
        "id": id,
        "studentId": student_id,
        "date": date,
        "amount": amount,
        "recordedBy": recorded_by,
    })
}

/// Overpayment check and cache increment as one guarded UPDATE: either both
/// happen or neither, and two concurrent installments cannot jointly overpay.
fn apply_fees_delta(
    tx: &rusqlite::Transaction<'_>,
    student_id: &str,
    delta: f64,
) -> Result<bool, HandlerErr> {
    let updated = tx
        .execute(
            "UPDATE students
             SET fees_paid = ROUND(fees_paid + ?1, 2)
             WHERE id = ?2
               AND fees_paid + ?1 <= total_fees + ?3
               AND fees_paid + ?1 >= -?3",
            (delta, student_id, MONEY_EPSILON),
        )
        .map_err(HandlerErr::db_update)?;
    Ok(updated > 0)
}

fn payments_record(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let amount = required_f64(params, "amount")?;
    if amount <= 0.0 {
        return Err(HandlerErr::invalid_amount("amount must be > 0"));
    }
    let recorded_by = optional_str(params, "recordedBy");
    let date = match optional_str(params, "date") {
        Some(raw) => parse_date(&raw, "date")?.format("%Y-%m-%d").to_string(),
        None => chrono::Utc::now().date_naive().format("%Y-%m-%d").to_string(),
    };

    let tx = db::immediate_tx(conn).map_err(HandlerErr::db_tx)?;
    if !apply_fees_delta(&tx, &student_id, amount)? {
        let student = tx
            .query_row(
                &format!("SELECT {STUDENT_COLS} FROM students WHERE id = ?"),
                [&student_id],
                student_from_row,
            )
            .optional()
            .map_err(HandlerErr::db_query)?;
        return match student {
            None => Err(HandlerErr::not_found("student not found")),
            Some(s) => {
                let mut e = HandlerErr::overpayment_rejected("payment exceeds remaining fee");
                e.details = Some(json!({
                    "remainingFee": round2(s.total_fees - s.fees_paid)
                }));
                Err(e)
            }
        };
    }

    let payment_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO payments(id, student_id, date, amount, recorded_by)
         VALUES(?, ?, ?, ?, ?)",
        (&payment_id, &student_id, &date, amount, &recorded_by),
    )
    .map_err(HandlerErr::db_update)?;
    tx.commit().map_err(HandlerErr::db_commit)?;

    let student = load_student(conn, &student_id)?
        .ok_or_else(|| HandlerErr::not_found("student not found"))?;
    Ok(json!({
        "payment": payment_json(&payment_id, &student_id, &date, amount, recorded_by.as_deref()),
        "student": student.to_json(),
    }))
}

fn payments_edit(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let payment_id = required_str(params, "paymentId")?;
    let new_amount = required_f64(params, "amount")?;
    if new_amount < 0.0 {
        return Err(HandlerErr::invalid_amount("amount cannot be negative"));
    }

    let tx = db::immediate_tx(conn).map_err(HandlerErr::db_tx)?;
    let row: Option<(String, String, f64, Option<String>)> = tx
        .query_row(
            "SELECT student_id, date, amount, recorded_by FROM payments WHERE id = ?",
            [&payment_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    let Some((student_id, date, old_amount, recorded_by)) = row else {
        return Err(HandlerErr::not_found("payment not found"));
    };

    // Delta adjustment, never a resum: a concurrent insert between our read
    // and write would make a recomputed total wrong, a delta stays right.
    let delta = new_amount - old_amount;
    if !apply_fees_delta(&tx, &student_id, delta)? {
        return Err(HandlerErr::overpayment_rejected(
            "edited amount exceeds remaining fee",
        ));
    }
    tx.execute(
        "UPDATE payments SET amount = ? WHERE id = ?",
        (new_amount, &payment_id),
    )
    .map_err(HandlerErr::db_update)?;
    tx.commit().map_err(HandlerErr::db_commit)?;

    let student = load_student(conn, &student_id)?
        .ok_or_else(|| HandlerErr::not_found("student not found"))?;
    Ok(json!({
        "payment": payment_json(&payment_id, &student_id, &date, new_amount, recorded_by.as_deref()),
        "student": student.to_json(),
    }))
}

fn payments_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let payment_id = required_str(params, "paymentId")?;

    let tx = db::immediate_tx(conn).map_err(HandlerErr::db_tx)?;
    let row: Option<(String, f64)> = tx
        .query_row(
            "SELECT student_id, amount FROM payments WHERE id = ?",
            [&payment_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    let Some((student_id, amount)) = row else {
        return Err(HandlerErr::not_found("payment not found"));
    };

    if !apply_fees_delta(&tx, &student_id, -amount)? {
        // fees_paid always covers its own payments; hitting this means the
        // cache is inconsistent, not a business-rule rejection.
        return Err(HandlerErr::conflict("student balance out of sync"));
    }
    tx.execute("DELETE FROM payments WHERE id = ?", [&payment_id])
        .map_err(HandlerErr::db_update)?;
    tx.commit().map_err(HandlerErr::db_commit)?;

    let student = load_student(conn, &student_id)?
        .ok_or_else(|| HandlerErr::not_found("student not found"))?;
    Ok(json!({ "ok": true, "student": student.to_json() }))
}

fn payments_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_filter = optional_str(params, "studentId");
    let mut stmt = conn
        .prepare(
            "SELECT p.id, p.student_id, p.date, p.amount, p.recorded_by,
                    s.fname, s.lname, s.grade
             FROM payments p
             JOIN students s ON s.id = p.student_id
             WHERE (?1 IS NULL OR p.student_id = ?1)
             ORDER BY p.date DESC, p.rowid DESC",
        )
        .map_err(HandlerErr::db_query)?;
    let payments = stmt
        .query_map([&student_filter], |r| {
            let id: String = r.get(0)?;
            let student_id: String = r.get(1)?;
            let date: String = r.get(2)?;
            let amount: f64 = r.get(3)?;
            let recorded_by: Option<String> = r.get(4)?;
            let mut v = payment_json(&id, &student_id, &date, amount, recorded_by.as_deref());
            v["studentFname"] = json!(r.get::<_, String>(5)?);
            v["studentLname"] = json!(r.get::<_, String>(6)?);
            v["studentGrade"] = json!(r.get::<_, String>(7)?);
            Ok(v)
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;
    Ok(json!({ "payments": payments }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let run = |f: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>| {
        match db_conn(state).and_then(|conn| with_conflict_retry(|| f(conn, &req.params))) {
            Ok(result) => ok(&req.id, result),
            Err(e) => e.response(&req.id),
        }
    };

    match req.method.as_str() {
        "students.lookup" => Some(run(students_lookup)),
        "students.findOrCreate" => Some(run(students_find_or_create)),
        "payments.record" => Some(run(payments_record)),
        "payments.edit" => Some(run(payments_edit)),
        "payments.delete" => Some(run(payments_delete)),
        "payments.list" => Some(run(payments_list)),
        _ => None,
    }
}
