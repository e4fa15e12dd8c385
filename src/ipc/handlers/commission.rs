use super::{db_conn, required_date, required_f64, required_str};
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::payroll::{commission_amount, round2};
use rusqlite::Connection;
use serde_json::json;

/// Sums the payments a sales agent recorded over `[from, to)`. The agent id
/// is a non-owning reference on each payment; there is nothing to cascade.
fn commission_compute(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let agent_id = required_str(params, "agentId")?;
    let from = required_date(params, "from")?;
    let to = required_date(params, "to")?;
    if to < from {
        return Err(HandlerErr::bad_params("to must not precede from"));
    }
    let rate = required_f64(params, "rate")?;
    if rate < 0.0 {
        return Err(HandlerErr::invalid_amount("rate cannot be negative"));
    }

    let mut stmt = conn
        .prepare(
            "SELECT p.id, p.student_id, p.date, p.amount, s.fname, s.lname, s.grade
             FROM payments p
             JOIN students s ON s.id = p.student_id
             WHERE p.recorded_by = ?1 AND p.date >= ?2 AND p.date < ?3
             ORDER BY p.date, p.rowid",
        )
        .map_err(HandlerErr::db_query)?;
    let from_str = from.format("%Y-%m-%d").to_string();
    let to_str = to.format("%Y-%m-%d").to_string();

    let mut total_amount = 0.0_f64;
    let line_items = stmt
        .query_map((&agent_id, &from_str, &to_str), |r| {
            let amount: f64 = r.get(3)?;
            Ok((
                json!({
                    "paymentId": r.get::<_, String>(0)?,
                    "studentId": r.get::<_, String>(1)?,
                    "date": r.get::<_, String>(2)?,
                    "amount": amount,
                    "studentFname": r.get::<_, String>(4)?,
                    "studentLname": r.get::<_, String>(5)?,
                    "studentGrade": r.get::<_, String>(6)?,
                }),
                amount,
            ))
        })
        .and_then(|it| {
            it.map(|res| {
                res.map(|(item, amount)| {
                    total_amount += amount;
                    item
                })
            })
            .collect::<Result<Vec<_>, _>>()
        })
        .map_err(HandlerErr::db_query)?;

    let total_amount = round2(total_amount);
    Ok(json!({
        "agentId": agent_id,
        "from": from_str,
        "to": to_str,
        "ratePercent": rate,
        "totalAmount": total_amount,
        "totalCommission": commission_amount(total_amount, rate),
        "lineItems": line_items,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "commission.compute" => {
            let resp = match db_conn(state).and_then(|conn| commission_compute(conn, &req.params)) {
                Ok(result) => ok(&req.id, result),
                Err(e) => e.response(&req.id),
            };
            Some(resp)
        }
        _ => None,
    }
}
