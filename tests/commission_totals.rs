use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_academyd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn academyd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err_code(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .expect("error code")
        .to_string()
}

fn create_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    fname: &str,
) -> String {
    request_ok(
        stdin,
        reader,
        id,
        "students.findOrCreate",
        json!({ "grade": "8", "fname": fname, "lname": "Commission", "totalFees": 50000.0 }),
    )
    .get("student")
    .and_then(|v| v.get("id"))
    .and_then(|v| v.as_str())
    .expect("student id")
    .to_string()
}

fn record_payment(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    student_id: &str,
    amount: f64,
    agent: &str,
    date: &str,
) {
    let _ = request_ok(
        stdin,
        reader,
        id,
        "payments.record",
        json!({ "studentId": student_id, "amount": amount, "recordedBy": agent, "date": date }),
    );
}

#[test]
fn commission_sums_only_the_agents_payments_in_the_period() {
    let workspace = temp_dir("academy-commission");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let s1 = create_student(&mut stdin, &mut reader, "2", "First");
    let s2 = create_student(&mut stdin, &mut reader, "3", "Second");

    record_payment(&mut stdin, &mut reader, "4", &s1, 1000.0, "agent-1", "2025-03-04");
    record_payment(&mut stdin, &mut reader, "5", &s2, 2500.0, "agent-1", "2025-03-20");
    // Another agent's work and out-of-period work never count.
    record_payment(&mut stdin, &mut reader, "6", &s1, 500.0, "agent-2", "2025-03-05");
    record_payment(&mut stdin, &mut reader, "7", &s2, 700.0, "agent-1", "2025-04-02");
    record_payment(&mut stdin, &mut reader, "8", &s1, 900.0, "agent-1", "2025-02-28");

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "commission.compute",
        json!({ "agentId": "agent-1", "from": "2025-03-01", "to": "2025-04-01", "rate": 2.5 }),
    );
    assert_eq!(
        report.get("totalAmount").and_then(|v| v.as_f64()),
        Some(3500.0)
    );
    assert_eq!(
        report.get("totalCommission").and_then(|v| v.as_f64()),
        Some(87.5)
    );
    let items = report
        .get("lineItems")
        .and_then(|v| v.as_array())
        .expect("lineItems");
    assert_eq!(items.len(), 2);
    assert_eq!(
        items[0].get("date").and_then(|v| v.as_str()),
        Some("2025-03-04")
    );
    assert_eq!(
        items[1].get("amount").and_then(|v| v.as_f64()),
        Some(2500.0)
    );

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn commission_handles_empty_periods_and_rejects_negative_rates() {
    let workspace = temp_dir("academy-commission-edges");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "commission.compute",
        json!({ "agentId": "agent-9", "from": "2025-03-01", "to": "2025-04-01", "rate": 5.0 }),
    );
    assert_eq!(report.get("totalAmount").and_then(|v| v.as_f64()), Some(0.0));
    assert_eq!(
        report.get("totalCommission").and_then(|v| v.as_f64()),
        Some(0.0)
    );
    assert_eq!(
        report
            .get("lineItems")
            .and_then(|v| v.as_array())
            .map(|v| v.len()),
        Some(0)
    );

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "3",
        "commission.compute",
        json!({ "agentId": "agent-9", "from": "2025-03-01", "to": "2025-04-01", "rate": -1.0 }),
    );
    assert_eq!(code, "invalid_amount");

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "4",
        "commission.compute",
        json!({ "agentId": "agent-9", "from": "2025-04-01", "to": "2025-03-01", "rate": 1.0 }),
    );
    assert_eq!(code, "bad_params");

    let _ = std::fs::remove_dir_all(workspace);
}
