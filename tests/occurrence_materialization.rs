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

fn setup_teacher_and_template(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    day_of_week: i64,
) -> (String, String) {
    let teacher = request_ok(
        stdin,
        reader,
        "t",
        "teachers.create",
        json!({ "name": "Asha", "email": format!("asha{}@academy.test", day_of_week), "payPerLecture": 200.0 }),
    )
    .get("teacher")
    .and_then(|v| v.get("id"))
    .and_then(|v| v.as_str())
    .expect("teacher id")
    .to_string();
    let template = request_ok(
        stdin,
        reader,
        "tpl",
        "templates.create",
        json!({
            "subject": "Math",
            "grade": "8",
            "teacherId": teacher,
            "dayOfWeek": day_of_week,
            "startTime": "09:00"
        }),
    )
    .get("template")
    .and_then(|v| v.get("id"))
    .and_then(|v| v.as_str())
    .expect("template id")
    .to_string();
    (teacher, template)
}

#[test]
fn ensure_is_idempotent_for_one_template_and_date() {
    let workspace = temp_dir("academy-ensure-idempotent");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let (_teacher, template) = setup_teacher_and_template(&mut stdin, &mut reader, 0);

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "occurrences.ensure",
        json!({ "templateId": template, "date": "2025-03-03" }),
    );
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "occurrences.ensure",
        json!({ "templateId": template, "date": "2025-03-03" }),
    );
    assert_eq!(
        first.get("occurrence").and_then(|v| v.get("id")),
        second.get("occurrence").and_then(|v| v.get("id")),
        "repeated ensure must return the same row"
    );

    // A different date is a different row.
    let other = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "occurrences.ensure",
        json!({ "templateId": template, "date": "2025-03-10" }),
    );
    assert_ne!(
        first.get("occurrence").and_then(|v| v.get("id")),
        other.get("occurrence").and_then(|v| v.get("id"))
    );

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn ensure_rejects_unknown_template() {
    let workspace = temp_dir("academy-ensure-missing");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "2",
        "occurrences.ensure",
        json!({ "templateId": "no-such-template", "date": "2025-03-03" }),
    );
    assert_eq!(code, "not_found");

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn ensure_never_resets_a_marked_occurrence() {
    let workspace = temp_dir("academy-ensure-preserves");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let (teacher, template) = setup_teacher_and_template(&mut stdin, &mut reader, 0);
    let ensured = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "occurrences.ensure",
        json!({ "templateId": template, "date": "2025-03-03" }),
    );
    let occurrence_id = ensured
        .get("occurrence")
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .expect("occurrence id")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "attendance.mark",
        json!({ "occurrenceId": occurrence_id, "actingTeacherId": teacher }),
    );

    let again = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "occurrences.ensure",
        json!({ "templateId": template, "date": "2025-03-03" }),
    );
    let occ = again.get("occurrence").expect("occurrence");
    assert_eq!(occ.get("id").and_then(|v| v.as_str()), Some(occurrence_id.as_str()));
    assert_eq!(occ.get("state").and_then(|v| v.as_str()), Some("present_regular"));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn open_day_materializes_only_matching_weekday_templates() {
    let workspace = temp_dir("academy-open-day");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    // Monday template and Tuesday template.
    let (_t1, monday_template) = setup_teacher_and_template(&mut stdin, &mut reader, 0);
    let (_t2, _tuesday_template) = setup_teacher_and_template(&mut stdin, &mut reader, 1);

    // 2025-03-03 is a Monday.
    let day = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "timetable.openDay",
        json!({ "date": "2025-03-03" }),
    );
    assert_eq!(day.get("dayOfWeek").and_then(|v| v.as_i64()), Some(0));
    assert_eq!(day.get("dayLabel").and_then(|v| v.as_str()), Some("Mon"));
    let lectures = day
        .get("lectures")
        .and_then(|v| v.as_array())
        .expect("lectures");
    assert_eq!(lectures.len(), 1);
    assert_eq!(
        lectures[0].get("templateId").and_then(|v| v.as_str()),
        Some(monday_template.as_str())
    );
    assert_eq!(
        lectures[0].get("state").and_then(|v| v.as_str()),
        Some("unmarked")
    );

    // Opening the same day again reuses the materialized rows.
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "timetable.openDay",
        json!({ "date": "2025-03-03" }),
    );
    let again_lectures = again
        .get("lectures")
        .and_then(|v| v.as_array())
        .expect("lectures");
    assert_eq!(again_lectures.len(), 1);
    assert_eq!(
        again_lectures[0].get("id"),
        lectures[0].get("id"),
        "openDay must reuse the existing occurrence"
    );

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn delete_is_allowed_only_before_marking() {
    let workspace = temp_dir("academy-occurrence-delete");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let (teacher, template) = setup_teacher_and_template(&mut stdin, &mut reader, 0);

    let unmarked = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "occurrences.ensure",
        json!({ "templateId": template, "date": "2025-03-03" }),
    );
    let unmarked_id = unmarked
        .get("occurrence")
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .expect("occurrence id")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "occurrences.delete",
        json!({ "occurrenceId": unmarked_id }),
    );

    let marked = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "occurrences.ensure",
        json!({ "templateId": template, "date": "2025-03-10" }),
    );
    let marked_id = marked
        .get("occurrence")
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .expect("occurrence id")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "attendance.mark",
        json!({ "occurrenceId": marked_id, "actingTeacherId": teacher }),
    );
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "6",
        "occurrences.delete",
        json!({ "occurrenceId": marked_id }),
    );
    assert_eq!(code, "already_marked");

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "7",
        "occurrences.delete",
        json!({ "occurrenceId": "no-such-occurrence" }),
    );
    assert_eq!(code, "not_found");

    let _ = std::fs::remove_dir_all(workspace);
}
