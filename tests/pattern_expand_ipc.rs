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
    let exe = env!("CARGO_BIN_EXE_lessond");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn lessond");
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
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "expected ok for {}: {}",
        method,
        value
    );
    value.get("result").cloned().expect("result")
}

fn request_err(
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
        "expected error for {}: {}",
        method,
        value
    );
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

struct Seed {
    teacher_id: String,
    student_id: String,
    slot_id: String,
}

fn seed_roster(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> Seed {
    let teacher_id = request_ok(
        stdin,
        reader,
        "seed-t",
        "teachers.create",
        json!({ "input": {
            "name": "Pattern Teacher",
            "subjects": ["math"],
            "gradeMin": 1,
            "gradeMax": 9,
            "capWeekSlots": 10,
            "capStudents": 10
        }}),
    )
    .get("teacherId")
    .and_then(|v| v.as_str())
    .expect("teacherId")
    .to_string();
    let student_id = request_ok(
        stdin,
        reader,
        "seed-s",
        "students.create",
        json!({ "input": { "name": "Pattern Student", "grade": 5, "subjects": ["math"] } }),
    )
    .get("studentId")
    .and_then(|v| v.as_str())
    .expect("studentId")
    .to_string();
    let slot_id = request_ok(
        stdin,
        reader,
        "seed-ts",
        "timeslots.create",
        json!({ "input": { "label": "P1", "startTime": "16:00" } }),
    )
    .get("timeSlotId")
    .and_then(|v| v.as_str())
    .expect("timeSlotId")
    .to_string();
    Seed {
        teacher_id,
        student_id,
        slot_id,
    }
}

fn create_pattern(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    seed: &Seed,
    weekday: i64,
    start_date: &str,
) -> String {
    request_ok(
        stdin,
        reader,
        id,
        "patterns.create",
        json!({ "input": {
            "teacherId": seed.teacher_id,
            "studentId": seed.student_id,
            "timeSlotId": seed.slot_id,
            "subject": "math",
            "weekday": weekday,
            "startDate": start_date
        }}),
    )
    .get("patternId")
    .and_then(|v| v.as_str())
    .expect("patternId")
    .to_string()
}

#[test]
fn expand_materializes_weekly_occurrences_idempotently() {
    let workspace = temp_dir("lessond-expand");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seed = seed_roster(&mut stdin, &mut reader);
    // Mondays starting 2026-03-02.
    let _pattern_id = create_pattern(&mut stdin, &mut reader, "2", &seed, 1, "2026-03-02");

    let expanded = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "patterns.expand",
        json!({ "from": "2026-03-02", "to": "2026-03-15" }),
    );
    assert_eq!(
        expanded.get("createdCount").and_then(|v| v.as_i64()),
        Some(2)
    );
    let created = expanded
        .get("created")
        .and_then(|v| v.as_array())
        .expect("created");
    let dates: Vec<&str> = created
        .iter()
        .filter_map(|c| c.get("date").and_then(|v| v.as_str()))
        .collect();
    assert_eq!(dates, vec!["2026-03-02", "2026-03-09"]);

    // Re-running the same range creates nothing new.
    let expanded = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "patterns.expand",
        json!({ "from": "2026-03-02", "to": "2026-03-15" }),
    );
    assert_eq!(
        expanded.get("createdCount").and_then(|v| v.as_i64()),
        Some(0)
    );
    let skipped = expanded
        .get("skipped")
        .and_then(|v| v.as_array())
        .expect("skipped");
    assert_eq!(skipped.len(), 2);
    assert!(skipped
        .iter()
        .all(|s| s.get("reason").and_then(|v| v.as_str()) == Some("already_materialized")));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "assignments.list",
        json!({ "teacherId": seed.teacher_id }),
    );
    assert_eq!(
        listed
            .get("assignments")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(2)
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn exceptions_skip_and_move_occurrences() {
    let workspace = temp_dir("lessond-exceptions");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seed = seed_roster(&mut stdin, &mut reader);
    let pattern_id = create_pattern(&mut stdin, &mut reader, "2", &seed, 1, "2026-03-02");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "patterns.exceptions.set",
        json!({ "patternId": pattern_id, "date": "2026-03-02", "kind": "skip" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "patterns.exceptions.set",
        json!({
            "patternId": pattern_id,
            "date": "2026-03-09",
            "kind": "move",
            "movedDate": "2026-03-10"
        }),
    );

    let listed = request_ok(&mut stdin, &mut reader, "5", "patterns.list", json!({}));
    let pattern = &listed
        .get("patterns")
        .and_then(|v| v.as_array())
        .expect("patterns")[0];
    assert_eq!(
        pattern
            .get("exceptions")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(2)
    );

    let expanded = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "patterns.expand",
        json!({ "from": "2026-03-02", "to": "2026-03-15" }),
    );
    assert_eq!(
        expanded.get("createdCount").and_then(|v| v.as_i64()),
        Some(1)
    );
    let created = expanded
        .get("created")
        .and_then(|v| v.as_array())
        .expect("created");
    assert_eq!(
        created[0].get("date").and_then(|v| v.as_str()),
        Some("2026-03-10")
    );
    let skipped = expanded
        .get("skipped")
        .and_then(|v| v.as_array())
        .expect("skipped");
    assert!(skipped
        .iter()
        .any(|s| s.get("reason").and_then(|v| v.as_str()) == Some("exception_skip")
            && s.get("date").and_then(|v| v.as_str()) == Some("2026-03-02")));

    // Clearing removes the override; clearing again reports nothing there.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "patterns.exceptions.clear",
        json!({ "patternId": pattern_id, "date": "2026-03-02" }),
    );
    let code = request_err(
        &mut stdin,
        &mut reader,
        "8",
        "patterns.exceptions.clear",
        json!({ "patternId": pattern_id, "date": "2026-03-02" }),
    );
    assert_eq!(code, "not_found");

    let code = request_err(
        &mut stdin,
        &mut reader,
        "9",
        "patterns.exceptions.set",
        json!({ "patternId": pattern_id, "date": "2026-03-16", "kind": "vanish" }),
    );
    assert_eq!(code, "bad_params");
    let code = request_err(
        &mut stdin,
        &mut reader,
        "10",
        "patterns.exceptions.set",
        json!({ "patternId": pattern_id, "date": "2026-03-16", "kind": "move" }),
    );
    assert_eq!(code, "bad_params");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn expand_reports_commit_conflicts_per_occurrence() {
    let workspace = temp_dir("lessond-expand-conflict");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seed = seed_roster(&mut stdin, &mut reader);
    let other_teacher = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "teachers.create",
        json!({ "input": {
            "name": "Other",
            "subjects": ["math"],
            "gradeMin": 1,
            "gradeMax": 9,
            "capWeekSlots": 10,
            "capStudents": 10
        }}),
    )
    .get("teacherId")
    .and_then(|v| v.as_str())
    .expect("teacherId")
    .to_string();

    let _pattern_id = create_pattern(&mut stdin, &mut reader, "3", &seed, 1, "2026-03-02");
    // The student is already booked elsewhere on the first Monday.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "assignments.create",
        json!({
            "teacherId": other_teacher,
            "studentId": seed.student_id,
            "date": "2026-03-02",
            "timeSlotId": seed.slot_id,
            "subject": "math"
        }),
    );

    let expanded = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "patterns.expand",
        json!({ "from": "2026-03-02", "to": "2026-03-08" }),
    );
    assert_eq!(
        expanded.get("createdCount").and_then(|v| v.as_i64()),
        Some(0)
    );
    let skipped = expanded
        .get("skipped")
        .and_then(|v| v.as_array())
        .expect("skipped");
    assert_eq!(skipped.len(), 1);
    assert_eq!(
        skipped[0].get("reason").and_then(|v| v.as_str()),
        Some("conflict")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn pattern_delete_guard_and_window_bounds() {
    let workspace = temp_dir("lessond-pattern-delete");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seed = seed_roster(&mut stdin, &mut reader);
    let pattern_id = create_pattern(&mut stdin, &mut reader, "2", &seed, 1, "2026-03-09");

    // The window start keeps earlier matching weekdays out.
    let expanded = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "patterns.expand",
        json!({ "from": "2026-03-02", "to": "2026-03-15" }),
    );
    assert_eq!(
        expanded.get("createdCount").and_then(|v| v.as_i64()),
        Some(1)
    );

    let code = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "patterns.delete",
        json!({ "patternId": pattern_id }),
    );
    assert_eq!(code, "conflict");

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "assignments.list",
        json!({ "teacherId": seed.teacher_id }),
    );
    let assignment_id = listed
        .get("assignments")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .and_then(|r| r.get("id"))
        .and_then(|v| v.as_str())
        .expect("assignment id")
        .to_string();
    assert_eq!(
        listed
            .get("assignments")
            .and_then(|v| v.as_array())
            .and_then(|a| a.first())
            .and_then(|r| r.get("patternId"))
            .and_then(|v| v.as_str()),
        Some(pattern_id.as_str())
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "assignments.cancel",
        json!({ "assignmentId": assignment_id }),
    );
    let deleted = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "patterns.delete",
        json!({ "patternId": pattern_id }),
    );
    assert_eq!(deleted.get("deleted").and_then(|v| v.as_bool()), Some(true));

    // The detached cancelled row no longer pins the roster either.
    for (id, method, params) in [
        ("8", "timeslots.delete", json!({ "timeSlotId": seed.slot_id })),
        ("9", "students.delete", json!({ "studentId": seed.student_id })),
        ("10", "teachers.delete", json!({ "teacherId": seed.teacher_id })),
    ] {
        let result = request_ok(&mut stdin, &mut reader, id, method, params);
        assert_eq!(result.get("deleted").and_then(|v| v.as_bool()), Some(true), "for {}", method);
    }

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn inactive_pattern_still_blocks_roster_deletes() {
    let workspace = temp_dir("lessond-inactive-pattern");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seed = seed_roster(&mut stdin, &mut reader);
    let pattern_id = create_pattern(&mut stdin, &mut reader, "2", &seed, 1, "2026-03-02");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "patterns.update",
        json!({ "patternId": pattern_id, "patch": { "active": false } }),
    );
    let code = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "teachers.delete",
        json!({ "teacherId": seed.teacher_id }),
    );
    assert_eq!(code, "conflict");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "patterns.delete",
        json!({ "patternId": pattern_id }),
    );
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "teachers.delete",
        json!({ "teacherId": seed.teacher_id }),
    );
    assert_eq!(result.get("deleted").and_then(|v| v.as_bool()), Some(true));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn pattern_update_rejects_inverted_window() {
    let workspace = temp_dir("lessond-pattern-window");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seed = seed_roster(&mut stdin, &mut reader);
    let pattern_id = create_pattern(&mut stdin, &mut reader, "2", &seed, 1, "2026-03-02");

    // Patching one bound is checked against the stored other bound.
    let code = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "patterns.update",
        json!({ "patternId": pattern_id, "patch": { "endDate": "2026-02-01" } }),
    );
    assert_eq!(code, "bad_params");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "patterns.update",
        json!({ "patternId": pattern_id, "patch": { "endDate": "2026-03-30" } }),
    );
    let code = request_err(
        &mut stdin,
        &mut reader,
        "5",
        "patterns.update",
        json!({ "patternId": pattern_id, "patch": { "startDate": "2026-04-06" } }),
    );
    assert_eq!(code, "bad_params");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "patterns.update",
        json!({ "patternId": pattern_id, "patch": { "startDate": "2026-04-06", "endDate": "2026-04-27" } }),
    );

    let listed = request_ok(&mut stdin, &mut reader, "7", "patterns.list", json!({}));
    let row = &listed.get("patterns").and_then(|v| v.as_array()).expect("patterns")[0];
    assert_eq!(row.get("startDate").and_then(|v| v.as_str()), Some("2026-04-06"));
    assert_eq!(row.get("endDate").and_then(|v| v.as_str()), Some("2026-04-27"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
