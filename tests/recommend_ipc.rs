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

fn create_teacher(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    input: serde_json::Value,
) -> String {
    request_ok(stdin, reader, id, "teachers.create", json!({ "input": input }))
        .get("teacherId")
        .and_then(|v| v.as_str())
        .expect("teacherId")
        .to_string()
}

fn create_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    input: serde_json::Value,
) -> String {
    request_ok(stdin, reader, id, "students.create", json!({ "input": input }))
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string()
}

fn create_slot(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    label: &str,
) -> String {
    request_ok(
        stdin,
        reader,
        id,
        "timeslots.create",
        json!({ "input": { "label": label } }),
    )
    .get("timeSlotId")
    .and_then(|v| v.as_str())
    .expect("timeSlotId")
    .to_string()
}

fn recommend(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    student_id: &str,
    date: &str,
    slot_id: &str,
    subject: &str,
) -> serde_json::Value {
    request_ok(
        stdin,
        reader,
        id,
        "recommend.teachers",
        json!({
            "studentId": student_id,
            "date": date,
            "timeSlotId": slot_id,
            "subject": subject
        }),
    )
}

fn ranked_ids(result: &serde_json::Value) -> Vec<String> {
    result
        .get("ranked")
        .and_then(|v| v.as_array())
        .expect("ranked")
        .iter()
        .map(|c| {
            c.get("teacherId")
                .and_then(|v| v.as_str())
                .expect("teacherId")
                .to_string()
        })
        .collect()
}

fn standard_teacher(name: &str) -> serde_json::Value {
    json!({
        "name": name,
        "subjects": ["math"],
        "gradeMin": 1,
        "gradeMax": 9,
        "capWeekSlots": 10,
        "capStudents": 10
    })
}

#[test]
fn lighter_load_ranks_first() {
    let workspace = temp_dir("lessond-rec-load");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let busy = create_teacher(&mut stdin, &mut reader, "2", standard_teacher("Busy"));
    let idle = create_teacher(&mut stdin, &mut reader, "3", standard_teacher("Idle"));
    let slot = create_slot(&mut stdin, &mut reader, "4", "P1");
    let filler1 = create_student(
        &mut stdin,
        &mut reader,
        "5",
        json!({ "name": "F1", "grade": 5, "subjects": ["math"] }),
    );
    let filler2 = create_student(
        &mut stdin,
        &mut reader,
        "6",
        json!({ "name": "F2", "grade": 5, "subjects": ["math"] }),
    );
    let target = create_student(
        &mut stdin,
        &mut reader,
        "7",
        json!({ "name": "Target", "grade": 5, "subjects": ["math"] }),
    );

    // Load the busy teacher with two slots in the request week.
    for (id, filler, date) in [("8", &filler1, "2026-03-02"), ("9", &filler2, "2026-03-03")] {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            id,
            "assignments.create",
            json!({
                "teacherId": busy,
                "studentId": filler,
                "date": date,
                "timeSlotId": slot,
                "subject": "math"
            }),
        );
    }

    let rec = recommend(
        &mut stdin,
        &mut reader,
        "10",
        &target,
        "2026-03-04",
        &slot,
        "math",
    );
    assert_eq!(ranked_ids(&rec), vec![idle.clone(), busy.clone()]);
    assert_eq!(
        rec.get("disqualified")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(0)
    );

    // The breakdown carries one entry per rule, in precedence order.
    let breakdown = rec
        .get("ranked")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .and_then(|c| c.get("breakdown"))
        .and_then(|v| v.as_array())
        .expect("breakdown");
    let rules: Vec<&str> = breakdown
        .iter()
        .filter_map(|r| r.get("rule").and_then(|v| v.as_str()))
        .collect();
    assert_eq!(
        rules,
        vec!["continuity", "loadBalance", "studentBalance", "pairing", "gradeFit"]
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn continuity_outranks_load_until_reweighted() {
    let workspace = temp_dir("lessond-rec-continuity");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let familiar = create_teacher(&mut stdin, &mut reader, "2", standard_teacher("Familiar"));
    let fresh = create_teacher(&mut stdin, &mut reader, "3", standard_teacher("Fresh"));
    let slot = create_slot(&mut stdin, &mut reader, "4", "P1");
    let target = create_student(
        &mut stdin,
        &mut reader,
        "5",
        json!({ "name": "Target", "grade": 5, "subjects": ["math"] }),
    );
    let filler = create_student(
        &mut stdin,
        &mut reader,
        "6",
        json!({ "name": "Filler", "grade": 5, "subjects": ["math"] }),
    );

    // History with the familiar teacher, weeks before the request.
    for (id, date) in [("7", "2026-02-10"), ("8", "2026-02-17")] {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            id,
            "assignments.create",
            json!({
                "teacherId": familiar,
                "studentId": target,
                "date": date,
                "timeSlotId": slot,
                "subject": "math"
            }),
        );
    }
    // And current load on the familiar teacher in the request week.
    for (id, date) in [("9", "2026-03-02"), ("10", "2026-03-03")] {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            id,
            "assignments.create",
            json!({
                "teacherId": familiar,
                "studentId": filler,
                "date": date,
                "timeSlotId": slot,
                "subject": "math"
            }),
        );
    }

    let rec = recommend(
        &mut stdin,
        &mut reader,
        "11",
        &target,
        "2026-03-04",
        &slot,
        "math",
    );
    assert_eq!(ranked_ids(&rec)[0], familiar);

    // Zeroing the continuity weight flips the order.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "setup.update",
        json!({ "section": "recommend", "patch": { "continuityWeight": 0 } }),
    );
    let rec = recommend(
        &mut stdin,
        &mut reader,
        "13",
        &target,
        "2026-03-04",
        &slot,
        "math",
    );
    assert_eq!(ranked_ids(&rec)[0], fresh);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn hard_constraints_surface_as_disqualifications() {
    let workspace = temp_dir("lessond-rec-disqualify");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let ok_teacher = create_teacher(&mut stdin, &mut reader, "2", standard_teacher("Fine"));
    let english_only = create_teacher(
        &mut stdin,
        &mut reader,
        "3",
        json!({
            "name": "English", "subjects": ["english"], "gradeMin": 1, "gradeMax": 9,
            "capWeekSlots": 10, "capStudents": 10
        }),
    );
    let juniors_only = create_teacher(
        &mut stdin,
        &mut reader,
        "4",
        json!({
            "name": "Juniors", "subjects": ["math"], "gradeMin": 1, "gradeMax": 3,
            "capWeekSlots": 10, "capStudents": 10
        }),
    );
    let blocked = create_teacher(&mut stdin, &mut reader, "5", standard_teacher("Blocked"));
    let slot = create_slot(&mut stdin, &mut reader, "6", "P1");
    let target = create_student(
        &mut stdin,
        &mut reader,
        "7",
        json!({
            "name": "Target", "grade": 5, "subjects": ["math"],
            "ngTeacherIds": [blocked]
        }),
    );

    let rec = recommend(
        &mut stdin,
        &mut reader,
        "8",
        &target,
        "2026-03-04",
        &slot,
        "math",
    );
    assert_eq!(ranked_ids(&rec), vec![ok_teacher.clone()]);
    let disqualified = rec
        .get("disqualified")
        .and_then(|v| v.as_array())
        .expect("disqualified");
    let reason_for = |id: &str| {
        disqualified
            .iter()
            .find(|d| d.get("teacherId").and_then(|v| v.as_str()) == Some(id))
            .and_then(|d| d.get("reason"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string()
    };
    assert_eq!(reason_for(&blocked), "ng_listed");
    assert_eq!(reason_for(&english_only), "subject_not_offered");
    assert_eq!(reason_for(&juniors_only), "grade_out_of_range");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn week_cap_disqualifies_new_students_only() {
    let workspace = temp_dir("lessond-rec-week-cap");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let capped = create_teacher(
        &mut stdin,
        &mut reader,
        "2",
        json!({
            "name": "Capped", "subjects": ["math"], "gradeMin": 1, "gradeMax": 9,
            "capWeekSlots": 1, "capStudents": 10
        }),
    );
    let slot = create_slot(&mut stdin, &mut reader, "3", "P1");
    let regular = create_student(
        &mut stdin,
        &mut reader,
        "4",
        json!({ "name": "Regular", "grade": 5, "subjects": ["math"] }),
    );
    let newcomer = create_student(
        &mut stdin,
        &mut reader,
        "5",
        json!({ "name": "Newcomer", "grade": 5, "subjects": ["math"] }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "assignments.create",
        json!({
            "teacherId": capped,
            "studentId": regular,
            "date": "2026-03-02",
            "timeSlotId": slot,
            "subject": "math"
        }),
    );

    // The newcomer sees the cap.
    let rec = recommend(
        &mut stdin,
        &mut reader,
        "7",
        &newcomer,
        "2026-03-04",
        &slot,
        "math",
    );
    assert!(ranked_ids(&rec).is_empty());
    let disqualified = rec
        .get("disqualified")
        .and_then(|v| v.as_array())
        .expect("disqualified");
    assert_eq!(
        disqualified[0].get("reason").and_then(|v| v.as_str()),
        Some("week_cap_reached")
    );

    // The student already on the book that week is exempt (a move).
    let rec = recommend(
        &mut stdin,
        &mut reader,
        "8",
        &regular,
        "2026-03-04",
        &slot,
        "math",
    );
    assert_eq!(ranked_ids(&rec), vec![capped.clone()]);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn empty_roster_yields_empty_recommendation() {
    let workspace = temp_dir("lessond-rec-empty");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let slot = create_slot(&mut stdin, &mut reader, "2", "P1");
    let target = create_student(
        &mut stdin,
        &mut reader,
        "3",
        json!({ "name": "Alone", "grade": 5, "subjects": ["math"] }),
    );

    let rec = recommend(
        &mut stdin,
        &mut reader,
        "4",
        &target,
        "2026-03-04",
        &slot,
        "math",
    );
    assert!(ranked_ids(&rec).is_empty());
    assert_eq!(
        rec.get("disqualified")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(0)
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn bad_request_and_missing_student_are_reported() {
    let workspace = temp_dir("lessond-rec-errors");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let slot = create_slot(&mut stdin, &mut reader, "2", "P1");
    let target = create_student(
        &mut stdin,
        &mut reader,
        "3",
        json!({ "name": "T", "grade": 5, "subjects": ["math"] }),
    );

    let value = request(
        &mut stdin,
        &mut reader,
        "4",
        "recommend.teachers",
        json!({
            "studentId": target,
            "date": "03/04/2026",
            "timeSlotId": slot,
            "subject": "math"
        }),
    );
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("bad_params")
    );

    let value = request(
        &mut stdin,
        &mut reader,
        "5",
        "recommend.teachers",
        json!({
            "studentId": "missing",
            "date": "2026-03-04",
            "timeSlotId": slot,
            "subject": "math"
        }),
    );
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("not_found")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
