use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, now_ts, parse_json_array_string, parse_opt_i64, parse_opt_string, required_date,
    required_str,
};
use crate::ipc::types::{AppState, Request};
use chrono::{Datelike, NaiveDate, Weekday};
use rusqlite::{params, params_from_iter, types::Value, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub(super) const STATUS_SCHEDULED: &str = "scheduled";
pub(super) const STATUS_CANCELLED: &str = "cancelled";

pub(super) fn week_bounds(date: NaiveDate) -> (NaiveDate, NaiveDate) {
    let week = date.week(Weekday::Mon);
    (week.first_day(), week.last_day())
}

pub(super) struct CommitRequest {
    pub teacher_id: String,
    pub student_id: String,
    pub date: NaiveDate,
    pub time_slot_id: String,
    pub subject: String,
    pub position: Option<i64>,
    pub pattern_id: Option<String>,
}

pub(super) enum CommitError {
    NotFound(String),
    Conflict(String),
    Db(String),
}

struct TeacherRow {
    subjects: Vec<String>,
    grade_min: i64,
    grade_max: i64,
    cap_week_slots: i64,
    cap_students: i64,
    allow_pair: bool,
    active: bool,
}

struct StudentRow {
    grade: i64,
    one_on_one: bool,
    ng_teacher_ids: Vec<String>,
    active: bool,
}

fn load_teacher(conn: &Connection, id: &str) -> Result<TeacherRow, CommitError> {
    conn.query_row(
        "SELECT subjects_json, grade_min, grade_max, cap_week_slots, cap_students, allow_pair, active
         FROM teachers WHERE id = ?",
        [id],
        |r| {
            let subjects_raw: String = r.get(0)?;
            Ok(TeacherRow {
                subjects: parse_json_array_string(&subjects_raw),
                grade_min: r.get(1)?,
                grade_max: r.get(2)?,
                cap_week_slots: r.get(3)?,
                cap_students: r.get(4)?,
                allow_pair: r.get::<_, i64>(5)? != 0,
                active: r.get::<_, i64>(6)? != 0,
            })
        },
    )
    .optional()
    .map_err(|e| CommitError::Db(e.to_string()))?
    .ok_or_else(|| CommitError::NotFound("teacher not found".to_string()))
}

fn load_student(conn: &Connection, id: &str) -> Result<StudentRow, CommitError> {
    conn.query_row(
        "SELECT grade, one_on_one, ng_teacher_ids_json, active FROM students WHERE id = ?",
        [id],
        |r| {
            let ng_raw: String = r.get(2)?;
            Ok(StudentRow {
                grade: r.get(0)?,
                one_on_one: r.get::<_, i64>(1)? != 0,
                ng_teacher_ids: parse_json_array_string(&ng_raw),
                active: r.get::<_, i64>(3)? != 0,
            })
        },
    )
    .optional()
    .map_err(|e| CommitError::Db(e.to_string()))?
    .ok_or_else(|| CommitError::NotFound("student not found".to_string()))
}

fn ensure_slot_exists(conn: &Connection, id: &str) -> Result<(), CommitError> {
    let found = conn
        .query_row("SELECT 1 FROM time_slots WHERE id = ? LIMIT 1", [id], |_r| Ok(()))
        .optional()
        .map_err(|e| CommitError::Db(e.to_string()))?;
    if found.is_some() {
        Ok(())
    } else {
        Err(CommitError::NotFound("time slot not found".to_string()))
    }
}

/// Commit-time validation and insert. This is the point of truth: the
/// recommendation engine is advisory, so every constraint it filtered on is
/// re-checked here against live state before the row is written.
pub(super) fn commit_assignment(
    conn: &Connection,
    c: &CommitRequest,
) -> Result<(String, i64), CommitError> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| CommitError::Db(e.to_string()))?;

    let teacher = load_teacher(&tx, &c.teacher_id)?;
    let student = load_student(&tx, &c.student_id)?;
    ensure_slot_exists(&tx, &c.time_slot_id)?;

    if !teacher.active {
        return Err(CommitError::Conflict("teacher is inactive".to_string()));
    }
    if !student.active {
        return Err(CommitError::Conflict("student is inactive".to_string()));
    }
    if student.ng_teacher_ids.iter().any(|id| *id == c.teacher_id) {
        return Err(CommitError::Conflict(
            "teacher is on the student's NG list".to_string(),
        ));
    }
    if !teacher.subjects.iter().any(|s| *s == c.subject) {
        return Err(CommitError::Conflict(
            "teacher does not offer this subject".to_string(),
        ));
    }
    if student.grade < teacher.grade_min || student.grade > teacher.grade_max {
        return Err(CommitError::Conflict(
            "student grade is outside the teacher's range".to_string(),
        ));
    }

    // Student double-booking across all teachers.
    let date_str = c.date.format("%Y-%m-%d").to_string();
    let student_busy: i64 = tx
        .query_row(
            "SELECT COUNT(*) FROM assignments
             WHERE student_id = ? AND date = ? AND time_slot_id = ? AND status != 'cancelled'",
            params![c.student_id, date_str, c.time_slot_id],
            |r| r.get(0),
        )
        .map_err(|e| CommitError::Db(e.to_string()))?;
    if student_busy > 0 {
        return Err(CommitError::Conflict(
            "student already has an assignment in this slot".to_string(),
        ));
    }

    // Seat occupancy for this teacher at (date, slot).
    let mut stmt = tx
        .prepare(
            "SELECT a.position, s.one_on_one FROM assignments a
             JOIN students s ON s.id = a.student_id
             WHERE a.teacher_id = ? AND a.date = ? AND a.time_slot_id = ? AND a.status != 'cancelled'",
        )
        .map_err(|e| CommitError::Db(e.to_string()))?;
    let seated: Vec<(i64, bool)> = stmt
        .query_map(params![c.teacher_id, date_str, c.time_slot_id], |r| {
            Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)? != 0))
        })
        .map_err(|e| CommitError::Db(e.to_string()))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CommitError::Db(e.to_string()))?;
    drop(stmt);

    if !seated.is_empty() {
        if seated.len() >= 2 {
            return Err(CommitError::Conflict("slot is full".to_string()));
        }
        if !teacher.allow_pair {
            return Err(CommitError::Conflict(
                "teacher does not accept paired lessons".to_string(),
            ));
        }
        if student.one_on_one {
            return Err(CommitError::Conflict(
                "student requires one-on-one instruction".to_string(),
            ));
        }
        if seated.iter().any(|(_, solo)| *solo) {
            return Err(CommitError::Conflict(
                "current occupant requires one-on-one instruction".to_string(),
            ));
        }
    }

    let position = match c.position {
        Some(p) if (0..=1).contains(&p) => {
            if seated.iter().any(|(taken, _)| *taken == p) {
                return Err(CommitError::Conflict("position already taken".to_string()));
            }
            p
        }
        Some(_) => return Err(CommitError::Conflict("position must be 0 or 1".to_string())),
        None => {
            // First free seat.
            if seated.iter().any(|(p, _)| *p == 0) {
                1
            } else {
                0
            }
        }
    };

    // Weekly slot cap, exempting moves for a student already on the
    // teacher's book in that ISO week.
    let (week_start, week_end) = week_bounds(c.date);
    let ws = week_start.format("%Y-%m-%d").to_string();
    let we = week_end.format("%Y-%m-%d").to_string();
    let week_load: i64 = tx
        .query_row(
            "SELECT COUNT(*) FROM assignments
             WHERE teacher_id = ? AND date BETWEEN ? AND ? AND status != 'cancelled'",
            params![c.teacher_id, ws, we],
            |r| r.get(0),
        )
        .map_err(|e| CommitError::Db(e.to_string()))?;
    if week_load >= teacher.cap_week_slots {
        let same_week_link: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM assignments
                 WHERE teacher_id = ? AND student_id = ? AND date BETWEEN ? AND ?
                   AND status != 'cancelled'",
                params![c.teacher_id, c.student_id, ws, we],
                |r| r.get(0),
            )
            .map_err(|e| CommitError::Db(e.to_string()))?;
        if same_week_link == 0 {
            return Err(CommitError::Conflict(
                "teacher is at the weekly slot cap".to_string(),
            ));
        }
    }

    // Distinct-student cap, exempting students already assigned.
    let distinct_students: i64 = tx
        .query_row(
            "SELECT COUNT(DISTINCT student_id) FROM assignments
             WHERE teacher_id = ? AND status != 'cancelled'",
            [&c.teacher_id],
            |r| r.get(0),
        )
        .map_err(|e| CommitError::Db(e.to_string()))?;
    if distinct_students >= teacher.cap_students {
        let already: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM assignments
                 WHERE teacher_id = ? AND student_id = ? AND status != 'cancelled'",
                params![c.teacher_id, c.student_id],
                |r| r.get(0),
            )
            .map_err(|e| CommitError::Db(e.to_string()))?;
        if already == 0 {
            return Err(CommitError::Conflict(
                "teacher is at the student-count cap".to_string(),
            ));
        }
    }

    let id = Uuid::new_v4().to_string();
    let weekday = c.date.weekday().number_from_monday() as i64;
    let ts = now_ts();
    tx.execute(
        "INSERT INTO assignments(id, teacher_id, student_id, date, weekday, time_slot_id,
            subject, position, status, pattern_id, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            id,
            c.teacher_id,
            c.student_id,
            date_str,
            weekday,
            c.time_slot_id,
            c.subject,
            position,
            STATUS_SCHEDULED,
            c.pattern_id,
            ts,
            ts,
        ],
    )
    .map_err(|e| CommitError::Db(e.to_string()))?;
    tx.commit().map_err(|e| CommitError::Db(e.to_string()))?;
    Ok((id, position))
}

pub(super) fn commit_error_response(id: &str, e: CommitError) -> serde_json::Value {
    match e {
        CommitError::NotFound(m) => err(id, "not_found", m, None),
        CommitError::Conflict(m) => err(id, "conflict", m, None),
        CommitError::Db(m) => err(id, "db_write_failed", m, None),
    }
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let mut clauses: Vec<&str> = vec!["a.status != 'cancelled'"];
    let mut values: Vec<Value> = Vec::new();

    let from = match parse_opt_string(req.params.get("from")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("from {}", m), None),
    };
    if let Some(from) = from {
        clauses.push("a.date >= ?");
        values.push(from.into());
    }
    let to = match parse_opt_string(req.params.get("to")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("to {}", m), None),
    };
    if let Some(to) = to {
        clauses.push("a.date <= ?");
        values.push(to.into());
    }
    if let Ok(Some(teacher_id)) = parse_opt_string(req.params.get("teacherId")) {
        clauses.push("a.teacher_id = ?");
        values.push(teacher_id.into());
    }
    if let Ok(Some(student_id)) = parse_opt_string(req.params.get("studentId")) {
        clauses.push("a.student_id = ?");
        values.push(student_id.into());
    }

    let sql = format!(
        "SELECT a.id, a.teacher_id, t.name, a.student_id, s.name, a.date, a.weekday,
                a.time_slot_id, a.subject, a.position, a.status, a.pattern_id
         FROM assignments a
         JOIN teachers t ON t.id = a.teacher_id
         JOIN students s ON s.id = a.student_id
         WHERE {}
         ORDER BY a.date, a.time_slot_id, a.teacher_id, a.position",
        clauses.join(" AND ")
    );
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = match stmt.query_map(params_from_iter(values), |r| {
        Ok(json!({
            "id": r.get::<_, String>(0)?,
            "teacherId": r.get::<_, String>(1)?,
            "teacherName": r.get::<_, String>(2)?,
            "studentId": r.get::<_, String>(3)?,
            "studentName": r.get::<_, String>(4)?,
            "date": r.get::<_, String>(5)?,
            "weekday": r.get::<_, i64>(6)?,
            "timeSlotId": r.get::<_, String>(7)?,
            "subject": r.get::<_, String>(8)?,
            "position": r.get::<_, i64>(9)?,
            "status": r.get::<_, String>(10)?,
            "patternId": r.get::<_, Option<String>>(11)?,
        }))
    }) {
        Ok(it) => match it.collect::<Result<Vec<_>, _>>() {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        },
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "assignments": rows }))
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let date = match required_date(req, "date") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let time_slot_id = match required_str(req, "timeSlotId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject = match required_str(req, "subject") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let position = match parse_opt_i64(req.params.get("position")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("position {}", m), None),
    };

    let commit = CommitRequest {
        teacher_id,
        student_id,
        date,
        time_slot_id,
        subject,
        position,
        pattern_id: None,
    };
    match commit_assignment(conn, &commit) {
        Ok((id, position)) => ok(&req.id, json!({ "assignmentId": id, "position": position })),
        Err(e) => commit_error_response(&req.id, e),
    }
}

fn handle_cancel(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let assignment_id = match required_str(req, "assignmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match conn.execute(
        "UPDATE assignments SET status = ?, updated_at = ? WHERE id = ? AND status != ?",
        params![STATUS_CANCELLED, now_ts(), assignment_id, STATUS_CANCELLED],
    ) {
        Ok(0) => err(&req.id, "not_found", "assignment not found or already cancelled", None),
        Ok(_) => ok(&req.id, json!({ "assignmentId": assignment_id })),
        Err(e) => err(&req.id, "db_write_failed", e.to_string(), None),
    }
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let assignment_id = match required_str(req, "assignmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match conn.execute("DELETE FROM assignments WHERE id = ?", [&assignment_id]) {
        Ok(0) => err(&req.id, "not_found", "assignment not found", None),
        Ok(_) => ok(&req.id, json!({ "deleted": true })),
        Err(e) => err(&req.id, "db_write_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "assignments.list" => Some(handle_list(state, req)),
        "assignments.create" => Some(handle_create(state, req)),
        "assignments.cancel" => Some(handle_cancel(state, req)),
        "assignments.delete" => Some(handle_delete(state, req)),
        _ => None,
    }
}
