use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, json_array_string, now_ts, parse_bool, parse_json_array_string, parse_opt_i64,
    parse_opt_string, parse_string_array, required_str,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn teacher_row_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let subjects_raw: String = r.get(2)?;
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "subjects": parse_json_array_string(&subjects_raw),
        "gradeMin": r.get::<_, i64>(3)?,
        "gradeMax": r.get::<_, i64>(4)?,
        "capWeekSlots": r.get::<_, i64>(5)?,
        "capStudents": r.get::<_, i64>(6)?,
        "allowPair": r.get::<_, i64>(7)? != 0,
        "active": r.get::<_, i64>(8)? != 0,
        "sortOrder": r.get::<_, i64>(9)?,
        "updatedAt": r.get::<_, Option<String>>(10)?,
    }))
}

const TEACHER_COLUMNS: &str = "id, name, subjects_json, grade_min, grade_max, cap_week_slots,
    cap_students, allow_pair, active, sort_order, updated_at";

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let include_inactive = match parse_bool(req.params.get("includeInactive"), false) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("includeInactive {}", m), None),
    };
    let sql = if include_inactive {
        format!(
            "SELECT {} FROM teachers ORDER BY sort_order, id",
            TEACHER_COLUMNS
        )
    } else {
        format!(
            "SELECT {} FROM teachers WHERE active = 1 ORDER BY sort_order, id",
            TEACHER_COLUMNS
        )
    };
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let teachers = match stmt.query_map([], |r| teacher_row_json(r)) {
        Ok(rows) => match rows.collect::<Result<Vec<_>, _>>() {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        },
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "teachers": teachers }))
}

struct TeacherInput {
    name: String,
    subjects: Vec<String>,
    grade_min: i64,
    grade_max: i64,
    cap_week_slots: i64,
    cap_students: i64,
    allow_pair: bool,
    active: bool,
}

fn parse_input(input: &serde_json::Value) -> Result<TeacherInput, String> {
    let name = input
        .get("name")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or("missing input.name")?;
    let subjects = parse_string_array(input.get("subjects")).map_err(|m| format!("subjects {}", m))?;
    if subjects.is_empty() {
        return Err("subjects must contain at least one subject".to_string());
    }
    let grade_min = input
        .get("gradeMin")
        .and_then(|v| v.as_i64())
        .ok_or("missing input.gradeMin")?;
    let grade_max = input
        .get("gradeMax")
        .and_then(|v| v.as_i64())
        .ok_or("missing input.gradeMax")?;
    if grade_min > grade_max {
        return Err("gradeMin must not exceed gradeMax".to_string());
    }
    let cap_week_slots = input
        .get("capWeekSlots")
        .and_then(|v| v.as_i64())
        .filter(|v| *v > 0)
        .ok_or("capWeekSlots must be a positive integer")?;
    let cap_students = input
        .get("capStudents")
        .and_then(|v| v.as_i64())
        .filter(|v| *v > 0)
        .ok_or("capStudents must be a positive integer")?;
    let allow_pair = parse_bool(input.get("allowPair"), true).map_err(|m| format!("allowPair {}", m))?;
    let active = parse_bool(input.get("active"), true).map_err(|m| format!("active {}", m))?;
    Ok(TeacherInput {
        name,
        subjects,
        grade_min,
        grade_max,
        cap_week_slots,
        cap_students,
        allow_pair,
        active,
    })
}

fn next_sort_order(conn: &Connection) -> Result<i64, String> {
    conn.query_row(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM teachers",
        [],
        |r| r.get(0),
    )
    .map_err(|e| e.to_string())
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let input = req.params.get("input").cloned().unwrap_or(json!({}));
    let parsed = match parse_input(&input) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let sort_order = match next_sort_order(conn) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "db_query_failed", m, None),
    };
    let id = Uuid::new_v4().to_string();
    let write = conn.execute(
        "INSERT INTO teachers(id, name, subjects_json, grade_min, grade_max, cap_week_slots,
            cap_students, allow_pair, active, sort_order, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            id,
            parsed.name,
            json_array_string(&parsed.subjects),
            parsed.grade_min,
            parsed.grade_max,
            parsed.cap_week_slots,
            parsed.cap_students,
            parsed.allow_pair as i64,
            parsed.active as i64,
            sort_order,
            now_ts(),
        ],
    );
    match write {
        Ok(_) => ok(&req.id, json!({ "teacherId": id })),
        Err(e) => err(&req.id, "db_write_failed", e.to_string(), None),
    }
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exists = conn
        .query_row(
            "SELECT 1 FROM teachers WHERE id = ? LIMIT 1",
            [&teacher_id],
            |_r| Ok(()),
        )
        .optional();
    match exists {
        Ok(Some(())) => {}
        Ok(None) => return err(&req.id, "not_found", "teacher not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let patch = req.params.get("patch").cloned().unwrap_or(json!({}));
    let mut sets: Vec<String> = Vec::new();
    let mut values: Vec<rusqlite::types::Value> = Vec::new();

    if let Ok(Some(name)) = parse_opt_string(patch.get("name")) {
        sets.push("name = ?".to_string());
        values.push(name.into());
    }
    if patch.get("subjects").is_some() {
        let subjects = match parse_string_array(patch.get("subjects")) {
            Ok(v) if !v.is_empty() => v,
            Ok(_) => {
                return err(&req.id, "bad_params", "subjects must not be empty", None)
            }
            Err(m) => return err(&req.id, "bad_params", format!("subjects {}", m), None),
        };
        sets.push("subjects_json = ?".to_string());
        values.push(json_array_string(&subjects).into());
    }
    let grade_min_patch = match parse_opt_i64(patch.get("gradeMin")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("gradeMin {}", m), None),
    };
    let grade_max_patch = match parse_opt_i64(patch.get("gradeMax")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("gradeMax {}", m), None),
    };
    if grade_min_patch.is_some() || grade_max_patch.is_some() {
        // Validate the range the row would end up with, not just the patched side.
        let stored: (i64, i64) = match conn.query_row(
            "SELECT grade_min, grade_max FROM teachers WHERE id = ?",
            [&teacher_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        ) {
            Ok(v) => v,
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                return err(&req.id, "not_found", "teacher not found", None)
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if grade_min_patch.unwrap_or(stored.0) > grade_max_patch.unwrap_or(stored.1) {
            return err(&req.id, "bad_params", "gradeMin must not exceed gradeMax", None);
        }
    }
    if let Some(v) = grade_min_patch {
        sets.push("grade_min = ?".to_string());
        values.push(v.into());
    }
    if let Some(v) = grade_max_patch {
        sets.push("grade_max = ?".to_string());
        values.push(v.into());
    }
    for (key, column) in [("capWeekSlots", "cap_week_slots"), ("capStudents", "cap_students")] {
        match parse_opt_i64(patch.get(key)) {
            Ok(Some(v)) => {
                if v <= 0 {
                    return err(
                        &req.id,
                        "bad_params",
                        format!("{} must be a positive integer", key),
                        None,
                    );
                }
                sets.push(format!("{} = ?", column));
                values.push(v.into());
            }
            Ok(None) => {}
            Err(m) => return err(&req.id, "bad_params", format!("{} {}", key, m), None),
        }
    }
    for (key, column) in [("allowPair", "allow_pair"), ("active", "active")] {
        if let Some(raw) = patch.get(key) {
            match raw.as_bool() {
                Some(v) => {
                    sets.push(format!("{} = ?", column));
                    values.push((v as i64).into());
                }
                None => return err(&req.id, "bad_params", format!("{} must be boolean", key), None),
            }
        }
    }

    if sets.is_empty() {
        return err(&req.id, "bad_params", "patch has no recognized fields", None);
    }
    sets.push("updated_at = ?".to_string());
    values.push(now_ts().into());
    values.push(teacher_id.clone().into());

    let sql = format!("UPDATE teachers SET {} WHERE id = ?", sets.join(", "));
    match conn.execute(&sql, rusqlite::params_from_iter(values)) {
        Ok(_) => ok(&req.id, json!({ "teacherId": teacher_id })),
        Err(e) => err(&req.id, "db_write_failed", e.to_string(), None),
    }
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let referenced: Result<i64, _> = conn.query_row(
        "SELECT (SELECT COUNT(*) FROM assignments WHERE teacher_id = ?1 AND status != 'cancelled')
              + (SELECT COUNT(*) FROM patterns WHERE teacher_id = ?1)",
        [&teacher_id],
        |r| r.get(0),
    );
    match referenced {
        Ok(0) => {}
        Ok(_) => {
            return err(
                &req.id,
                "conflict",
                "teacher has live assignments or patterns; cancel and remove them first",
                None,
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    // Only cancelled assignment rows can remain; they go with the teacher.
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_write_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute("DELETE FROM assignments WHERE teacher_id = ?", [&teacher_id]) {
        return err(&req.id, "db_write_failed", e.to_string(), None);
    }
    match tx.execute("DELETE FROM teachers WHERE id = ?", [&teacher_id]) {
        Ok(0) => return err(&req.id, "not_found", "teacher not found", None),
        Ok(_) => {}
        Err(e) => return err(&req.id, "db_write_failed", e.to_string(), None),
    }
    match tx.commit() {
        Ok(()) => ok(&req.id, json!({ "deleted": true })),
        Err(e) => err(&req.id, "db_write_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "teachers.list" => Some(handle_list(state, req)),
        "teachers.create" => Some(handle_create(state, req)),
        "teachers.update" => Some(handle_update(state, req)),
        "teachers.delete" => Some(handle_delete(state, req)),
        _ => None,
    }
}
