use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, json_array_string, now_ts, parse_bool, parse_json_array_string, parse_opt_i64,
    parse_opt_string, parse_string_array, required_str,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const STUDENT_COLUMNS: &str = "id, name, grade, subjects_json, one_on_one, ng_teacher_ids_json,
    active, sort_order, updated_at";

fn student_row_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let subjects_raw: String = r.get(3)?;
    let ng_raw: String = r.get(5)?;
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "grade": r.get::<_, i64>(2)?,
        "subjects": parse_json_array_string(&subjects_raw),
        "oneOnOne": r.get::<_, i64>(4)? != 0,
        "ngTeacherIds": parse_json_array_string(&ng_raw),
        "active": r.get::<_, i64>(6)? != 0,
        "sortOrder": r.get::<_, i64>(7)?,
        "updatedAt": r.get::<_, Option<String>>(8)?,
    }))
}

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
            "SELECT {} FROM students ORDER BY sort_order, id",
            STUDENT_COLUMNS
        )
    } else {
        format!(
            "SELECT {} FROM students WHERE active = 1 ORDER BY sort_order, id",
            STUDENT_COLUMNS
        )
    };
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let students = match stmt.query_map([], |r| student_row_json(r)) {
        Ok(rows) => match rows.collect::<Result<Vec<_>, _>>() {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        },
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "students": students }))
}

fn next_sort_order(conn: &Connection) -> Result<i64, String> {
    conn.query_row(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM students",
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
    let name = match input
        .get("name")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing input.name", None),
    };
    let grade = match input.get("grade").and_then(|v| v.as_i64()) {
        Some(v) if v > 0 => v,
        _ => return err(&req.id, "bad_params", "grade must be a positive integer", None),
    };
    let subjects = match parse_string_array(input.get("subjects")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("subjects {}", m), None),
    };
    let ng_teacher_ids = match parse_string_array(input.get("ngTeacherIds")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("ngTeacherIds {}", m), None),
    };
    let one_on_one = match parse_bool(input.get("oneOnOne"), false) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("oneOnOne {}", m), None),
    };
    let active = match parse_bool(input.get("active"), true) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("active {}", m), None),
    };
    let sort_order = match next_sort_order(conn) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "db_query_failed", m, None),
    };

    let id = Uuid::new_v4().to_string();
    let write = conn.execute(
        "INSERT INTO students(id, name, grade, subjects_json, one_on_one, ng_teacher_ids_json,
            active, sort_order, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            id,
            name,
            grade,
            json_array_string(&subjects),
            one_on_one as i64,
            json_array_string(&ng_teacher_ids),
            active as i64,
            sort_order,
            now_ts(),
        ],
    );
    match write {
        Ok(_) => ok(&req.id, json!({ "studentId": id })),
        Err(e) => err(&req.id, "db_write_failed", e.to_string(), None),
    }
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exists = conn
        .query_row(
            "SELECT 1 FROM students WHERE id = ? LIMIT 1",
            [&student_id],
            |_r| Ok(()),
        )
        .optional();
    match exists {
        Ok(Some(())) => {}
        Ok(None) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let patch = req.params.get("patch").cloned().unwrap_or(json!({}));
    let mut sets: Vec<String> = Vec::new();
    let mut values: Vec<rusqlite::types::Value> = Vec::new();

    if let Ok(Some(name)) = parse_opt_string(patch.get("name")) {
        sets.push("name = ?".to_string());
        values.push(name.into());
    }
    match parse_opt_i64(patch.get("grade")) {
        Ok(Some(v)) if v > 0 => {
            sets.push("grade = ?".to_string());
            values.push(v.into());
        }
        Ok(Some(_)) => return err(&req.id, "bad_params", "grade must be a positive integer", None),
        Ok(None) => {}
        Err(m) => return err(&req.id, "bad_params", format!("grade {}", m), None),
    }
    if patch.get("subjects").is_some() {
        match parse_string_array(patch.get("subjects")) {
            Ok(v) => {
                sets.push("subjects_json = ?".to_string());
                values.push(json_array_string(&v).into());
            }
            Err(m) => return err(&req.id, "bad_params", format!("subjects {}", m), None),
        }
    }
    if patch.get("ngTeacherIds").is_some() {
        match parse_string_array(patch.get("ngTeacherIds")) {
            Ok(v) => {
                sets.push("ng_teacher_ids_json = ?".to_string());
                values.push(json_array_string(&v).into());
            }
            Err(m) => return err(&req.id, "bad_params", format!("ngTeacherIds {}", m), None),
        }
    }
    for (key, column) in [("oneOnOne", "one_on_one"), ("active", "active")] {
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
    values.push(student_id.clone().into());

    let sql = format!("UPDATE students SET {} WHERE id = ?", sets.join(", "));
    match conn.execute(&sql, rusqlite::params_from_iter(values)) {
        Ok(_) => ok(&req.id, json!({ "studentId": student_id })),
        Err(e) => err(&req.id, "db_write_failed", e.to_string(), None),
    }
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let referenced: Result<i64, _> = conn.query_row(
        "SELECT (SELECT COUNT(*) FROM assignments WHERE student_id = ?1 AND status != 'cancelled')
              + (SELECT COUNT(*) FROM patterns WHERE student_id = ?1)",
        [&student_id],
        |r| r.get(0),
    );
    match referenced {
        Ok(0) => {}
        Ok(_) => {
            return err(
                &req.id,
                "conflict",
                "student has live assignments or patterns; cancel and remove them first",
                None,
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    // Only cancelled assignment rows can remain; they go with the student.
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_write_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute("DELETE FROM assignments WHERE student_id = ?", [&student_id]) {
        return err(&req.id, "db_write_failed", e.to_string(), None);
    }
    match tx.execute("DELETE FROM students WHERE id = ?", [&student_id]) {
        Ok(0) => return err(&req.id, "not_found", "student not found", None),
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
        "students.list" => Some(handle_list(state, req)),
        "students.create" => Some(handle_create(state, req)),
        "students.update" => Some(handle_update(state, req)),
        "students.delete" => Some(handle_delete(state, req)),
        _ => None,
    }
}
