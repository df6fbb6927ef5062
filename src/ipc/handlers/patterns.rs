use crate::ipc::error::{err, ok};
use crate::ipc::handlers::assignments::{commit_assignment, CommitError, CommitRequest};
use crate::ipc::helpers::{
    db_conn, parse_bool, parse_iso_date, parse_opt_i64, parse_opt_string, required_date,
    required_str,
};
use crate::ipc::types::{AppState, Request};
use chrono::{Datelike, Duration as ChronoDuration, NaiveDate};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const EXCEPTION_SKIP: &str = "skip";
const EXCEPTION_MOVE: &str = "move";

fn ensure_exists(conn: &Connection, table: &str, id: &str) -> Result<bool, String> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ? LIMIT 1", table);
    conn.query_row(&sql, [id], |_r| Ok(()))
        .optional()
        .map(|v| v.is_some())
        .map_err(|e| e.to_string())
}

fn exceptions_json(conn: &Connection, pattern_id: &str) -> Result<Vec<serde_json::Value>, String> {
    let mut stmt = conn
        .prepare(
            "SELECT date, kind, moved_date, moved_time_slot_id
             FROM pattern_exceptions WHERE pattern_id = ? ORDER BY date",
        )
        .map_err(|e| e.to_string())?;
    let rows = stmt
        .query_map([pattern_id], |r| {
            Ok(json!({
                "date": r.get::<_, String>(0)?,
                "kind": r.get::<_, String>(1)?,
                "movedDate": r.get::<_, Option<String>>(2)?,
                "movedTimeSlotId": r.get::<_, Option<String>>(3)?,
            }))
        })
        .map_err(|e| e.to_string())?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| e.to_string())?;
    Ok(rows)
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
    let mut clauses: Vec<&str> = Vec::new();
    let mut values: Vec<rusqlite::types::Value> = Vec::new();
    if !include_inactive {
        clauses.push("p.active = 1");
    }
    if let Ok(Some(teacher_id)) = parse_opt_string(req.params.get("teacherId")) {
        clauses.push("p.teacher_id = ?");
        values.push(teacher_id.into());
    }
    if let Ok(Some(student_id)) = parse_opt_string(req.params.get("studentId")) {
        clauses.push("p.student_id = ?");
        values.push(student_id.into());
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let sql = format!(
        "SELECT p.id, p.teacher_id, t.name, p.student_id, s.name, p.weekday, p.time_slot_id,
                p.subject, p.position, p.start_date, p.end_date, p.active
         FROM patterns p
         JOIN teachers t ON t.id = p.teacher_id
         JOIN students s ON s.id = p.student_id
         {}
         ORDER BY p.weekday, p.time_slot_id, p.id",
        where_sql
    );
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let raw = match stmt.query_map(rusqlite::params_from_iter(values), |r| {
        Ok((
            r.get::<_, String>(0)?,
            json!({
                "id": r.get::<_, String>(0)?,
                "teacherId": r.get::<_, String>(1)?,
                "teacherName": r.get::<_, String>(2)?,
                "studentId": r.get::<_, String>(3)?,
                "studentName": r.get::<_, String>(4)?,
                "weekday": r.get::<_, i64>(5)?,
                "timeSlotId": r.get::<_, String>(6)?,
                "subject": r.get::<_, String>(7)?,
                "position": r.get::<_, i64>(8)?,
                "startDate": r.get::<_, String>(9)?,
                "endDate": r.get::<_, Option<String>>(10)?,
                "active": r.get::<_, i64>(11)? != 0,
            }),
        ))
    }) {
        Ok(it) => match it.collect::<Result<Vec<_>, _>>() {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        },
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let mut patterns = Vec::with_capacity(raw.len());
    for (id, mut row) in raw {
        match exceptions_json(conn, &id) {
            Ok(ex) => {
                row["exceptions"] = json!(ex);
                patterns.push(row);
            }
            Err(m) => return err(&req.id, "db_query_failed", m, None),
        }
    }
    ok(&req.id, json!({ "patterns": patterns }))
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let input = req.params.get("input").cloned().unwrap_or(json!({}));
    let get_str = |key: &str| {
        input
            .get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };
    let Some(teacher_id) = get_str("teacherId") else {
        return err(&req.id, "bad_params", "missing input.teacherId", None);
    };
    let Some(student_id) = get_str("studentId") else {
        return err(&req.id, "bad_params", "missing input.studentId", None);
    };
    let Some(time_slot_id) = get_str("timeSlotId") else {
        return err(&req.id, "bad_params", "missing input.timeSlotId", None);
    };
    let Some(subject) = get_str("subject") else {
        return err(&req.id, "bad_params", "missing input.subject", None);
    };
    let weekday = match input.get("weekday").and_then(|v| v.as_i64()) {
        Some(v) if (1..=7).contains(&v) => v,
        _ => return err(&req.id, "bad_params", "weekday must be 1 (Mon) through 7 (Sun)", None),
    };
    let position = match parse_opt_i64(input.get("position")) {
        Ok(Some(p)) if (0..=1).contains(&p) => p,
        Ok(Some(_)) => return err(&req.id, "bad_params", "position must be 0 or 1", None),
        Ok(None) => 0,
        Err(m) => return err(&req.id, "bad_params", format!("position {}", m), None),
    };
    let Some(start_date) = get_str("startDate").and_then(|s| parse_iso_date(&s)) else {
        return err(&req.id, "bad_params", "startDate must be YYYY-MM-DD", None);
    };
    let end_date = match parse_opt_string(input.get("endDate")) {
        Ok(Some(raw)) => match parse_iso_date(&raw) {
            Some(d) => {
                if d < start_date {
                    return err(&req.id, "bad_params", "endDate must not precede startDate", None);
                }
                Some(d)
            }
            None => return err(&req.id, "bad_params", "endDate must be YYYY-MM-DD", None),
        },
        Ok(None) => None,
        Err(m) => return err(&req.id, "bad_params", format!("endDate {}", m), None),
    };

    for (table, id, label) in [
        ("teachers", &teacher_id, "teacher"),
        ("students", &student_id, "student"),
        ("time_slots", &time_slot_id, "time slot"),
    ] {
        match ensure_exists(conn, table, id) {
            Ok(true) => {}
            Ok(false) => return err(&req.id, "not_found", format!("{} not found", label), None),
            Err(m) => return err(&req.id, "db_query_failed", m, None),
        }
    }

    let id = Uuid::new_v4().to_string();
    let write = conn.execute(
        "INSERT INTO patterns(id, teacher_id, student_id, weekday, time_slot_id, subject,
            position, start_date, end_date, active)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, 1)",
        params![
            id,
            teacher_id,
            student_id,
            weekday,
            time_slot_id,
            subject,
            position,
            start_date.format("%Y-%m-%d").to_string(),
            end_date.map(|d| d.format("%Y-%m-%d").to_string()),
        ],
    );
    match write {
        Ok(_) => ok(&req.id, json!({ "patternId": id })),
        Err(e) => err(&req.id, "db_write_failed", e.to_string(), None),
    }
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let pattern_id = match required_str(req, "patternId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match ensure_exists(conn, "patterns", &pattern_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "pattern not found", None),
        Err(m) => return err(&req.id, "db_query_failed", m, None),
    }

    let patch = req.params.get("patch").cloned().unwrap_or(json!({}));
    let mut sets: Vec<&str> = Vec::new();
    let mut values: Vec<rusqlite::types::Value> = Vec::new();

    match parse_opt_i64(patch.get("weekday")) {
        Ok(Some(v)) if (1..=7).contains(&v) => {
            sets.push("weekday = ?");
            values.push(v.into());
        }
        Ok(Some(_)) => {
            return err(&req.id, "bad_params", "weekday must be 1 (Mon) through 7 (Sun)", None)
        }
        Ok(None) => {}
        Err(m) => return err(&req.id, "bad_params", format!("weekday {}", m), None),
    }
    if let Ok(Some(slot)) = parse_opt_string(patch.get("timeSlotId")) {
        match ensure_exists(conn, "time_slots", &slot) {
            Ok(true) => {
                sets.push("time_slot_id = ?");
                values.push(slot.into());
            }
            Ok(false) => return err(&req.id, "not_found", "time slot not found", None),
            Err(m) => return err(&req.id, "db_query_failed", m, None),
        }
    }
    if let Ok(Some(subject)) = parse_opt_string(patch.get("subject")) {
        sets.push("subject = ?");
        values.push(subject.into());
    }
    let mut start_patch = None;
    let mut end_patch = None;
    for (key, out) in [("startDate", &mut start_patch), ("endDate", &mut end_patch)] {
        if let Ok(Some(raw)) = parse_opt_string(patch.get(key)) {
            let Some(d) = parse_iso_date(&raw) else {
                return err(&req.id, "bad_params", format!("{} must be YYYY-MM-DD", key), None);
            };
            *out = Some(d);
        }
    }
    if start_patch.is_some() || end_patch.is_some() {
        // Check the window the row would end up with, not just the patched side.
        let stored: (String, Option<String>) = match conn.query_row(
            "SELECT start_date, end_date FROM patterns WHERE id = ?",
            [&pattern_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        ) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if let Some(start) = start_patch.or_else(|| parse_iso_date(&stored.0)) {
            let end = end_patch.or_else(|| stored.1.as_deref().and_then(parse_iso_date));
            if end.is_some_and(|d| d < start) {
                return err(
                    &req.id,
                    "bad_params",
                    "endDate must not precede startDate",
                    None,
                );
            }
        }
    }
    if let Some(d) = start_patch {
        sets.push("start_date = ?");
        values.push(d.format("%Y-%m-%d").to_string().into());
    }
    if let Some(d) = end_patch {
        sets.push("end_date = ?");
        values.push(d.format("%Y-%m-%d").to_string().into());
    }
    if let Some(raw) = patch.get("active") {
        match raw.as_bool() {
            Some(v) => {
                sets.push("active = ?");
                values.push((v as i64).into());
            }
            None => return err(&req.id, "bad_params", "active must be boolean", None),
        }
    }

    if sets.is_empty() {
        return err(&req.id, "bad_params", "patch has no recognized fields", None);
    }
    values.push(pattern_id.clone().into());
    let sql = format!("UPDATE patterns SET {} WHERE id = ?", sets.join(", "));
    match conn.execute(&sql, rusqlite::params_from_iter(values)) {
        Ok(_) => ok(&req.id, json!({ "patternId": pattern_id })),
        Err(e) => err(&req.id, "db_write_failed", e.to_string(), None),
    }
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let pattern_id = match required_str(req, "patternId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let referenced: Result<i64, _> = conn.query_row(
        "SELECT COUNT(*) FROM assignments WHERE pattern_id = ? AND status != 'cancelled'",
        [&pattern_id],
        |r| r.get(0),
    );
    match referenced {
        Ok(0) => {}
        Ok(_) => {
            return err(
                &req.id,
                "conflict",
                "pattern has live generated assignments; deactivate instead",
                None,
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_write_failed", e.to_string(), None),
    };
    // Only cancelled generated rows can remain; detach them so they survive as history.
    if let Err(e) = tx.execute(
        "UPDATE assignments SET pattern_id = NULL WHERE pattern_id = ?",
        [&pattern_id],
    ) {
        return err(&req.id, "db_write_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute(
        "DELETE FROM pattern_exceptions WHERE pattern_id = ?",
        [&pattern_id],
    ) {
        return err(&req.id, "db_write_failed", e.to_string(), None);
    }
    match tx.execute("DELETE FROM patterns WHERE id = ?", [&pattern_id]) {
        Ok(0) => return err(&req.id, "not_found", "pattern not found", None),
        Ok(_) => {}
        Err(e) => return err(&req.id, "db_write_failed", e.to_string(), None),
    }
    match tx.commit() {
        Ok(()) => ok(&req.id, json!({ "deleted": true })),
        Err(e) => err(&req.id, "db_write_failed", e.to_string(), None),
    }
}

fn handle_exceptions_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let pattern_id = match required_str(req, "patternId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match ensure_exists(conn, "patterns", &pattern_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "pattern not found", None),
        Err(m) => return err(&req.id, "db_query_failed", m, None),
    }
    let date = match required_date(req, "date") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let kind = match required_str(req, "kind") {
        Ok(v) => v.to_ascii_lowercase(),
        Err(e) => return e,
    };
    if kind != EXCEPTION_SKIP && kind != EXCEPTION_MOVE {
        return err(&req.id, "bad_params", "kind must be one of: skip, move", None);
    }
    let (moved_date, moved_slot) = if kind == EXCEPTION_MOVE {
        let md = match required_date(req, "movedDate") {
            Ok(v) => v,
            Err(e) => return e,
        };
        let ms = match parse_opt_string(req.params.get("movedTimeSlotId")) {
            Ok(v) => v,
            Err(m) => return err(&req.id, "bad_params", format!("movedTimeSlotId {}", m), None),
        };
        if let Some(ms) = &ms {
            match ensure_exists(conn, "time_slots", ms) {
                Ok(true) => {}
                Ok(false) => return err(&req.id, "not_found", "moved time slot not found", None),
                Err(m) => return err(&req.id, "db_query_failed", m, None),
            }
        }
        (Some(md.format("%Y-%m-%d").to_string()), ms)
    } else {
        (None, None)
    };

    let id = Uuid::new_v4().to_string();
    let write = conn.execute(
        "INSERT INTO pattern_exceptions(id, pattern_id, date, kind, moved_date, moved_time_slot_id)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(pattern_id, date) DO UPDATE SET
            kind = excluded.kind,
            moved_date = excluded.moved_date,
            moved_time_slot_id = excluded.moved_time_slot_id",
        params![
            id,
            pattern_id,
            date.format("%Y-%m-%d").to_string(),
            kind,
            moved_date,
            moved_slot,
        ],
    );
    match write {
        Ok(_) => ok(&req.id, json!({ "patternId": pattern_id })),
        Err(e) => err(&req.id, "db_write_failed", e.to_string(), None),
    }
}

fn handle_exceptions_clear(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let pattern_id = match required_str(req, "patternId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let date = match required_date(req, "date") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match conn.execute(
        "DELETE FROM pattern_exceptions WHERE pattern_id = ? AND date = ?",
        params![pattern_id, date.format("%Y-%m-%d").to_string()],
    ) {
        Ok(0) => err(&req.id, "not_found", "no exception on that date", None),
        Ok(_) => ok(&req.id, json!({ "cleared": true })),
        Err(e) => err(&req.id, "db_write_failed", e.to_string(), None),
    }
}

struct PatternRow {
    id: String,
    teacher_id: String,
    student_id: String,
    weekday: i64,
    time_slot_id: String,
    subject: String,
    position: i64,
    start_date: NaiveDate,
    end_date: Option<NaiveDate>,
}

fn load_active_patterns(conn: &Connection) -> Result<Vec<PatternRow>, String> {
    let mut stmt = conn
        .prepare(
            "SELECT id, teacher_id, student_id, weekday, time_slot_id, subject, position,
                    start_date, end_date
             FROM patterns WHERE active = 1 ORDER BY id",
        )
        .map_err(|e| e.to_string())?;
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, i64>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, String>(5)?,
                r.get::<_, i64>(6)?,
                r.get::<_, String>(7)?,
                r.get::<_, Option<String>>(8)?,
            ))
        })
        .map_err(|e| e.to_string())?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| e.to_string())?;

    let mut out = Vec::with_capacity(rows.len());
    for (id, teacher_id, student_id, weekday, time_slot_id, subject, position, start, end) in rows {
        let Some(start_date) = parse_iso_date(&start) else {
            continue;
        };
        let end_date = end.as_deref().and_then(parse_iso_date);
        out.push(PatternRow {
            id,
            teacher_id,
            student_id,
            weekday,
            time_slot_id,
            subject,
            position,
            start_date,
            end_date,
        });
    }
    Ok(out)
}

struct Exception {
    kind: String,
    moved_date: Option<NaiveDate>,
    moved_time_slot_id: Option<String>,
}

fn load_exception(
    conn: &Connection,
    pattern_id: &str,
    date: NaiveDate,
) -> Result<Option<Exception>, String> {
    conn.query_row(
        "SELECT kind, moved_date, moved_time_slot_id FROM pattern_exceptions
         WHERE pattern_id = ? AND date = ?",
        params![pattern_id, date.format("%Y-%m-%d").to_string()],
        |r| {
            let moved_raw: Option<String> = r.get(1)?;
            Ok(Exception {
                kind: r.get(0)?,
                moved_date: moved_raw.as_deref().and_then(parse_iso_date),
                moved_time_slot_id: r.get(2)?,
            })
        },
    )
    .optional()
    .map_err(|e| e.to_string())
}

fn occurrence_exists(
    conn: &Connection,
    pattern_id: &str,
    date: NaiveDate,
) -> Result<bool, String> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM assignments
             WHERE pattern_id = ? AND date = ? AND status != 'cancelled'",
            params![pattern_id, date.format("%Y-%m-%d").to_string()],
            |r| r.get(0),
        )
        .map_err(|e| e.to_string())?;
    Ok(count > 0)
}

/// Walks the date range and materializes one assignment per pattern
/// occurrence, routing each insert through the commit validator. Re-running
/// over the same range is a no-op for occurrences already materialized.
fn handle_expand(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let from = match required_date(req, "from") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let to = match required_date(req, "to") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if to < from {
        return err(&req.id, "bad_params", "to must not precede from", None);
    }

    let patterns = match load_active_patterns(conn) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "db_query_failed", m, None),
    };

    let mut created: Vec<serde_json::Value> = Vec::new();
    let mut skipped: Vec<serde_json::Value> = Vec::new();

    let mut day = from;
    while day <= to {
        let weekday = day.weekday().number_from_monday() as i64;
        for pattern in patterns.iter().filter(|p| p.weekday == weekday) {
            if day < pattern.start_date {
                continue;
            }
            if let Some(end) = pattern.end_date {
                if day > end {
                    continue;
                }
            }

            let mut target_date = day;
            let mut target_slot = pattern.time_slot_id.clone();
            match load_exception(conn, &pattern.id, day) {
                Ok(Some(ex)) if ex.kind == EXCEPTION_SKIP => {
                    skipped.push(json!({
                        "patternId": pattern.id,
                        "date": day.format("%Y-%m-%d").to_string(),
                        "reason": "exception_skip",
                    }));
                    continue;
                }
                Ok(Some(ex)) if ex.kind == EXCEPTION_MOVE => {
                    if let Some(md) = ex.moved_date {
                        target_date = md;
                    }
                    if let Some(ms) = ex.moved_time_slot_id {
                        target_slot = ms;
                    }
                }
                Ok(_) => {}
                Err(m) => return err(&req.id, "db_query_failed", m, None),
            }

            match occurrence_exists(conn, &pattern.id, target_date) {
                Ok(true) => {
                    skipped.push(json!({
                        "patternId": pattern.id,
                        "date": target_date.format("%Y-%m-%d").to_string(),
                        "reason": "already_materialized",
                    }));
                    continue;
                }
                Ok(false) => {}
                Err(m) => return err(&req.id, "db_query_failed", m, None),
            }

            let commit = CommitRequest {
                teacher_id: pattern.teacher_id.clone(),
                student_id: pattern.student_id.clone(),
                date: target_date,
                time_slot_id: target_slot,
                subject: pattern.subject.clone(),
                position: Some(pattern.position),
                pattern_id: Some(pattern.id.clone()),
            };
            match commit_assignment(conn, &commit) {
                Ok((assignment_id, _)) => {
                    created.push(json!({
                        "patternId": pattern.id,
                        "assignmentId": assignment_id,
                        "date": target_date.format("%Y-%m-%d").to_string(),
                    }));
                }
                Err(CommitError::Conflict(m)) => {
                    skipped.push(json!({
                        "patternId": pattern.id,
                        "date": target_date.format("%Y-%m-%d").to_string(),
                        "reason": "conflict",
                        "message": m,
                    }));
                }
                Err(CommitError::NotFound(m)) => {
                    skipped.push(json!({
                        "patternId": pattern.id,
                        "date": target_date.format("%Y-%m-%d").to_string(),
                        "reason": "not_found",
                        "message": m,
                    }));
                }
                Err(CommitError::Db(m)) => {
                    return err(&req.id, "db_write_failed", m, None);
                }
            }
        }
        day += ChronoDuration::days(1);
    }

    ok(
        &req.id,
        json!({
            "createdCount": created.len(),
            "created": created,
            "skipped": skipped,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "patterns.list" => Some(handle_list(state, req)),
        "patterns.create" => Some(handle_create(state, req)),
        "patterns.update" => Some(handle_update(state, req)),
        "patterns.delete" => Some(handle_delete(state, req)),
        "patterns.exceptions.set" => Some(handle_exceptions_set(state, req)),
        "patterns.exceptions.clear" => Some(handle_exceptions_clear(state, req)),
        "patterns.expand" => Some(handle_expand(state, req)),
        _ => None,
    }
}
