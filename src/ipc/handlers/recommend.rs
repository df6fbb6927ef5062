use crate::db;
use crate::engine::{
    self, AssignmentHistory, HistoryRecord, RecommendConfig, SlotOccupant,
    SlotRequest, Student, Teacher,
};
use crate::ipc::error::{engine_err, err, ok};
use crate::ipc::handlers::assignments::week_bounds;
use crate::ipc::helpers::{db_conn, parse_iso_date, parse_json_array_string, parse_opt_i64, required_str};
use crate::ipc::types::{AppState, Request};
use chrono::{Duration as ChronoDuration, NaiveDate};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;

fn load_student(conn: &Connection, id: &str) -> Result<Option<Student>, String> {
    conn.query_row(
        "SELECT id, name, grade, one_on_one, ng_teacher_ids_json, active
         FROM students WHERE id = ?",
        [id],
        |r| {
            let ng_raw: String = r.get(4)?;
            Ok(Student {
                id: r.get(0)?,
                name: r.get(1)?,
                grade: r.get(2)?,
                one_on_one: r.get::<_, i64>(3)? != 0,
                ng_teacher_ids: parse_json_array_string(&ng_raw),
                active: r.get::<_, i64>(5)? != 0,
            })
        },
    )
    .optional()
    .map_err(|e| e.to_string())
}

/// Active roster with the derived counters the engine expects: live slots in
/// the ISO week of the request date, and distinct students with live rows.
fn load_roster(conn: &Connection, date: NaiveDate) -> Result<Vec<Teacher>, String> {
    let (week_start, week_end) = week_bounds(date);
    let ws = week_start.format("%Y-%m-%d").to_string();
    let we = week_end.format("%Y-%m-%d").to_string();
    let mut stmt = conn
        .prepare(
            "SELECT t.id, t.name, t.subjects_json, t.grade_min, t.grade_max,
                    t.cap_week_slots, t.cap_students, t.allow_pair, t.active,
                    (SELECT COUNT(*) FROM assignments a
                      WHERE a.teacher_id = t.id AND a.date BETWEEN ?1 AND ?2
                        AND a.status != 'cancelled') AS week_slots,
                    (SELECT COUNT(DISTINCT a.student_id) FROM assignments a
                      WHERE a.teacher_id = t.id AND a.status != 'cancelled') AS students
             FROM teachers t
             WHERE t.active = 1
             ORDER BY t.sort_order, t.id",
        )
        .map_err(|e| e.to_string())?;
    let roster = stmt
        .query_map(params![ws, we], |r| {
            let subjects_raw: String = r.get(2)?;
            Ok(Teacher {
                id: r.get(0)?,
                name: r.get(1)?,
                subjects: parse_json_array_string(&subjects_raw),
                grade_min: r.get(3)?,
                grade_max: r.get(4)?,
                cap_week_slots: r.get(5)?,
                cap_students: r.get(6)?,
                allow_pair: r.get::<_, i64>(7)? != 0,
                active: r.get::<_, i64>(8)? != 0,
                current_week_slots: r.get(9)?,
                current_students: r.get(10)?,
            })
        })
        .map_err(|e| e.to_string())?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| e.to_string())?;
    Ok(roster)
}

fn load_occupancy(
    conn: &Connection,
    date: NaiveDate,
    time_slot_id: &str,
) -> Result<Vec<SlotOccupant>, String> {
    let mut stmt = conn
        .prepare(
            "SELECT a.teacher_id, a.student_id, s.grade, a.subject, a.position, s.one_on_one
             FROM assignments a
             JOIN students s ON s.id = a.student_id
             WHERE a.date = ? AND a.time_slot_id = ? AND a.status != 'cancelled'",
        )
        .map_err(|e| e.to_string())?;
    let occupants = stmt
        .query_map(
            params![date.format("%Y-%m-%d").to_string(), time_slot_id],
            |r| {
                Ok(SlotOccupant {
                    teacher_id: r.get(0)?,
                    student_id: r.get(1)?,
                    grade: r.get(2)?,
                    subject: r.get(3)?,
                    position: r.get(4)?,
                    one_on_one: r.get::<_, i64>(5)? != 0,
                })
            },
        )
        .map_err(|e| e.to_string())?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| e.to_string())?;
    Ok(occupants)
}

fn load_history(
    conn: &Connection,
    student_id: &str,
    date: NaiveDate,
    lookback_days: i64,
) -> Result<AssignmentHistory, String> {
    let since = (date - ChronoDuration::days(lookback_days))
        .format("%Y-%m-%d")
        .to_string();
    let mut stmt = conn
        .prepare(
            "SELECT teacher_id, student_id, subject, date FROM assignments
             WHERE student_id = ? AND date >= ? AND status != 'cancelled'
             ORDER BY date",
        )
        .map_err(|e| e.to_string())?;
    let raw = stmt
        .query_map(params![student_id, since], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
            ))
        })
        .map_err(|e| e.to_string())?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| e.to_string())?;

    let mut records = Vec::with_capacity(raw.len());
    for (teacher_id, student_id, subject, date_raw) in raw {
        let Some(d) = parse_iso_date(&date_raw) else {
            continue;
        };
        records.push(HistoryRecord {
            teacher_id,
            student_id,
            subject,
            date: d,
        });
    }
    Ok(AssignmentHistory { records })
}

fn handle_recommend(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let position = match parse_opt_i64(req.params.get("position")) {
        Ok(v) => v.unwrap_or(0),
        Err(m) => return err(&req.id, "bad_params", format!("position {}", m), None),
    };
    let request = SlotRequest {
        date: req
            .params
            .get("date")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        time_slot_id: req
            .params
            .get("timeSlotId")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        subject: req
            .params
            .get("subject")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        position,
    };
    let date = match engine::parse_request(&request) {
        Ok(d) => d,
        Err(e) => return engine_err(&req.id, e),
    };

    let config = match db::settings_get_json(conn, "setup.recommend") {
        Ok(raw) => RecommendConfig::from_settings(raw.as_ref()),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let student = match load_student(conn, &student_id) {
        Ok(Some(s)) => s,
        Ok(None) => return err(&req.id, "not_found", "student not found", None),
        Err(m) => return err(&req.id, "db_query_failed", m, None),
    };
    let roster = match load_roster(conn, date) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "db_query_failed", m, None),
    };
    let occupancy = match load_occupancy(conn, date, &request.time_slot_id) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "db_query_failed", m, None),
    };
    let history = match load_history(conn, &student_id, date, config.lookback_days) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "db_query_failed", m, None),
    };

    match engine::recommend_teachers(&request, &student, &roster, &occupancy, &history, &config) {
        Ok(rec) => ok(
            &req.id,
            json!({
                "ranked": rec.ranked,
                "disqualified": rec.disqualified,
            }),
        ),
        Err(e) => engine_err(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "recommend.teachers" => Some(handle_recommend(state, req)),
        _ => None,
    }
}
