use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, parse_opt_string, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params, Connection};
use serde_json::json;
use uuid::Uuid;

fn next_sort_order(conn: &Connection) -> Result<i64, String> {
    conn.query_row(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM time_slots",
        [],
        |r| r.get(0),
    )
    .map_err(|e| e.to_string())
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT id, label, start_time, sort_order FROM time_slots ORDER BY sort_order, id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let slots = match stmt.query_map([], |r| {
        Ok(json!({
            "id": r.get::<_, String>(0)?,
            "label": r.get::<_, String>(1)?,
            "startTime": r.get::<_, String>(2)?,
            "sortOrder": r.get::<_, i64>(3)?,
        }))
    }) {
        Ok(rows) => match rows.collect::<Result<Vec<_>, _>>() {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        },
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "timeSlots": slots }))
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let input = req.params.get("input").cloned().unwrap_or(json!({}));
    let label = match input
        .get("label")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing input.label", None),
    };
    let start_time = input
        .get("startTime")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    let sort_order = match next_sort_order(conn) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "db_query_failed", m, None),
    };
    let id = Uuid::new_v4().to_string();
    match conn.execute(
        "INSERT INTO time_slots(id, label, start_time, sort_order) VALUES(?, ?, ?, ?)",
        params![id, label, start_time, sort_order],
    ) {
        Ok(_) => ok(&req.id, json!({ "timeSlotId": id })),
        Err(e) => err(&req.id, "db_write_failed", e.to_string(), None),
    }
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let slot_id = match required_str(req, "timeSlotId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let patch = req.params.get("patch").cloned().unwrap_or(json!({}));
    let mut sets: Vec<&str> = Vec::new();
    let mut values: Vec<rusqlite::types::Value> = Vec::new();
    if let Ok(Some(label)) = parse_opt_string(patch.get("label")) {
        sets.push("label = ?");
        values.push(label.into());
    }
    if let Ok(Some(start_time)) = parse_opt_string(patch.get("startTime")) {
        sets.push("start_time = ?");
        values.push(start_time.into());
    }
    if sets.is_empty() {
        return err(&req.id, "bad_params", "patch has no recognized fields", None);
    }
    values.push(slot_id.clone().into());
    let sql = format!("UPDATE time_slots SET {} WHERE id = ?", sets.join(", "));
    match conn.execute(&sql, rusqlite::params_from_iter(values)) {
        Ok(0) => err(&req.id, "not_found", "time slot not found", None),
        Ok(_) => ok(&req.id, json!({ "timeSlotId": slot_id })),
        Err(e) => err(&req.id, "db_write_failed", e.to_string(), None),
    }
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let slot_id = match required_str(req, "timeSlotId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let referenced: Result<i64, _> = conn.query_row(
        "SELECT (SELECT COUNT(*) FROM assignments WHERE time_slot_id = ?1 AND status != 'cancelled')
              + (SELECT COUNT(*) FROM patterns WHERE time_slot_id = ?1)",
        [&slot_id],
        |r| r.get(0),
    );
    match referenced {
        Ok(0) => {}
        Ok(_) => {
            return err(
                &req.id,
                "conflict",
                "time slot is referenced by assignments or patterns; cancel and remove them first",
                None,
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    // Only cancelled assignment rows can remain; they go with the slot.
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_write_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute("DELETE FROM assignments WHERE time_slot_id = ?", [&slot_id]) {
        return err(&req.id, "db_write_failed", e.to_string(), None);
    }
    match tx.execute("DELETE FROM time_slots WHERE id = ?", [&slot_id]) {
        Ok(0) => return err(&req.id, "not_found", "time slot not found", None),
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
        "timeslots.list" => Some(handle_list(state, req)),
        "timeslots.create" => Some(handle_create(state, req)),
        "timeslots.update" => Some(handle_update(state, req)),
        "timeslots.delete" => Some(handle_delete(state, req)),
        _ => None,
    }
}
