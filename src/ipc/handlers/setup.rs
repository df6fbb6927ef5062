use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Recommend,
    Scheduling,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "recommend" => Some(Self::Recommend),
            "scheduling" => Some(Self::Scheduling),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Recommend => "setup.recommend",
            Self::Scheduling => "setup.scheduling",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Recommend => json!({
            "continuityWeight": 30.0,
            "loadBalanceWeight": 20.0,
            "studentBalanceWeight": 10.0,
            "pairingWeight": 10.0,
            "gradeFitWeight": 5.0,
            "lookbackDays": 90
        }),
        SetupSection::Scheduling => json!({
            "defaultExpandWeeks": 4,
            "allowPairByDefault": true
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool()
        .ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_weight(v: &Value, key: &str) -> Result<f64, String> {
    let w = v.as_f64().ok_or_else(|| format!("{} must be numeric", key))?;
    if !w.is_finite() || !(0.0..=1000.0).contains(&w) {
        return Err(format!("{} must be in 0..=1000", key));
    }
    Ok(w)
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Recommend => match k.as_str() {
                "continuityWeight" | "loadBalanceWeight" | "studentBalanceWeight"
                | "pairingWeight" | "gradeFitWeight" => {
                    obj.insert(k.clone(), Value::from(parse_weight(v, k)?));
                }
                "lookbackDays" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 730)?));
                }
                _ => return Err(format!("unknown recommend field: {}", k)),
            },
            SetupSection::Scheduling => match k.as_str() {
                "defaultExpandWeeks" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 52)?));
                }
                "allowPairByDefault" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown scheduling field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &rusqlite::Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Best-effort apply: malformed historical values should not block setup UI.
            let _ = merge_section_patch(section, &mut current, saved_obj);
        }
    }
    Ok(current)
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let recommend = match load_section(conn, SetupSection::Recommend) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let scheduling = match load_section(conn, SetupSection::Scheduling) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "recommend": recommend,
            "scheduling": scheduling
        }),
    )
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_write_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
