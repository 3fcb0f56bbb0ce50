use crate::db;
use rusqlite::Connection;
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupSection {
    Schedules,
    Locking,
}

impl SetupSection {
    pub const ALL: [SetupSection; 2] = [SetupSection::Schedules, SetupSection::Locking];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "schedules" => Some(Self::Schedules),
            "locking" => Some(Self::Locking),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Schedules => "schedules",
            Self::Locking => "locking",
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Schedules => "setup.schedules",
            Self::Locking => "setup.locking",
        }
    }
}

pub const DEFAULT_DELTA_DAYS: i64 = 5;
pub const DEFAULT_BUSY_TIMEOUT_MS: i64 = 2000;

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Schedules => json!({
            "deltaDays": DEFAULT_DELTA_DAYS,
            "activateOnUpload": false
        }),
        SetupSection::Locking => json!({
            "busyTimeoutMs": DEFAULT_BUSY_TIMEOUT_MS
        }),
    }
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

pub fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

pub fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())?;
    for (k, v) in patch {
        match section {
            SetupSection::Schedules => match k.as_str() {
                "deltaDays" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 365)?));
                }
                "activateOnUpload" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown schedules field: {}", k)),
            },
            SetupSection::Locking => match k.as_str() {
                "busyTimeoutMs" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 60_000)?));
                }
                _ => return Err(format!("unknown locking field: {}", k)),
            },
        }
    }
    Ok(())
}

/// Defaults overlaid with whatever valid fields are stored.
pub fn load_section(conn: &Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed historical values fall back to defaults field by field.
            for (k, v) in saved_obj {
                let mut one = Map::new();
                one.insert(k.clone(), v.clone());
                let _ = merge_section_patch(section, &mut current, &one);
            }
        }
    }
    Ok(current)
}

pub fn update_section(
    conn: &Connection,
    section: SetupSection,
    patch: &Map<String, Value>,
) -> anyhow::Result<Result<Value, String>> {
    let mut current = load_section(conn, section)?;
    if let Err(msg) = merge_section_patch(section, &mut current, patch) {
        return Ok(Err(msg));
    }
    db::settings_set_json(conn, section.key(), &current)?;
    Ok(Ok(current))
}

pub fn delta_days(conn: &Connection) -> anyhow::Result<i64> {
    let v = load_section(conn, SetupSection::Schedules)?;
    Ok(v.get("deltaDays")
        .and_then(|d| d.as_i64())
        .unwrap_or(DEFAULT_DELTA_DAYS))
}

pub fn activate_on_upload(conn: &Connection) -> anyhow::Result<bool> {
    let v = load_section(conn, SetupSection::Schedules)?;
    Ok(v.get("activateOnUpload")
        .and_then(|d| d.as_bool())
        .unwrap_or(false))
}

pub fn busy_timeout_ms(conn: &Connection) -> anyhow::Result<u64> {
    let v = load_section(conn, SetupSection::Locking)?;
    let ms = v
        .get("busyTimeoutMs")
        .and_then(|d| d.as_i64())
        .unwrap_or(DEFAULT_BUSY_TIMEOUT_MS);
    Ok(ms.max(0) as u64)
}
