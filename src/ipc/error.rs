use crate::error::OrganizerError;
use serde_json::json;
use tracing::warn;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

/// Maps an engine error onto its stable error code.
pub fn fail(id: &str, e: OrganizerError) -> serde_json::Value {
    if matches!(e, OrganizerError::Db(_) | OrganizerError::Internal(_)) {
        warn!(request = id, error = %e, "request failed");
    }
    err(id, e.code(), e.to_string(), e.details())
}

pub fn reply<T: serde::Serialize>(
    id: &str,
    result: Result<T, OrganizerError>,
) -> serde_json::Value {
    match result.and_then(|v| serde_json::to_value(v).map_err(OrganizerError::from)) {
        Ok(v) => ok(id, v),
        Err(e) => fail(id, e),
    }
}
