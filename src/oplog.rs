use crate::db;
use crate::error::Result;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::Value;

/// Scope and caller of a logged schedule operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpScope {
    pub organization_id: Option<i64>,
    pub term_id: Option<i64>,
    pub user_id: Option<i64>,
}

/// Appends one entry to the operation log. Runs on the caller's connection
/// so it commits or rolls back with the operation it describes.
pub fn record(conn: &Connection, kind: &str, scope: OpScope, summary: &Value) -> Result<String> {
    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO operation_log(id, kind, organization_id, term_id, user_id, summary_json, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            kind,
            scope.organization_id,
            scope.term_id,
            scope.user_id,
            serde_json::to_string(summary)?,
            db::now_timestamp(),
        ),
    )?;
    Ok(id)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpEntry {
    pub id: String,
    pub kind: String,
    pub organization_id: Option<i64>,
    pub term_id: Option<i64>,
    pub user_id: Option<i64>,
    pub summary: Value,
    pub created_at: String,
}

/// Most recent entries first, optionally limited to one organization.
pub fn list(conn: &Connection, organization_id: Option<i64>, limit: i64) -> Result<Vec<OpEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, kind, organization_id, term_id, user_id, summary_json, created_at
         FROM operation_log
         WHERE (?1 IS NULL OR organization_id = ?1)
         ORDER BY created_at DESC, rowid DESC
         LIMIT ?2",
    )?;
    let rows = stmt
        .query_map((organization_id, limit), |r| {
            let summary: String = r.get(5)?;
            Ok(OpEntry {
                id: r.get(0)?,
                kind: r.get(1)?,
                organization_id: r.get(2)?,
                term_id: r.get(3)?,
                user_id: r.get(4)?,
                summary: serde_json::from_str(&summary).unwrap_or(Value::Null),
                created_at: r.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}
