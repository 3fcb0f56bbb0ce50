use crate::db;
use crate::delta::{ChildKind, DeltaStatus};
use crate::ipc::error::{err, fail, ok};
use crate::ipc::types::{AppState, Request};
use crate::settings;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

/// Which `removed` rows a display query still shows.
#[derive(Debug, Clone)]
enum Visibility {
    All,
    /// Removed rows stay visible while modified at or after the cutoff.
    RemovedSince(Option<String>),
}

impl Visibility {
    fn window(delta_days: i64) -> Self {
        if delta_days <= 0 {
            return Visibility::RemovedSince(None);
        }
        let cutoff = chrono::Utc::now() - chrono::Duration::days(delta_days);
        Visibility::RemovedSince(Some(cutoff.format("%Y-%m-%d %H:%M:%S").to_string()))
    }

    fn shows(&self, status: DeltaStatus, modified: &str) -> bool {
        match self {
            Visibility::All => true,
            Visibility::RemovedSince(cutoff) => {
                if !status.is_removed() {
                    return true;
                }
                cutoff.as_deref().map(|c| modified >= c).unwrap_or(false)
            }
        }
    }
}

fn load_children(
    conn: &Connection,
    kind: ChildKind,
    assoc_id: i64,
    vis: &Visibility,
) -> rusqlite::Result<Vec<Value>> {
    let (resource_table, label_col) = match kind {
        ChildKind::Group => ("student_groups", "name"),
        ChildKind::Room => ("rooms", "name"),
    };
    let sql = format!(
        "SELECT c.{col}, r.code, r.{label}, c.delta, c.modified
         FROM {table} c
         JOIN {resources} r ON r.id = c.{col}
         WHERE c.assoc_id = ?
         ORDER BY r.code, r.id",
        col = kind.column(),
        label = label_col,
        table = kind.table(),
        resources = resource_table
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([assoc_id], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, Option<String>>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .filter(|(_, _, _, delta, modified)| vis.shows(DeltaStatus::parse(delta), modified))
        .map(|(id, code, name, delta, modified)| {
            json!({
                "id": id,
                "code": code,
                "name": name,
                "status": DeltaStatus::parse(&delta),
                "statusDate": modified
            })
        })
        .collect())
}

fn load_persons(conn: &Connection, instance_id: i64, vis: &Visibility) -> rusqlite::Result<Vec<Value>> {
    let mut stmt = conn.prepare(
        "SELECT ip.id, ip.person_id, p.code, p.surname, p.forename, ip.role_id, ip.delta, ip.modified
         FROM instance_persons ip
         JOIN persons p ON p.id = ip.person_id
         WHERE ip.instance_id = ?
         ORDER BY p.surname, p.forename, p.id",
    )?;
    let rows = stmt
        .query_map([instance_id], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, i64>(5)?,
                r.get::<_, String>(6)?,
                r.get::<_, String>(7)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::new();
    for (assoc_id, person_id, code, surname, forename, role_id, delta, modified) in rows {
        let status = DeltaStatus::parse(&delta);
        if !vis.shows(status, &modified) {
            continue;
        }
        out.push(json!({
            "personId": person_id,
            "code": code,
            "surname": surname,
            "forename": forename,
            "roleId": role_id,
            "status": status,
            "statusDate": modified,
            "groups": load_children(conn, ChildKind::Group, assoc_id, vis)?,
            "rooms": load_children(conn, ChildKind::Room, assoc_id, vis)?
        }));
    }
    Ok(out)
}

const INSTANCE_SELECT: &str = "SELECT i.id, i.code, i.delta, i.modified,
        u.id, u.code, u.delta, u.modified,
        e.id, e.name, b.date, b.start_time, b.end_time
     FROM instances i
     JOIN units u ON u.id = i.unit_id
     LEFT JOIN events e ON e.id = i.event_id
     LEFT JOIN blocks b ON b.id = i.block_id";

struct InstanceRow {
    id: i64,
    code: Option<String>,
    status: DeltaStatus,
    modified: String,
    unit_id: i64,
    unit_code: Option<String>,
    unit_status: DeltaStatus,
    unit_modified: String,
    event_id: Option<i64>,
    event_name: Option<String>,
    date: Option<String>,
    start_time: Option<String>,
    end_time: Option<String>,
}

fn instance_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<InstanceRow> {
    Ok(InstanceRow {
        id: r.get(0)?,
        code: r.get(1)?,
        status: DeltaStatus::parse(&r.get::<_, String>(2)?),
        modified: r.get(3)?,
        unit_id: r.get(4)?,
        unit_code: r.get(5)?,
        unit_status: DeltaStatus::parse(&r.get::<_, String>(6)?),
        unit_modified: r.get(7)?,
        event_id: r.get(8)?,
        event_name: r.get(9)?,
        date: r.get(10)?,
        start_time: r.get(11)?,
        end_time: r.get(12)?,
    })
}

fn scope_instances(
    conn: &Connection,
    organization_id: i64,
    term_id: i64,
) -> rusqlite::Result<Vec<InstanceRow>> {
    let sql = format!(
        "{} WHERE u.organization_id = ? AND u.term_id = ?
         ORDER BY b.date, b.start_time, i.id",
        INSTANCE_SELECT
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map((organization_id, term_id), instance_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn instance_json(conn: &Connection, row: &InstanceRow, vis: &Visibility) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": row.id,
        "code": row.code,
        "status": row.status,
        "statusDate": row.modified,
        "unit": {
            "id": row.unit_id,
            "code": row.unit_code,
            "status": row.unit_status,
            "statusDate": row.unit_modified
        },
        "event": { "id": row.event_id, "name": row.event_name },
        "block": { "date": row.date, "startTime": row.start_time, "endTime": row.end_time },
        "persons": load_persons(conn, row.id, vis)?
    }))
}

fn handle_instances_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let organization_id = match req.i64_param("organizationId") {
        Ok(v) => v,
        Err(e) => return fail(&req.id, e),
    };
    let term_id = match req.i64_param("termId") {
        Ok(v) => v,
        Err(e) => return fail(&req.id, e),
    };
    let delta_days = match req.opt_i64_param("deltaDays") {
        Some(d) => d,
        None => match settings::delta_days(conn) {
            Ok(d) => d,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        },
    };
    let status_filter = match req.params.get("status").and_then(|v| v.as_str()) {
        None => None,
        Some(s @ ("none" | "new" | "removed" | "changed")) => Some(DeltaStatus::parse(s)),
        Some(_) => {
            return err(
                &req.id,
                "bad_params",
                "status must be one of: none, new, removed, changed",
                None,
            )
        }
    };
    let vis = Visibility::window(delta_days);

    let tx = match db::begin_read(conn) {
        Ok(tx) => tx,
        Err(e) => return fail(&req.id, e.into()),
    };
    match list_scope(&tx, organization_id, term_id, status_filter, &vis) {
        Ok(instances) => ok(
            &req.id,
            json!({ "deltaDays": delta_days, "instances": instances }),
        ),
        Err(e) => fail(&req.id, e.into()),
    }
}

fn list_scope(
    conn: &Connection,
    organization_id: i64,
    term_id: i64,
    status_filter: Option<DeltaStatus>,
    vis: &Visibility,
) -> rusqlite::Result<Vec<Value>> {
    let mut instances = Vec::new();
    for row in scope_instances(conn, organization_id, term_id)? {
        if let Some(wanted) = status_filter {
            if row.status != wanted && row.unit_status != wanted {
                continue;
            }
        }
        if !vis.shows(row.status, &row.modified) {
            continue;
        }
        instances.push(instance_json(conn, &row, vis)?);
    }
    Ok(instances)
}

/// One instance with every association row, removed ones included.
fn handle_instances_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let instance_id = match req.i64_param("instanceId") {
        Ok(v) => v,
        Err(e) => return fail(&req.id, e),
    };
    let tx = match db::begin_read(conn) {
        Ok(tx) => tx,
        Err(e) => return fail(&req.id, e.into()),
    };
    let sql = format!("{} WHERE i.id = ?", INSTANCE_SELECT);
    let row = match tx.query_row(&sql, [instance_id], instance_row).optional() {
        Ok(Some(r)) => r,
        Ok(None) => {
            return err(
                &req.id,
                "not_found",
                format!("instance {} not found", instance_id),
                Some(json!({ "instanceId": instance_id })),
            )
        }
        Err(e) => return fail(&req.id, e.into()),
    };
    match instance_json(&tx, &row, &Visibility::All) {
        Ok(v) => ok(&req.id, v),
        Err(e) => fail(&req.id, e.into()),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "instances.list" => Some(handle_instances_list(state, req)),
        "instances.get" => Some(handle_instances_get(state, req)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{self, ResourceKind};
    use std::time::{SystemTime, UNIX_EPOCH};

    #[test]
    fn zero_day_window_hides_every_removed_row() {
        let vis = Visibility::window(0);
        assert!(!vis.shows(DeltaStatus::Removed, "2999-01-01 00:00:00"));
        assert!(vis.shows(DeltaStatus::New, "2000-01-01 00:00:00"));
    }

    #[test]
    fn window_keeps_recent_removals() {
        let vis = Visibility::window(5);
        let now = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
        assert!(vis.shows(DeltaStatus::Removed, &now));
        assert!(!vis.shows(DeltaStatus::Removed, "2000-01-01 00:00:00"));
        assert!(Visibility::All.shows(DeltaStatus::Removed, "2000-01-01 00:00:00"));
    }

    #[test]
    fn listing_reads_one_snapshot_while_another_connection_commits() {
        let dir = std::env::temp_dir().join(format!(
            "organizer-instances-{}",
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        let reader = db::open_db(&dir).expect("open reader");
        let writer = db::open_db(&dir).expect("open writer");

        let org = directory::upsert(&writer, ResourceKind::Organization, &json!({ "code": "MNI" }))
            .expect("org");
        let term = directory::upsert(&writer, ResourceKind::Term, &json!({ "code": "WS24" }))
            .expect("term");
        let unit = directory::upsert(
            &writer,
            ResourceKind::Unit,
            &json!({ "code": "U1", "organizationId": org, "termId": term }),
        )
        .expect("unit");
        directory::upsert(&writer, ResourceKind::Instance, &json!({ "unitId": unit }))
            .expect("instance");

        let vis = Visibility::All;
        let tx = db::begin_read(&reader).expect("begin read");
        let before = list_scope(&tx, org, term, None, &vis).expect("first listing");
        assert_eq!(before.len(), 1);

        directory::upsert(&writer, ResourceKind::Instance, &json!({ "unitId": unit }))
            .expect("second instance");
        let during = list_scope(&tx, org, term, None, &vis).expect("second listing");
        assert_eq!(during.len(), 1);
        drop(tx);

        let after = list_scope(&reader, org, term, None, &vis).expect("after listing");
        assert_eq!(after.len(), 2);

        let _ = std::fs::remove_dir_all(dir);
    }
}
