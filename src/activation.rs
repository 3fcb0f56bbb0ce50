use crate::access::{self, RequestContext};
use crate::db;
use crate::delta::{DeltaStatus, DeltaStore};
use crate::directory::{ResourceDirectory, ResourceKind, SqliteDirectory};
use crate::error::{OrganizerError, Result};
use crate::oplog::{self, OpScope};
use crate::reconcile::{self, Parent, PlanSummary, ReconcilePlan, SnapshotDiff, Target};
use crate::snapshot::Snapshot;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

/// Snapshot row without its blob.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleMeta {
    pub id: i64,
    pub organization_id: i64,
    pub term_id: i64,
    pub user_id: Option<i64>,
    pub creation_date: String,
    pub creation_time: String,
    pub checksum: Option<String>,
    pub active: bool,
    pub activated_at: Option<String>,
}

const META_COLUMNS: &str = "id, organization_id, term_id, user_id, creation_date, creation_time, checksum, active, activated_at";

fn meta_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduleMeta> {
    Ok(ScheduleMeta {
        id: r.get(0)?,
        organization_id: r.get(1)?,
        term_id: r.get(2)?,
        user_id: r.get(3)?,
        creation_date: r.get(4)?,
        creation_time: r.get(5)?,
        checksum: r.get(6)?,
        active: r.get::<_, i64>(7)? != 0,
        activated_at: r.get(8)?,
    })
}

fn schedule_not_found(id: i64) -> OrganizerError {
    OrganizerError::not_found(
        format!("schedule {} not found", id),
        json!({ "scheduleId": id }),
    )
}

pub fn load_meta(conn: &Connection, schedule_id: i64) -> Result<ScheduleMeta> {
    let sql = format!("SELECT {} FROM schedules WHERE id = ?", META_COLUMNS);
    conn.query_row(&sql, [schedule_id], meta_from_row)
        .optional()?
        .ok_or_else(|| schedule_not_found(schedule_id))
}

pub fn load_snapshot(conn: &Connection, schedule_id: i64) -> Result<Snapshot> {
    let raw: String = conn
        .query_row(
            "SELECT schedule FROM schedules WHERE id = ?",
            [schedule_id],
            |r| r.get(0),
        )
        .optional()?
        .ok_or_else(|| schedule_not_found(schedule_id))?;
    Ok(Snapshot::from_json_str(&raw)?)
}

pub fn list_schedules(
    conn: &Connection,
    organization_id: Option<i64>,
    term_id: Option<i64>,
) -> Result<Vec<ScheduleMeta>> {
    let sql = format!(
        "SELECT {} FROM schedules
         WHERE (?1 IS NULL OR organization_id = ?1) AND (?2 IS NULL OR term_id = ?2)
         ORDER BY creation_date DESC, creation_time DESC, id DESC",
        META_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map((organization_id, term_id), meta_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn active_in_scope(conn: &Connection, organization_id: i64, term_id: i64) -> Result<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT id FROM schedules
             WHERE organization_id = ? AND term_id = ? AND active = 1
             ORDER BY activated_at DESC, id DESC LIMIT 1",
            (organization_id, term_id),
            |r| r.get(0),
        )
        .optional()?)
}

/// The snapshot the delta is computed against: the scope's active snapshot,
/// else the one activated most recently, else nothing.
fn baseline_for(conn: &Connection, meta: &ScheduleMeta) -> Result<Option<i64>> {
    if let Some(id) = active_in_scope(conn, meta.organization_id, meta.term_id)? {
        return Ok(Some(id));
    }
    Ok(conn
        .query_row(
            "SELECT id FROM schedules
             WHERE organization_id = ? AND term_id = ? AND activated_at IS NOT NULL
             ORDER BY activated_at DESC, id DESC LIMIT 1",
            (meta.organization_id, meta.term_id),
            |r| r.get(0),
        )
        .optional()?)
}

/// Every resource a snapshot references must still exist, and every instance
/// must still belong to the snapshot's scope.
fn verify_integrity(conn: &Connection, meta: &ScheduleMeta, snapshot: &Snapshot) -> Result<()> {
    let dir = SqliteDirectory::new(conn);
    let mut missing: Vec<Value> = Vec::new();
    for instance_id in snapshot.instances.keys() {
        let in_scope = dir
            .instance_scope(*instance_id)?
            .map(|s| s.organization_id == meta.organization_id && s.term_id == meta.term_id)
            .unwrap_or(false);
        if !in_scope {
            missing.push(json!({ "kind": "instance", "id": instance_id }));
        }
    }
    let checks: [(ResourceKind, BTreeSet<i64>); 3] = [
        (ResourceKind::Person, snapshot.person_ids()),
        (ResourceKind::Group, snapshot.group_ids()),
        (ResourceKind::Room, snapshot.room_ids()),
    ];
    for (kind, ids) in checks {
        for id in ids {
            if !dir.exists(kind, id)? {
                missing.push(json!({ "kind": kind.label(), "id": id }));
            }
        }
    }
    if missing.is_empty() {
        return Ok(());
    }
    Err(OrganizerError::integrity(
        format!(
            "schedule {} references {} resource(s) that no longer exist",
            meta.id,
            missing.len()
        ),
        json!({ "scheduleId": meta.id, "missing": missing }),
    ))
}

/// Writes a reconcile plan. Person associations are created first so that
/// group/room rows of the same plan can point at them.
fn apply_plan(store: &DeltaStore<'_>, plan: &ReconcilePlan) -> Result<()> {
    let mut created: HashMap<(i64, i64), i64> = HashMap::new();
    for t in plan.to_create() {
        if let Target::Person {
            instance_id,
            person_id,
            ..
        } = t.target
        {
            let role_id = t.role_id.unwrap_or(crate::snapshot::DEFAULT_ROLE_ID);
            let id = store.insert_person(instance_id, person_id, role_id)?;
            created.insert((instance_id, person_id), id);
        }
    }

    let mut bulk: HashMap<(&'static str, DeltaStatus), Vec<i64>> = HashMap::new();
    for t in &plan.transitions {
        match t.target {
            Target::Unit(id) => bulk.entry(("units", t.to)).or_default().push(id),
            Target::Instance(id) => bulk.entry(("instances", t.to)).or_default().push(id),
            Target::Person { assoc_id: None, .. } => {}
            Target::Person {
                assoc_id: Some(assoc_id),
                ..
            } => match t.role_id {
                Some(role_id) => store.save_person(assoc_id, t.to, role_id)?,
                None => bulk
                    .entry(("instance_persons", t.to))
                    .or_default()
                    .push(assoc_id),
            },
            Target::Child {
                kind,
                parent,
                resource_id,
                row_id: None,
            } => {
                let assoc_id = match parent {
                    Parent::Stored(id) => id,
                    Parent::Pending {
                        instance_id,
                        person_id,
                    } => *created.get(&(instance_id, person_id)).ok_or_else(|| {
                        OrganizerError::integrity(
                            "group/room row without a parent association",
                            json!({ "instanceId": instance_id, "personId": person_id }),
                        )
                    })?,
                };
                store.insert_child(kind, assoc_id, resource_id)?;
            }
            Target::Child {
                kind,
                row_id: Some(row_id),
                ..
            } => bulk.entry((kind.table(), t.to)).or_default().push(row_id),
        }
    }

    for ((table, status), ids) in bulk {
        let n = store.bulk_update_status(table, &ids, status)?;
        debug!(table, status = status.as_str(), rows = n, "delta status update");
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationOutcome {
    pub schedule_id: i64,
    pub already_active: bool,
    pub baseline_id: Option<i64>,
    pub previous_active_id: Option<i64>,
    pub summary: PlanSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
}

/// Activation body. The caller must already hold the write lock
/// (`db::begin_write`) and commits afterwards.
pub fn activate_locked(
    conn: &Connection,
    ctx: &RequestContext,
    schedule_id: i64,
) -> Result<ActivationOutcome> {
    let meta = load_meta(conn, schedule_id)?;
    access::require_scheduler(conn, ctx, meta.organization_id)?;
    if meta.active {
        return Ok(ActivationOutcome {
            schedule_id,
            already_active: true,
            baseline_id: Some(schedule_id),
            previous_active_id: Some(schedule_id),
            summary: PlanSummary::default(),
            operation_id: None,
        });
    }

    let snapshot = load_snapshot(conn, schedule_id)?;
    verify_integrity(conn, &meta, &snapshot)?;

    let previous_active_id = active_in_scope(conn, meta.organization_id, meta.term_id)?;
    let baseline_id = baseline_for(conn, &meta)?;
    let baseline = match baseline_id {
        Some(id) => load_snapshot(conn, id)?,
        None => Snapshot::default(),
    };

    let now = db::now_timestamp();
    let store = DeltaStore::new(conn, now.clone());
    let stored = store.load_scope(meta.organization_id, meta.term_id)?;
    let plan = reconcile::reconcile(&snapshot, &baseline, &stored);
    let summary = plan.summary();
    apply_plan(&store, &plan)?;

    conn.execute(
        "UPDATE schedules SET active = 0
         WHERE organization_id = ? AND term_id = ? AND active = 1 AND id <> ?",
        (meta.organization_id, meta.term_id, schedule_id),
    )?;
    conn.execute(
        "UPDATE schedules SET active = 1, activated_at = ? WHERE id = ?",
        (&now, schedule_id),
    )?;

    let operation_id = oplog::record(
        conn,
        "activate",
        OpScope {
            organization_id: Some(meta.organization_id),
            term_id: Some(meta.term_id),
            user_id: ctx.user_id,
        },
        &json!({
            "scheduleId": schedule_id,
            "baselineId": baseline_id,
            "previousActiveId": previous_active_id,
            "summary": summary,
        }),
    )?;
    info!(
        schedule_id,
        organization_id = meta.organization_id,
        term_id = meta.term_id,
        baseline_id,
        transitions = summary.transitions,
        "schedule activated"
    );

    Ok(ActivationOutcome {
        schedule_id,
        already_active: false,
        baseline_id,
        previous_active_id,
        summary,
        operation_id: Some(operation_id),
    })
}

/// Makes a snapshot the scope's authoritative one and moves every delta
/// status to reflect it, all under one write lock.
pub fn activate(conn: &Connection, ctx: &RequestContext, schedule_id: i64) -> Result<ActivationOutcome> {
    let tx = db::begin_write(conn)?;
    let outcome = activate_locked(&tx, ctx, schedule_id)?;
    tx.commit()?;
    Ok(outcome)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeactivationOutcome {
    pub schedule_id: i64,
    pub was_active: bool,
}

fn deactivate_locked(
    conn: &Connection,
    ctx: &RequestContext,
    schedule_id: i64,
) -> Result<DeactivationOutcome> {
    let meta = load_meta(conn, schedule_id)?;
    access::require_scheduler(conn, ctx, meta.organization_id)?;
    if meta.active {
        conn.execute("UPDATE schedules SET active = 0 WHERE id = ?", [schedule_id])?;
        oplog::record(
            conn,
            "deactivate",
            OpScope {
                organization_id: Some(meta.organization_id),
                term_id: Some(meta.term_id),
                user_id: ctx.user_id,
            },
            &json!({ "scheduleId": schedule_id }),
        )?;
        info!(schedule_id, "schedule deactivated");
    }
    Ok(DeactivationOutcome {
        schedule_id,
        was_active: meta.active,
    })
}

/// Clears the active flag only; delta statuses stay as they are.
pub fn deactivate(
    conn: &Connection,
    ctx: &RequestContext,
    schedule_id: i64,
) -> Result<DeactivationOutcome> {
    let tx = db::begin_write(conn)?;
    let outcome = deactivate_locked(&tx, ctx, schedule_id)?;
    tx.commit()?;
    Ok(outcome)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleOutcome {
    pub schedule_id: i64,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activation: Option<ActivationOutcome>,
}

pub fn toggle(conn: &Connection, ctx: &RequestContext, schedule_id: i64) -> Result<ToggleOutcome> {
    let tx = db::begin_write(conn)?;
    let meta = load_meta(&tx, schedule_id)?;
    let outcome = if meta.active {
        deactivate_locked(&tx, ctx, schedule_id)?;
        ToggleOutcome {
            schedule_id,
            active: false,
            activation: None,
        }
    } else {
        let activation = activate_locked(&tx, ctx, schedule_id)?;
        ToggleOutcome {
            schedule_id,
            active: true,
            activation: Some(activation),
        }
    };
    tx.commit()?;
    Ok(outcome)
}

/// Deletes snapshot rows. Either all listed snapshots are deleted or none.
pub fn delete(conn: &Connection, ctx: &RequestContext, schedule_ids: &[i64]) -> Result<usize> {
    if schedule_ids.is_empty() {
        return Err(OrganizerError::BadParams("scheduleIds must not be empty".into()));
    }
    let tx = db::begin_write(conn)?;
    let mut missing = Vec::new();
    let mut metas = Vec::new();
    for id in schedule_ids.iter().copied().collect::<BTreeSet<i64>>() {
        match load_meta(&tx, id) {
            Ok(m) => metas.push(m),
            Err(OrganizerError::NotFound { .. }) => missing.push(id),
            Err(e) => return Err(e),
        }
    }
    if !missing.is_empty() {
        return Err(OrganizerError::not_found(
            format!("{} schedule(s) not found", missing.len()),
            json!({ "scheduleIds": missing }),
        ));
    }
    for meta in &metas {
        access::require_scheduler(&tx, ctx, meta.organization_id)?;
    }
    let mut deleted = 0;
    for meta in &metas {
        deleted += tx.execute("DELETE FROM schedules WHERE id = ?", [meta.id])?;
        oplog::record(
            &tx,
            "delete",
            OpScope {
                organization_id: Some(meta.organization_id),
                term_id: Some(meta.term_id),
                user_id: ctx.user_id,
            },
            &json!({ "scheduleId": meta.id, "wasActive": meta.active }),
        )?;
    }
    tx.commit()?;
    info!(deleted, "schedules deleted");
    Ok(deleted)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceOutcome {
    pub reference_id: i64,
    pub active_id: Option<i64>,
    pub diff: SnapshotDiff,
}

/// Compares a reference snapshot with the scope's active one. Nothing is
/// written.
pub fn set_reference(
    conn: &Connection,
    ctx: &RequestContext,
    reference_id: i64,
) -> Result<ReferenceOutcome> {
    let meta = load_meta(conn, reference_id)?;
    access::require_scheduler(conn, ctx, meta.organization_id)?;
    let Some(active_id) = active_in_scope(conn, meta.organization_id, meta.term_id)? else {
        return Ok(ReferenceOutcome {
            reference_id,
            active_id: None,
            diff: SnapshotDiff::default(),
        });
    };
    let reference = load_snapshot(conn, reference_id)?;
    let active = load_snapshot(conn, active_id)?;
    Ok(ReferenceOutcome {
        reference_id,
        active_id: Some(active_id),
        diff: reconcile::diff_snapshots(&reference, &active),
    })
}
