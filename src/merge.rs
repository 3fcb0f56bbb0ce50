use crate::access::{self, RequestContext};
use crate::db;
use crate::directory::{ResourceDirectory, ResourceKind, SqliteDirectory};
use crate::error::{OrganizerError, Result};
use crate::oplog::{self, OpScope};
use crate::snapshot::Snapshot;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
    Groups,
    Persons,
    Rooms,
}

impl MergeKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "groups" => Some(Self::Groups),
            "persons" => Some(Self::Persons),
            "rooms" => Some(Self::Rooms),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Groups => "groups",
            Self::Persons => "persons",
            Self::Rooms => "rooms",
        }
    }

    fn resource(self) -> ResourceKind {
        match self {
            Self::Groups => ResourceKind::Group,
            Self::Persons => ResourceKind::Person,
            Self::Rooms => ResourceKind::Room,
        }
    }

    pub fn config(self) -> &'static MergeConfig {
        match self {
            Self::Groups => &GROUPS,
            Self::Persons => &PERSONS,
            Self::Rooms => &ROOMS,
        }
    }
}

/// Rows hanging off a de-duplicated row that follow it when it is dropped.
#[derive(Debug)]
pub struct ChildTable {
    pub table: &'static str,
    pub parent_column: &'static str,
    /// Children of one parent are unique on this column.
    pub key_column: &'static str,
}

/// A table referencing the merged resource that allows one row per scope
/// value, so duplicates must be collapsed before the foreign key moves.
#[derive(Debug)]
pub struct DedupTable {
    pub table: &'static str,
    pub scope_column: &'static str,
    pub has_modified: bool,
    pub children: &'static [ChildTable],
    /// Column the kept row takes from the lowest-ID resource's row, so the
    /// stored value agrees with the rewritten snapshots.
    pub follows_survivor: Option<&'static str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotRewrite {
    Groups,
    Rooms,
    Persons,
}

#[derive(Debug)]
pub struct MergeConfig {
    pub fk_column: &'static str,
    /// Tables whose foreign key is rewritten in bulk.
    pub direct: &'static [&'static str],
    pub dedup: &'static [DedupTable],
    /// (patch key, column) pairs a merge may update on the survivor.
    pub patch_fields: &'static [(&'static str, &'static str)],
    pub rewrite: SnapshotRewrite,
}

const ASSOC_CHILDREN: &[ChildTable] = &[
    ChildTable {
        table: "instance_groups",
        parent_column: "assoc_id",
        key_column: "group_id",
    },
    ChildTable {
        table: "instance_rooms",
        parent_column: "assoc_id",
        key_column: "room_id",
    },
];

const ORG_RESOURCES: DedupTable = DedupTable {
    table: "organization_resources",
    scope_column: "organization_id",
    has_modified: false,
    children: &[],
    follows_survivor: None,
};

static GROUPS: MergeConfig = MergeConfig {
    fk_column: "group_id",
    direct: &["pools"],
    dedup: &[
        DedupTable {
            table: "instance_groups",
            scope_column: "assoc_id",
            has_modified: true,
            children: &[],
            follows_survivor: None,
        },
        ORG_RESOURCES,
        DedupTable {
            table: "group_publishing",
            scope_column: "term_id",
            has_modified: false,
            children: &[],
            follows_survivor: None,
        },
    ],
    patch_fields: &[("code", "code"), ("name", "name")],
    rewrite: SnapshotRewrite::Groups,
};

static ROOMS: MergeConfig = MergeConfig {
    fk_column: "room_id",
    direct: &[],
    dedup: &[
        DedupTable {
            table: "instance_rooms",
            scope_column: "assoc_id",
            has_modified: true,
            children: &[],
            follows_survivor: None,
        },
        ORG_RESOURCES,
    ],
    patch_fields: &[("code", "code"), ("name", "name")],
    rewrite: SnapshotRewrite::Rooms,
};

static PERSONS: MergeConfig = MergeConfig {
    fk_column: "person_id",
    direct: &[],
    dedup: &[
        DedupTable {
            table: "instance_persons",
            scope_column: "instance_id",
            has_modified: true,
            children: ASSOC_CHILDREN,
            follows_survivor: Some("role_id"),
        },
        ORG_RESOURCES,
    ],
    patch_fields: &[
        ("code", "code"),
        ("surname", "surname"),
        ("forename", "forename"),
    ],
    rewrite: SnapshotRewrite::Persons,
};

#[derive(Debug, Clone)]
struct Row {
    rowid: i64,
    modified: Option<String>,
}

/// Most recent `modified` wins; ties (or no timestamps) go to the lowest rowid.
fn pick_keeper(rows: &[Row]) -> Option<&Row> {
    rows.iter().min_by(|a, b| {
        b.modified
            .cmp(&a.modified)
            .then_with(|| a.rowid.cmp(&b.rowid))
    })
}

fn in_list(n: usize) -> String {
    vec!["?"; n].join(",")
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeCounts {
    pub repointed: usize,
    pub deduplicated: usize,
    pub children_moved: usize,
    pub children_dropped: usize,
}

/// Moves the children of `dropped` onto `keep`, collapsing collisions on the
/// child key the same way as their parents.
fn move_children(
    conn: &Connection,
    child: &ChildTable,
    dropped: i64,
    keep: i64,
    counts: &mut MergeCounts,
) -> Result<()> {
    let sql = format!(
        "SELECT id, {key}, modified FROM {table} WHERE {parent} = ?",
        key = child.key_column,
        table = child.table,
        parent = child.parent_column
    );
    let mut stmt = conn.prepare(&sql)?;
    let moving = stmt
        .query_map([dropped], |r| {
            Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?, r.get::<_, Option<String>>(2)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let find = format!(
        "SELECT id, modified FROM {table} WHERE {parent} = ? AND {key} = ?",
        key = child.key_column,
        table = child.table,
        parent = child.parent_column
    );
    let delete = format!("DELETE FROM {} WHERE id = ?", child.table);
    let repoint = format!(
        "UPDATE {} SET {} = ? WHERE id = ?",
        child.table, child.parent_column
    );
    for (id, key, modified) in moving {
        let existing: Option<(i64, Option<String>)> = conn
            .query_row(&find, (keep, key), |r| Ok((r.get(0)?, r.get(1)?)))
            .optional()?;
        match existing {
            None => {
                conn.execute(&repoint, (keep, id))?;
                counts.children_moved += 1;
            }
            Some((existing_id, existing_modified)) => {
                let candidates = [
                    Row {
                        rowid: existing_id,
                        modified: existing_modified,
                    },
                    Row { rowid: id, modified },
                ];
                let winner = pick_keeper(&candidates).map(|r| r.rowid).unwrap_or(existing_id);
                if winner == id {
                    conn.execute(&delete, [existing_id])?;
                    conn.execute(&repoint, (keep, id))?;
                } else {
                    conn.execute(&delete, [id])?;
                }
                counts.children_dropped += 1;
            }
        }
    }
    Ok(())
}

fn dedup_table(
    conn: &Connection,
    cfg: &MergeConfig,
    t: &DedupTable,
    all_ids: &[i64],
    counts: &mut MergeCounts,
) -> Result<()> {
    let modified_col = if t.has_modified { "modified" } else { "NULL" };
    let sql = format!(
        "SELECT rowid, {scope}, {modified}, {fk}, {carried} FROM {table} WHERE {fk} IN ({list})",
        scope = t.scope_column,
        modified = modified_col,
        fk = cfg.fk_column,
        carried = t.follows_survivor.unwrap_or("NULL"),
        table = t.table,
        list = in_list(all_ids.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(all_ids.iter()), |r| {
            Ok((
                r.get::<_, SqlValue>(1)?,
                Row {
                    rowid: r.get(0)?,
                    modified: r.get(2)?,
                },
                r.get::<_, i64>(3)?,
                r.get::<_, SqlValue>(4)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut by_scope: BTreeMap<String, Vec<(Row, i64, SqlValue)>> = BTreeMap::new();
    for (scope, row, owner, carried) in rows {
        let key = match scope {
            SqlValue::Integer(i) => i.to_string(),
            SqlValue::Text(s) => s,
            SqlValue::Null => continue,
            other => format!("{:?}", other),
        };
        by_scope.entry(key).or_default().push((row, owner, carried));
    }

    let delete = format!("DELETE FROM {} WHERE rowid = ?", t.table);
    for group in by_scope.values() {
        if group.len() < 2 {
            continue;
        }
        let rows: Vec<Row> = group.iter().map(|(r, _, _)| r.clone()).collect();
        let Some(keep) = pick_keeper(&rows).map(|r| r.rowid) else {
            continue;
        };
        for row in rows.iter().filter(|r| r.rowid != keep) {
            for child in t.children {
                move_children(conn, child, row.rowid, keep, counts)?;
            }
            conn.execute(&delete, [row.rowid])?;
            counts.deduplicated += 1;
        }
        if let Some(column) = t.follows_survivor {
            // The survivor is the lowest ID, so its row (or else the lowest
            // merged one) decides, as in Snapshot::substitute_persons.
            if let Some((_, _, value)) = group.iter().min_by_key(|(_, owner, _)| *owner) {
                conn.execute(
                    &format!("UPDATE {} SET {} = ? WHERE rowid = ?", t.table, column),
                    (value, keep),
                )?;
            }
        }
    }
    Ok(())
}

fn repoint(
    conn: &Connection,
    table: &str,
    fk_column: &str,
    merged: &[i64],
    survivor: i64,
) -> Result<usize> {
    let sql = format!(
        "UPDATE {table} SET {fk} = ? WHERE {fk} IN ({list})",
        table = table,
        fk = fk_column,
        list = in_list(merged.len())
    );
    let mut bind: Vec<i64> = Vec::with_capacity(merged.len() + 1);
    bind.push(survivor);
    bind.extend_from_slice(merged);
    Ok(conn.execute(&sql, params_from_iter(bind))?)
}

fn rewrite_snapshots(conn: &Connection, cfg: &MergeConfig, merged: &[i64], survivor: i64) -> Result<usize> {
    let mut stmt = conn.prepare("SELECT id, schedule FROM schedules ORDER BY id")?;
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let mut rewritten = 0;
    for (id, raw) in rows {
        let mut snapshot = Snapshot::from_json_str(&raw)?;
        let changed = match cfg.rewrite {
            SnapshotRewrite::Groups => snapshot.substitute_groups(merged, survivor),
            SnapshotRewrite::Rooms => snapshot.substitute_rooms(merged, survivor),
            SnapshotRewrite::Persons => snapshot.substitute_persons(merged, survivor),
        };
        if !changed {
            continue;
        }
        conn.execute(
            "UPDATE schedules SET schedule = ?, checksum = ? WHERE id = ?",
            (snapshot.to_json_string()?, snapshot.checksum()?, id),
        )?;
        rewritten += 1;
    }
    Ok(rewritten)
}

fn apply_patch(
    conn: &Connection,
    kind: MergeKind,
    survivor: i64,
    patch: &Map<String, Value>,
) -> Result<()> {
    let cfg = kind.config();
    let mut sets = Vec::new();
    let mut bind: Vec<SqlValue> = Vec::new();
    for (k, v) in patch {
        let Some((_, column)) = cfg.patch_fields.iter().find(|(key, _)| key == k) else {
            return Err(OrganizerError::BadParams(format!(
                "unknown {} patch field: {}",
                kind.as_str(),
                k
            )));
        };
        let s = v
            .as_str()
            .ok_or_else(|| OrganizerError::BadParams(format!("{} must be string", k)))?;
        sets.push(format!("{} = ?", column));
        bind.push(SqlValue::Text(s.trim().to_string()));
    }
    if sets.is_empty() {
        return Ok(());
    }
    bind.push(SqlValue::Integer(survivor));
    let sql = format!(
        "UPDATE {} SET {} WHERE id = ?",
        kind.resource().table(),
        sets.join(", ")
    );
    match conn.execute(&sql, params_from_iter(bind)) {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(OrganizerError::validation(
                format!("patch collides with another {}", kind.resource().label()),
                json!({ "kind": kind.as_str(), "patch": patch }),
            ))
        }
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeOutcome {
    pub kind: &'static str,
    pub survivor_id: i64,
    pub merged_ids: Vec<i64>,
    pub counts: MergeCounts,
    pub schedules_rewritten: usize,
    pub operation_id: String,
}

/// Collapses duplicate resources onto the lowest ID. Runs in one write
/// transaction; any failure leaves the database untouched.
pub fn merge(
    conn: &Connection,
    ctx: &RequestContext,
    kind: MergeKind,
    ids: &[i64],
    patch: Option<&Map<String, Value>>,
) -> Result<MergeOutcome> {
    let all: Vec<i64> = ids.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
    if all.len() < 2 {
        return Err(OrganizerError::BadParams(
            "merge needs at least two distinct ids".into(),
        ));
    }
    let survivor = all[0];
    let merged: Vec<i64> = all[1..].to_vec();
    let cfg = kind.config();

    let tx = db::begin_write(conn)?;
    access::require_admin(&tx, ctx)?;

    let dir = SqliteDirectory::new(&tx);
    let mut missing = Vec::new();
    for id in &all {
        if !dir.exists(kind.resource(), *id)? {
            missing.push(*id);
        }
    }
    if !missing.is_empty() {
        return Err(OrganizerError::not_found(
            format!("{} {} not found", kind.as_str(), json!(missing)),
            json!({ "kind": kind.as_str(), "ids": missing }),
        ));
    }

    let mut counts = MergeCounts::default();
    for table in cfg.direct {
        counts.repointed += repoint(&tx, table, cfg.fk_column, &merged, survivor)?;
    }
    for t in cfg.dedup {
        dedup_table(&tx, cfg, t, &all, &mut counts)?;
        counts.repointed += repoint(&tx, t.table, cfg.fk_column, &merged, survivor)?;
    }
    debug!(kind = kind.as_str(), ?counts, "merge references moved");

    let delete = format!(
        "DELETE FROM {} WHERE id IN ({})",
        kind.resource().table(),
        in_list(merged.len())
    );
    match tx.execute(&delete, params_from_iter(merged.iter())) {
        Ok(_) => {}
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            return Err(OrganizerError::integrity(
                format!("merged {} are still referenced", kind.as_str()),
                json!({ "kind": kind.as_str(), "ids": merged }),
            ));
        }
        Err(e) => return Err(e.into()),
    }
    if let Some(patch) = patch {
        apply_patch(&tx, kind, survivor, patch)?;
    }

    let schedules_rewritten = rewrite_snapshots(&tx, cfg, &merged, survivor)?;
    let operation_id = oplog::record(
        &tx,
        "merge",
        OpScope {
            user_id: ctx.user_id,
            ..OpScope::default()
        },
        &json!({
            "kind": kind.as_str(),
            "survivorId": survivor,
            "mergedIds": merged,
            "counts": counts,
            "schedulesRewritten": schedules_rewritten,
        }),
    )?;
    tx.commit()?;
    info!(
        kind = kind.as_str(),
        survivor_id = survivor,
        merged = merged.len(),
        schedules_rewritten,
        "resources merged"
    );

    Ok(MergeOutcome {
        kind: kind.as_str(),
        survivor_id: survivor,
        merged_ids: merged,
        counts,
        schedules_rewritten,
        operation_id,
    })
}
