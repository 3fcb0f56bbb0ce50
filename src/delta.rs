use rusqlite::{params_from_iter, types::Value, Connection};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// IDs bound per `bulk_update_status` statement.
const STATUS_BATCH: usize = 500;

/// Change state of a unit, instance or association relative to the last
/// activated snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaStatus {
    None,
    New,
    Removed,
    Changed,
}

impl DeltaStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeltaStatus::None => "none",
            DeltaStatus::New => "new",
            DeltaStatus::Removed => "removed",
            DeltaStatus::Changed => "changed",
        }
    }

    /// Unknown and empty values read as `none`; older rows used '' for it.
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "new" => DeltaStatus::New,
            "removed" => DeltaStatus::Removed,
            "changed" => DeltaStatus::Changed,
            _ => DeltaStatus::None,
        }
    }

    pub fn is_removed(self) -> bool {
        self == DeltaStatus::Removed
    }
}

/// The two association tables hanging off an instance-person row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChildKind {
    Group,
    Room,
}

impl ChildKind {
    pub fn table(self) -> &'static str {
        match self {
            ChildKind::Group => "instance_groups",
            ChildKind::Room => "instance_rooms",
        }
    }

    pub fn column(self) -> &'static str {
        match self {
            ChildKind::Group => "group_id",
            ChildKind::Room => "room_id",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ChildKind::Group => "group",
            ChildKind::Room => "room",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredPerson {
    pub id: i64,
    pub role_id: i64,
    pub status: DeltaStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredChild {
    pub id: i64,
    pub status: DeltaStatus,
}

/// Everything the reconciler needs to know about storage for one
/// (organization, term) scope.
#[derive(Debug, Clone, Default)]
pub struct ScopeState {
    pub units: BTreeMap<i64, DeltaStatus>,
    /// instance id → (unit id, status)
    pub instances: BTreeMap<i64, (i64, DeltaStatus)>,
    /// (instance id, person id) → stored association
    pub persons: BTreeMap<(i64, i64), StoredPerson>,
    /// (assoc id, group id) → stored row
    pub groups: BTreeMap<(i64, i64), StoredChild>,
    /// (assoc id, room id) → stored row
    pub rooms: BTreeMap<(i64, i64), StoredChild>,
}

impl ScopeState {
    pub fn children(&self, kind: ChildKind) -> &BTreeMap<(i64, i64), StoredChild> {
        match kind {
            ChildKind::Group => &self.groups,
            ChildKind::Room => &self.rooms,
        }
    }
}

/// Repository over the delta-tracked tables. Every write stamps `modified`
/// with the timestamp handed to the store, so one operation shares one time.
pub struct DeltaStore<'a> {
    conn: &'a Connection,
    now: String,
}

impl<'a> DeltaStore<'a> {
    pub fn new(conn: &'a Connection, now: impl Into<String>) -> Self {
        Self {
            conn,
            now: now.into(),
        }
    }

    pub fn load_scope(&self, organization_id: i64, term_id: i64) -> rusqlite::Result<ScopeState> {
        let mut state = ScopeState::default();

        let mut stmt = self
            .conn
            .prepare("SELECT id, delta FROM units WHERE organization_id = ? AND term_id = ?")?;
        let rows = stmt.query_map((organization_id, term_id), |r| {
            Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (id, delta) = row?;
            state.units.insert(id, DeltaStatus::parse(&delta));
        }

        let mut stmt = self.conn.prepare(
            "SELECT i.id, i.unit_id, i.delta
             FROM instances i
             JOIN units u ON u.id = i.unit_id
             WHERE u.organization_id = ? AND u.term_id = ?",
        )?;
        let rows = stmt.query_map((organization_id, term_id), |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, String>(2)?,
            ))
        })?;
        for row in rows {
            let (id, unit_id, delta) = row?;
            state
                .instances
                .insert(id, (unit_id, DeltaStatus::parse(&delta)));
        }

        let mut stmt = self.conn.prepare(
            "SELECT ip.id, ip.instance_id, ip.person_id, ip.role_id, ip.delta
             FROM instance_persons ip
             JOIN instances i ON i.id = ip.instance_id
             JOIN units u ON u.id = i.unit_id
             WHERE u.organization_id = ? AND u.term_id = ?",
        )?;
        let rows = stmt.query_map((organization_id, term_id), |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, i64>(3)?,
                r.get::<_, String>(4)?,
            ))
        })?;
        for row in rows {
            let (id, instance_id, person_id, role_id, delta) = row?;
            state.persons.insert(
                (instance_id, person_id),
                StoredPerson {
                    id,
                    role_id,
                    status: DeltaStatus::parse(&delta),
                },
            );
        }

        for kind in [ChildKind::Group, ChildKind::Room] {
            let sql = format!(
                "SELECT c.id, c.assoc_id, c.{col}, c.delta
                 FROM {table} c
                 JOIN instance_persons ip ON ip.id = c.assoc_id
                 JOIN instances i ON i.id = ip.instance_id
                 JOIN units u ON u.id = i.unit_id
                 WHERE u.organization_id = ? AND u.term_id = ?",
                col = kind.column(),
                table = kind.table()
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map((organization_id, term_id), |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, String>(3)?,
                ))
            })?;
            let target = match kind {
                ChildKind::Group => &mut state.groups,
                ChildKind::Room => &mut state.rooms,
            };
            for row in rows {
                let (id, assoc_id, resource_id, delta) = row?;
                target.insert(
                    (assoc_id, resource_id),
                    StoredChild {
                        id,
                        status: DeltaStatus::parse(&delta),
                    },
                );
            }
        }

        Ok(state)
    }

    /// Inserts a new instance-person association. New rows always start as
    /// `new`.
    pub fn insert_person(
        &self,
        instance_id: i64,
        person_id: i64,
        role_id: i64,
    ) -> rusqlite::Result<i64> {
        self.conn.execute(
            "INSERT INTO instance_persons(instance_id, person_id, role_id, delta, modified)
             VALUES(?, ?, ?, 'new', ?)",
            (instance_id, person_id, role_id, &self.now),
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn insert_child(
        &self,
        kind: ChildKind,
        assoc_id: i64,
        resource_id: i64,
    ) -> rusqlite::Result<i64> {
        let sql = format!(
            "INSERT INTO {}(assoc_id, {}, delta, modified) VALUES(?, ?, 'new', ?)",
            kind.table(),
            kind.column()
        );
        self.conn
            .execute(&sql, (assoc_id, resource_id, &self.now))?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn save_person(
        &self,
        assoc_id: i64,
        status: DeltaStatus,
        role_id: i64,
    ) -> rusqlite::Result<()> {
        self.conn.execute(
            "UPDATE instance_persons SET delta = ?, role_id = ?, modified = ? WHERE id = ?",
            (status.as_str(), role_id, &self.now, assoc_id),
        )?;
        Ok(())
    }

    /// Sets the status of many rows of one table, `STATUS_BATCH` IDs per
    /// statement to stay under SQLite's bound-variable limit.
    pub fn bulk_update_status(
        &self,
        table: &str,
        ids: &[i64],
        status: DeltaStatus,
    ) -> rusqlite::Result<usize> {
        let mut updated = 0;
        for chunk in ids.chunks(STATUS_BATCH) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!(
                "UPDATE {} SET delta = ?, modified = ? WHERE id IN ({})",
                table, placeholders
            );
            let mut bind: Vec<Value> = Vec::with_capacity(chunk.len() + 2);
            bind.push(Value::Text(status.as_str().to_string()));
            bind.push(Value::Text(self.now.clone()));
            bind.extend(chunk.iter().map(|id| Value::Integer(*id)));
            updated += self.conn.execute(&sql, params_from_iter(bind))?;
        }
        Ok(updated)
    }
}
