use crate::access::{self, RequestContext};
use crate::activation::{self, ActivationOutcome};
use crate::db;
use crate::directory::{ResourceDirectory, ResourceKind, SqliteDirectory};
use crate::error::{OrganizerError, Result};
use crate::settings;
use crate::snapshot::{Assignment, RawRef, RawSnapshot, Snapshot};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};

/// How references in a raw upload are spelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyedBy {
    Id,
    Code,
}

impl KeyedBy {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "id" => Some(Self::Id),
            "code" => Some(Self::Code),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub organization_id: i64,
    pub term_id: i64,
    pub keyed_by: KeyedBy,
    pub schedule: RawSnapshot,
    pub validation_errors: Vec<Value>,
    pub validation_warnings: Vec<Value>,
    pub activate: Option<bool>,
}

impl UploadRequest {
    pub fn from_params(params: &Value) -> Result<Self> {
        let organization_id = params
            .get("organizationId")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| OrganizerError::BadParams("missing organizationId".into()))?;
        let term_id = params
            .get("termId")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| OrganizerError::BadParams("missing termId".into()))?;
        let keyed_by = match params.get("keyedBy").and_then(|v| v.as_str()) {
            None => KeyedBy::Id,
            Some(s) => KeyedBy::parse(s).ok_or_else(|| {
                OrganizerError::BadParams("keyedBy must be id or code".into())
            })?,
        };
        let raw = params
            .get("schedule")
            .cloned()
            .ok_or_else(|| OrganizerError::BadParams("missing schedule".into()))?;
        let schedule: RawSnapshot = serde_json::from_value(raw)
            .map_err(|e| OrganizerError::BadParams(format!("malformed schedule: {}", e)))?;
        let list = |key: &str| -> Vec<Value> {
            params
                .get("validation")
                .and_then(|v| v.get(key))
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default()
        };
        Ok(Self {
            organization_id,
            term_id,
            keyed_by,
            schedule,
            validation_errors: list("errors"),
            validation_warnings: list("warnings"),
            activate: params.get("activate").and_then(|v| v.as_bool()),
        })
    }
}

/// A reference in the upload that could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Unresolved {
    pub kind: &'static str,
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub person: Option<String>,
    pub reason: &'static str,
}

struct Resolver<'d, D: ResourceDirectory> {
    dir: &'d D,
    keyed_by: KeyedBy,
    cache: HashMap<(ResourceKind, String), Option<i64>>,
}

impl<'d, D: ResourceDirectory> Resolver<'d, D> {
    fn new(dir: &'d D, keyed_by: KeyedBy) -> Self {
        Self {
            dir,
            keyed_by,
            cache: HashMap::new(),
        }
    }

    fn lookup(&mut self, kind: ResourceKind, key: &str) -> Result<Option<i64>> {
        let cache_key = (kind, key.to_string());
        if let Some(hit) = self.cache.get(&cache_key) {
            return Ok(*hit);
        }
        let found = match self.keyed_by {
            KeyedBy::Code => self.dir.resolve(kind, key)?,
            KeyedBy::Id => match key.parse::<i64>() {
                Ok(id) if self.dir.exists(kind, id)? => Some(id),
                _ => None,
            },
        };
        self.cache.insert(cache_key, found);
        Ok(found)
    }

    fn lookup_ref(&mut self, kind: ResourceKind, r: &RawRef) -> Result<Option<i64>> {
        if self.keyed_by == KeyedBy::Id {
            if let RawRef::Text(s) = r {
                if s.trim().parse::<i64>().is_err() {
                    return Ok(None);
                }
            }
        }
        self.lookup(kind, &r.as_key())
    }
}

/// Resolves every reference of a raw upload and produces the normalized
/// snapshot. Fails closed: one unresolved reference rejects the upload, and
/// the error lists all of them.
pub fn normalize<D: ResourceDirectory>(
    dir: &D,
    organization_id: i64,
    term_id: i64,
    keyed_by: KeyedBy,
    raw: &RawSnapshot,
) -> Result<Snapshot> {
    let mut resolver = Resolver::new(dir, keyed_by);
    let mut unresolved: Vec<Unresolved> = Vec::new();
    let mut folded: BTreeMap<i64, BTreeMap<i64, (i64, Vec<i64>, Vec<i64>)>> = BTreeMap::new();

    for (instance_key, persons) in &raw.instances {
        let instance_id = match resolver.lookup(ResourceKind::Instance, instance_key.trim())? {
            Some(id) => id,
            None => {
                unresolved.push(Unresolved {
                    kind: "instance",
                    reference: instance_key.clone(),
                    instance: None,
                    person: None,
                    reason: "unknown",
                });
                continue;
            }
        };
        let in_scope = dir
            .instance_scope(instance_id)?
            .map(|s| s.organization_id == organization_id && s.term_id == term_id)
            .unwrap_or(false);
        if !in_scope {
            unresolved.push(Unresolved {
                kind: "instance",
                reference: instance_key.clone(),
                instance: None,
                person: None,
                reason: "out_of_scope",
            });
            continue;
        }

        for (person_key, a) in persons {
            let person_id = resolver.lookup(ResourceKind::Person, person_key.trim())?;
            if person_id.is_none() {
                unresolved.push(Unresolved {
                    kind: "person",
                    reference: person_key.clone(),
                    instance: Some(instance_key.clone()),
                    person: None,
                    reason: "unknown",
                });
            }
            let mut groups = Vec::with_capacity(a.groups.len());
            for r in &a.groups {
                match resolver.lookup_ref(ResourceKind::Group, r)? {
                    Some(id) => groups.push(id),
                    None => unresolved.push(Unresolved {
                        kind: "group",
                        reference: r.as_key(),
                        instance: Some(instance_key.clone()),
                        person: Some(person_key.clone()),
                        reason: "unknown",
                    }),
                }
            }
            let mut rooms = Vec::with_capacity(a.rooms.len());
            for r in &a.rooms {
                match resolver.lookup_ref(ResourceKind::Room, r)? {
                    Some(id) => rooms.push(id),
                    None => unresolved.push(Unresolved {
                        kind: "room",
                        reference: r.as_key(),
                        instance: Some(instance_key.clone()),
                        person: Some(person_key.clone()),
                        reason: "unknown",
                    }),
                }
            }
            let Some(person_id) = person_id else {
                continue;
            };
            // Two keys may resolve to the same person; their lists are unioned.
            let entry = folded
                .entry(instance_id)
                .or_default()
                .entry(person_id)
                .or_insert_with(|| (a.role_id.unwrap_or(0), Vec::new(), Vec::new()));
            entry.1.extend(groups);
            entry.2.extend(rooms);
        }
    }

    if !unresolved.is_empty() {
        return Err(OrganizerError::validation(
            format!("{} reference(s) could not be resolved", unresolved.len()),
            json!({ "unresolved": unresolved }),
        ));
    }

    let mut snapshot = Snapshot::default();
    for (instance_id, persons) in folded {
        let target = snapshot.instances.entry(instance_id).or_default();
        for (person_id, (role_id, groups, rooms)) in persons {
            target.insert(person_id, Assignment::new(role_id, groups, rooms));
        }
    }
    Ok(snapshot)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportOutcome {
    pub schedule_id: i64,
    pub checksum: String,
    pub instance_count: usize,
    pub association_count: usize,
    pub warnings: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activation: Option<ActivationOutcome>,
}

/// Validates, normalizes and stores an upload as an inactive snapshot, and
/// activates it in the same transaction when asked to.
pub fn import(conn: &Connection, ctx: &RequestContext, req: &UploadRequest) -> Result<ImportOutcome> {
    if !req.validation_errors.is_empty() {
        return Err(OrganizerError::validation(
            "upload failed validation",
            json!({ "errors": req.validation_errors }),
        ));
    }
    if req.schedule.instances.is_empty() {
        return Err(OrganizerError::validation(
            "schedule is empty",
            json!({ "unresolved": [] }),
        ));
    }

    let tx = db::begin_write(conn)?;
    access::require_scheduler(&tx, ctx, req.organization_id)?;

    let dir = SqliteDirectory::new(&tx);
    let mut scope_missing = Vec::new();
    if !dir.exists(ResourceKind::Organization, req.organization_id)? {
        scope_missing.push(json!({ "kind": "organization", "ref": req.organization_id.to_string(), "reason": "unknown" }));
    }
    if !dir.exists(ResourceKind::Term, req.term_id)? {
        scope_missing.push(json!({ "kind": "term", "ref": req.term_id.to_string(), "reason": "unknown" }));
    }
    if !scope_missing.is_empty() {
        return Err(OrganizerError::validation(
            "upload scope does not exist",
            json!({ "unresolved": scope_missing }),
        ));
    }

    let snapshot = normalize(&dir, req.organization_id, req.term_id, req.keyed_by, &req.schedule)?;
    if snapshot.is_empty() {
        return Err(OrganizerError::validation(
            "schedule has no participants",
            json!({ "unresolved": [] }),
        ));
    }
    let association_count = snapshot.flatten().len();
    let checksum = snapshot.checksum()?;

    let mut warnings = req.validation_warnings.clone();
    let identical: Option<i64> = tx
        .query_row(
            "SELECT id FROM schedules
             WHERE organization_id = ? AND term_id = ? AND checksum = ?
             ORDER BY id DESC LIMIT 1",
            (req.organization_id, req.term_id, &checksum),
            |r| r.get(0),
        )
        .optional()?;
    if let Some(existing) = identical {
        warn!(schedule_id = existing, "upload is identical to a stored snapshot");
        warnings.push(json!({
            "code": "identical_snapshot",
            "message": format!("identical to stored schedule {}", existing),
            "scheduleId": existing
        }));
    }

    let now = chrono::Utc::now();
    tx.execute(
        "INSERT INTO schedules(organization_id, term_id, user_id, creation_date, creation_time, schedule, checksum, active)
         VALUES(?, ?, ?, ?, ?, ?, ?, 0)",
        (
            req.organization_id,
            req.term_id,
            ctx.user_id,
            now.format("%Y-%m-%d").to_string(),
            now.format("%H:%M:%S").to_string(),
            snapshot.to_json_string()?,
            &checksum,
        ),
    )?;
    let schedule_id = tx.last_insert_rowid();
    info!(
        schedule_id,
        organization_id = req.organization_id,
        term_id = req.term_id,
        instances = snapshot.instances.len(),
        associations = association_count,
        "stored schedule upload"
    );

    let activate = match req.activate {
        Some(a) => a,
        None => settings::activate_on_upload(&tx)?,
    };
    let activation = if activate {
        Some(activation::activate_locked(&tx, ctx, schedule_id)?)
    } else {
        None
    };

    tx.commit()?;
    Ok(ImportOutcome {
        schedule_id,
        checksum,
        instance_count: snapshot.instances.len(),
        association_count,
        warnings,
        activation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::InstanceScope;
    use std::collections::HashSet;

    /// In-memory directory: codes are "<letter><id>", every instance sits in
    /// unit 1 of org 1 / term 1 unless listed in `foreign`.
    #[derive(Default)]
    struct FakeDirectory {
        known: HashSet<(ResourceKind, i64)>,
        foreign: HashSet<i64>,
    }

    impl FakeDirectory {
        fn with(mut self, kind: ResourceKind, ids: &[i64]) -> Self {
            for id in ids {
                self.known.insert((kind, *id));
            }
            self
        }
    }

    fn prefix(kind: ResourceKind) -> char {
        match kind {
            ResourceKind::Instance => 'I',
            ResourceKind::Person => 'P',
            ResourceKind::Group => 'G',
            ResourceKind::Room => 'R',
            _ => 'X',
        }
    }

    impl ResourceDirectory for FakeDirectory {
        fn resolve(&self, kind: ResourceKind, code: &str) -> Result<Option<i64>> {
            let Some(rest) = code.strip_prefix(prefix(kind)) else {
                return Ok(None);
            };
            Ok(rest
                .parse::<i64>()
                .ok()
                .filter(|id| self.known.contains(&(kind, *id))))
        }

        fn exists(&self, kind: ResourceKind, id: i64) -> Result<bool> {
            Ok(self.known.contains(&(kind, id)))
        }

        fn instance_scope(&self, instance_id: i64) -> Result<Option<InstanceScope>> {
            if !self.known.contains(&(ResourceKind::Instance, instance_id)) {
                return Ok(None);
            }
            let org = if self.foreign.contains(&instance_id) { 2 } else { 1 };
            Ok(Some(InstanceScope {
                unit_id: 1,
                organization_id: org,
                term_id: 1,
            }))
        }
    }

    fn raw(v: Value) -> RawSnapshot {
        serde_json::from_value(v).expect("raw snapshot")
    }

    fn directory() -> FakeDirectory {
        FakeDirectory::default()
            .with(ResourceKind::Instance, &[100, 101])
            .with(ResourceKind::Person, &[7, 8])
            .with(ResourceKind::Group, &[3])
            .with(ResourceKind::Room, &[4])
    }

    #[test]
    fn code_keyed_upload_resolves_everything() {
        let dir = directory();
        let s = normalize(
            &dir,
            1,
            1,
            KeyedBy::Code,
            &raw(json!({ "I100": { "P7": { "roleID": 2, "groups": ["G3"], "rooms": ["R4"] } } })),
        )
        .expect("normalize");
        let a = s.get(100, 7).expect("100/7");
        assert_eq!(a.role_id, 2);
        assert_eq!(a.groups, vec![3]);
        assert_eq!(a.rooms, vec![4]);
    }

    #[test]
    fn every_unresolved_reference_is_reported() {
        let dir = directory();
        let err = normalize(
            &dir,
            1,
            1,
            KeyedBy::Code,
            &raw(json!({
                "I100": { "P7": { "groups": ["G3", "G99"] }, "P55": { "rooms": ["R77"] } },
                "I999": { "P7": {} }
            })),
        )
        .unwrap_err();
        assert_eq!(err.code(), "validation_failed");
        let details = err.details().expect("details");
        let refs: Vec<&str> = details["unresolved"]
            .as_array()
            .expect("list")
            .iter()
            .filter_map(|u| u["ref"].as_str())
            .collect();
        assert_eq!(refs, vec!["P55", "R77", "G99", "I999"]);
    }

    #[test]
    fn id_mode_rejects_out_of_scope_instances_and_codes() {
        let mut dir = directory();
        dir.foreign.insert(101);
        let err = normalize(
            &dir,
            1,
            1,
            KeyedBy::Id,
            &raw(json!({ "100": { "7": { "groups": ["G3"] } }, "101": { "8": {} } })),
        )
        .unwrap_err();
        let details = err.details().expect("details");
        let list = details["unresolved"].as_array().expect("list");
        assert_eq!(list.len(), 2);
        assert_eq!(list[0]["kind"], "group");
        assert_eq!(list[1]["reason"], "out_of_scope");
    }
}
