use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

pub type InstanceId = i64;
pub type PersonId = i64;

/// Role used when an upload omits `roleID` (or sends 0).
pub const DEFAULT_ROLE_ID: i64 = 1;

/// What one person does in one instance: their role plus the groups and
/// rooms attached to that participation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    #[serde(rename = "roleID", default = "default_role")]
    pub role_id: i64,
    #[serde(default)]
    pub groups: Vec<i64>,
    #[serde(default)]
    pub rooms: Vec<i64>,
}

fn default_role() -> i64 {
    DEFAULT_ROLE_ID
}

impl Assignment {
    pub fn new(role_id: i64, groups: Vec<i64>, rooms: Vec<i64>) -> Self {
        let mut a = Self {
            role_id: if role_id > 0 { role_id } else { DEFAULT_ROLE_ID },
            groups,
            rooms,
        };
        a.normalize();
        a
    }

    fn normalize(&mut self) {
        if self.role_id <= 0 {
            self.role_id = DEFAULT_ROLE_ID;
        }
        dedup_in_place(&mut self.groups);
        dedup_in_place(&mut self.rooms);
    }
}

fn dedup_in_place(ids: &mut Vec<i64>) {
    let mut seen = BTreeSet::new();
    ids.retain(|id| seen.insert(*id));
}

/// A normalized schedule upload: instance → person → assignment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot {
    pub instances: BTreeMap<InstanceId, BTreeMap<PersonId, Assignment>>,
}

/// Flattened association: one row per (instance, person).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationTuple {
    pub instance_id: InstanceId,
    pub person_id: PersonId,
    pub role_id: i64,
    pub group_ids: Vec<i64>,
    pub room_ids: Vec<i64>,
}

impl Snapshot {
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        let mut snap: Snapshot = serde_json::from_str(s)?;
        snap.normalize();
        Ok(snap)
    }

    pub fn to_json_string(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn normalize(&mut self) {
        for persons in self.instances.values_mut() {
            for a in persons.values_mut() {
                a.normalize();
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn get(&self, instance_id: InstanceId, person_id: PersonId) -> Option<&Assignment> {
        self.instances.get(&instance_id)?.get(&person_id)
    }

    pub fn contains_instance(&self, instance_id: InstanceId) -> bool {
        self.instances.contains_key(&instance_id)
    }

    pub fn flatten(&self) -> Vec<AssociationTuple> {
        let mut out = Vec::new();
        for (instance_id, persons) in &self.instances {
            for (person_id, a) in persons {
                out.push(AssociationTuple {
                    instance_id: *instance_id,
                    person_id: *person_id,
                    role_id: a.role_id,
                    group_ids: a.groups.clone(),
                    room_ids: a.rooms.clone(),
                });
            }
        }
        out
    }

    pub fn person_ids(&self) -> BTreeSet<i64> {
        self.instances
            .values()
            .flat_map(|persons| persons.keys().copied())
            .collect()
    }

    pub fn group_ids(&self) -> BTreeSet<i64> {
        self.instances
            .values()
            .flat_map(|persons| persons.values())
            .flat_map(|a| a.groups.iter().copied())
            .collect()
    }

    pub fn room_ids(&self) -> BTreeSet<i64> {
        self.instances
            .values()
            .flat_map(|persons| persons.values())
            .flat_map(|a| a.rooms.iter().copied())
            .collect()
    }

    /// SHA-256 over the normalized JSON. BTreeMap ordering makes this stable.
    pub fn checksum(&self) -> serde_json::Result<String> {
        let text = self.to_json_string()?;
        Ok(format!("{:x}", Sha256::digest(text.as_bytes())))
    }

    /// Replaces every group ID in `merged` by `survivor`. Returns whether
    /// anything changed.
    pub fn substitute_groups(&mut self, merged: &[i64], survivor: i64) -> bool {
        self.substitute_list(merged, survivor, |a| &mut a.groups)
    }

    pub fn substitute_rooms(&mut self, merged: &[i64], survivor: i64) -> bool {
        self.substitute_list(merged, survivor, |a| &mut a.rooms)
    }

    fn substitute_list<F>(&mut self, merged: &[i64], survivor: i64, pick: F) -> bool
    where
        F: Fn(&mut Assignment) -> &mut Vec<i64>,
    {
        let mut changed = false;
        for persons in self.instances.values_mut() {
            for a in persons.values_mut() {
                let list = pick(a);
                if !list.iter().any(|id| merged.contains(id)) {
                    continue;
                }
                changed = true;
                for id in list.iter_mut() {
                    if merged.contains(id) {
                        *id = survivor;
                    }
                }
                dedup_in_place(list);
            }
        }
        changed
    }

    /// Folds the person entries of `merged` into `survivor`. When several
    /// merged persons appear under the same instance, the survivor's role
    /// wins (otherwise the lowest merged ID's) and groups/rooms are unioned.
    pub fn substitute_persons(&mut self, merged: &[i64], survivor: i64) -> bool {
        let mut changed = false;
        for persons in self.instances.values_mut() {
            let hits: Vec<i64> = persons
                .keys()
                .copied()
                .filter(|id| *id == survivor || merged.contains(id))
                .collect();
            if !hits.iter().any(|id| *id != survivor) {
                continue;
            }
            changed = true;
            let mut folded: Option<Assignment> = persons.remove(&survivor);
            for id in hits.into_iter().filter(|id| *id != survivor) {
                let Some(a) = persons.remove(&id) else {
                    continue;
                };
                folded = Some(match folded {
                    None => a,
                    Some(mut keep) => {
                        keep.groups.extend(a.groups);
                        keep.rooms.extend(a.rooms);
                        keep
                    }
                });
            }
            if let Some(mut a) = folded {
                a.normalize();
                persons.insert(survivor, a);
            }
        }
        changed
    }
}

/// A reference in a raw upload: either a numeric ID or a textual code.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RawRef {
    Number(i64),
    Text(String),
}

impl RawRef {
    pub fn as_key(&self) -> String {
        match self {
            RawRef::Number(n) => n.to_string(),
            RawRef::Text(s) => s.trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawAssignment {
    #[serde(rename = "roleID", default)]
    pub role_id: Option<i64>,
    #[serde(default)]
    pub groups: Vec<RawRef>,
    #[serde(default)]
    pub rooms: Vec<RawRef>,
}

/// Upload payload as delivered by the import validator, keyed by whatever
/// the validator used (surrogate IDs or external codes).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct RawSnapshot {
    pub instances: BTreeMap<String, BTreeMap<String, RawAssignment>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snap(v: serde_json::Value) -> Snapshot {
        Snapshot::from_json_str(&v.to_string()).expect("parse snapshot")
    }

    #[test]
    fn parses_numeric_keys_and_defaults() {
        let s = snap(json!({
            "100": { "7": { "groups": [3, 3, 4] } },
            "101": { "8": { "roleID": 0, "groups": [], "rooms": [9] } }
        }));
        let a = s.get(100, 7).expect("100/7");
        assert_eq!(a.role_id, DEFAULT_ROLE_ID);
        assert_eq!(a.groups, vec![3, 4]);
        assert!(a.rooms.is_empty());
        assert_eq!(s.get(101, 8).map(|a| a.role_id), Some(1));
        assert_eq!(s.flatten().len(), 2);
    }

    #[test]
    fn checksum_ignores_input_key_order() {
        let a = snap(json!({ "2": { "1": { "groups": [1] } }, "1": { "1": { "groups": [2] } } }));
        let b = snap(json!({ "1": { "1": { "groups": [2] } }, "2": { "1": { "groups": [1] } } }));
        assert_eq!(a.checksum().unwrap(), b.checksum().unwrap());
    }

    #[test]
    fn substitute_groups_collapses_duplicates() {
        let mut s = snap(json!({ "1": { "1": { "groups": [9, 5, 12] } } }));
        assert!(s.substitute_groups(&[9, 12], 5));
        assert_eq!(s.get(1, 1).unwrap().groups, vec![5]);
        assert!(!s.substitute_groups(&[9, 12], 5));
    }

    #[test]
    fn substitute_persons_folds_entries() {
        let mut s = snap(json!({
            "1": {
                "5": { "roleID": 2, "groups": [1], "rooms": [] },
                "9": { "roleID": 3, "groups": [2], "rooms": [4] }
            },
            "2": { "12": { "roleID": 4, "groups": [1] } }
        }));
        assert!(s.substitute_persons(&[9, 12], 5));
        let a = s.get(1, 5).unwrap();
        assert_eq!(a.role_id, 2);
        assert_eq!(a.groups, vec![1, 2]);
        assert_eq!(a.rooms, vec![4]);
        assert!(s.get(1, 9).is_none());
        assert_eq!(s.get(2, 5).map(|a| a.role_id), Some(4));
    }

    #[test]
    fn raw_refs_accept_numbers_and_codes() {
        let raw: RawSnapshot = serde_json::from_value(json!({
            "I1": { "P1": { "groups": ["G1", 4], "rooms": [" R1 "] } }
        }))
        .expect("raw");
        let a = &raw.instances["I1"]["P1"];
        let keys: Vec<String> = a.groups.iter().map(|r| r.as_key()).collect();
        assert_eq!(keys, vec!["G1".to_string(), "4".to_string()]);
        assert_eq!(a.rooms[0].as_key(), "R1");
        assert_eq!(a.role_id, None);
    }
}
