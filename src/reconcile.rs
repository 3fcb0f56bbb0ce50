use crate::delta::{ChildKind, DeltaStatus, ScopeState};
use crate::snapshot::{Assignment, Snapshot};
use serde::Serialize;
use std::collections::BTreeSet;

/// Which person association a group/room row hangs off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parent {
    Stored(i64),
    /// The parent is created by the same plan.
    Pending { instance_id: i64, person_id: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Unit(i64),
    Instance(i64),
    Person {
        instance_id: i64,
        person_id: i64,
        assoc_id: Option<i64>,
    },
    Child {
        kind: ChildKind,
        parent: Parent,
        resource_id: i64,
        row_id: Option<i64>,
    },
}

/// One planned status write. `from == None` means the row does not exist
/// yet and is inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub target: Target,
    pub from: Option<DeltaStatus>,
    pub to: DeltaStatus,
    /// Role to store on person associations.
    pub role_id: Option<i64>,
}

impl Transition {
    pub fn is_create(&self) -> bool {
        self.from.is_none()
    }

    pub fn is_activate(&self) -> bool {
        self.from == Some(DeltaStatus::Removed) && self.to == DeltaStatus::New
    }

    pub fn is_remove(&self) -> bool {
        self.to == DeltaStatus::Removed
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReconcilePlan {
    pub transitions: Vec<Transition>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelCounts {
    pub created: usize,
    pub activated: usize,
    pub removed: usize,
    pub changed: usize,
    pub renewed: usize,
    pub unchanged: usize,
}

impl LevelCounts {
    fn record(&mut self, t: &Transition) {
        if t.is_create() {
            self.created += 1;
        } else if t.is_activate() {
            self.activated += 1;
        } else {
            match t.to {
                DeltaStatus::Removed => self.removed += 1,
                DeltaStatus::Changed => self.changed += 1,
                DeltaStatus::New => self.renewed += 1,
                DeltaStatus::None => self.unchanged += 1,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSummary {
    pub units: LevelCounts,
    pub instances: LevelCounts,
    pub persons: LevelCounts,
    pub groups: LevelCounts,
    pub rooms: LevelCounts,
    pub transitions: usize,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    pub fn to_create(&self) -> impl Iterator<Item = &Transition> {
        self.transitions.iter().filter(|t| t.is_create())
    }

    pub fn to_activate(&self) -> impl Iterator<Item = &Transition> {
        self.transitions.iter().filter(|t| t.is_activate())
    }

    pub fn to_remove(&self) -> impl Iterator<Item = &Transition> {
        self.transitions.iter().filter(|t| t.is_remove())
    }

    pub fn changed(&self) -> impl Iterator<Item = &Transition> {
        self.transitions
            .iter()
            .filter(|t| t.to == DeltaStatus::Changed)
    }

    pub fn summary(&self) -> PlanSummary {
        let mut s = PlanSummary {
            transitions: self.transitions.len(),
            ..PlanSummary::default()
        };
        for t in &self.transitions {
            let level = match t.target {
                Target::Unit(_) => &mut s.units,
                Target::Instance(_) => &mut s.instances,
                Target::Person { .. } => &mut s.persons,
                Target::Child {
                    kind: ChildKind::Group,
                    ..
                } => &mut s.groups,
                Target::Child {
                    kind: ChildKind::Room,
                    ..
                } => &mut s.rooms,
            };
            level.record(t);
        }
        s
    }
}

/// Three-way decision for one key. Returns the status to write, or `None`
/// when storage already holds the right value.
fn decide(
    in_new: bool,
    in_baseline: bool,
    stored: Option<DeltaStatus>,
    changed: bool,
) -> Option<DeltaStatus> {
    if !in_new {
        return match stored {
            Some(s) if !s.is_removed() => Some(DeltaStatus::Removed),
            _ => None,
        };
    }
    match stored {
        None | Some(DeltaStatus::Removed) => Some(DeltaStatus::New),
        Some(current) => {
            let next = if changed {
                DeltaStatus::Changed
            } else if in_baseline {
                DeltaStatus::None
            } else {
                DeltaStatus::New
            };
            (next != current).then_some(next)
        }
    }
}

fn child_list(a: &Assignment, kind: ChildKind) -> &[i64] {
    match kind {
        ChildKind::Group => &a.groups,
        ChildKind::Room => &a.rooms,
    }
}

fn units_of(snapshot: &Snapshot, stored: &ScopeState) -> BTreeSet<i64> {
    snapshot
        .instances
        .keys()
        .filter_map(|id| stored.instances.get(id).map(|(unit_id, _)| *unit_id))
        .collect()
}

/// Computes the status transitions that make storage reflect `new`.
///
/// `baseline` is the snapshot the delta is relative to (the previously
/// authoritative one, or empty). Storage decides existence: rows marked
/// `removed` that reappear become `new` again, rows absent from `new` become
/// `removed`, and a differing role on an existing person association marks it
/// `changed`. Group and room rows are compared per parent association;
/// dropping a person association removes its groups and rooms with it.
pub fn reconcile(new: &Snapshot, baseline: &Snapshot, stored: &ScopeState) -> ReconcilePlan {
    let mut plan = ReconcilePlan::default();

    let new_units = units_of(new, stored);
    let base_units = units_of(baseline, stored);
    for (unit_id, status) in &stored.units {
        if let Some(to) = decide(
            new_units.contains(unit_id),
            base_units.contains(unit_id),
            Some(*status),
            false,
        ) {
            plan.transitions.push(Transition {
                target: Target::Unit(*unit_id),
                from: Some(*status),
                to,
                role_id: None,
            });
        }
    }

    for (instance_id, (_, status)) in &stored.instances {
        if let Some(to) = decide(
            new.contains_instance(*instance_id),
            baseline.contains_instance(*instance_id),
            Some(*status),
            false,
        ) {
            plan.transitions.push(Transition {
                target: Target::Instance(*instance_id),
                from: Some(*status),
                to,
                role_id: None,
            });
        }
    }

    for (instance_id, persons) in &new.instances {
        for (person_id, assignment) in persons {
            let key = (*instance_id, *person_id);
            let existing = stored.persons.get(&key);
            let base = baseline.get(*instance_id, *person_id);
            // A role differing from storage needs a write; one differing from
            // the baseline keeps the association `changed`.
            let stored_role_differs = existing
                .map(|p| !p.status.is_removed() && p.role_id != assignment.role_id)
                .unwrap_or(false);
            let base_role_differs = base
                .map(|b| b.role_id != assignment.role_id)
                .unwrap_or(false);
            let to = decide(
                true,
                base.is_some(),
                existing.map(|p| p.status),
                stored_role_differs || base_role_differs,
            )
            .or_else(|| stored_role_differs.then_some(DeltaStatus::Changed));
            if let Some(to) = to {
                plan.transitions.push(Transition {
                    target: Target::Person {
                        instance_id: *instance_id,
                        person_id: *person_id,
                        assoc_id: existing.map(|p| p.id),
                    },
                    from: existing.map(|p| p.status),
                    to,
                    role_id: Some(assignment.role_id),
                });
            }

            let parent = match existing {
                Some(p) => Parent::Stored(p.id),
                None => Parent::Pending {
                    instance_id: *instance_id,
                    person_id: *person_id,
                },
            };
            for kind in [ChildKind::Group, ChildKind::Room] {
                reconcile_children(
                    &mut plan,
                    kind,
                    parent,
                    child_list(assignment, kind),
                    base.map(|b| child_list(b, kind)).unwrap_or(&[]),
                    stored,
                );
            }
        }
    }

    for ((instance_id, person_id), p) in &stored.persons {
        if new.get(*instance_id, *person_id).is_some() {
            continue;
        }
        if !p.status.is_removed() {
            plan.transitions.push(Transition {
                target: Target::Person {
                    instance_id: *instance_id,
                    person_id: *person_id,
                    assoc_id: Some(p.id),
                },
                from: Some(p.status),
                to: DeltaStatus::Removed,
                role_id: None,
            });
        }
        for kind in [ChildKind::Group, ChildKind::Room] {
            reconcile_children(&mut plan, kind, Parent::Stored(p.id), &[], &[], stored);
        }
    }

    plan
}

fn reconcile_children(
    plan: &mut ReconcilePlan,
    kind: ChildKind,
    parent: Parent,
    wanted: &[i64],
    baseline: &[i64],
    stored: &ScopeState,
) {
    let rows = stored.children(kind);
    let assoc_id = match parent {
        Parent::Stored(id) => Some(id),
        Parent::Pending { .. } => None,
    };

    for resource_id in wanted {
        let existing = assoc_id.and_then(|a| rows.get(&(a, *resource_id)));
        if let Some(to) = decide(
            true,
            baseline.contains(resource_id),
            existing.map(|c| c.status),
            false,
        ) {
            plan.transitions.push(Transition {
                target: Target::Child {
                    kind,
                    parent,
                    resource_id: *resource_id,
                    row_id: existing.map(|c| c.id),
                },
                from: existing.map(|c| c.status),
                to,
                role_id: None,
            });
        }
    }

    let Some(assoc_id) = assoc_id else {
        return;
    };
    for ((_, resource_id), row) in rows.range((assoc_id, i64::MIN)..=(assoc_id, i64::MAX)) {
        if wanted.contains(resource_id) || row.status.is_removed() {
            continue;
        }
        plan.transitions.push(Transition {
            target: Target::Child {
                kind,
                parent,
                resource_id: *resource_id,
                row_id: Some(row.id),
            },
            from: Some(row.status),
            to: DeltaStatus::Removed,
            role_id: None,
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonKey {
    pub instance_id: i64,
    pub person_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleChange {
    pub instance_id: i64,
    pub person_id: i64,
    pub from_role_id: i64,
    pub to_role_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildKey {
    pub instance_id: i64,
    pub person_id: i64,
    pub resource_id: i64,
}

/// What changed between a reference snapshot and the current one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDiff {
    pub new_instances: Vec<i64>,
    pub removed_instances: Vec<i64>,
    pub new_persons: Vec<PersonKey>,
    pub removed_persons: Vec<PersonKey>,
    pub changed_persons: Vec<RoleChange>,
    pub new_groups: Vec<ChildKey>,
    pub removed_groups: Vec<ChildKey>,
    pub new_rooms: Vec<ChildKey>,
    pub removed_rooms: Vec<ChildKey>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        *self == SnapshotDiff::default()
    }
}

/// Pure comparison of two snapshots; nothing is read from or written to
/// storage. Group/room differences are reported for persons present in both.
pub fn diff_snapshots(reference: &Snapshot, current: &Snapshot) -> SnapshotDiff {
    let mut diff = SnapshotDiff::default();

    for instance_id in current.instances.keys() {
        if !reference.contains_instance(*instance_id) {
            diff.new_instances.push(*instance_id);
        }
    }
    for instance_id in reference.instances.keys() {
        if !current.contains_instance(*instance_id) {
            diff.removed_instances.push(*instance_id);
        }
    }

    for (instance_id, persons) in &current.instances {
        let Some(ref_persons) = reference.instances.get(instance_id) else {
            continue;
        };
        for (person_id, a) in persons {
            let key = PersonKey {
                instance_id: *instance_id,
                person_id: *person_id,
            };
            let Some(r) = ref_persons.get(person_id) else {
                diff.new_persons.push(key);
                continue;
            };
            if r.role_id != a.role_id {
                diff.changed_persons.push(RoleChange {
                    instance_id: *instance_id,
                    person_id: *person_id,
                    from_role_id: r.role_id,
                    to_role_id: a.role_id,
                });
            }
            let child = |resource_id: i64| ChildKey {
                instance_id: *instance_id,
                person_id: *person_id,
                resource_id,
            };
            diff.new_groups
                .extend(a.groups.iter().filter(|g| !r.groups.contains(g)).map(|g| child(*g)));
            diff.removed_groups
                .extend(r.groups.iter().filter(|g| !a.groups.contains(g)).map(|g| child(*g)));
            diff.new_rooms
                .extend(a.rooms.iter().filter(|x| !r.rooms.contains(x)).map(|x| child(*x)));
            diff.removed_rooms
                .extend(r.rooms.iter().filter(|x| !a.rooms.contains(x)).map(|x| child(*x)));
        }
        for person_id in ref_persons.keys() {
            if !persons.contains_key(person_id) {
                diff.removed_persons.push(PersonKey {
                    instance_id: *instance_id,
                    person_id: *person_id,
                });
            }
        }
    }

    diff
}
