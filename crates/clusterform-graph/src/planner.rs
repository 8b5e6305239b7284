//! Planner
//!
//! Diffs the resource graph against a state snapshot and orders the
//! resulting operations.
//!
//! Ordering rules, as edges of the operation graph:
//!
//! - create/update of an instance runs after the create/update of every
//!   instance it depends on;
//! - a delete runs after the delete of every recorded dependent;
//! - destroy-before-create: the old object is deleted before its
//!   replacement is created;
//! - create-before-destroy: the replacement is created, dependents are
//!   moved onto it, and only then is the old object deleted.
//!
//! Operations are then levelled and, within a level, sorted by address.

use crate::graph::ResourceGraph;
use crate::plan::{Plan, PlanKind, PlannedOp};
use clusterform_core::{
    Action, EachBinding, Error, EvalContext, PlannedAttributes, ReplacePolicy, Resolved,
    ResourceAddress, Result, SchemaSet, StateRecord, StateSnapshot,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Change {
    NoOp,
    Create,
    Update,
    Replace,
}

struct Diff {
    change: Change,
    planned: PlannedAttributes,
    changed: Vec<String>,
    forcing: Vec<String>,
}

/// Planned values of instances evaluated so far, in topological order.
struct PlanScope<'a> {
    graph: &'a ResourceGraph,
    state: &'a StateSnapshot,
    schemas: &'a SchemaSet,
    diffs: &'a BTreeMap<ResourceAddress, Diff>,
    each: Option<&'a EachBinding>,
}

impl EvalContext for PlanScope<'_> {
    fn variable(&self, name: &str) -> Option<Value> {
        self.graph.variable(name).cloned()
    }

    fn each(&self) -> Option<&EachBinding> {
        self.each
    }

    fn instance_keys(&self, kind: &str, name: &str) -> Option<Vec<Option<String>>> {
        self.graph.instance_keys(kind, name)
    }

    fn attribute(&self, address: &ResourceAddress, attribute: &str) -> Option<Resolved> {
        let diff = self.diffs.get(address)?;
        let schema = self.schemas.get(&address.kind)?;
        let attr = schema.get(attribute)?;
        if attr.is_argument() {
            if let Some(v) = diff.planned.get(attribute) {
                return Some(v.clone());
            }
        }
        match diff.change {
            Change::Create | Change::Replace => Some(Resolved::Unknown),
            Change::NoOp | Change::Update => Some(
                self.state
                    .get(address)
                    .and_then(|r| r.outputs.get(attribute))
                    .cloned()
                    .map(Resolved::Known)
                    .unwrap_or_else(Resolved::null),
            ),
        }
    }
}

pub struct Planner<'a> {
    schemas: &'a SchemaSet,
}

/// An operation before ids are assigned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct OpKey<'a> {
    address: &'a ResourceAddress,
    action: Action,
}

impl<'a> Planner<'a> {
    pub fn new(schemas: &'a SchemaSet) -> Self {
        Self { schemas }
    }

    pub fn plan(&self, graph: &ResourceGraph, state: &StateSnapshot) -> Result<Plan> {
        let mut diffs: BTreeMap<ResourceAddress, Diff> = BTreeMap::new();
        for address in graph.order() {
            let diff = self.diff(graph, state, &diffs, address)?;
            diffs.insert(address.clone(), diff);
        }

        // A create-before-destroy replacement forces the same policy on the
        // replaced instances it depends on; otherwise its old object would
        // have to outlive a dependency that is already gone.
        let mut policy: BTreeMap<&ResourceAddress, ReplacePolicy> = BTreeMap::new();
        for address in graph.order().iter().rev() {
            if diffs[address].change != Change::Replace {
                continue;
            }
            let own = graph
                .node(address)
                .map(|n| n.replace_policy)
                .unwrap_or(ReplacePolicy::DestroyBeforeCreate);
            let p = *policy.entry(address).or_insert(own);
            if p == ReplacePolicy::CreateBeforeDestroy {
                for dep in graph.dependencies(address) {
                    if diffs.get(dep).map(|d| d.change) == Some(Change::Replace) {
                        policy.insert(dep, ReplacePolicy::CreateBeforeDestroy);
                    }
                }
            }
        }

        let orphans: Vec<&StateRecord> = state
            .records()
            .filter(|r| !graph.contains(&r.address))
            .collect();

        let mut ops: BTreeSet<OpKey> = BTreeSet::new();
        for (address, diff) in &diffs {
            match diff.change {
                Change::NoOp => {}
                Change::Create => {
                    ops.insert(OpKey { address, action: Action::Create });
                }
                Change::Update => {
                    ops.insert(OpKey { address, action: Action::Update });
                }
                Change::Replace => {
                    ops.insert(OpKey { address, action: Action::Create });
                    ops.insert(OpKey { address, action: Action::Delete });
                }
            }
        }
        for r in &orphans {
            ops.insert(OpKey {
                address: &r.address,
                action: Action::Delete,
            });
        }

        let mut edges: BTreeMap<OpKey, BTreeSet<OpKey>> = BTreeMap::new();
        for address in diffs.keys() {
            let Some(this) = apply_op(&ops, address) else {
                continue;
            };
            for dep in graph.dependencies(address) {
                if let Some(up) = apply_op(&ops, dep) {
                    add_edge(&ops, &mut edges, up, this);
                }
            }
        }

        for key in &ops {
            if key.action != Action::Delete {
                continue;
            }
            let address = key.address;
            // Recorded dependents go first.
            for dependent in state.dependents_of(address) {
                add_edge(
                    &ops,
                    &mut edges,
                    OpKey {
                        address: dependent,
                        action: Action::Delete,
                    },
                    *key,
                );
            }
            if diffs.get(address).map(|d| d.change) != Some(Change::Replace) {
                continue;
            }
            let create = OpKey {
                address,
                action: Action::Create,
            };
            match policy.get(address) {
                Some(ReplacePolicy::CreateBeforeDestroy) => {
                    add_edge(&ops, &mut edges, create, *key);
                    for dependent in graph.dependents(address) {
                        if let Some(moved) = apply_op(&ops, dependent) {
                            add_edge(&ops, &mut edges, moved, *key);
                        }
                    }
                }
                _ => add_edge(&ops, &mut edges, *key, create),
            }
        }

        // A dependent that stays declared has to stop referencing the object
        // before it is deleted. Skipped when the dependent's change already
        // waits on the delete (a destroy-before-create replacement).
        for key in &ops {
            if key.action != Action::Delete {
                continue;
            }
            for dependent in state.dependents_of(key.address) {
                let Some(moved) = apply_op(&ops, dependent) else {
                    continue;
                };
                if !waits_on(&edges, moved, *key) {
                    add_edge(&ops, &mut edges, moved, *key);
                }
            }
        }

        let ordered = level(&ops, &edges)?;
        let ids: BTreeMap<OpKey, usize> = ordered
            .iter()
            .enumerate()
            .map(|(i, (k, _))| (*k, i))
            .collect();

        let mut operations = Vec::with_capacity(ordered.len());
        for (id, (key, depth)) in ordered.iter().enumerate() {
            let mut depends_on: Vec<usize> = edges
                .get(key)
                .into_iter()
                .flatten()
                .filter_map(|k| ids.get(k).copied())
                .collect();
            depends_on.sort_unstable();

            let diff = diffs.get(key.address);
            let replacement = match diff.map(|d| d.change) {
                Some(Change::Replace) => Some(
                    policy
                        .get(key.address)
                        .copied()
                        .unwrap_or(ReplacePolicy::DestroyBeforeCreate),
                ),
                _ => None,
            };
            let (planned, changed, forcing) = match (key.action, diff) {
                (Action::Delete, _) | (_, None) => Default::default(),
                (_, Some(d)) => (d.planned.clone(), d.changed.clone(), d.forcing.clone()),
            };
            let sensitive = graph
                .node(key.address)
                .map(|n| n.sensitive.clone())
                .unwrap_or_default();

            operations.push(PlannedOp {
                id,
                address: key.address.clone(),
                action: key.action,
                replacement,
                depends_on,
                prior: match key.action {
                    Action::Create => None,
                    _ => state.get(key.address).cloned(),
                },
                planned,
                changed,
                forcing,
                sensitive,
                depth: *depth,
            });
        }

        let unchanged: Vec<ResourceAddress> = diffs
            .iter()
            .filter(|(_, d)| d.change == Change::NoOp)
            .map(|(a, _)| a.clone())
            .collect();

        debug!(
            operations = operations.len(),
            unchanged = unchanged.len(),
            orphans = orphans.len(),
            "plan computed"
        );
        Ok(Plan {
            kind: PlanKind::Apply,
            operations,
            unchanged,
            drift: Vec::new(),
        })
    }

    /// Delete everything recorded, dependents first.
    pub fn plan_destroy(&self, state: &StateSnapshot) -> Result<Plan> {
        let ops: BTreeSet<OpKey> = state
            .addresses()
            .map(|address| OpKey {
                address,
                action: Action::Delete,
            })
            .collect();
        let mut edges: BTreeMap<OpKey, BTreeSet<OpKey>> = BTreeMap::new();
        for key in &ops {
            for dependent in state.dependents_of(key.address) {
                let before = OpKey {
                    address: dependent,
                    action: Action::Delete,
                };
                if ops.contains(&before) {
                    edges.entry(*key).or_default().insert(before);
                }
            }
        }

        let ordered = level(&ops, &edges)?;
        let ids: BTreeMap<OpKey, usize> = ordered
            .iter()
            .enumerate()
            .map(|(i, (k, _))| (*k, i))
            .collect();
        let operations = ordered
            .iter()
            .enumerate()
            .map(|(id, (key, depth))| {
                let mut depends_on: Vec<usize> = edges
                    .get(key)
                    .into_iter()
                    .flatten()
                    .filter_map(|k| ids.get(k).copied())
                    .collect();
                depends_on.sort_unstable();
                PlannedOp {
                    id,
                    address: key.address.clone(),
                    action: Action::Delete,
                    replacement: None,
                    depends_on,
                    prior: state.get(key.address).cloned(),
                    planned: PlannedAttributes::new(),
                    changed: Vec::new(),
                    forcing: Vec::new(),
                    sensitive: BTreeSet::new(),
                    depth: *depth,
                }
            })
            .collect();

        Ok(Plan {
            kind: PlanKind::Destroy,
            operations,
            unchanged: Vec::new(),
            drift: Vec::new(),
        })
    }

    fn diff(
        &self,
        graph: &ResourceGraph,
        state: &StateSnapshot,
        diffs: &BTreeMap<ResourceAddress, Diff>,
        address: &ResourceAddress,
    ) -> Result<Diff> {
        let node = graph
            .node(address)
            .ok_or_else(|| Error::Internal(format!("{address} missing from graph")))?;
        let schema = self
            .schemas
            .get(&address.kind)
            .ok_or_else(|| Error::UnknownResourceType {
                resource: address.to_string(),
                kind: address.kind.clone(),
            })?;
        let scope = PlanScope {
            graph,
            state,
            schemas: self.schemas,
            diffs,
            each: node.each.as_ref(),
        };

        let mut planned = PlannedAttributes::new();
        for (name, template) in &node.attributes {
            let value = template
                .evaluate(&scope)
                .map_err(|e| Error::invalid(address.to_string(), e.to_string()))?;
            planned.insert(name.clone(), value);
        }

        let Some(record) = state.get(address) else {
            return Ok(Diff {
                change: Change::Create,
                planned,
                changed: Vec::new(),
                forcing: Vec::new(),
            });
        };

        let mut changed = Vec::new();
        let mut forcing = Vec::new();
        for (name, _) in schema.arguments() {
            let want = planned.get(name).cloned().unwrap_or_else(Resolved::null);
            let have = record.inputs.get(name).cloned().unwrap_or(Value::Null);
            let differs = match want {
                Resolved::Unknown => true,
                Resolved::Known(v) => v != have,
            };
            if differs {
                changed.push(name.clone());
                if schema.is_force_new(name) {
                    forcing.push(name.clone());
                }
            }
        }

        let change = if changed.is_empty() {
            Change::NoOp
        } else if !forcing.is_empty() {
            Change::Replace
        } else {
            Change::Update
        };
        Ok(Diff {
            change,
            planned,
            changed,
            forcing,
        })
    }
}

/// Record that `after` waits on `before`, when both are planned.
fn add_edge<'a>(
    ops: &BTreeSet<OpKey<'a>>,
    edges: &mut BTreeMap<OpKey<'a>, BTreeSet<OpKey<'a>>>,
    before: OpKey<'a>,
    after: OpKey<'a>,
) {
    if ops.contains(&before) && ops.contains(&after) {
        edges.entry(after).or_default().insert(before);
    }
}

/// Whether `op` transitively waits on `target`.
fn waits_on<'a>(
    edges: &BTreeMap<OpKey<'a>, BTreeSet<OpKey<'a>>>,
    op: OpKey<'a>,
    target: OpKey<'a>,
) -> bool {
    let mut seen = BTreeSet::new();
    let mut stack = vec![op];
    while let Some(k) = stack.pop() {
        if k == target {
            return true;
        }
        if seen.insert(k) {
            stack.extend(edges.get(&k).into_iter().flatten().copied());
        }
    }
    false
}

/// The create or update scheduled for `address`, if any.
fn apply_op<'a>(ops: &BTreeSet<OpKey<'a>>, address: &'a ResourceAddress) -> Option<OpKey<'a>> {
    [Action::Create, Action::Update]
        .into_iter()
        .map(|action| OpKey { address, action })
        .find(|k| ops.contains(k))
}

/// Longest-path levels over the operation graph, sorted by
/// `(level, address, action)`. `edges` maps an operation to the operations
/// it waits on.
fn level<'a>(
    ops: &BTreeSet<OpKey<'a>>,
    edges: &BTreeMap<OpKey<'a>, BTreeSet<OpKey<'a>>>,
) -> Result<Vec<(OpKey<'a>, usize)>> {
    let mut waiting: BTreeMap<OpKey, usize> = ops
        .iter()
        .map(|k| (*k, edges.get(k).map(BTreeSet::len).unwrap_or(0)))
        .collect();
    let mut after: BTreeMap<OpKey, Vec<OpKey>> = BTreeMap::new();
    for (k, befores) in edges {
        for b in befores {
            after.entry(*b).or_default().push(*k);
        }
    }

    let mut depth: BTreeMap<OpKey, usize> = BTreeMap::new();
    let mut ready: Vec<OpKey> = waiting
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(k, _)| *k)
        .collect();
    while let Some(k) = ready.pop() {
        let d = edges
            .get(&k)
            .into_iter()
            .flatten()
            .filter_map(|b| depth.get(b))
            .map(|d| d + 1)
            .max()
            .unwrap_or(0);
        depth.insert(k, d);
        for next in after.get(&k).into_iter().flatten() {
            if let Some(n) = waiting.get_mut(next) {
                *n -= 1;
                if *n == 0 {
                    ready.push(*next);
                }
            }
        }
    }

    if depth.len() != ops.len() {
        let stuck: Vec<String> = ops
            .iter()
            .filter(|k| !depth.contains_key(*k))
            .map(|k| format!("{} ({})", k.address, k.action))
            .collect();
        return Err(Error::CyclicDependency { cycle: stuck });
    }

    let mut ordered: Vec<(OpKey, usize)> = depth.into_iter().collect();
    ordered.sort_by(|(a, da), (b, db)| {
        da.cmp(db)
            .then_with(|| a.address.to_string().cmp(&b.address.to_string()))
            .then_with(|| a.action.cmp(&b.action))
    });
    Ok(ordered)
}
