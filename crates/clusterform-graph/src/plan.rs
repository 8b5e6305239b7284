//! Plans: the ordered operation list and its human rendering.

use clusterform_core::value::display;
use clusterform_core::{
    Action, Drift, PlannedAttributes, ReplacePolicy, Resolved, ResourceAddress, StateRecord,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt::Write as _;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanKind {
    Apply,
    Destroy,
}

impl std::fmt::Display for PlanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Apply => write!(f, "apply"),
            Self::Destroy => write!(f, "destroy"),
        }
    }
}

/// One provider mutation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlannedOp {
    /// Position in the plan; `depends_on` refers to these.
    pub id: usize,
    pub address: ResourceAddress,
    pub action: Action,
    /// Set when this create or delete is half of a replacement.
    pub replacement: Option<ReplacePolicy>,
    pub depends_on: Vec<usize>,
    /// Record the operation starts from: the object being updated or deleted.
    pub prior: Option<StateRecord>,
    /// Arguments as known at plan time (create and update only).
    pub planned: PlannedAttributes,
    /// Arguments that differ from the recorded inputs.
    pub changed: Vec<String>,
    /// Arguments whose change forces the replacement.
    pub forcing: Vec<String>,
    pub sensitive: BTreeSet<String>,
    /// Level in the operation graph.
    pub depth: usize,
}

impl PlannedOp {
    pub fn label(&self) -> String {
        match (self.action, self.replacement) {
            (Action::Create, Some(_)) => format!("{} (replace: create)", self.address),
            (Action::Delete, Some(_)) => format!("{} (replace: delete)", self.address),
            (action, _) => format!("{} ({action})", self.address),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub add: usize,
    pub change: usize,
    pub destroy: usize,
}

impl PlanSummary {
    pub fn is_empty(&self) -> bool {
        self.add + self.change + self.destroy == 0
    }
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to add, {} to change, {} to destroy",
            self.add, self.change, self.destroy
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub kind: PlanKind,
    /// In execution order: every operation follows its dependencies.
    pub operations: Vec<PlannedOp>,
    pub unchanged: Vec<ResourceAddress>,
    pub drift: Vec<Drift>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn with_drift(mut self, drift: Vec<Drift>) -> Self {
        self.drift = drift;
        self
    }

    pub fn get(&self, id: usize) -> Option<&PlannedOp> {
        self.operations.get(id)
    }

    pub fn find(&self, address: &ResourceAddress, action: Action) -> Option<&PlannedOp> {
        self.operations
            .iter()
            .find(|op| &op.address == address && op.action == action)
    }

    /// Operations that wait on `id`.
    pub fn dependents(&self, id: usize) -> impl Iterator<Item = &PlannedOp> {
        self.operations
            .iter()
            .filter(move |op| op.depends_on.contains(&id))
    }

    pub fn summary(&self) -> PlanSummary {
        let mut s = PlanSummary::default();
        for op in &self.operations {
            match op.action {
                Action::Create => s.add += 1,
                Action::Update => s.change += 1,
                Action::Delete => s.destroy += 1,
            }
        }
        s
    }

    pub fn render(&self) -> String {
        let mut out = String::new();

        if !self.drift.is_empty() {
            out.push_str("Note: objects have changed outside of clusterform\n\n");
            for d in &self.drift {
                let _ = writeln!(out, "  ~ {d}");
            }
            out.push('\n');
        }

        if self.operations.is_empty() {
            out.push_str("No changes. Infrastructure matches the configuration.\n");
            return out;
        }

        out.push_str("clusterform will perform the following actions:\n\n");
        for op in &self.operations {
            render_op(&mut out, op);
            out.push('\n');
        }
        let _ = writeln!(out, "Plan: {}.", self.summary());
        out
    }
}

fn render_value(value: &Resolved, sensitive: bool) -> String {
    match value {
        _ if sensitive => "(sensitive)".to_string(),
        Resolved::Unknown => "(known after apply)".to_string(),
        Resolved::Known(v) => display(v),
    }
}

fn render_op(out: &mut String, op: &PlannedOp) {
    let width = op.planned.keys().map(String::len).max().unwrap_or(0);
    match (op.action, op.replacement) {
        (Action::Create, replacement) => {
            match replacement {
                Some(policy) => {
                    let _ = writeln!(out, "  # {} must be replaced ({policy})", op.address);
                }
                None => {
                    let _ = writeln!(out, "  # {} will be created", op.address);
                }
            }
            let _ = writeln!(out, "  + {}", op.address);
            for (name, value) in &op.planned {
                if value.known() == Some(&Value::Null) {
                    continue;
                }
                let note = if op.forcing.contains(name) {
                    " # forces replacement"
                } else {
                    ""
                };
                let _ = writeln!(
                    out,
                    "      + {name:<width$} = {}{note}",
                    render_value(value, op.sensitive.contains(name))
                );
            }
        }
        (Action::Update, _) => {
            let _ = writeln!(out, "  # {} will be updated in-place", op.address);
            let _ = writeln!(out, "  ~ {}", op.address);
            for name in &op.changed {
                let secret = op.sensitive.contains(name);
                let old = op
                    .prior
                    .as_ref()
                    .and_then(|r| r.inputs.get(name))
                    .cloned()
                    .unwrap_or(Value::Null);
                let new = op.planned.get(name).cloned().unwrap_or_else(Resolved::null);
                let _ = writeln!(
                    out,
                    "      ~ {name:<width$} = {} -> {}",
                    render_value(&Resolved::Known(old), secret),
                    render_value(&new, secret)
                );
            }
        }
        (Action::Delete, Some(_)) => {
            let _ = writeln!(out, "  # {} (old object) will be destroyed", op.address);
            let _ = writeln!(out, "  - {}", op.address);
        }
        (Action::Delete, None) => {
            let _ = writeln!(out, "  # {} will be destroyed", op.address);
            let _ = writeln!(out, "  - {}", op.address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn op(id: usize, action: Action) -> PlannedOp {
        PlannedOp {
            id,
            address: ResourceAddress::keyed("cluster", "main", "ams3"),
            action,
            replacement: None,
            depends_on: vec![],
            prior: None,
            planned: PlannedAttributes::new(),
            changed: vec![],
            forcing: vec![],
            sensitive: BTreeSet::new(),
            depth: 0,
        }
    }

    #[test]
    fn summary_counts() {
        let plan = Plan {
            kind: PlanKind::Apply,
            operations: vec![op(0, Action::Create), op(1, Action::Delete), op(2, Action::Update)],
            unchanged: vec![],
            drift: vec![],
        };
        assert_eq!(plan.summary().to_string(), "1 to add, 1 to change, 1 to destroy");
    }

    #[test]
    fn render_masks_sensitive_and_unknown() {
        let mut create = op(0, Action::Create);
        create.planned.insert("region".into(), Resolved::Known(json!("ams3")));
        create.planned.insert("token".into(), Resolved::Known(json!("secret")));
        create.planned.insert("host".into(), Resolved::Unknown);
        create.sensitive.insert("token".into());
        let plan = Plan {
            kind: PlanKind::Apply,
            operations: vec![create],
            unchanged: vec![],
            drift: vec![],
        };
        let text = plan.render();
        assert!(text.contains("(sensitive)"));
        assert!(!text.contains("secret"));
        assert!(text.contains("(known after apply)"));
        assert!(text.contains(r#""ams3""#));
        assert!(text.contains("Plan: 1 to add, 0 to change, 0 to destroy."));
    }

    #[test]
    fn empty_plan_renders_no_changes() {
        let plan = Plan {
            kind: PlanKind::Apply,
            operations: vec![],
            unchanged: vec![],
            drift: vec![],
        };
        assert!(plan.render().starts_with("No changes."));
        assert!(plan.summary().is_empty());
    }
}
