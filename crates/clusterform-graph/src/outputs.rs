//! Output values, evaluated against recorded state.

use crate::graph::ResourceGraph;
use clusterform_core::{EachBinding, EvalContext, Resolved, ResourceAddress, StateSnapshot};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OutputValue {
    /// `None` while a referenced instance has no state record.
    pub value: Option<Value>,
    pub sensitive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

struct StateScope<'a> {
    graph: &'a ResourceGraph,
    state: &'a StateSnapshot,
}

impl EvalContext for StateScope<'_> {
    fn variable(&self, name: &str) -> Option<Value> {
        self.graph.variable(name).cloned()
    }

    fn each(&self) -> Option<&EachBinding> {
        None
    }

    fn instance_keys(&self, kind: &str, name: &str) -> Option<Vec<Option<String>>> {
        self.graph.instance_keys(kind, name)
    }

    fn attribute(&self, address: &ResourceAddress, attribute: &str) -> Option<Resolved> {
        let record = self.state.get(address)?;
        Some(Resolved::Known(
            record.outputs.get(attribute).cloned().unwrap_or(Value::Null),
        ))
    }
}

pub fn evaluate_outputs(graph: &ResourceGraph, state: &StateSnapshot) -> BTreeMap<String, OutputValue> {
    let scope = StateScope { graph, state };
    graph
        .outputs()
        .iter()
        .map(|(name, out)| {
            let value = out
                .value
                .evaluate(&scope)
                .ok()
                .and_then(Resolved::into_known);
            (
                name.clone(),
                OutputValue {
                    value,
                    sensitive: out.sensitive,
                    description: out.description.clone(),
                },
            )
        })
        .collect()
}
