//! The resource graph: one node per resource instance, edges for
//! "consumes an attribute of" and explicit `depends_on`.

use clusterform_core::{EachBinding, ReplacePolicy, ResourceAddress, Template};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

#[derive(Clone, Debug)]
pub struct InstanceNode {
    pub address: ResourceAddress,
    /// Iteration element this instance was expanded from.
    pub each: Option<EachBinding>,
    pub attributes: BTreeMap<String, Template>,
    /// Attributes whose value is secret, by schema or by what they reference.
    pub sensitive: BTreeSet<String>,
    pub depends_on: BTreeSet<ResourceAddress>,
    pub replace_policy: ReplacePolicy,
}

#[derive(Clone, Debug)]
pub struct OutputNode {
    pub value: Template,
    pub description: Option<String>,
    pub sensitive: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ResourceGraph {
    pub(crate) nodes: BTreeMap<ResourceAddress, InstanceNode>,
    pub(crate) dependents: BTreeMap<ResourceAddress, BTreeSet<ResourceAddress>>,
    /// Instance keys per `(type, name)`, in key order.
    pub(crate) instances: BTreeMap<(String, String), Vec<Option<String>>>,
    pub(crate) variables: BTreeMap<String, Value>,
    pub(crate) outputs: BTreeMap<String, OutputNode>,
    pub(crate) depth: BTreeMap<ResourceAddress, usize>,
    pub(crate) order: Vec<ResourceAddress>,
}

impl ResourceGraph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, address: &ResourceAddress) -> Option<&InstanceNode> {
        self.nodes.get(address)
    }

    pub fn contains(&self, address: &ResourceAddress) -> bool {
        self.nodes.contains_key(address)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &InstanceNode> {
        self.nodes.values()
    }

    pub fn dependencies(&self, address: &ResourceAddress) -> impl Iterator<Item = &ResourceAddress> {
        self.nodes
            .get(address)
            .into_iter()
            .flat_map(|n| n.depends_on.iter())
    }

    pub fn dependents(&self, address: &ResourceAddress) -> impl Iterator<Item = &ResourceAddress> {
        self.dependents.get(address).into_iter().flatten()
    }

    /// Deterministic topological order: by depth, then by address.
    pub fn order(&self) -> &[ResourceAddress] {
        &self.order
    }

    /// Length of the longest dependency chain below `address`.
    pub fn depth(&self, address: &ResourceAddress) -> usize {
        self.depth.get(address).copied().unwrap_or(0)
    }

    pub fn instance_keys(&self, kind: &str, name: &str) -> Option<Vec<Option<String>>> {
        self.instances
            .get(&(kind.to_string(), name.to_string()))
            .cloned()
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn outputs(&self) -> &BTreeMap<String, OutputNode> {
        &self.outputs
    }

    /// Graphviz rendering for `clusterform graph`.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph clusterform {\n  rankdir = \"BT\";\n");
        for addr in &self.order {
            let _ = writeln!(out, "  {:?} [shape = box];", addr.to_string());
        }
        for node in self.nodes.values() {
            for dep in &node.depends_on {
                let _ = writeln!(out, "  {:?} -> {:?};", node.address.to_string(), dep.to_string());
            }
        }
        out.push_str("}\n");
        out
    }

    pub(crate) fn link(&mut self) {
        self.dependents.clear();
        for node in self.nodes.values() {
            for dep in &node.depends_on {
                self.dependents
                    .entry(dep.clone())
                    .or_default()
                    .insert(node.address.clone());
            }
        }
    }

    /// Find a dependency cycle, returned as the path that closes it.
    pub(crate) fn find_cycle(&self) -> Option<Vec<ResourceAddress>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit(
            graph: &ResourceGraph,
            addr: &ResourceAddress,
            marks: &mut BTreeMap<ResourceAddress, Mark>,
            stack: &mut Vec<ResourceAddress>,
        ) -> Option<Vec<ResourceAddress>> {
            match marks.get(addr) {
                Some(Mark::Done) => return None,
                Some(Mark::Visiting) => {
                    let start = stack.iter().position(|a| a == addr).unwrap_or(0);
                    let mut cycle = stack[start..].to_vec();
                    cycle.push(addr.clone());
                    return Some(cycle);
                }
                None => {}
            }
            marks.insert(addr.clone(), Mark::Visiting);
            stack.push(addr.clone());
            for dep in graph.dependencies(addr) {
                if let Some(cycle) = visit(graph, dep, marks, stack) {
                    return Some(cycle);
                }
            }
            stack.pop();
            marks.insert(addr.clone(), Mark::Done);
            None
        }

        let mut marks = BTreeMap::new();
        let mut stack = Vec::new();
        for addr in self.nodes.keys() {
            if let Some(cycle) = visit(self, addr, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
        None
    }

    /// Compute depths and the topological order. The graph must be acyclic.
    pub(crate) fn sort(&mut self) {
        let mut depth: BTreeMap<ResourceAddress, usize> = BTreeMap::new();
        let mut pending: BTreeMap<&ResourceAddress, usize> = self
            .nodes
            .values()
            .map(|n| (&n.address, n.depends_on.len()))
            .collect();
        let mut ready: Vec<&ResourceAddress> = pending
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(a, _)| *a)
            .collect();

        while let Some(addr) = ready.pop() {
            let d = self
                .dependencies(addr)
                .filter_map(|dep| depth.get(dep))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(addr.clone(), d);
            for child in self.dependents.get(addr).into_iter().flatten() {
                if let Some(n) = pending.get_mut(child) {
                    *n -= 1;
                    if *n == 0 {
                        ready.push(child);
                    }
                }
            }
        }

        let mut order: Vec<ResourceAddress> = depth.keys().cloned().collect();
        order.sort_by(|a, b| {
            depth[a]
                .cmp(&depth[b])
                .then_with(|| a.to_string().cmp(&b.to_string()))
        });
        self.depth = depth;
        self.order = order;
    }
}
