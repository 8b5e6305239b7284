//! Graph and planner tests against the platform's resource types.

use clusterform_core::{
    Action, Attributes, Document, Error, ResourceAddress, StateRecord, StateSnapshot,
};
use clusterform_graph::{GraphBuilder, PlanKind, Planner, ResourceGraph};
use clusterform_provider::cloud_schemas;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};

const DOKS: &str = include_str!("../../../demos/doks.yaml");

const PAIR: &str = r#"
resources:
  - type: cluster
    name: main
    for_each: {ams3: ams3, nyc1: nyc1}
    attributes:
      name: "k8s-${each.key}"
      region: "${each.value}"
      version: "1.29"
  - type: node_pool
    name: workers
    for_each: {ams3: ams3, nyc1: nyc1}
    attributes:
      cluster_id: "${cluster.main[each.key].id}"
      name: "workers-${each.key}"
      size: s-2vcpu-4gb
      node_count: 2
"#;

fn build(yaml: &str) -> Result<ResourceGraph, Error> {
    let doc = Document::from_yaml(yaml)?;
    GraphBuilder::new(&cloud_schemas()).build(&doc, &BTreeMap::new())
}

fn attrs(pairs: &[(&str, Value)]) -> Attributes {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// State as it would look after applying `PAIR`.
fn pair_state() -> StateSnapshot {
    let mut snap = StateSnapshot::new();
    for key in ["ams3", "nyc1"] {
        let cluster = ResourceAddress::keyed("cluster", "main", key);
        let inputs = attrs(&[
            ("name", json!(format!("k8s-{key}"))),
            ("region", json!(key)),
            ("version", json!("1.29")),
        ]);
        let mut outputs = inputs.clone();
        outputs.insert("id".into(), json!(format!("c-{key}")));
        snap.insert(StateRecord::new(
            cluster.clone(),
            format!("c-{key}"),
            inputs,
            outputs,
            vec![],
        ));

        let inputs = attrs(&[
            ("cluster_id", json!(format!("c-{key}"))),
            ("name", json!(format!("workers-{key}"))),
            ("size", json!("s-2vcpu-4gb")),
            ("node_count", json!(2)),
        ]);
        snap.insert(StateRecord::new(
            ResourceAddress::keyed("node_pool", "workers", key),
            format!("np-{key}"),
            inputs.clone(),
            inputs,
            vec![cluster],
        ));
    }
    snap
}

// ---------------------------------------------------------------------------
// Graph builder
// ---------------------------------------------------------------------------

#[test]
fn demo_configuration_builds() {
    let graph = build(DOKS).unwrap();
    assert_eq!(graph.len(), 7);
    let ns = ResourceAddress::keyed("namespace", "app", "ams3");
    let deps: Vec<String> = graph.dependencies(&ns).map(ToString::to_string).collect();
    assert_eq!(deps, vec![r#"cluster.main["ams3"]"#]);

    let project = ResourceAddress::new("project_resources", "platform");
    assert_eq!(graph.dependencies(&project).count(), 2);
}

#[test]
fn topological_order_puts_dependencies_first() {
    let graph = build(DOKS).unwrap();
    let position: BTreeMap<&ResourceAddress, usize> = graph
        .order()
        .iter()
        .enumerate()
        .map(|(i, a)| (a, i))
        .collect();
    for addr in graph.order() {
        for dep in graph.dependencies(addr) {
            assert!(position[dep] < position[addr], "{dep} must precede {addr}");
        }
    }
    assert_eq!(graph.order()[0].to_string(), r#"cluster.main["ams3"]"#);
}

#[test]
fn regions_form_independent_subgraphs() {
    let graph = build(PAIR).unwrap();

    // Union-find over dependency edges.
    let addrs: Vec<&ResourceAddress> = graph.order().iter().collect();
    let mut parent: Vec<usize> = (0..addrs.len()).collect();
    fn root(parent: &mut [usize], i: usize) -> usize {
        let mut i = i;
        while parent[i] != i {
            i = parent[i];
        }
        i
    }
    for (i, addr) in addrs.iter().enumerate() {
        for dep in graph.dependencies(addr) {
            let j = addrs.iter().position(|a| *a == dep).unwrap();
            let (ri, rj) = (root(&mut parent, i), root(&mut parent, j));
            parent[ri] = rj;
        }
    }
    let mut components: BTreeMap<usize, BTreeSet<String>> = BTreeMap::new();
    for (i, addr) in addrs.iter().enumerate() {
        let r = root(&mut parent, i);
        components
            .entry(r)
            .or_default()
            .insert(addr.key.clone().unwrap_or_default());
    }
    assert_eq!(components.len(), 2);
    for keys in components.values() {
        assert_eq!(keys.len(), 1, "a component spans regions: {keys:?}");
    }
}

#[test]
fn demo_has_no_cross_region_edges() {
    let graph = build(DOKS).unwrap();
    for node in graph.nodes() {
        let Some(key) = &node.address.key else {
            continue;
        };
        for dep in &node.depends_on {
            if let Some(dep_key) = &dep.key {
                assert_eq!(dep_key, key, "{} depends on {dep}", node.address);
            }
        }
    }
}

#[test]
fn two_resource_cycle_is_rejected() {
    let err = build(
        r#"
resources:
  - type: cluster
    name: a
    depends_on: ["node_pool.b"]
    attributes: {name: a, region: ams3, version: "1.29"}
  - type: node_pool
    name: b
    attributes: {cluster_id: "${cluster.a.id}", name: b, size: s, node_count: 1}
"#,
    )
    .unwrap_err();
    match err {
        Error::CyclicDependency { cycle } => {
            assert!(cycle.contains(&"cluster.a".to_string()));
            assert!(cycle.contains(&"node_pool.b".to_string()));
            assert_eq!(cycle.first(), cycle.last());
        }
        other => panic!("expected a cycle, got {other}"),
    }
}

#[test]
fn unresolved_references_name_the_instance() {
    let missing = build(
        r#"
resources:
  - type: node_pool
    name: b
    attributes: {cluster_id: "${cluster.nope.id}", name: b, size: s, node_count: 1}
"#,
    )
    .unwrap_err();
    assert!(
        matches!(&missing, Error::UnresolvedReference { resource, .. } if resource == "node_pool.b"),
        "{missing}"
    );

    let bad_key = build(&PAIR.replace("cluster.main[each.key].id", r#"cluster.main[\"fra1\"].id"#))
        .unwrap_err();
    assert!(matches!(bad_key, Error::UnresolvedReference { .. }), "{bad_key}");

    let bad_attr = build(&PAIR.replace("[each.key].id", "[each.key].ip")).unwrap_err();
    assert!(matches!(bad_attr, Error::UnresolvedReference { .. }), "{bad_attr}");

    let bad_var = build(&PAIR.replace("version: \"1.29\"", "version: \"${var.version}\""))
        .unwrap_err();
    assert!(matches!(bad_var, Error::UnresolvedReference { .. }), "{bad_var}");
}

#[test]
fn unknown_type_and_missing_required() {
    let err = build("resources:\n  - {type: droplet, name: web, attributes: {}}\n").unwrap_err();
    assert!(matches!(err, Error::UnknownResourceType { .. }));

    let err = build("resources:\n  - {type: cluster, name: c, attributes: {name: c}}\n").unwrap_err();
    assert!(matches!(err, Error::InvalidDeclaration { .. }));
}

#[test]
fn duplicate_declaration_conflicts() {
    let doc = format!("{PAIR}  - type: cluster\n    name: main\n    attributes: {{}}\n");
    assert!(matches!(build(&doc).unwrap_err(), Error::PlanConflict { .. }));
}

#[test]
fn dot_rendering_lists_edges() {
    let dot = build(PAIR).unwrap().to_dot();
    assert!(dot.starts_with("digraph clusterform {"));
    assert!(dot.contains(r#""node_pool.workers[\"ams3\"]" -> "cluster.main[\"ams3\"]";"#));
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

#[test]
fn fresh_plan_orders_every_dependency_first() {
    let graph = build(DOKS).unwrap();
    let schemas = cloud_schemas();
    let plan = Planner::new(&schemas)
        .plan(&graph, &StateSnapshot::new())
        .unwrap();
    assert_eq!(plan.summary().add, 7);
    for op in &plan.operations {
        for dep in &op.depends_on {
            assert!(*dep < op.id);
        }
    }
    // Ties at the same depth are ordered by address.
    let first: Vec<String> = plan
        .operations
        .iter()
        .take(2)
        .map(|op| op.address.to_string())
        .collect();
    assert_eq!(first, vec![r#"cluster.main["ams3"]"#, r#"cluster.main["nyc1"]"#]);

    let ns = plan
        .find(&ResourceAddress::keyed("namespace", "app", "ams3"), Action::Create)
        .unwrap();
    assert!(ns.sensitive.contains("token"));
    assert!(plan.render().contains("(known after apply)"));
}

#[test]
fn applied_state_plans_nothing() {
    let graph = build(PAIR).unwrap();
    let schemas = cloud_schemas();
    let plan = Planner::new(&schemas).plan(&graph, &pair_state()).unwrap();
    assert!(plan.is_empty(), "{}", plan.render());
    assert_eq!(plan.unchanged.len(), 4);
}

#[test]
fn force_new_change_replaces_once_before_dependents() {
    let doc = PAIR.replacen("{ams3: ams3, nyc1: nyc1}", "{ams3: fra1, nyc1: nyc1}", 1);
    let graph = build(&doc).unwrap();
    let schemas = cloud_schemas();
    let plan = Planner::new(&schemas).plan(&graph, &pair_state()).unwrap();

    let cluster = ResourceAddress::keyed("cluster", "main", "ams3");
    let ops: Vec<_> = plan
        .operations
        .iter()
        .filter(|op| op.address == cluster)
        .collect();
    assert_eq!(ops.len(), 2);
    let create = plan.find(&cluster, Action::Create).unwrap();
    let delete = plan.find(&cluster, Action::Delete).unwrap();
    assert_eq!(create.forcing, vec!["region"]);

    for op in &plan.operations {
        if op.address.kind == "node_pool" && op.action != Action::Delete {
            assert!(create.id < op.id);
            assert!(op.depends_on.contains(&create.id));
        }
    }
    // Create-before-destroy: the old cluster goes last.
    assert_eq!(delete.id, plan.operations.len() - 1);
    assert!(plan
        .operations
        .iter()
        .all(|op| op.address.key.as_deref() == Some("ams3")));
    assert_eq!(plan.summary().to_string(), "2 to add, 0 to change, 2 to destroy");
}

#[test]
fn in_place_change_is_update() {
    let doc = PAIR.replace("node_count: 2", "node_count: 3");
    let graph = build(&doc).unwrap();
    let schemas = cloud_schemas();
    let plan = Planner::new(&schemas).plan(&graph, &pair_state()).unwrap();
    assert_eq!(plan.summary().change, 2);
    assert!(plan.operations.iter().all(|op| op.action == Action::Update));
    assert!(plan.render().contains("~ node_count = 2 -> 3"));
}

#[test]
fn destroy_plan_deletes_dependents_first() {
    let schemas = cloud_schemas();
    let plan = Planner::new(&schemas).plan_destroy(&pair_state()).unwrap();
    assert_eq!(plan.kind, PlanKind::Destroy);
    assert_eq!(plan.summary().destroy, 4);
    let first_cluster = plan
        .operations
        .iter()
        .position(|op| op.address.kind == "cluster")
        .unwrap();
    let last_pool = plan
        .operations
        .iter()
        .rposition(|op| op.address.kind == "node_pool")
        .unwrap();
    assert!(last_pool < first_cluster);
}

/// The demo as applied with both regions, reduced to what the region
/// removal touches.
fn demo_state() -> StateSnapshot {
    let mut snap = StateSnapshot::new();
    let mut urns = Vec::new();
    for key in ["ams3", "nyc1"] {
        let cluster = ResourceAddress::keyed("cluster", "main", key);
        let inputs = attrs(&[
            ("name", json!(format!("k8s-{key}"))),
            ("region", json!(key)),
            ("version", json!("1.29")),
            ("tags", json!(["clusterform", key])),
        ]);
        let mut outputs = inputs.clone();
        outputs.insert("id".into(), json!(format!("c-{key}")));
        outputs.insert("urn".into(), json!(format!("do:kubernetes:c-{key}")));
        urns.push(json!(format!("do:kubernetes:c-{key}")));
        snap.insert(StateRecord::new(
            cluster.clone(),
            format!("c-{key}"),
            inputs,
            outputs,
            vec![],
        ));
    }

    let nyc = ResourceAddress::keyed("cluster", "main", "nyc1");
    for (kind, name) in [("node_pool", "workers"), ("namespace", "app")] {
        snap.insert(StateRecord::new(
            ResourceAddress::keyed(kind, name, "nyc1"),
            format!("{kind}-nyc1"),
            Attributes::new(),
            Attributes::new(),
            vec![nyc.clone()],
        ));
    }

    let inputs = attrs(&[("project", json!("platform")), ("resources", json!(urns))]);
    snap.insert(StateRecord::new(
        ResourceAddress::new("project_resources", "platform"),
        "pr-1",
        inputs.clone(),
        inputs,
        vec![ResourceAddress::keyed("cluster", "main", "ams3"), nyc],
    ));
    snap
}

#[test]
fn removed_region_is_deleted_after_dependents_stop_referencing_it() {
    let doc = Document::from_yaml(DOKS).unwrap();
    let vars = BTreeMap::from([("regions".to_string(), json!(["ams3"]))]);
    let graph = GraphBuilder::new(&cloud_schemas()).build(&doc, &vars).unwrap();
    let schemas = cloud_schemas();
    let plan = Planner::new(&schemas).plan(&graph, &demo_state()).unwrap();

    let project = ResourceAddress::new("project_resources", "platform");
    let attachment = plan.find(&project, Action::Update).unwrap();
    assert_eq!(attachment.changed, vec!["resources"]);

    let delete = plan
        .find(&ResourceAddress::keyed("cluster", "main", "nyc1"), Action::Delete)
        .unwrap();
    assert!(
        delete.depends_on.contains(&attachment.id),
        "{}",
        plan.render()
    );
    assert!(attachment.id < delete.id);
    for kind in ["node_pool", "namespace"] {
        let gone = plan
            .operations
            .iter()
            .find(|op| op.address.kind == kind && op.action == Action::Delete)
            .unwrap();
        assert!(delete.depends_on.contains(&gone.id));
    }
    for op in &plan.operations {
        for dep in &op.depends_on {
            assert!(*dep < op.id);
        }
    }
}
