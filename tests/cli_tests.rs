//! End-to-end command tests against a simulated cloud persisted in a
//! temporary directory.

use clusterform::{commands, ClusterformConfig, Session};
use clusterform_executor::RetryConfig;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

fn demo() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/doks.yaml")
}

fn config(dir: &Path) -> ClusterformConfig {
    let mut config = ClusterformConfig::default();
    config.state.dir = dir.join("state");
    config.executor.runs_dir = Some(dir.join("runs"));
    config.provider.world = Some(dir.join("cloud.json"));
    config.retry = RetryConfig::fast(3);
    config
}

async fn session(dir: &Path, vars: &[&str]) -> Session {
    let vars: Vec<String> = vars.iter().map(|v| v.to_string()).collect();
    Session::open(config(dir), &vars).await.unwrap()
}

async fn apply(session: &Session) -> (i32, String) {
    let mut out = Vec::new();
    let code = commands::apply(session, &demo(), CancellationToken::new(), &mut out)
        .await
        .unwrap();
    (code, String::from_utf8(out).unwrap())
}

// ---------------------------------------------------------------------------
// plan / apply
// ---------------------------------------------------------------------------

#[tokio::test]
async fn apply_then_plan_reports_no_changes() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let s = session(tmp.path(), &[]).await;
        let (code, text) = apply(&s).await;
        assert_eq!(code, 0, "{text}");
        assert!(text.contains("Plan: 7 to add, 0 to change, 0 to destroy."));
        assert!(text.contains("Apply complete! Resources: 7 added, 0 changed, 0 destroyed."));
        assert!(text.contains("ams3_kube_config = (sensitive)"));
        assert!(!text.contains("sim-"), "token leaked into output");
    }

    // A fresh process sees the persisted cloud and state.
    let s = session(tmp.path(), &[]).await;
    let mut out = Vec::new();
    let code = commands::plan(&s, &demo(), true, &mut out).await.unwrap();
    let text = String::from_utf8(out).unwrap();
    assert_eq!(code, 0, "{text}");
    assert!(text.starts_with("No changes."));
    assert_eq!(s.cloud.mutation_count().await, 0);

    let (code, text) = apply(&s).await;
    assert_eq!(code, 0);
    assert!(text.contains("No changes."));
    assert_eq!(s.cloud.mutation_count().await, 0);
}

#[tokio::test]
async fn variable_override_is_planned_without_mutation() {
    let tmp = tempfile::tempdir().unwrap();
    assert_eq!(apply(&session(tmp.path(), &[]).await).await.0, 0);

    let s = session(tmp.path(), &["node_count=3"]).await;
    let before = s.store.snapshot();
    let mut out = Vec::new();
    let code = commands::plan(&s, &demo(), true, &mut out).await.unwrap();
    let text = String::from_utf8(out).unwrap();
    assert_eq!(code, 2);
    assert!(text.contains("~ node_count = 2 -> 3"));
    assert!(text.contains("Plan: 0 to add, 2 to change, 0 to destroy."));
    assert_eq!(s.cloud.mutation_count().await, 0);
    assert_eq!(s.store.snapshot(), before);

    let (code, text) = apply(&s).await;
    assert_eq!(code, 0, "{text}");
    assert!(text.contains("0 added, 2 changed, 0 destroyed"));
}

#[tokio::test]
async fn undeclared_variable_is_a_configuration_error() {
    let tmp = tempfile::tempdir().unwrap();
    let s = session(tmp.path(), &["zones=3"]).await;
    let mut out = Vec::new();
    let err = commands::validate(&s, &demo(), &mut out).unwrap_err();
    assert!(err.to_string().contains("zones"), "{err}");
    assert!(s.cloud.calls().await.is_empty());
}

#[tokio::test]
async fn provider_failure_exits_nonzero_and_names_the_instance() {
    let tmp = tempfile::tempdir().unwrap();
    let s = session(tmp.path(), &[r#"regions=["ams3","xyz9"]"#]).await;
    let (code, text) = apply(&s).await;
    assert_eq!(code, 1);
    assert!(text.contains(r#"Error: create cluster.main["xyz9"]"#), "{text}");
    assert!(text.contains("unknown region"));
    assert!(s.store.get(&clusterform_core::ResourceAddress::keyed("cluster", "main", "ams3")).is_some());
}

// ---------------------------------------------------------------------------
// State commands
// ---------------------------------------------------------------------------

#[tokio::test]
async fn run_lock_blocks_apply_until_force_unlock() {
    let tmp = tempfile::tempdir().unwrap();
    let s = session(tmp.path(), &[]).await;
    let held = s.store.lock_run("other", "apply").unwrap();

    let mut out = Vec::new();
    let err = commands::apply(&s, &demo(), CancellationToken::new(), &mut out)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("force-unlock"), "{err}");
    assert!(s.cloud.calls().await.is_empty());

    // The holder crashed.
    std::mem::forget(held);
    let mut out = Vec::new();
    commands::force_unlock(&s, &mut out).unwrap();
    assert!(String::from_utf8(out).unwrap().contains("Removed run lock held by run other"));

    assert_eq!(apply(&s).await.0, 0);
}

#[tokio::test]
async fn destroy_empties_state_and_cloud() {
    let tmp = tempfile::tempdir().unwrap();
    let s = session(tmp.path(), &[]).await;
    assert_eq!(apply(&s).await.0, 0);

    let mut out = Vec::new();
    let code = commands::destroy(&s, CancellationToken::new(), &mut out).await.unwrap();
    let text = String::from_utf8(out).unwrap();
    assert_eq!(code, 0, "{text}");
    assert!(text.contains("Plan: 0 to add, 0 to change, 7 to destroy."));
    assert!(s.store.is_empty());
    for kind in ["cluster", "node_pool", "project_resources", "namespace"] {
        assert!(s.cloud.objects(kind).await.is_empty());
    }

    let mut out = Vec::new();
    commands::show(&s, false, &mut out).unwrap();
    assert!(String::from_utf8(out).unwrap().starts_with("No resources in state"));
}

#[tokio::test]
async fn refresh_reports_drift_and_show_masks_secrets() {
    let tmp = tempfile::tempdir().unwrap();
    let s = session(tmp.path(), &[]).await;
    assert_eq!(apply(&s).await.0, 0);

    let pool = clusterform_core::ResourceAddress::keyed("node_pool", "workers", "nyc1");
    assert!(s.cloud.tamper(&pool, "node_count", serde_json::json!(9)).await);

    let mut out = Vec::new();
    commands::refresh_state(&s, &mut out).await.unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains(r#"node_pool.workers["nyc1"] has changed outside of clusterform (node_count)"#));
    assert_eq!(s.store.get(&pool).unwrap().inputs["node_count"], serde_json::json!(9));

    let mut out = Vec::new();
    commands::show(&s, false, &mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("kube_config"));
    assert!(text.contains("(sensitive)"));
    assert!(!text.contains("sim-"));
}

// ---------------------------------------------------------------------------
// Declarations
// ---------------------------------------------------------------------------

#[tokio::test]
async fn outputs_and_graph() {
    let tmp = tempfile::tempdir().unwrap();
    let s = session(tmp.path(), &[]).await;

    let mut out = Vec::new();
    commands::output(&s, &demo(), None, false, &mut out).unwrap();
    assert!(String::from_utf8(out).unwrap().contains("endpoints = (not yet applied)"));

    assert_eq!(apply(&s).await.0, 0);

    let mut out = Vec::new();
    commands::output(&s, &demo(), Some("ams3_kube_config"), false, &mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("token"));
    assert!(text.contains("sim-"));

    let mut out = Vec::new();
    let err = commands::output(&s, &demo(), Some("missing"), false, &mut out).unwrap_err();
    assert!(err.to_string().contains("missing"));

    let mut out = Vec::new();
    commands::graph(&s, &demo(), &mut out).unwrap();
    let dot = String::from_utf8(out).unwrap();
    assert!(dot.starts_with("digraph clusterform {"));
    assert!(dot.contains(r#""namespace.app[\"ams3\"]" -> "cluster.main[\"ams3\"]";"#));

    let mut out = Vec::new();
    commands::validate(&s, &demo(), &mut out).unwrap();
    assert!(String::from_utf8(out).unwrap().contains("7 resource instance(s), 3 output(s)"));
}
