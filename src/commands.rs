//! CLI commands.
//!
//! Every command writes its user-facing output to `out` and returns the
//! process exit code; diagnostics go through `tracing`.

use crate::config::ClusterformConfig;
use anyhow::Context;
use clusterform_core::value::display;
use clusterform_core::{parse_variable_override, Document, Drift, SchemaSet, StateSnapshot};
use clusterform_executor::{new_run_id, refresh, repair_intents, Executor};
use clusterform_graph::{evaluate_outputs, GraphBuilder, Plan, Planner, ResourceGraph};
use clusterform_provider::{Provider, SimulatedCloud};
use clusterform_state::StateStore;
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Everything a command runs against.
pub struct Session {
    pub config: ClusterformConfig,
    pub schemas: SchemaSet,
    pub cloud: Arc<SimulatedCloud>,
    pub store: Arc<StateStore>,
    pub variables: BTreeMap<String, Value>,
}

impl Session {
    /// Open the provider and state store named by `config`. `vars` are
    /// `NAME=VALUE` variable overrides.
    pub async fn open(config: ClusterformConfig, vars: &[String]) -> anyhow::Result<Self> {
        let variables = vars
            .iter()
            .map(|v| parse_variable_override(v))
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        let cloud = match &config.provider.world {
            Some(path) => SimulatedCloud::open(path)
                .with_context(|| format!("opening simulated cloud at {}", path.display()))?,
            None => SimulatedCloud::new(),
        }
        .with_latency(config.latency());

        let mut schemas = cloud.schemas().clone();
        config.apply_replace_policies(&mut schemas);

        let store = StateStore::open_local(&config.state.dir)
            .await
            .with_context(|| format!("opening state at {}", config.state.dir.display()))?;

        Ok(Self {
            config,
            schemas,
            cloud: Arc::new(cloud),
            store: Arc::new(store),
            variables,
        })
    }

    pub fn load_graph(&self, path: &Path) -> anyhow::Result<ResourceGraph> {
        let doc = Document::load(path)
            .with_context(|| format!("loading declarations from {}", path.display()))?;
        Ok(GraphBuilder::new(&self.schemas).build(&doc, &self.variables)?)
    }

    /// Repair interrupted operations and bring the store up to date with
    /// the provider. Returns everything that was found to differ.
    async fn reconcile(&self) -> anyhow::Result<Vec<Drift>> {
        let retry = &self.config.retry;
        let mut drift = repair_intents(self.cloud.as_ref(), &self.store, retry).await?;
        let refreshed = refresh(
            self.cloud.as_ref(),
            &self.store.snapshot(),
            retry,
            self.config.executor.concurrency,
        )
        .await?;
        let written = self.store.sync(&refreshed.snapshot).await?;
        if written > 0 {
            info!(records = written, "state refreshed from provider");
        }
        drift.extend(refreshed.drift);
        Ok(drift)
    }

    fn executor(&self, run_id: &str) -> Executor {
        Executor::new(
            self.cloud.clone(),
            self.store.clone(),
            self.config.executor_config(),
        )
        .with_run_id(run_id)
    }
}

pub fn validate(session: &Session, path: &Path, out: &mut dyn Write) -> anyhow::Result<i32> {
    let graph = session.load_graph(path)?;
    writeln!(
        out,
        "Configuration is valid: {} resource instance(s), {} output(s).",
        graph.len(),
        graph.outputs().len()
    )?;
    Ok(0)
}

pub fn graph(session: &Session, path: &Path, out: &mut dyn Write) -> anyhow::Result<i32> {
    let graph = session.load_graph(path)?;
    write!(out, "{}", graph.to_dot())?;
    Ok(0)
}

/// Dry run: no provider mutation and no state write. With
/// `detailed_exitcode`, returns 2 when changes are pending.
pub async fn plan(
    session: &Session,
    path: &Path,
    detailed_exitcode: bool,
    out: &mut dyn Write,
) -> anyhow::Result<i32> {
    let graph = session.load_graph(path)?;

    let pending = session.store.pending_intents().await?;
    if !pending.is_empty() {
        writeln!(
            out,
            "Warning: {} operation(s) from an interrupted run will be repaired by the next apply.\n",
            pending.len()
        )?;
    }

    let refreshed = refresh(
        session.cloud.as_ref(),
        &session.store.snapshot(),
        &session.config.retry,
        session.config.executor.concurrency,
    )
    .await?;
    let plan = Planner::new(&session.schemas)
        .plan(&graph, &refreshed.snapshot)?
        .with_drift(refreshed.drift);
    write!(out, "{}", plan.render())?;

    Ok(if detailed_exitcode && !plan.is_empty() { 2 } else { 0 })
}

pub async fn apply(
    session: &Session,
    path: &Path,
    cancel: CancellationToken,
    out: &mut dyn Write,
) -> anyhow::Result<i32> {
    let graph = Arc::new(session.load_graph(path)?);
    let run_id = new_run_id();
    let _lock = session.store.lock_run(&run_id, "apply")?;

    let drift = session.reconcile().await?;
    let plan = Planner::new(&session.schemas)
        .plan(&graph, &session.store.snapshot())?
        .with_drift(drift);
    write!(out, "{}", plan.render())?;
    if plan.is_empty() {
        write_outputs(&graph, &session.store.snapshot(), out)?;
        return Ok(0);
    }
    writeln!(out)?;

    execute(session, &run_id, graph, plan, cancel, out).await
}

pub async fn destroy(
    session: &Session,
    cancel: CancellationToken,
    out: &mut dyn Write,
) -> anyhow::Result<i32> {
    let run_id = new_run_id();
    let _lock = session.store.lock_run(&run_id, "destroy")?;

    let drift = session.reconcile().await?;
    let plan = Planner::new(&session.schemas)
        .plan_destroy(&session.store.snapshot())?
        .with_drift(drift);
    write!(out, "{}", plan.render())?;
    if plan.is_empty() {
        return Ok(0);
    }
    writeln!(out)?;

    execute(
        session,
        &run_id,
        Arc::new(ResourceGraph::default()),
        plan,
        cancel,
        out,
    )
    .await
}

async fn execute(
    session: &Session,
    run_id: &str,
    graph: Arc<ResourceGraph>,
    plan: Plan,
    cancel: CancellationToken,
    out: &mut dyn Write,
) -> anyhow::Result<i32> {
    let report = session
        .executor(run_id)
        .apply(graph.clone(), Arc::new(plan), cancel)
        .await?;

    for error in &report.errors {
        writeln!(out, "Error: {error}")?;
    }
    writeln!(out, "{}", report.summary())?;
    if report.is_success() && !graph.is_empty() {
        write_outputs(&graph, &session.store.snapshot(), out)?;
    }
    Ok(if report.is_success() { 0 } else { 1 })
}

pub async fn refresh_state(session: &Session, out: &mut dyn Write) -> anyhow::Result<i32> {
    let run_id = new_run_id();
    let _lock = session.store.lock_run(&run_id, "refresh")?;
    let drift = session.reconcile().await?;
    if drift.is_empty() {
        writeln!(out, "No changes. State matches the provider.")?;
    } else {
        for d in &drift {
            writeln!(out, "  ~ {d}")?;
        }
        writeln!(out, "\nState updated: {} object(s) drifted.", drift.len())?;
    }
    Ok(0)
}

pub fn show(session: &Session, json: bool, out: &mut dyn Write) -> anyhow::Result<i32> {
    let snapshot = session.store.snapshot();
    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(&snapshot)?)?;
        return Ok(0);
    }
    if snapshot.is_empty() {
        writeln!(out, "No resources in state ({}).", session.store.location())?;
        return Ok(0);
    }
    for record in snapshot.records() {
        let schema = session.schemas.get(&record.address.kind);
        writeln!(
            out,
            "# {} (id {}, version {}, updated {})",
            record.address,
            record.id,
            record.version,
            record.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
        )?;
        let width = record.outputs.keys().map(String::len).max().unwrap_or(0);
        for (name, value) in &record.outputs {
            let shown = if schema.map(|s| s.is_sensitive(name)).unwrap_or(false) {
                "(sensitive)".to_string()
            } else {
                display(value)
            };
            writeln!(out, "    {name:<width$} = {shown}")?;
        }
        writeln!(out)?;
    }
    Ok(0)
}

/// Print declared outputs. A single named output is printed raw, sensitive
/// or not.
pub fn output(
    session: &Session,
    path: &Path,
    name: Option<&str>,
    json: bool,
    out: &mut dyn Write,
) -> anyhow::Result<i32> {
    let graph = session.load_graph(path)?;
    let outputs = evaluate_outputs(&graph, &session.store.snapshot());

    if let Some(name) = name {
        let output = outputs
            .get(name)
            .with_context(|| format!("no output named '{name}'"))?;
        let value = output.value.clone().unwrap_or(Value::Null);
        match (&value, json) {
            (Value::String(s), false) => writeln!(out, "{s}")?,
            _ => writeln!(out, "{}", serde_json::to_string_pretty(&value)?)?,
        }
        return Ok(0);
    }

    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(&outputs)?)?;
        return Ok(0);
    }
    write_outputs(&graph, &session.store.snapshot(), out)?;
    Ok(0)
}

fn write_outputs(
    graph: &ResourceGraph,
    snapshot: &StateSnapshot,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    let outputs = evaluate_outputs(graph, snapshot);
    if outputs.is_empty() {
        return Ok(());
    }
    writeln!(out, "\nOutputs:\n")?;
    for (name, output) in &outputs {
        let shown = match &output.value {
            _ if output.sensitive => "(sensitive)".to_string(),
            Some(value) => display(value),
            None => "(not yet applied)".to_string(),
        };
        writeln!(out, "{name} = {shown}")?;
    }
    Ok(())
}

pub fn force_unlock(session: &Session, out: &mut dyn Write) -> anyhow::Result<i32> {
    match session.store.break_lock()? {
        Some(holder) => {
            warn!(holder = %holder, "run lock removed by force-unlock");
            writeln!(out, "Removed run lock held by {holder}.")?;
        }
        None => writeln!(out, "No run lock held on {}.", session.store.location())?,
    }
    Ok(0)
}
