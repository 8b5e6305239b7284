//! Executor: runs a plan against a provider.
//!
//! Operations are scheduled once every operation they depend on has
//! succeeded, up to `concurrency` at a time. A failed operation blocks its
//! transitive dependents only; unrelated branches keep going. On
//! cancellation, in-flight operations finish and nothing new starts.
//!
//! Each create or update reads its inputs from the value cells of the
//! instances it references, and publishes its own cell only after its
//! state record is committed.

use crate::cells::ValueCells;
use crate::error::{ExecResult, OperationError, OperationFailure};
use crate::manifest::{OpState, Outcome, RunManifest};
use crate::retry::{retry_with_backoff, RetryConfig};
use chrono::Utc;
use clusterform_core::{
    Action, Attributes, EachBinding, EvalContext, Resolved, ResourceAddress, StateRecord,
    StateSnapshot,
};
use clusterform_graph::{InstanceNode, Plan, PlannedOp, ResourceGraph};
use clusterform_provider::{Provider, ProviderError, ResourceRequest};
use clusterform_state::{Intent, StateStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    /// Maximum operations in flight.
    pub concurrency: usize,
    pub retry: RetryConfig,
    /// Where run manifests are written; `None` keeps them in memory only.
    pub runs_dir: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            retry: RetryConfig::default(),
            runs_dir: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OpOutcome {
    Succeeded,
    Failed { error: String },
    /// Not attempted because an operation it depends on failed.
    Skipped { blocked_by: String },
    Cancelled,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpReport {
    pub id: usize,
    pub address: ResourceAddress,
    pub action: Action,
    pub outcome: OpOutcome,
    pub attempts: u32,
}

#[derive(Debug)]
pub struct ApplyReport {
    pub run_id: String,
    pub operations: Vec<OpReport>,
    pub errors: Vec<OperationError>,
    pub manifest: RunManifest,
    pub cancelled: bool,
}

impl ApplyReport {
    pub fn is_success(&self) -> bool {
        !self.cancelled
            && self
                .operations
                .iter()
                .all(|op| op.outcome == OpOutcome::Succeeded)
    }

    /// Succeeded operations of `action`.
    pub fn completed(&self, action: Action) -> usize {
        self.operations
            .iter()
            .filter(|op| op.action == action && op.outcome == OpOutcome::Succeeded)
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op.outcome, OpOutcome::Skipped { .. }))
            .count()
    }

    pub fn summary(&self) -> String {
        let counts = format!(
            "{} added, {} changed, {} destroyed",
            self.completed(Action::Create),
            self.completed(Action::Update),
            self.completed(Action::Delete)
        );
        if self.is_success() {
            format!("Apply complete! Resources: {counts}.")
        } else if self.cancelled {
            format!("Apply cancelled. Resources: {counts}.")
        } else {
            format!(
                "Apply failed: {} error(s), {} skipped. Resources: {counts}.",
                self.errors.len(),
                self.skipped()
            )
        }
    }
}

pub fn new_run_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().format("%Y%m%dT%H%M%S"), &suffix[..8])
}

pub struct Executor {
    provider: Arc<dyn Provider>,
    store: Arc<StateStore>,
    config: ExecutorConfig,
    run_id: String,
}

/// What a spawned operation needs; shared by every task of one run.
struct RunContext {
    provider: Arc<dyn Provider>,
    store: Arc<StateStore>,
    cells: Arc<ValueCells>,
    graph: Arc<ResourceGraph>,
    plan: Arc<Plan>,
    retry: RetryConfig,
    run_id: String,
}

struct OpResult {
    attempts: u32,
    result: Result<(), OperationFailure>,
}

impl Executor {
    pub fn new(provider: Arc<dyn Provider>, store: Arc<StateStore>, config: ExecutorConfig) -> Self {
        Self {
            provider,
            store,
            config,
            run_id: new_run_id(),
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    /// Apply `plan`. `graph` supplies the templates of created and updated
    /// instances; a destroy plan can pass an empty graph.
    pub async fn apply(
        &self,
        graph: Arc<ResourceGraph>,
        plan: Arc<Plan>,
        cancel: CancellationToken,
    ) -> ExecResult<ApplyReport> {
        let run_id = self.run_id.clone();
        let total = plan.operations.len();
        info!(run_id = %run_id, kind = %plan.kind, operations = total, "run started");

        let cells = Arc::new(ValueCells::new());
        prepublish(&cells, &graph, &plan, &self.store.snapshot());

        let mut manifest = RunManifest::new(&run_id, plan.kind);
        for op in &plan.operations {
            let state = if op.depends_on.is_empty() {
                OpState::Pending
            } else {
                OpState::Blocked
            };
            manifest.add_op(&op.label(), state);
        }
        self.write_manifest(&manifest).await?;

        let ctx = Arc::new(RunContext {
            provider: self.provider.clone(),
            store: self.store.clone(),
            cells,
            graph,
            plan: plan.clone(),
            retry: self.config.retry.clone(),
            run_id: run_id.clone(),
        });

        let mut waiting: Vec<usize> = plan.operations.iter().map(|op| op.depends_on.len()).collect();
        let mut ready: BTreeSet<usize> = (0..total).filter(|&i| waiting[i] == 0).collect();
        let mut outcomes: Vec<Option<OpOutcome>> = vec![None; total];
        let mut attempts: Vec<u32> = vec![0; total];
        let mut in_flight: BTreeSet<usize> = BTreeSet::new();
        let mut errors = Vec::new();
        let mut tasks: JoinSet<(usize, OpResult)> = JoinSet::new();
        let mut cancelled = false;
        let limit = self.config.concurrency.max(1);

        loop {
            if !cancelled && cancel.is_cancelled() {
                cancelled = true;
                warn!(run_id = %run_id, "run cancelled before scheduling remaining operations");
            }
            while !cancelled && tasks.len() < limit {
                let Some(id) = ready.pop_first() else { break };
                let op = &plan.operations[id];
                manifest.start_op(&op.label());
                in_flight.insert(id);
                let ctx = ctx.clone();
                tasks.spawn(async move {
                    let result = run_op(&ctx, id).await;
                    (id, result)
                });
            }

            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                joined = tasks.join_next() => {
                    let Some(joined) = joined else { continue };
                    let (id, done) = match joined {
                        Ok(done) => done,
                        Err(e) => {
                            error!(run_id = %run_id, error = %e, "operation task aborted");
                            continue;
                        }
                    };
                    in_flight.remove(&id);
                    attempts[id] = done.attempts;
                    let op = &plan.operations[id];
                    match done.result {
                        Ok(()) => {
                            manifest.finish_op(&op.label(), OpState::Succeeded, done.attempts, None);
                            outcomes[id] = Some(OpOutcome::Succeeded);
                            for next in plan.dependents(id) {
                                waiting[next.id] -= 1;
                                if waiting[next.id] == 0 && outcomes[next.id].is_none() {
                                    manifest.update_op(&next.label(), OpState::Pending);
                                    ready.insert(next.id);
                                }
                            }
                        }
                        Err(source) => {
                            let message = source.to_string();
                            error!(
                                run_id = %run_id,
                                address = %op.address,
                                action = %op.action,
                                attempts = done.attempts,
                                error = %message,
                                "operation failed"
                            );
                            manifest.finish_op(
                                &op.label(),
                                OpState::Failed,
                                done.attempts,
                                Some(message.clone()),
                            );
                            outcomes[id] = Some(OpOutcome::Failed { error: message });
                            for blocked in block_dependents(&plan, id, &mut outcomes) {
                                ready.remove(&blocked);
                                manifest.update_op(&plan.operations[blocked].label(), OpState::Skipped);
                            }
                            errors.push(OperationError {
                                address: op.address.clone(),
                                action: op.action,
                                attempts: done.attempts,
                                source,
                            });
                        }
                    }
                }
                _ = cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    warn!(run_id = %run_id, in_flight = tasks.len(), "cancellation requested, draining in-flight operations");
                }
            }
        }

        let mut operations = Vec::with_capacity(total);
        for op in &plan.operations {
            let outcome = match outcomes[op.id].take() {
                Some(outcome) => outcome,
                None if in_flight.contains(&op.id) => {
                    let error = "operation task aborted".to_string();
                    manifest.finish_op(&op.label(), OpState::Failed, attempts[op.id], Some(error.clone()));
                    OpOutcome::Failed { error }
                }
                None if cancelled => {
                    manifest.update_op(&op.label(), OpState::Cancelled);
                    OpOutcome::Cancelled
                }
                None => {
                    manifest.update_op(&op.label(), OpState::Skipped);
                    OpOutcome::Skipped {
                        blocked_by: "an aborted operation".into(),
                    }
                }
            };
            operations.push(OpReport {
                id: op.id,
                address: op.address.clone(),
                action: op.action,
                outcome,
                attempts: attempts[op.id],
            });
        }

        let failed = operations
            .iter()
            .any(|op| !matches!(op.outcome, OpOutcome::Succeeded | OpOutcome::Cancelled));
        let outcome = if failed {
            Outcome::Failure
        } else if cancelled {
            Outcome::Cancelled
        } else {
            Outcome::Success
        };
        manifest.finalize(outcome);
        self.write_manifest(&manifest).await?;

        info!(
            run_id = %run_id,
            outcome = %manifest.outcome,
            succeeded = manifest.count(OpState::Succeeded),
            failed = manifest.count(OpState::Failed),
            skipped = manifest.count(OpState::Skipped),
            wall_ms = manifest.total_wall_ms,
            "run complete"
        );

        Ok(ApplyReport {
            run_id,
            operations,
            errors,
            manifest,
            cancelled,
        })
    }

    async fn write_manifest(&self, manifest: &RunManifest) -> ExecResult<()> {
        let Some(runs) = &self.config.runs_dir else {
            return Ok(());
        };
        let dir = runs.join(&manifest.run_id);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join("manifest.yaml"), manifest.to_yaml()).await?;
        if manifest.ended.is_some() {
            use tokio::io::AsyncWriteExt;
            let mut log = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(runs.join("runs.log"))
                .await?;
            log.write_all(format!("{}\n", manifest.run_log_line()).as_bytes())
                .await?;
        }
        Ok(())
    }
}

/// Instances that no operation touches keep their recorded values.
fn prepublish(cells: &ValueCells, graph: &ResourceGraph, plan: &Plan, state: &StateSnapshot) {
    let writes: BTreeSet<&ResourceAddress> = plan
        .operations
        .iter()
        .filter(|op| op.action != Action::Delete)
        .map(|op| &op.address)
        .collect();
    for node in graph.nodes() {
        if writes.contains(&node.address) {
            continue;
        }
        if let Some(record) = state.get(&node.address) {
            cells.publish(&node.address, record.outputs.clone());
        }
    }
}

/// Mark every transitive dependent of `failed` as skipped. Returns the ids
/// newly skipped.
fn block_dependents(plan: &Plan, failed: usize, outcomes: &mut [Option<OpOutcome>]) -> Vec<usize> {
    let blocked_by = plan.operations[failed].label();
    let mut queue = VecDeque::from([failed]);
    let mut skipped = Vec::new();
    while let Some(id) = queue.pop_front() {
        for next in plan.dependents(id) {
            if outcomes[next.id].is_none() {
                outcomes[next.id] = Some(OpOutcome::Skipped {
                    blocked_by: blocked_by.clone(),
                });
                skipped.push(next.id);
                queue.push_back(next.id);
            }
        }
    }
    skipped
}

// ---------------------------------------------------------------------------
// Single operation
// ---------------------------------------------------------------------------

/// Template scope at apply time: references read committed values from cells.
struct ApplyScope<'a> {
    graph: &'a ResourceGraph,
    cells: &'a ValueCells,
    each: Option<&'a EachBinding>,
}

impl EvalContext for ApplyScope<'_> {
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
        let values = self.cells.get(address)?;
        Some(
            values
                .get(attribute)
                .cloned()
                .map(Resolved::Known)
                .unwrap_or_else(Resolved::null),
        )
    }
}

fn resolve_inputs(ctx: &RunContext, node: &InstanceNode) -> Result<Attributes, OperationFailure> {
    for dep in ctx.graph.dependencies(&node.address) {
        if ctx.cells.get(dep).is_none() {
            return Err(OperationFailure::input(format!(
                "{dep} has not published its attributes"
            )));
        }
    }
    let scope = ApplyScope {
        graph: &ctx.graph,
        cells: &ctx.cells,
        each: node.each.as_ref(),
    };
    let mut inputs = Attributes::new();
    for (name, template) in &node.attributes {
        match template.evaluate(&scope) {
            Ok(Resolved::Known(Value::Null)) => {}
            Ok(Resolved::Known(value)) => {
                inputs.insert(name.clone(), value);
            }
            Ok(Resolved::Unknown) => {
                return Err(OperationFailure::input(format!("{name} is still unknown")));
            }
            Err(e) => return Err(OperationFailure::input(format!("{name}: {e}"))),
        }
    }
    Ok(inputs)
}

async fn run_op(ctx: &RunContext, id: usize) -> OpResult {
    let op = &ctx.plan.operations[id];
    debug!(run_id = %ctx.run_id, op = %op.label(), "operation started");
    match op.action {
        Action::Create | Action::Update => write_op(ctx, op).await,
        Action::Delete => delete_op(ctx, op).await,
    }
}

async fn write_op(ctx: &RunContext, op: &PlannedOp) -> OpResult {
    let fail = |source: OperationFailure| OpResult {
        attempts: 0,
        result: Err(source),
    };
    let Some(node) = ctx.graph.node(&op.address) else {
        return fail(OperationFailure::input(format!(
            "{} is not in the resource graph",
            op.address
        )));
    };
    let inputs = match resolve_inputs(ctx, node) {
        Ok(inputs) => inputs,
        Err(e) => return fail(e),
    };
    let prior_id = match (op.action, &op.prior) {
        (Action::Update, Some(prior)) => Some(prior.id.clone()),
        (Action::Update, None) => {
            return fail(OperationFailure::input(format!(
                "{} has no recorded object to update",
                op.address
            )))
        }
        _ => None,
    };

    let guard = ctx.store.lock(&op.address).await;
    let intent = Intent::new(op.address.clone(), op.action, &ctx.run_id, prior_id.clone());
    if let Err(e) = ctx.store.begin(&intent).await {
        return fail(e.into());
    }

    let request = ResourceRequest::new(op.address.clone(), inputs.clone());
    let label = op.label();
    let provider = &*ctx.provider;
    let req = &request;
    let (result, attempts) = match &prior_id {
        Some(id) => {
            retry_with_backoff(&ctx.retry, &label, || provider.update(id, req)).await
        }
        None => retry_with_backoff(&ctx.retry, &label, || provider.create(req)).await,
    };

    let live = match result {
        Ok(live) => live,
        Err(e) => {
            // The provider reported the failure, so nothing is left to repair.
            if let Err(clear) = ctx.store.finish(&op.address).await {
                warn!(address = %op.address, error = %clear, "failed to clear intent");
            }
            return OpResult {
                attempts,
                result: Err(e.into()),
            };
        }
    };

    let record = StateRecord::new(
        op.address.clone(),
        live.id,
        inputs,
        live.attributes,
        ctx.graph.dependencies(&op.address).cloned().collect(),
    );
    let committed = match ctx.store.commit(record).await {
        Ok(committed) => committed,
        Err(e) => {
            // Intent stays behind; the next run adopts the object.
            return OpResult {
                attempts,
                result: Err(e.into()),
            };
        }
    };
    if let Err(e) = ctx.store.finish(&op.address).await {
        warn!(address = %op.address, error = %e, "failed to clear intent");
    }
    drop(guard);

    ctx.cells.publish(&op.address, committed.outputs);
    info!(
        run_id = %ctx.run_id,
        address = %op.address,
        action = %op.action,
        id = %committed.id,
        version = committed.version,
        attempts,
        "operation complete"
    );
    OpResult {
        attempts,
        result: Ok(()),
    }
}

async fn delete_op(ctx: &RunContext, op: &PlannedOp) -> OpResult {
    let Some(prior) = &op.prior else {
        return OpResult {
            attempts: 0,
            result: Err(OperationFailure::input(format!(
                "{} has no recorded object to delete",
                op.address
            ))),
        };
    };

    let _guard = ctx.store.lock(&op.address).await;
    let intent = Intent::new(
        op.address.clone(),
        Action::Delete,
        &ctx.run_id,
        Some(prior.id.clone()),
    );
    if let Err(e) = ctx.store.begin(&intent).await {
        return OpResult {
            attempts: 0,
            result: Err(e.into()),
        };
    }

    let label = op.label();
    let provider = &*ctx.provider;
    let kind = op.address.kind.as_str();
    let id = prior.id.as_str();
    let (result, attempts) =
        retry_with_backoff(&ctx.retry, &label, || provider.delete(kind, id)).await;

    match result {
        Ok(()) => {}
        Err(ProviderError::NotFound(_)) => {
            warn!(address = %op.address, id = %prior.id, "object already gone");
        }
        Err(e) => {
            if let Err(clear) = ctx.store.finish(&op.address).await {
                warn!(address = %op.address, error = %clear, "failed to clear intent");
            }
            return OpResult {
                attempts,
                result: Err(e.into()),
            };
        }
    }

    if let Err(e) = ctx.store.remove_if_id(&op.address, &prior.id).await {
        return OpResult {
            attempts,
            result: Err(e.into()),
        };
    }
    if let Err(e) = ctx.store.finish(&op.address).await {
        warn!(address = %op.address, error = %e, "failed to clear intent");
    }
    info!(
        run_id = %ctx.run_id,
        address = %op.address,
        id = %prior.id,
        attempts,
        replacement = op.replacement.is_some(),
        "object deleted"
    );
    OpResult {
        attempts,
        result: Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clusterform_core::PlannedAttributes;
    use clusterform_graph::PlanKind;

    fn op(id: usize, key: &str, depends_on: Vec<usize>) -> PlannedOp {
        PlannedOp {
            id,
            address: ResourceAddress::keyed("cluster", "main", key),
            action: Action::Create,
            replacement: None,
            depends_on,
            prior: None,
            planned: PlannedAttributes::new(),
            changed: vec![],
            forcing: vec![],
            sensitive: BTreeSet::new(),
            depth: 0,
        }
    }

    #[test]
    fn failure_blocks_transitive_dependents_only() {
        let plan = Plan {
            kind: PlanKind::Apply,
            operations: vec![
                op(0, "a", vec![]),
                op(1, "b", vec![]),
                op(2, "c", vec![0]),
                op(3, "d", vec![2]),
                op(4, "e", vec![1]),
            ],
            unchanged: vec![],
            drift: vec![],
        };
        let mut outcomes = vec![None; 5];
        let skipped = block_dependents(&plan, 0, &mut outcomes);
        assert_eq!(skipped, vec![2, 3]);
        assert!(outcomes[4].is_none());
        assert_eq!(
            outcomes[3],
            Some(OpOutcome::Skipped {
                blocked_by: r#"cluster.main["a"] (create)"#.into()
            })
        );
    }

    #[test]
    fn run_ids_are_unique() {
        assert_ne!(new_run_id(), new_run_id());
    }

    #[test]
    fn empty_report_is_success() {
        let report = ApplyReport {
            run_id: "r".into(),
            operations: vec![],
            errors: vec![],
            manifest: RunManifest::new("r", PlanKind::Apply),
            cancelled: false,
        };
        assert!(report.is_success());
        assert_eq!(report.summary(), "Apply complete! Resources: 0 added, 0 changed, 0 destroyed.");
    }
}
