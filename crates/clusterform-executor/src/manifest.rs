//! Run manifest: a structured record of every apply or destroy run.

use chrono::{DateTime, Utc};
use clusterform_graph::PlanKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RunManifest {
    pub run_id: String,
    pub kind: PlanKind,
    pub started: DateTime<Utc>,
    pub ended: Option<DateTime<Utc>>,
    pub outcome: Outcome,
    pub total_wall_ms: u64,
    pub operations: BTreeMap<String, OpStatus>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pending,
    Success,
    Failure,
    Cancelled,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct OpStatus {
    pub status: OpState,
    pub attempts: u32,
    pub wall_ms: u64,
    pub started: Option<DateTime<Utc>>,
    pub ended: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum OpState {
    Pending,
    Blocked,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl RunManifest {
    pub fn new(run_id: &str, kind: PlanKind) -> Self {
        Self {
            run_id: run_id.into(),
            kind,
            started: Utc::now(),
            ended: None,
            outcome: Outcome::Pending,
            total_wall_ms: 0,
            operations: BTreeMap::new(),
        }
    }

    pub fn add_op(&mut self, label: &str, state: OpState) {
        self.operations.insert(
            label.into(),
            OpStatus {
                status: state,
                attempts: 0,
                wall_ms: 0,
                started: None,
                ended: None,
                error: None,
            },
        );
    }

    pub fn update_op(&mut self, label: &str, state: OpState) {
        if let Some(op) = self.operations.get_mut(label) {
            op.status = state;
        }
    }

    pub fn start_op(&mut self, label: &str) {
        if let Some(op) = self.operations.get_mut(label) {
            op.status = OpState::Running;
            op.started = Some(Utc::now());
        }
    }

    pub fn finish_op(&mut self, label: &str, state: OpState, attempts: u32, error: Option<String>) {
        if let Some(op) = self.operations.get_mut(label) {
            op.status = state;
            op.attempts = attempts;
            op.error = error;
            op.ended = Some(Utc::now());
            if let (Some(start), Some(end)) = (op.started, op.ended) {
                op.wall_ms = (end - start).num_milliseconds().max(0) as u64;
            }
        }
    }

    pub fn finalize(&mut self, outcome: Outcome) {
        let ended = Utc::now();
        self.outcome = outcome;
        self.ended = Some(ended);
        self.total_wall_ms = (ended - self.started).num_milliseconds().max(0) as u64;
    }

    pub fn count(&self, state: OpState) -> usize {
        self.operations.values().filter(|o| o.status == state).count()
    }

    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).unwrap_or_default()
    }

    pub fn run_log_line(&self) -> String {
        format!(
            "| {} | {} | {} | {} ops | {} |",
            self.run_id,
            self.kind,
            self.started.format("%Y-%m-%dT%H:%M:%S"),
            self.operations.len(),
            self.outcome,
        )
    }
}
