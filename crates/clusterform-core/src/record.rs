//! State records: the last-known provider-side view of each resource instance.

use crate::address::ResourceAddress;
use crate::value::Attributes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A provider-side mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub address: ResourceAddress,
    /// Provider-assigned identifier.
    pub id: String,
    /// Arguments that were sent to the provider.
    pub inputs: Attributes,
    /// Full attribute set the provider returned, computed attributes included.
    pub outputs: Attributes,
    /// Instances this one consumed values from when it was last applied.
    #[serde(default)]
    pub dependencies: Vec<ResourceAddress>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl StateRecord {
    pub fn new(
        address: ResourceAddress,
        id: impl Into<String>,
        inputs: Attributes,
        outputs: Attributes,
        dependencies: Vec<ResourceAddress>,
    ) -> Self {
        Self {
            address,
            id: id.into(),
            inputs,
            outputs,
            dependencies,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn depends_on(&self, other: &ResourceAddress) -> bool {
        self.dependencies.iter().any(|d| d == other)
    }
}

/// Point-in-time copy of the state store, used as the diff baseline.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    records: BTreeMap<ResourceAddress, StateRecord>,
}

impl StateSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = StateRecord>) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|r| (r.address.clone(), r))
                .collect(),
        }
    }

    pub fn get(&self, address: &ResourceAddress) -> Option<&StateRecord> {
        self.records.get(address)
    }

    pub fn insert(&mut self, record: StateRecord) {
        self.records.insert(record.address.clone(), record);
    }

    pub fn remove(&mut self, address: &ResourceAddress) -> Option<StateRecord> {
        self.records.remove(address)
    }

    pub fn records(&self) -> impl Iterator<Item = &StateRecord> {
        self.records.values()
    }

    pub fn addresses(&self) -> impl Iterator<Item = &ResourceAddress> {
        self.records.keys()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Recorded instances that depend on `address`.
    pub fn dependents_of(&self, address: &ResourceAddress) -> Vec<&ResourceAddress> {
        self.records
            .values()
            .filter(|r| r.depends_on(address))
            .map(|r| &r.address)
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriftKind {
    /// The provider no longer has the object.
    Deleted,
    /// Attributes changed outside of clusterform.
    Modified { attributes: Vec<String> },
    /// A provider call was interrupted before its state write and the
    /// outcome was recovered from the provider.
    Recovered { action: Action, adopted: bool },
}

/// Divergence between recorded state and live provider state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Drift {
    pub address: ResourceAddress,
    #[serde(flatten)]
    pub kind: DriftKind,
}

impl std::fmt::Display for Drift {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            DriftKind::Deleted => write!(f, "{} has been deleted outside of clusterform", self.address),
            DriftKind::Modified { attributes } => write!(
                f,
                "{} has changed outside of clusterform ({})",
                self.address,
                attributes.join(", ")
            ),
            DriftKind::Recovered { action, adopted } => write!(
                f,
                "{} had an interrupted {} ({})",
                self.address,
                action,
                if *adopted { "adopted live object" } else { "no live object" }
            ),
        }
    }
}
