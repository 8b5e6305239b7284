//! Clusterform Provider - the boundary to the cloud control API
//!
//! The orchestrator never talks to a cloud directly. Everything goes through
//! the [`Provider`] trait. [`SimulatedCloud`] serves the managed-Kubernetes
//! resource types from memory (optionally persisted to a file) and doubles as
//! the test provider with call recording and fault injection.

pub mod error;
pub mod provider;
pub mod schemas;
pub mod simulated;

pub use error::{ProviderError, ProviderResult};
pub use provider::{LiveResource, Provider, ResourceRequest};
pub use schemas::cloud_schemas;
pub use simulated::{CallKind, FaultRule, ProviderCall, SimulatedCloud};
