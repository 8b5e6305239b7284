//! Intent journal entries.
//!
//! An intent is written before a provider call and cleared after the
//! resulting state write. One that survives a run marks a call whose outcome
//! never reached the store.

use chrono::{DateTime, Utc};
use clusterform_core::{Action, ResourceAddress};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub address: ResourceAddress,
    pub action: Action,
    pub run_id: String,
    /// Provider id of the object being updated or deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_id: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl Intent {
    pub fn new(
        address: ResourceAddress,
        action: Action,
        run_id: impl Into<String>,
        prior_id: Option<String>,
    ) -> Self {
        Self {
            address,
            action,
            run_id: run_id.into(),
            prior_id,
            started_at: Utc::now(),
        }
    }
}
