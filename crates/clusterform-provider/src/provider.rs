//! Provider trait

use crate::error::ProviderResult;
use clusterform_core::{Attributes, ResourceAddress, SchemaSet};
use serde::{Deserialize, Serialize};

/// A create or update call: the fully resolved arguments of one instance.
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceRequest {
    pub address: ResourceAddress,
    pub attributes: Attributes,
}

impl ResourceRequest {
    pub fn new(address: ResourceAddress, attributes: Attributes) -> Self {
        Self {
            address,
            attributes,
        }
    }

    pub fn kind(&self) -> &str {
        &self.address.kind
    }
}

/// A provider-side object as the provider reports it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LiveResource {
    pub id: String,
    /// Arguments and computed attributes together.
    pub attributes: Attributes,
}

/// Provider trait
///
/// Every object a provider creates is tagged with the address that created it,
/// so [`Provider::find`] can recover objects whose state write was lost.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    fn schemas(&self) -> &SchemaSet;

    async fn create(&self, request: &ResourceRequest) -> ProviderResult<LiveResource>;

    /// Read an object by id. `Ok(None)` when it no longer exists.
    async fn read(&self, kind: &str, id: &str) -> ProviderResult<Option<LiveResource>>;

    async fn update(&self, id: &str, request: &ResourceRequest) -> ProviderResult<LiveResource>;

    async fn delete(&self, kind: &str, id: &str) -> ProviderResult<()>;

    /// Look up the object created for `address`, if any.
    async fn find(&self, address: &ResourceAddress) -> ProviderResult<Option<LiveResource>>;
}
