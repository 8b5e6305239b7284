//! Per-instance value cells.
//!
//! A cell holds the attributes of one resource instance as committed to
//! state. Dependents read inputs only from cells, and a cell is published
//! only after the state write, so no consumer sees a value the store does
//! not hold yet. The scheduler starts an operation only once every operation
//! it depends on has published.

use clusterform_core::{Attributes, ResourceAddress};
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct ValueCells {
    cells: DashMap<ResourceAddress, Arc<Attributes>>,
}

impl ValueCells {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish or replace the committed attributes of `address`.
    pub fn publish(&self, address: &ResourceAddress, attributes: Attributes) {
        self.cells.insert(address.clone(), Arc::new(attributes));
    }

    pub fn get(&self, address: &ResourceAddress) -> Option<Arc<Attributes>> {
        self.cells.get(address).map(|cell| Arc::clone(cell.value()))
    }
}
