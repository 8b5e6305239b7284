//! Executor errors

use clusterform_core::{Action, ResourceAddress};
use clusterform_provider::ProviderError;
use clusterform_state::StateError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OperationFailure {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("state write failed: {0}")]
    State(#[from] StateError),

    #[error("cannot resolve inputs: {0}")]
    Input(String),
}

impl OperationFailure {
    pub fn input(message: impl Into<String>) -> Self {
        Self::Input(message.into())
    }
}

/// A failed operation, attributed to its resource instance.
#[derive(Error, Debug)]
#[error("{action} {address}: {source}")]
pub struct OperationError {
    pub address: ResourceAddress,
    pub action: Action,
    pub attempts: u32,
    pub source: OperationFailure,
}

#[derive(Error, Debug)]
pub enum ExecError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Config(#[from] clusterform_core::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ExecResult<T> = std::result::Result<T, ExecError>;
