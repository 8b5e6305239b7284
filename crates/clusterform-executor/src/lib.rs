//! Clusterform Executor - Applies plans against a provider

pub mod cells;
pub mod error;
pub mod executor;
pub mod manifest;
pub mod refresh;
pub mod retry;

pub use cells::ValueCells;
pub use error::{ExecError, ExecResult, OperationError, OperationFailure};
pub use executor::{new_run_id, ApplyReport, Executor, ExecutorConfig, OpOutcome, OpReport};
pub use manifest::{OpState, Outcome, RunManifest};
pub use refresh::{refresh, repair_intents, Refreshed};
pub use retry::{retry_with_backoff, RetryConfig};
