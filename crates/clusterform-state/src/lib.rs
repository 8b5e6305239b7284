//! Clusterform State - Durable resource records, intent journal, and run lock

pub mod backend;
pub mod error;
pub mod intent;
pub mod lock;
pub mod store;

pub use backend::{LocalFsBackend, MemoryBackend, StateBackend};
pub use error::{StateError, StateResult};
pub use intent::Intent;
pub use lock::{LockInfo, RunLock};
pub use store::StateStore;
