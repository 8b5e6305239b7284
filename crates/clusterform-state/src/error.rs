//! State store errors

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("state is locked by {holder} ({}); remove it with `clusterform force-unlock` if that run is gone", path.display())]
    Locked { holder: String, path: PathBuf },

    #[error("corrupt state document {}: {message}", path.display())]
    Corrupt { path: PathBuf, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type StateResult<T> = std::result::Result<T, StateError>;
