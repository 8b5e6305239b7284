//! Provider error taxonomy

use std::time::Duration;

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("rate limited: retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("network error: {0}")]
    Network(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("authorization failed: {0}")]
    Unauthorized(String),

    #[error("invalid attribute '{attribute}': {message}")]
    InvalidAttribute { attribute: String, message: String },

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unsupported resource type: {0}")]
    UnsupportedType(String),
}

impl ProviderError {
    pub fn invalid(attribute: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidAttribute {
            attribute: attribute.into(),
            message: message.into(),
        }
    }

    /// Transient errors are worth retrying; everything else aborts the branch.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Network(_) | Self::Unavailable(_)
        )
    }

    /// Minimum wait the provider asked for before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after_ms } => Some(Duration::from_millis(*retry_after_ms)),
            _ => None,
        }
    }
}
