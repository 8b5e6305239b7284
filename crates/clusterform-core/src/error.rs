//! Error types for Clusterform

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cyclic dependency: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("unresolved reference in {resource}: {reference} ({reason})")]
    UnresolvedReference {
        resource: String,
        reference: String,
        reason: String,
    },

    #[error("plan conflict: {address} is declared more than once")]
    PlanConflict { address: String },

    #[error("unknown resource type '{kind}' in {resource}")]
    UnknownResourceType { resource: String, kind: String },

    #[error("invalid declaration {resource}: {message}")]
    InvalidDeclaration { resource: String, message: String },

    #[error("expression error: {0}")]
    Expression(String),

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn unresolved(
        resource: impl Into<String>,
        reference: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::UnresolvedReference {
            resource: resource.into(),
            reference: reference.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidDeclaration {
            resource: resource.into(),
            message: message.into(),
        }
    }

    pub fn expression(message: impl Into<String>) -> Self {
        Self::Expression(message.into())
    }
}
