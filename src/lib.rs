//! clusterform: reconciles one managed Kubernetes cluster per region, with
//! its node pools, namespaces and project attachment, against declarations.

pub mod commands;
pub mod config;
pub mod logging;

pub use commands::Session;
pub use config::ClusterformConfig;
