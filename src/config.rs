//! clusterform configuration
//!
//! Loaded from `clusterform.toml` at startup; falls back to defaults when
//! the file is missing. Command-line flags override what is loaded here.

use anyhow::Context;
use clusterform_core::{ReplacePolicy, SchemaSet};
use clusterform_executor::{ExecutorConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterformConfig {
    pub state: StateConfig,
    pub executor: ExecutorSection,
    pub retry: RetryConfig,
    pub provider: ProviderConfig,
    pub log: LogConfig,
    /// Replacement policy per resource type, overriding the type's default.
    pub replace: BTreeMap<String, ReplacePolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Directory holding state records, intents, and the run lock.
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    /// Maximum provider operations in flight.
    pub concurrency: usize,
    /// Run manifests are written here, one directory per run.
    pub runs_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// File the simulated cloud persists its objects to.
    pub world: Option<PathBuf>,
    /// Artificial latency per provider call.
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Daily-rolling log files are written here when set.
    pub dir: Option<PathBuf>,
    /// JSON lines in the log file instead of plain text.
    pub json: bool,
}

// ============================================================
// Defaults
// ============================================================

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".clusterform/state"),
        }
    }
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            concurrency: 4,
            runs_dir: Some(PathBuf::from(".clusterform/runs")),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            world: Some(PathBuf::from(".clusterform/cloud.json")),
            latency_ms: 0,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "clusterform=info".into(),
            dir: None,
            json: false,
        }
    }
}

impl ClusterformConfig {
    /// A missing file means defaults. A file that exists but cannot be read
    /// or parsed is an error: running on defaults would point at a different
    /// state directory.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        let config = toml::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            concurrency: self.executor.concurrency.max(1),
            retry: self.retry.clone(),
            runs_dir: self.executor.runs_dir.clone(),
        }
    }

    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.provider.latency_ms)
    }

    /// Provider schemas with the configured replacement policies applied.
    pub fn apply_replace_policies(&self, schemas: &mut SchemaSet) {
        for (kind, policy) in &self.replace {
            if !schemas.set_replace_policy(kind, *policy) {
                tracing::warn!(kind = %kind, "replace policy for unknown resource type ignored");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clusterform_provider::cloud_schemas;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: ClusterformConfig = toml::from_str(
            r#"
[executor]
concurrency = 8

[retry]
max_attempts = 2
initial_delay = 10

[replace]
node_pool = "create_before_destroy"
"#,
        )
        .unwrap();
        assert_eq!(config.executor.concurrency, 8);
        assert_eq!(config.executor.runs_dir, Some(PathBuf::from(".clusterform/runs")));
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.initial_delay, Duration::from_millis(10));
        assert_eq!(config.state.dir, PathBuf::from(".clusterform/state"));
        assert_eq!(config.log.level, "clusterform=info");

        let mut schemas = cloud_schemas();
        config.apply_replace_policies(&mut schemas);
        assert_eq!(
            schemas.get("node_pool").unwrap().replace_policy,
            ReplacePolicy::CreateBeforeDestroy
        );
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ClusterformConfig::load(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(config.executor.concurrency, 4);
        assert_eq!(config.state.dir, PathBuf::from(".clusterform/state"));
    }

    #[test]
    fn broken_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let broken = tmp.path().join("clusterform.toml");
        std::fs::write(&broken, "[state]\ndir = \"/srv/state\"\n[executor\nconcurrency = ").unwrap();
        let err = ClusterformConfig::load(&broken).unwrap_err();
        assert!(format!("{err:#}").contains("clusterform.toml"), "{err:#}");
    }

    #[test]
    fn default_config_round_trips_through_toml() {
        let text = ClusterformConfig::default().to_toml();
        let parsed: ClusterformConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.state.dir, PathBuf::from(".clusterform/state"));
        assert_eq!(parsed.retry, RetryConfig::default());
    }
}
