//! Declaration documents: the desired state, as written by the operator.
//!
//! ```yaml
//! variables:
//!   regions:
//!     default: ["ams3", "nyc1"]
//! resources:
//!   - type: cluster
//!     name: main
//!     for_each: "${var.regions}"
//!     attributes:
//!       name: "k8s-${each.key}"
//!       region: "${each.value}"
//! outputs:
//!   endpoints:
//!     value: "${cluster.main[*].endpoint}"
//! ```

use crate::error::{Error, Result};
use crate::value::Attributes;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Document {
    #[serde(default)]
    pub variables: BTreeMap<String, VariableDecl>,
    #[serde(default)]
    pub resources: Vec<ResourceDecl>,
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputDecl>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VariableDecl {
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub sensitive: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Lifecycle {
    /// Overrides the resource type's replacement policy.
    #[serde(default)]
    pub create_before_destroy: Option<bool>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceDecl {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    /// Iteration set: a list of strings, a map, or an expression yielding one.
    #[serde(default)]
    pub for_each: Option<Value>,
    /// Explicit ordering edges, as `type.name` or `type.name["key"]`.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub lifecycle: Lifecycle,
    #[serde(default)]
    pub attributes: Attributes,
}

impl ResourceDecl {
    pub fn label(&self) -> String {
        format!("{}.{}", self.kind, self.name)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputDecl {
    pub value: Value,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub sensitive: bool,
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*$").expect("static regex"))
}

pub fn is_valid_name(name: &str) -> bool {
    name_pattern().is_match(name)
}

impl Document {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let doc: Self = serde_yaml::from_str(text)?;
        doc.check_names()?;
        Ok(doc)
    }

    /// Load a single file, or every `*.yaml`/`*.yml` file of a directory
    /// merged in file-name order.
    pub fn load(path: &Path) -> Result<Self> {
        if path.is_dir() {
            let mut files: Vec<_> = std::fs::read_dir(path)?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| {
                    matches!(
                        p.extension().and_then(|e| e.to_str()),
                        Some("yaml") | Some("yml")
                    )
                })
                .collect();
            files.sort();
            if files.is_empty() {
                return Err(Error::ConfigError(format!(
                    "no declaration files in {}",
                    path.display()
                )));
            }
            let mut merged = Self::default();
            for file in files {
                let doc = Self::from_yaml(&std::fs::read_to_string(&file)?)?;
                merged.merge(doc)?;
            }
            Ok(merged)
        } else {
            Self::from_yaml(&std::fs::read_to_string(path)?)
        }
    }

    pub fn merge(&mut self, other: Document) -> Result<()> {
        for (name, var) in other.variables {
            if self.variables.insert(name.clone(), var).is_some() {
                return Err(Error::ConfigError(format!("variable '{name}' declared twice")));
            }
        }
        for (name, out) in other.outputs {
            if self.outputs.insert(name.clone(), out).is_some() {
                return Err(Error::ConfigError(format!("output '{name}' declared twice")));
            }
        }
        self.resources.extend(other.resources);
        Ok(())
    }

    fn check_names(&self) -> Result<()> {
        for name in self.variables.keys().chain(self.outputs.keys()) {
            if !is_valid_name(name) {
                return Err(Error::ConfigError(format!("invalid name '{name}'")));
            }
        }
        for r in &self.resources {
            if !is_valid_name(&r.kind) || !is_valid_name(&r.name) {
                return Err(Error::invalid(r.label(), "type and name must be identifiers"));
            }
        }
        Ok(())
    }

    /// Final variable values: overrides first, then declared defaults.
    pub fn resolve_variables(
        &self,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<BTreeMap<String, Value>> {
        if let Some(name) = overrides.keys().find(|n| !self.variables.contains_key(*n)) {
            return Err(Error::ConfigError(format!(
                "value given for undeclared variable '{name}'"
            )));
        }
        self.variables
            .iter()
            .map(|(name, decl)| {
                overrides
                    .get(name)
                    .or(decl.default.as_ref())
                    .cloned()
                    .map(|v| (name.clone(), v))
                    .ok_or_else(|| Error::ConfigError(format!("variable '{name}' has no value")))
            })
            .collect()
    }

    pub fn sensitive_variables(&self) -> Vec<&str> {
        self.variables
            .iter()
            .filter(|(_, v)| v.sensitive)
            .map(|(n, _)| n.as_str())
            .collect()
    }
}

/// Parse a `NAME=VALUE` override. The value is read as JSON when it parses,
/// otherwise as a plain string.
pub fn parse_variable_override(arg: &str) -> Result<(String, Value)> {
    let (name, raw) = arg
        .split_once('=')
        .ok_or_else(|| Error::ConfigError(format!("expected NAME=VALUE, got '{arg}'")))?;
    let name = name.trim();
    if !is_valid_name(name) {
        return Err(Error::ConfigError(format!("invalid variable name '{name}'")));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((name.to_string(), value))
}
