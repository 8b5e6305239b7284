//! Attribute values, known and not-yet-known.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Attribute name → value, as stored in state and sent to providers.
pub type Attributes = BTreeMap<String, Value>;

/// Attribute name → value as computed at plan time.
pub type PlannedAttributes = BTreeMap<String, Resolved>;

/// A value at plan time: either known, or only known once an upstream
/// operation has completed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "lowercase")]
pub enum Resolved {
    Known(Value),
    Unknown,
}

impl Resolved {
    pub fn null() -> Self {
        Self::Known(Value::Null)
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Self::Known(_))
    }

    pub fn known(&self) -> Option<&Value> {
        match self {
            Self::Known(v) => Some(v),
            Self::Unknown => None,
        }
    }

    pub fn into_known(self) -> Option<Value> {
        match self {
            Self::Known(v) => Some(v),
            Self::Unknown => None,
        }
    }
}

impl From<Value> for Resolved {
    fn from(v: Value) -> Self {
        Self::Known(v)
    }
}

/// Render a value for interpolation into a string. Lists and maps cannot be
/// interpolated and return `None`.
pub fn interpolate(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some(String::new()),
        Value::Array(_) | Value::Object(_) => None,
    }
}

/// Compact human rendering used in plan output.
pub fn display(value: &Value) -> String {
    match value {
        Value::String(s) => format!("{s:?}"),
        other => other.to_string(),
    }
}
