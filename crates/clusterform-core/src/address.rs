//! Resource instance identity.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Identity of a single resource instance: `(type, name)` or, for resources
/// declared over an iteration set, `(type, name, key)`.
///
/// Renders as `cluster.main` or `cluster.main["ams3"]`.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ResourceAddress {
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl ResourceAddress {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            key: None,
        }
    }

    pub fn keyed(kind: impl Into<String>, name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            key: Some(key.into()),
        }
    }

    pub fn with_key(kind: &str, name: &str, key: Option<&str>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            key: key.map(str::to_string),
        }
    }

    /// `type.name` without the instance key.
    pub fn declaration(&self) -> String {
        format!("{}.{}", self.kind, self.name)
    }

    pub fn belongs_to(&self, kind: &str, name: &str) -> bool {
        self.kind == kind && self.name == name
    }

    /// Parse `type.name` or `type.name["key"]`.
    pub fn parse(s: &str) -> Result<Self> {
        let bad = || Error::ConfigError(format!("invalid resource address: {s}"));
        let (head, key) = match s.find('[') {
            Some(open) => {
                let rest = &s[open..];
                let inner = rest
                    .strip_prefix("[\"")
                    .and_then(|r| r.strip_suffix("\"]"))
                    .ok_or_else(bad)?;
                (&s[..open], Some(inner.to_string()))
            }
            None => (s, None),
        };
        let (kind, name) = head.split_once('.').ok_or_else(bad)?;
        if kind.is_empty() || name.is_empty() || name.contains('.') {
            return Err(bad());
        }
        Ok(Self {
            kind: kind.into(),
            name: name.into(),
            key,
        })
    }

    /// Stable file-name stem for filesystem backends. Keys are hex-encoded so
    /// arbitrary key text never collides or escapes the directory.
    pub fn file_stem(&self) -> String {
        match &self.key {
            None => format!("{}.{}", self.kind, self.name),
            Some(key) => {
                let hex: String = key.bytes().map(|b| format!("{b:02x}")).collect();
                format!("{}.{}.k{}", self.kind, self.name, hex)
            }
        }
    }
}

impl std::fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.key {
            None => write!(f, "{}.{}", self.kind, self.name),
            Some(key) => write!(f, "{}.{}[\"{}\"]", self.kind, self.name, key),
        }
    }
}

// Ordered by the rendered identity string so plans are reproducible.
impl Ord for ResourceAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_string().cmp(&other.to_string())
    }
}

impl PartialOrd for ResourceAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_plain_and_keyed() {
        assert_eq!(ResourceAddress::new("namespace", "app").to_string(), "namespace.app");
        assert_eq!(
            ResourceAddress::keyed("cluster", "main", "ams3").to_string(),
            r#"cluster.main["ams3"]"#
        );
    }

    #[test]
    fn parse_matches_display() {
        let addr = ResourceAddress::parse(r#"cluster.main["nyc1"]"#).unwrap();
        assert_eq!(addr, ResourceAddress::keyed("cluster", "main", "nyc1"));
        let plain = ResourceAddress::parse("namespace.app").unwrap();
        assert_eq!(plain.key, None);
        assert!(ResourceAddress::parse("cluster").is_err());
        assert!(ResourceAddress::parse("cluster.main[nyc1]").is_err());
    }

    #[test]
    fn ordering_follows_identity_string() {
        let mut addrs = vec![
            ResourceAddress::keyed("cluster", "main", "nyc1"),
            ResourceAddress::new("namespace", "app"),
            ResourceAddress::keyed("cluster", "main", "ams3"),
        ];
        addrs.sort();
        let rendered: Vec<String> = addrs.iter().map(|a| a.to_string()).collect();
        assert_eq!(
            rendered,
            vec![r#"cluster.main["ams3"]"#, r#"cluster.main["nyc1"]"#, "namespace.app"]
        );
    }

    #[test]
    fn file_stem_hex_encodes_key() {
        let addr = ResourceAddress::keyed("cluster", "main", "a/b");
        assert_eq!(addr.file_stem(), "cluster.main.k612f62");
    }
}
