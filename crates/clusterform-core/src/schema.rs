//! Resource type schemas.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a resource whose identity-defining attribute changed is replaced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplacePolicy {
    /// Create the replacement, move dependents onto it, then delete the old object.
    CreateBeforeDestroy,
    /// Delete the old object first, then create the replacement.
    DestroyBeforeCreate,
}

impl std::fmt::Display for ReplacePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreateBeforeDestroy => write!(f, "create_before_destroy"),
            Self::DestroyBeforeCreate => write!(f, "destroy_before_create"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttributeMode {
    Required,
    Optional,
    /// Set by the provider, never declared.
    Computed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttributeSchema {
    pub mode: AttributeMode,
    /// Changing this attribute forces a replacement.
    pub force_new: bool,
    pub sensitive: bool,
}

impl AttributeSchema {
    pub fn required() -> Self {
        Self {
            mode: AttributeMode::Required,
            force_new: false,
            sensitive: false,
        }
    }

    pub fn optional() -> Self {
        Self {
            mode: AttributeMode::Optional,
            ..Self::required()
        }
    }

    pub fn computed() -> Self {
        Self {
            mode: AttributeMode::Computed,
            ..Self::required()
        }
    }

    pub fn force_new(mut self) -> Self {
        self.force_new = true;
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn is_argument(&self) -> bool {
        self.mode != AttributeMode::Computed
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResourceSchema {
    pub kind: String,
    pub attributes: BTreeMap<String, AttributeSchema>,
    pub replace_policy: ReplacePolicy,
}

impl ResourceSchema {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            attributes: BTreeMap::new(),
            replace_policy: ReplacePolicy::DestroyBeforeCreate,
        }
    }

    pub fn attribute(mut self, name: &str, schema: AttributeSchema) -> Self {
        self.attributes.insert(name.into(), schema);
        self
    }

    pub fn replace_policy(mut self, policy: ReplacePolicy) -> Self {
        self.replace_policy = policy;
        self
    }

    pub fn get(&self, name: &str) -> Option<&AttributeSchema> {
        self.attributes.get(name)
    }

    /// Declarable attributes (required and optional).
    pub fn arguments(&self) -> impl Iterator<Item = (&String, &AttributeSchema)> {
        self.attributes.iter().filter(|(_, a)| a.is_argument())
    }

    pub fn required(&self) -> impl Iterator<Item = &String> {
        self.attributes
            .iter()
            .filter(|(_, a)| a.mode == AttributeMode::Required)
            .map(|(name, _)| name)
    }

    pub fn is_argument(&self, name: &str) -> bool {
        self.get(name).map(|a| a.is_argument()).unwrap_or(false)
    }

    pub fn is_force_new(&self, name: &str) -> bool {
        self.get(name).map(|a| a.force_new).unwrap_or(false)
    }

    pub fn is_sensitive(&self, name: &str) -> bool {
        self.get(name).map(|a| a.sensitive).unwrap_or(false)
    }
}

/// Schemas for every resource type a provider serves.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SchemaSet {
    schemas: BTreeMap<String, ResourceSchema>,
}

impl SchemaSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, schema: ResourceSchema) -> Self {
        self.insert(schema);
        self
    }

    pub fn insert(&mut self, schema: ResourceSchema) {
        self.schemas.insert(schema.kind.clone(), schema);
    }

    pub fn get(&self, kind: &str) -> Option<&ResourceSchema> {
        self.schemas.get(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &String> {
        self.schemas.keys()
    }

    /// Override the replacement policy of a resource type. Returns `false`
    /// if the type is unknown.
    pub fn set_replace_policy(&mut self, kind: &str, policy: ReplacePolicy) -> bool {
        match self.schemas.get_mut(kind) {
            Some(schema) => {
                schema.replace_policy = policy;
                true
            }
            None => false,
        }
    }
}
