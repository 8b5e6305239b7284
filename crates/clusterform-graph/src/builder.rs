//! Resource Graph Builder
//!
//! Expands declarations over their iteration sets, validates every attribute
//! against the resource type's schema, resolves references to concrete
//! instances, and rejects cycles. No side effects.

use crate::graph::{InstanceNode, OutputNode, ResourceGraph};
use clusterform_core::expr::Selector;
use clusterform_core::{
    Document, EachBinding, Error, EvalContext, ReplacePolicy, Resolved, ResourceAddress,
    ResourceDecl, ResourceRef, Result, SchemaSet, Template,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

pub struct GraphBuilder<'a> {
    schemas: &'a SchemaSet,
}

/// Variables only; used for `for_each`, which must be known before any
/// resource exists.
struct VariableScope<'a>(&'a BTreeMap<String, Value>);

impl EvalContext for VariableScope<'_> {
    fn variable(&self, name: &str) -> Option<Value> {
        self.0.get(name).cloned()
    }

    fn each(&self) -> Option<&EachBinding> {
        None
    }

    fn instance_keys(&self, _kind: &str, _name: &str) -> Option<Vec<Option<String>>> {
        None
    }

    fn attribute(&self, _address: &ResourceAddress, _attribute: &str) -> Option<Resolved> {
        None
    }
}

impl<'a> GraphBuilder<'a> {
    pub fn new(schemas: &'a SchemaSet) -> Self {
        Self { schemas }
    }

    pub fn build(
        &self,
        doc: &Document,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<ResourceGraph> {
        let variables = doc.resolve_variables(overrides)?;
        let sensitive_vars: BTreeSet<&str> = doc.sensitive_variables().into_iter().collect();

        let mut graph = ResourceGraph {
            variables: variables.clone(),
            ..Default::default()
        };

        // Declarations and their instance keys first, so references can be
        // checked against every declaration regardless of file order.
        let mut decls: BTreeMap<(String, String), &ResourceDecl> = BTreeMap::new();
        let mut expanded: BTreeMap<(String, String), Vec<Option<EachBinding>>> = BTreeMap::new();
        for decl in &doc.resources {
            if decls
                .insert((decl.kind.clone(), decl.name.clone()), decl)
                .is_some()
            {
                return Err(Error::PlanConflict {
                    address: decl.label(),
                });
            }
            let keys = self.expand(decl, &variables)?;
            graph.instances.insert(
                (decl.kind.clone(), decl.name.clone()),
                keys.iter().map(|e| e.as_ref().map(|b| b.key.clone())).collect(),
            );
            expanded.insert((decl.kind.clone(), decl.name.clone()), keys);
        }

        for (id, decl) in &decls {
            let schema = self.schemas.get(&decl.kind).ok_or_else(|| Error::UnknownResourceType {
                resource: decl.label(),
                kind: decl.kind.clone(),
            })?;

            for name in decl.attributes.keys() {
                match schema.get(name) {
                    None => {
                        return Err(Error::invalid(
                            decl.label(),
                            format!("unknown attribute '{name}'"),
                        ))
                    }
                    Some(a) if !a.is_argument() => {
                        return Err(Error::invalid(
                            decl.label(),
                            format!("'{name}' is computed by the provider and cannot be set"),
                        ))
                    }
                    Some(_) => {}
                }
            }
            if let Some(name) = schema.required().find(|n| !decl.attributes.contains_key(*n)) {
                return Err(Error::invalid(
                    decl.label(),
                    format!("missing required attribute '{name}'"),
                ));
            }

            let templates: BTreeMap<String, Template> = decl
                .attributes
                .iter()
                .map(|(name, value)| {
                    Template::parse(value)
                        .map(|t| (name.clone(), t))
                        .map_err(|e| Error::invalid(decl.label(), e.to_string()))
                })
                .collect::<Result<_>>()?;

            if decl.for_each.is_none() && templates.values().any(Template::uses_each) {
                return Err(Error::invalid(
                    decl.label(),
                    "each.key and each.value require for_each",
                ));
            }

            let mut sensitive = BTreeSet::new();
            for (name, template) in &templates {
                let secret = schema.is_sensitive(name)
                    || template.variables().iter().any(|v| sensitive_vars.contains(v))
                    || template.references().iter().any(|r| {
                        self.schemas
                            .get(&r.kind)
                            .map(|s| s.is_sensitive(&r.attribute))
                            .unwrap_or(false)
                    });
                if secret {
                    sensitive.insert(name.clone());
                }
            }

            let replace_policy = match decl.lifecycle.create_before_destroy {
                Some(true) => ReplacePolicy::CreateBeforeDestroy,
                Some(false) => ReplacePolicy::DestroyBeforeCreate,
                None => schema.replace_policy,
            };

            for each in expanded.remove(id).unwrap_or_default() {
                let address = ResourceAddress::with_key(
                    &decl.kind,
                    &decl.name,
                    each.as_ref().map(|b| b.key.as_str()),
                );
                let label = address.to_string();
                let mut depends_on = BTreeSet::new();

                for template in templates.values() {
                    for var in template.variables() {
                        if !variables.contains_key(var) {
                            return Err(Error::unresolved(
                                &label,
                                format!("var.{var}"),
                                "undeclared variable",
                            ));
                        }
                    }
                    for r in template.references() {
                        depends_on.extend(self.resolve(&graph, &label, each.as_ref(), r)?);
                    }
                }
                for target in &decl.depends_on {
                    depends_on.extend(self.resolve_explicit(&graph, &label, target)?);
                }

                if depends_on.contains(&address) {
                    return Err(Error::CyclicDependency {
                        cycle: vec![label.clone(), label],
                    });
                }

                graph.nodes.insert(
                    address.clone(),
                    InstanceNode {
                        address,
                        each,
                        attributes: templates.clone(),
                        sensitive: sensitive.clone(),
                        depends_on,
                        replace_policy,
                    },
                );
            }
        }

        for (name, out) in &doc.outputs {
            let label = format!("output.{name}");
            let value = Template::parse(&out.value)
                .map_err(|e| Error::invalid(&label, e.to_string()))?;
            if value.uses_each() {
                return Err(Error::invalid(&label, "outputs cannot use each"));
            }
            for var in value.variables() {
                if !variables.contains_key(var) {
                    return Err(Error::unresolved(&label, format!("var.{var}"), "undeclared variable"));
                }
            }
            for r in value.references() {
                self.resolve(&graph, &label, None, r)?;
            }
            let sensitive = out.sensitive
                || value.variables().iter().any(|v| sensitive_vars.contains(v))
                || value.references().iter().any(|r| {
                    self.schemas
                        .get(&r.kind)
                        .map(|s| s.is_sensitive(&r.attribute))
                        .unwrap_or(false)
                });
            graph.outputs.insert(
                name.clone(),
                OutputNode {
                    value,
                    description: out.description.clone(),
                    sensitive,
                },
            );
        }

        graph.link();
        if let Some(cycle) = graph.find_cycle() {
            return Err(Error::CyclicDependency {
                cycle: cycle.iter().map(ToString::to_string).collect(),
            });
        }
        graph.sort();

        debug!(
            instances = graph.len(),
            declarations = decls.len(),
            "resource graph built"
        );
        Ok(graph)
    }

    /// Instances of one declaration: `[None]` without `for_each`, otherwise
    /// one binding per element in key order.
    fn expand(
        &self,
        decl: &ResourceDecl,
        variables: &BTreeMap<String, Value>,
    ) -> Result<Vec<Option<EachBinding>>> {
        let Some(raw) = &decl.for_each else {
            return Ok(vec![None]);
        };
        let template = Template::parse(raw).map_err(|e| Error::invalid(decl.label(), e.to_string()))?;
        if !template.references().is_empty() {
            return Err(Error::invalid(
                decl.label(),
                "for_each must be known at plan time and cannot reference resources",
            ));
        }
        for var in template.variables() {
            if !variables.contains_key(var) {
                return Err(Error::unresolved(
                    decl.label(),
                    format!("var.{var}"),
                    "undeclared variable",
                ));
            }
        }
        let value = match template.evaluate(&VariableScope(variables)) {
            Ok(Resolved::Known(v)) => v,
            Ok(Resolved::Unknown) => {
                return Err(Error::invalid(decl.label(), "for_each must be known at plan time"))
            }
            Err(e) => return Err(Error::invalid(decl.label(), e.to_string())),
        };

        let mut bindings: BTreeMap<String, Value> = BTreeMap::new();
        let mut add = |key: String, value: Value| -> Result<()> {
            if bindings.insert(key.clone(), value).is_some() {
                return Err(Error::PlanConflict {
                    address: ResourceAddress::keyed(&decl.kind, &decl.name, key).to_string(),
                });
            }
            Ok(())
        };
        match value {
            Value::Array(items) => {
                for item in items {
                    let Value::String(key) = item else {
                        return Err(Error::invalid(
                            decl.label(),
                            "for_each list elements must be strings",
                        ));
                    };
                    add(key.clone(), Value::String(key))?;
                }
            }
            Value::Object(map) => {
                for (key, value) in map {
                    add(key, value)?;
                }
            }
            _ => {
                return Err(Error::invalid(
                    decl.label(),
                    "for_each must be a list of strings or a map",
                ))
            }
        }

        Ok(bindings
            .into_iter()
            .map(|(key, value)| Some(EachBinding { key, value }))
            .collect())
    }

    /// Concrete instances a reference points at.
    fn resolve(
        &self,
        graph: &ResourceGraph,
        from: &str,
        each: Option<&EachBinding>,
        r: &ResourceRef,
    ) -> Result<Vec<ResourceAddress>> {
        let fail = |reason: &str| Error::unresolved(from, r.to_string(), reason);
        let keys = graph
            .instance_keys(&r.kind, &r.name)
            .ok_or_else(|| fail("no such resource"))?;
        let iterated = keys.first().map(Option::is_some).unwrap_or(false);

        let schema = self
            .schemas
            .get(&r.kind)
            .ok_or_else(|| fail("unknown resource type"))?;
        if schema.get(&r.attribute).is_none() {
            return Err(fail(&format!("{} has no attribute '{}'", r.kind, r.attribute)));
        }

        let keyed = |key: &str| -> Result<Vec<ResourceAddress>> {
            if !iterated {
                return Err(fail("resource has no for_each; drop the instance key"));
            }
            if !keys.iter().any(|k| k.as_deref() == Some(key)) {
                return Err(fail(&format!("no instance with key \"{key}\"")));
            }
            Ok(vec![ResourceAddress::keyed(&r.kind, &r.name, key)])
        };

        match &r.selector {
            Selector::Single if iterated => Err(fail(
                "resource has for_each; select an instance with [\"key\"], [each.key] or [*]",
            )),
            Selector::Single => Ok(vec![ResourceAddress::new(&r.kind, &r.name)]),
            Selector::Key(key) => keyed(key),
            Selector::EachKey => match each {
                Some(binding) => keyed(&binding.key),
                None => Err(fail("each.key used outside of a for_each resource")),
            },
            Selector::Splat => Ok(keys
                .iter()
                .map(|k| ResourceAddress::with_key(&r.kind, &r.name, k.as_deref()))
                .collect()),
        }
    }

    fn resolve_explicit(
        &self,
        graph: &ResourceGraph,
        from: &str,
        target: &str,
    ) -> Result<Vec<ResourceAddress>> {
        let address = ResourceAddress::parse(target)
            .map_err(|_| Error::unresolved(from, target, "not a resource address"))?;
        let keys = graph
            .instance_keys(&address.kind, &address.name)
            .ok_or_else(|| Error::unresolved(from, target, "no such resource"))?;
        match &address.key {
            None => Ok(keys
                .iter()
                .map(|k| ResourceAddress::with_key(&address.kind, &address.name, k.as_deref()))
                .collect()),
            Some(key) if keys.iter().any(|k| k.as_deref() == Some(key)) => Ok(vec![address]),
            Some(key) => Err(Error::unresolved(
                from,
                target,
                format!("no instance with key \"{key}\""),
            )),
        }
    }
}
