//! Expression templates embedded in attribute values.
//!
//! A string attribute may contain `${...}` references:
//!
//! - `var.regions`: an input variable
//! - `each.key` / `each.value`: the current iteration element
//! - `cluster.main.id`, `cluster.main["ams3"].endpoint`,
//!   `cluster.main[each.key].kube_config[0].token`, `cluster.main[*].urn`
//! - `base64decode(...)`, `base64encode(...)`, `jsonencode(...)`
//!
//! A string that is exactly one `${...}` evaluates to the referenced value
//! with its own type. Anything else interpolates into a string. `$${` is a
//! literal `${`.

use crate::address::ResourceAddress;
use crate::error::{Error, Result};
use crate::value::{self, Resolved};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq)]
pub enum PathStep {
    Field(String),
    Index(usize),
    Key(String),
}

/// Which instance(s) of a declaration a reference points at.
#[derive(Clone, Debug, PartialEq)]
pub enum Selector {
    /// Declaration without an iteration set.
    Single,
    Key(String),
    /// `[each.key]`: the instance with the same key as the referrer.
    EachKey,
    /// `[*]`: every instance, in key order.
    Splat,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResourceRef {
    pub kind: String,
    pub name: String,
    pub selector: Selector,
    pub attribute: String,
    pub path: Vec<PathStep>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EachField {
    Key,
    Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Function {
    Base64Decode,
    Base64Encode,
    JsonEncode,
}

impl Function {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "base64decode" => Some(Self::Base64Decode),
            "base64encode" => Some(Self::Base64Encode),
            "jsonencode" => Some(Self::JsonEncode),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Base64Decode => "base64decode",
            Self::Base64Encode => "base64encode",
            Self::JsonEncode => "jsonencode",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Variable { name: String, path: Vec<PathStep> },
    Each { field: EachField, path: Vec<PathStep> },
    Resource(ResourceRef),
    Call { function: Function, arg: Box<Expr> },
}

/// The iteration element a resource instance was expanded from.
#[derive(Clone, Debug, PartialEq)]
pub struct EachBinding {
    pub key: String,
    pub value: Value,
}

/// Everything an expression can look up while evaluating.
pub trait EvalContext {
    fn variable(&self, name: &str) -> Option<Value>;

    fn each(&self) -> Option<&EachBinding>;

    /// Instance keys of a declaration in key order; `None` if undeclared.
    fn instance_keys(&self, kind: &str, name: &str) -> Option<Vec<Option<String>>>;

    /// One attribute of one resource instance; `None` if there is no such
    /// instance or attribute.
    fn attribute(&self, address: &ResourceAddress, attribute: &str) -> Option<Resolved>;
}

// ---------------------------------------------------------------------------
// Display
// ---------------------------------------------------------------------------

fn fmt_path(f: &mut std::fmt::Formatter<'_>, path: &[PathStep]) -> std::fmt::Result {
    for step in path {
        match step {
            PathStep::Field(name) => write!(f, ".{name}")?,
            PathStep::Index(i) => write!(f, "[{i}]")?,
            PathStep::Key(k) => write!(f, "[{k:?}]")?,
        }
    }
    Ok(())
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.kind, self.name)?;
        match &self.selector {
            Selector::Single => {}
            Selector::Key(k) => write!(f, "[{k:?}]")?,
            Selector::EachKey => write!(f, "[each.key]")?,
            Selector::Splat => write!(f, "[*]")?,
        }
        write!(f, ".{}", self.attribute)?;
        fmt_path(f, &self.path)
    }
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Variable { name, path } => {
                write!(f, "var.{name}")?;
                fmt_path(f, path)
            }
            Self::Each { field, path } => {
                match field {
                    EachField::Key => write!(f, "each.key")?,
                    EachField::Value => write!(f, "each.value")?,
                }
                fmt_path(f, path)
            }
            Self::Resource(r) => write!(f, "{r}"),
            Self::Call { function, arg } => write!(f, "{}({})", function.name(), arg),
        }
    }
}

// ---------------------------------------------------------------------------
// Expression parser
// ---------------------------------------------------------------------------

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.bump();
        }
    }

    fn error(&self, message: &str) -> Error {
        Error::expression(format!("{message} at offset {} in '{}'", self.pos, self.src))
    }

    fn expect(&mut self, want: char) -> Result<()> {
        match self.bump() {
            Some(c) if c == want => Ok(()),
            _ => Err(self.error(&format!("expected '{want}'"))),
        }
    }

    fn ident(&mut self) -> Result<String> {
        let start = self.pos;
        match self.peek() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                self.bump();
            }
            _ => return Err(self.error("expected identifier")),
        }
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            self.bump();
        }
        Ok(self.src[start..self.pos].to_string())
    }

    fn string(&mut self) -> Result<String> {
        self.expect('"')?;
        let mut out = String::new();
        loop {
            match self.bump() {
                Some('"') => return Ok(out),
                Some('\\') => match self.bump() {
                    Some(c) => out.push(c),
                    None => return Err(self.error("unterminated escape")),
                },
                Some(c) => out.push(c),
                None => return Err(self.error("unterminated string")),
            }
        }
    }

    fn number(&mut self) -> Result<usize> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.bump();
        }
        self.src[start..self.pos]
            .parse()
            .map_err(|_| self.error("expected index"))
    }

    fn path(&mut self) -> Result<Vec<PathStep>> {
        let mut path = Vec::new();
        loop {
            match self.peek() {
                Some('.') => {
                    self.bump();
                    path.push(PathStep::Field(self.ident()?));
                }
                Some('[') => {
                    self.bump();
                    self.skip_ws();
                    if self.peek() == Some('"') {
                        path.push(PathStep::Key(self.string()?));
                    } else {
                        path.push(PathStep::Index(self.number()?));
                    }
                    self.skip_ws();
                    self.expect(']')?;
                }
                _ => return Ok(path),
            }
        }
    }

    fn selector(&mut self) -> Result<Selector> {
        if self.peek() != Some('[') {
            return Ok(Selector::Single);
        }
        self.bump();
        self.skip_ws();
        let selector = match self.peek() {
            Some('*') => {
                self.bump();
                Selector::Splat
            }
            Some('"') => Selector::Key(self.string()?),
            _ => {
                let head = self.ident()?;
                self.expect('.')?;
                let field = self.ident()?;
                if head != "each" || field != "key" {
                    return Err(self.error("instance selector must be \"key\", each.key or *"));
                }
                Selector::EachKey
            }
        };
        self.skip_ws();
        self.expect(']')?;
        Ok(selector)
    }

    fn expr(&mut self) -> Result<Expr> {
        self.skip_ws();
        let head = self.ident()?;
        self.skip_ws();

        if self.peek() == Some('(') {
            self.bump();
            let function = Function::from_name(&head)
                .ok_or_else(|| self.error(&format!("unknown function '{head}'")))?;
            let arg = self.expr()?;
            self.skip_ws();
            self.expect(')')?;
            return Ok(Expr::Call {
                function,
                arg: Box::new(arg),
            });
        }

        match head.as_str() {
            "var" => {
                self.expect('.')?;
                let name = self.ident()?;
                let path = self.path()?;
                Ok(Expr::Variable { name, path })
            }
            "each" => {
                self.expect('.')?;
                let field = match self.ident()?.as_str() {
                    "key" => EachField::Key,
                    "value" => EachField::Value,
                    other => return Err(self.error(&format!("each has no field '{other}'"))),
                };
                let path = self.path()?;
                Ok(Expr::Each { field, path })
            }
            _ => {
                self.expect('.')?;
                let name = self.ident()?;
                let selector = self.selector()?;
                if self.peek() != Some('.') {
                    return Err(self.error("expected attribute after resource reference"));
                }
                self.bump();
                let attribute = self.ident()?;
                let path = self.path()?;
                Ok(Expr::Resource(ResourceRef {
                    kind: head,
                    name,
                    selector,
                    attribute,
                    path,
                }))
            }
        }
    }
}

impl Expr {
    pub fn parse(src: &str) -> Result<Self> {
        let mut parser = Parser::new(src);
        let expr = parser.expr()?;
        parser.skip_ws();
        if parser.pos != src.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(expr)
    }

    fn collect_refs<'a>(&'a self, out: &mut Vec<&'a ResourceRef>) {
        match self {
            Self::Resource(r) => out.push(r),
            Self::Call { arg, .. } => arg.collect_refs(out),
            _ => {}
        }
    }

    fn collect_vars<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Variable { name, .. } => out.push(name),
            Self::Call { arg, .. } => arg.collect_vars(out),
            _ => {}
        }
    }

    fn uses_each(&self) -> bool {
        match self {
            Self::Each { .. } => true,
            Self::Resource(r) => r.selector == Selector::EachKey,
            Self::Call { arg, .. } => arg.uses_each(),
            Self::Variable { .. } => false,
        }
    }

    pub fn evaluate(&self, ctx: &dyn EvalContext) -> Result<Resolved> {
        match self {
            Self::Variable { name, path } => {
                let value = ctx
                    .variable(name)
                    .ok_or_else(|| Error::expression(format!("undeclared variable '{name}'")))?;
                apply_path(&value, path, self).map(Resolved::Known)
            }
            Self::Each { field, path } => {
                let each = ctx.each().ok_or_else(|| {
                    Error::expression(format!("'{self}' used outside of a for_each resource"))
                })?;
                let base = match field {
                    EachField::Key => Value::String(each.key.clone()),
                    EachField::Value => each.value.clone(),
                };
                apply_path(&base, path, self).map(Resolved::Known)
            }
            Self::Resource(r) => self.evaluate_ref(r, ctx),
            Self::Call { function, arg } => match arg.evaluate(ctx)? {
                Resolved::Unknown => Ok(Resolved::Unknown),
                Resolved::Known(v) => call(*function, v).map(Resolved::Known),
            },
        }
    }

    fn evaluate_ref(&self, r: &ResourceRef, ctx: &dyn EvalContext) -> Result<Resolved> {
        let single = |address: ResourceAddress| -> Result<Resolved> {
            match ctx.attribute(&address, &r.attribute) {
                None => Err(Error::expression(format!(
                    "'{self}': {address} has no attribute '{}'",
                    r.attribute
                ))),
                Some(Resolved::Unknown) => Ok(Resolved::Unknown),
                Some(Resolved::Known(v)) => apply_path(&v, &r.path, self).map(Resolved::Known),
            }
        };

        match &r.selector {
            Selector::Single => single(ResourceAddress::new(&r.kind, &r.name)),
            Selector::Key(key) => single(ResourceAddress::keyed(&r.kind, &r.name, key)),
            Selector::EachKey => {
                let each = ctx.each().ok_or_else(|| {
                    Error::expression(format!("'{self}' used outside of a for_each resource"))
                })?;
                single(ResourceAddress::keyed(&r.kind, &r.name, &each.key))
            }
            Selector::Splat => {
                let keys = ctx.instance_keys(&r.kind, &r.name).ok_or_else(|| {
                    Error::expression(format!("'{self}': no resource {}.{}", r.kind, r.name))
                })?;
                let mut items = Vec::with_capacity(keys.len());
                let mut unknown = false;
                for key in keys {
                    let address = ResourceAddress::with_key(&r.kind, &r.name, key.as_deref());
                    match single(address)? {
                        Resolved::Known(v) => items.push(v),
                        Resolved::Unknown => unknown = true,
                    }
                }
                if unknown {
                    Ok(Resolved::Unknown)
                } else {
                    Ok(Resolved::Known(Value::Array(items)))
                }
            }
        }
    }
}

fn apply_path(value: &Value, path: &[PathStep], expr: &Expr) -> Result<Value> {
    let mut current = value;
    for step in path {
        current = match step {
            PathStep::Field(name) | PathStep::Key(name) => current.get(name.as_str()),
            PathStep::Index(i) => current.get(*i),
        }
        .ok_or_else(|| Error::expression(format!("'{expr}': path step {step:?} not found")))?;
    }
    Ok(current.clone())
}

fn call(function: Function, value: Value) -> Result<Value> {
    match function {
        Function::Base64Decode => {
            let text = value
                .as_str()
                .ok_or_else(|| Error::expression("base64decode expects a string"))?;
            let bytes = STANDARD
                .decode(text.trim())
                .map_err(|e| Error::expression(format!("base64decode: {e}")))?;
            String::from_utf8(bytes)
                .map(Value::String)
                .map_err(|_| Error::expression("base64decode: result is not valid UTF-8"))
        }
        Function::Base64Encode => {
            let text = value
                .as_str()
                .ok_or_else(|| Error::expression("base64encode expects a string"))?;
            Ok(Value::String(STANDARD.encode(text)))
        }
        Function::JsonEncode => Ok(Value::String(serde_json::to_string(&value)?)),
    }
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub enum Part {
    Text(String),
    Expr(Expr),
}

/// An attribute value with its embedded expressions parsed.
#[derive(Clone, Debug, PartialEq)]
pub enum Template {
    Literal(Value),
    Expr(Expr),
    Interpolated(Vec<Part>),
    List(Vec<Template>),
    Map(BTreeMap<String, Template>),
}

/// Index of the `}` closing an interpolation, skipping quoted strings.
fn find_close(body: &str) -> Option<usize> {
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in body.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
        } else {
            match c {
                '"' => in_string = true,
                '}' => return Some(i),
                _ => {}
            }
        }
    }
    None
}

fn parse_string(s: &str) -> Result<Template> {
    let mut parts = Vec::new();
    let mut text = String::new();
    let mut rest = s;

    while let Some(i) = rest.find("${") {
        if i > 0 && rest.as_bytes()[i - 1] == b'$' {
            text.push_str(&rest[..i - 1]);
            text.push_str("${");
            rest = &rest[i + 2..];
            continue;
        }
        text.push_str(&rest[..i]);
        let body = &rest[i + 2..];
        let close = find_close(body)
            .ok_or_else(|| Error::expression(format!("unterminated '${{' in '{s}'")))?;
        let expr = Expr::parse(&body[..close])?;
        if !text.is_empty() {
            parts.push(Part::Text(std::mem::take(&mut text)));
        }
        parts.push(Part::Expr(expr));
        rest = &body[close + 1..];
    }
    text.push_str(rest);
    if !text.is_empty() {
        parts.push(Part::Text(text));
    }

    let has_expr = parts.iter().any(|p| matches!(p, Part::Expr(_)));
    if !has_expr {
        let literal: String = parts
            .into_iter()
            .map(|p| match p {
                Part::Text(t) => t,
                Part::Expr(_) => String::new(),
            })
            .collect();
        return Ok(Template::Literal(Value::String(literal)));
    }
    if parts.len() == 1 {
        if let Some(Part::Expr(expr)) = parts.pop() {
            return Ok(Template::Expr(expr));
        }
    }
    Ok(Template::Interpolated(parts))
}

impl Template {
    pub fn parse(value: &Value) -> Result<Self> {
        match value {
            Value::String(s) => parse_string(s),
            Value::Array(items) => items
                .iter()
                .map(Template::parse)
                .collect::<Result<Vec<_>>>()
                .map(Template::List),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), Template::parse(v)?)))
                .collect::<Result<BTreeMap<_, _>>>()
                .map(Template::Map),
            other => Ok(Template::Literal(other.clone())),
        }
    }

    fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a Expr)) {
        match self {
            Self::Literal(_) => {}
            Self::Expr(e) => f(e),
            Self::Interpolated(parts) => {
                for part in parts {
                    if let Part::Expr(e) = part {
                        f(e);
                    }
                }
            }
            Self::List(items) => {
                for t in items {
                    t.walk(f);
                }
            }
            Self::Map(map) => {
                for t in map.values() {
                    t.walk(f);
                }
            }
        }
    }

    pub fn references(&self) -> Vec<&ResourceRef> {
        let mut out = Vec::new();
        self.walk(&mut |e| e.collect_refs(&mut out));
        out
    }

    pub fn variables(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.walk(&mut |e| e.collect_vars(&mut out));
        out
    }

    pub fn uses_each(&self) -> bool {
        let mut used = false;
        self.walk(&mut |e| used |= e.uses_each());
        used
    }

    pub fn evaluate(&self, ctx: &dyn EvalContext) -> Result<Resolved> {
        match self {
            Self::Literal(v) => Ok(Resolved::Known(v.clone())),
            Self::Expr(e) => e.evaluate(ctx),
            Self::Interpolated(parts) => {
                let mut out = String::new();
                let mut unknown = false;
                for part in parts {
                    match part {
                        Part::Text(t) => out.push_str(t),
                        Part::Expr(e) => match e.evaluate(ctx)? {
                            Resolved::Unknown => unknown = true,
                            Resolved::Known(v) => {
                                let text = value::interpolate(&v).ok_or_else(|| {
                                    Error::expression(format!(
                                        "'{e}' is a list or map and cannot be interpolated"
                                    ))
                                })?;
                                out.push_str(&text);
                            }
                        },
                    }
                }
                if unknown {
                    Ok(Resolved::Unknown)
                } else {
                    Ok(Resolved::Known(Value::String(out)))
                }
            }
            Self::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                let mut unknown = false;
                for item in items {
                    match item.evaluate(ctx)? {
                        Resolved::Known(v) => out.push(v),
                        Resolved::Unknown => unknown = true,
                    }
                }
                Ok(if unknown {
                    Resolved::Unknown
                } else {
                    Resolved::Known(Value::Array(out))
                })
            }
            Self::Map(map) => {
                let mut out = serde_json::Map::new();
                let mut unknown = false;
                for (k, t) in map {
                    match t.evaluate(ctx)? {
                        Resolved::Known(v) => {
                            out.insert(k.clone(), v);
                        }
                        Resolved::Unknown => unknown = true,
                    }
                }
                Ok(if unknown {
                    Resolved::Unknown
                } else {
                    Resolved::Known(Value::Object(out))
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Ctx {
        vars: BTreeMap<String, Value>,
        each: Option<EachBinding>,
        resources: BTreeMap<ResourceAddress, BTreeMap<String, Resolved>>,
    }

    impl EvalContext for Ctx {
        fn variable(&self, name: &str) -> Option<Value> {
            self.vars.get(name).cloned()
        }
        fn each(&self) -> Option<&EachBinding> {
            self.each.as_ref()
        }
        fn instance_keys(&self, kind: &str, name: &str) -> Option<Vec<Option<String>>> {
            let keys: Vec<_> = self
                .resources
                .keys()
                .filter(|a| a.belongs_to(kind, name))
                .map(|a| a.key.clone())
                .collect();
            (!keys.is_empty()).then_some(keys)
        }
        fn attribute(&self, address: &ResourceAddress, attribute: &str) -> Option<Resolved> {
            self.resources.get(address)?.get(attribute).cloned()
        }
    }

    fn ctx() -> Ctx {
        let mut resources = BTreeMap::new();
        for (key, known) in [("ams3", true), ("nyc1", true)] {
            let mut attrs = BTreeMap::new();
            attrs.insert("id".to_string(), Resolved::Known(json!(format!("id-{key}"))));
            attrs.insert(
                "kube_config".to_string(),
                if known {
                    Resolved::Known(json!([{"token": format!("tok-{key}")}]))
                } else {
                    Resolved::Unknown
                },
            );
            resources.insert(ResourceAddress::keyed("cluster", "main", key), attrs);
        }
        let mut pending = BTreeMap::new();
        pending.insert("endpoint".to_string(), Resolved::Unknown);
        resources.insert(ResourceAddress::new("cluster", "edge"), pending);

        Ctx {
            vars: [("regions".to_string(), json!(["ams3", "nyc1"]))].into(),
            each: Some(EachBinding {
                key: "ams3".into(),
                value: json!("ams3"),
            }),
            resources,
        }
    }

    #[test]
    fn parse_resource_reference_with_path() {
        let expr = Expr::parse(r#"cluster.main["ams3"].kube_config[0].token"#).unwrap();
        let Expr::Resource(r) = &expr else {
            panic!("expected resource ref")
        };
        assert_eq!(r.selector, Selector::Key("ams3".into()));
        assert_eq!(r.attribute, "kube_config");
        assert_eq!(
            r.path,
            vec![PathStep::Index(0), PathStep::Field("token".into())]
        );
        assert_eq!(expr.to_string(), r#"cluster.main["ams3"].kube_config[0].token"#);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Expr::parse("cluster").is_err());
        assert!(Expr::parse("cluster.main").is_err());
        assert!(Expr::parse("cluster.main[0].id").is_err());
        assert!(Expr::parse("nosuchfn(var.x)").is_err());
        assert!(Expr::parse("var.x extra").is_err());
    }

    #[test]
    fn whole_string_expression_keeps_type() {
        let t = Template::parse(&json!("${var.regions}")).unwrap();
        assert_eq!(t.evaluate(&ctx()).unwrap(), Resolved::Known(json!(["ams3", "nyc1"])));
    }

    #[test]
    fn interpolation_builds_string() {
        let t = Template::parse(&json!("k8s-${each.key}-${cluster.main[each.key].id}")).unwrap();
        assert_eq!(t.evaluate(&ctx()).unwrap(), Resolved::Known(json!("k8s-ams3-id-ams3")));
    }

    #[test]
    fn escaped_dollar_is_literal() {
        let t = Template::parse(&json!("cost: $${not.a.ref}")).unwrap();
        assert_eq!(t, Template::Literal(json!("cost: ${not.a.ref}")));
    }

    #[test]
    fn splat_collects_instances() {
        let t = Template::parse(&json!("${cluster.main[*].id}")).unwrap();
        assert_eq!(
            t.evaluate(&ctx()).unwrap(),
            Resolved::Known(json!(["id-ams3", "id-nyc1"]))
        );
    }

    #[test]
    fn unknown_propagates_through_lists_and_strings() {
        let c = ctx();
        let t = Template::parse(&json!(["a", "${cluster.edge.endpoint}"])).unwrap();
        assert_eq!(t.evaluate(&c).unwrap(), Resolved::Unknown);
        let t = Template::parse(&json!("https://${cluster.edge.endpoint}/")).unwrap();
        assert_eq!(t.evaluate(&c).unwrap(), Resolved::Unknown);
    }

    #[test]
    fn base64decode_decodes() {
        let mut c = ctx();
        c.vars.insert("ca".into(), json!(STANDARD.encode("-----BEGIN CERTIFICATE-----")));
        let t = Template::parse(&json!("${base64decode(var.ca)}")).unwrap();
        assert_eq!(
            t.evaluate(&c).unwrap(),
            Resolved::Known(json!("-----BEGIN CERTIFICATE-----"))
        );
    }

    #[test]
    fn references_and_each_usage() {
        let t = Template::parse(&json!({
            "host": "${cluster.main[each.key].endpoint}",
            "list": ["${cluster.edge.endpoint}", "${var.regions}"]
        }))
        .unwrap();
        assert_eq!(t.references().len(), 2);
        assert_eq!(t.variables(), vec!["regions"]);
        assert!(t.uses_each());
    }

    #[test]
    fn interpolating_list_fails() {
        let t = Template::parse(&json!("regions: ${var.regions}")).unwrap();
        assert!(t.evaluate(&ctx()).is_err());
    }
}
