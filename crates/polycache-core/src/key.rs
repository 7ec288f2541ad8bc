//! Cache key templates and call-argument binding
//!
//! Every wrapped function gets one stable [`KeyTemplate`], computed at
//! registration. Concrete keys are produced per call by binding the caller's
//! [`CallArgs`] against the function's declared [`FnSignature`] and
//! substituting the bound values into the template. Binding is an explicit
//! mapping step: the signature carries ordered parameter names and default
//! values, so a call produces the same key whether a value was passed
//! positionally or by name.

use std::collections::BTreeMap;
use std::fmt::Display;

use crate::error::{CacheError, Result};

/// One declared parameter of a wrapped function.
#[derive(Debug, Clone)]
pub struct Param {
    name: String,
    default: Option<String>,
}

impl Param {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default(&self) -> Option<&str> {
        self.default.as_deref()
    }
}

/// The declared call schema of a wrapped function: a stable name plus its
/// parameters in declaration order.
///
/// ```
/// use polycache_core::FnSignature;
///
/// let sig = FnSignature::new("fetch_user")
///     .param("user_id")
///     .param_with_default("region", "eu");
/// assert_eq!(sig.name(), "fetch_user");
/// ```
#[derive(Debug, Clone)]
pub struct FnSignature {
    name: String,
    params: Vec<Param>,
}

impl FnSignature {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }

    /// Declare the next parameter in positional order.
    pub fn param(mut self, name: impl Into<String>) -> Self {
        self.params.push(Param {
            name: name.into(),
            default: None,
        });
        self
    }

    /// Declare a parameter with a default, applied when a call leaves it
    /// unset.
    pub fn param_with_default(mut self, name: impl Into<String>, default: impl Display) -> Self {
        self.params.push(Param {
            name: name.into(),
            default: Some(default.to_string()),
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    fn has_param(&self, name: &str) -> bool {
        self.params.iter().any(|p| p.name == name)
    }

    /// Bind one call's arguments to parameter names.
    ///
    /// Positional values map to parameters in declaration order, named values
    /// bind by name, and defaults fill whatever remains unset. Excess
    /// positional values, unknown names and doubly-assigned parameters are
    /// configuration errors.
    pub fn bind(&self, args: &CallArgs) -> Result<BoundArgs> {
        if args.positional.len() > self.params.len() {
            return Err(CacheError::Configuration(format!(
                "{} takes {} parameters but got {} positional values",
                self.name,
                self.params.len(),
                args.positional.len()
            )));
        }

        let mut values: BTreeMap<String, String> = BTreeMap::new();
        for (param, value) in self.params.iter().zip(&args.positional) {
            values.insert(param.name.clone(), value.clone());
        }
        for (name, value) in &args.named {
            if !self.has_param(name) {
                return Err(CacheError::Configuration(format!(
                    "unknown parameter {name:?} for {}",
                    self.name
                )));
            }
            if values.insert(name.clone(), value.clone()).is_some() {
                return Err(CacheError::Configuration(format!(
                    "parameter {name:?} assigned more than once in call to {}",
                    self.name
                )));
            }
        }
        for param in &self.params {
            if !values.contains_key(&param.name) {
                if let Some(default) = &param.default {
                    values.insert(param.name.clone(), default.clone());
                }
            }
        }

        Ok(BoundArgs { values })
    }
}

/// The arguments of one call, rendered to strings.
///
/// Positional entries correspond to the signature's declaration order; named
/// entries bind by parameter name. Values only ever feed key construction,
/// so they are captured in rendered form.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    positional: Vec<String>,
    named: Vec<(String, String)>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional value.
    pub fn positional(mut self, value: impl Display) -> Self {
        self.positional.push(value.to_string());
        self
    }

    /// Append a named value.
    pub fn named(mut self, name: impl Into<String>, value: impl Display) -> Self {
        self.named.push((name.into(), value.to_string()));
        self
    }

    pub fn positionals(&self) -> &[String] {
        &self.positional
    }

    /// Look up a named value. Positional values are only addressable after
    /// binding against a signature.
    pub fn named_value(&self, name: &str) -> Option<&str> {
        self.named
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.named.is_empty()
    }
}

/// Parameter values after binding a call against a signature.
#[derive(Debug, Clone)]
pub struct BoundArgs {
    values: BTreeMap<String, String>,
}

impl BoundArgs {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(|v| v.as_str())
    }
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

/// A parsed key template: literal text interleaved with `{param}`
/// placeholders.
///
/// Templates are parsed once, at registration, and never change afterwards.
/// [`KeyTemplate::resolve`] substitutes bound values into the placeholders;
/// [`KeyTemplate::match_pattern`] renders the wildcard pattern covering every
/// key the template can produce, which is what tag invalidation deletes by.
#[derive(Debug, Clone)]
pub struct KeyTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl KeyTemplate {
    /// Parse a template string. Malformed placeholders are rejected here,
    /// at registration, rather than surfacing on some later call.
    pub fn parse(source: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars();

        while let Some(ch) = chars.next() {
            match ch {
                '{' => {
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    let mut name = String::new();
                    let mut closed = false;
                    for inner in chars.by_ref() {
                        match inner {
                            '}' => {
                                closed = true;
                                break;
                            }
                            '{' => {
                                return Err(CacheError::Configuration(format!(
                                    "nested '{{' in key template {source:?}"
                                )));
                            }
                            c if c.is_ascii_alphanumeric() || c == '_' => name.push(c),
                            c => {
                                return Err(CacheError::Configuration(format!(
                                    "invalid character {c:?} in placeholder of key template {source:?}"
                                )));
                            }
                        }
                    }
                    if !closed {
                        return Err(CacheError::Configuration(format!(
                            "unclosed placeholder in key template {source:?}"
                        )));
                    }
                    if name.is_empty() {
                        return Err(CacheError::Configuration(format!(
                            "empty placeholder in key template {source:?}"
                        )));
                    }
                    segments.push(Segment::Placeholder(name));
                }
                '}' => {
                    return Err(CacheError::Configuration(format!(
                        "unmatched '}}' in key template {source:?}"
                    )));
                }
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// Compute the template for a wrapped function: the explicit template if
    /// the registration supplied one, otherwise one derived from the
    /// signature (`name(p1={p1},p2={p2})`). A non-empty prefix is prepended
    /// either way. Placeholders naming parameters the signature does not
    /// declare are rejected.
    pub fn derive(sig: &FnSignature, explicit: Option<&str>, prefix: &str) -> Result<Self> {
        let body = match explicit {
            Some(key) => key.to_string(),
            None => {
                let parts: Vec<String> = sig
                    .params()
                    .iter()
                    .map(|p| format!("{}={{{}}}", p.name(), p.name()))
                    .collect();
                format!("{}({})", sig.name(), parts.join(","))
            }
        };
        let source = if prefix.is_empty() {
            body
        } else {
            format!("{prefix}:{body}")
        };
        let template = Self::parse(&source)?;
        for name in template.placeholders() {
            if !sig.has_param(name) {
                return Err(CacheError::Configuration(format!(
                    "key template {source:?} references parameter {name:?} \
                     which {} does not declare",
                    sig.name()
                )));
            }
        }
        Ok(template)
    }

    /// The original template text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Placeholder names in template order.
    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Placeholder(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Substitute bound values into the template. A placeholder with no
    /// bound value (a required parameter the call never supplied) is a
    /// configuration error.
    pub fn resolve(&self, bound: &BoundArgs) -> Result<String> {
        let mut key = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => key.push_str(text),
                Segment::Placeholder(name) => match bound.get(name) {
                    Some(value) => key.push_str(value),
                    None => {
                        return Err(CacheError::Configuration(format!(
                            "no value bound for placeholder {{{name}}} in key template {:?}",
                            self.source
                        )));
                    }
                },
            }
        }
        Ok(key)
    }

    /// The wildcard pattern matching every key this template can produce.
    pub fn match_pattern(&self) -> String {
        self.segments
            .iter()
            .map(|segment| match segment {
                Segment::Literal(text) => text.as_str(),
                Segment::Placeholder(_) => "*",
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig() -> FnSignature {
        FnSignature::new("fetch_user")
            .param("user_id")
            .param_with_default("region", "eu")
    }

    #[test]
    fn test_derived_template() {
        let template = KeyTemplate::derive(&sig(), None, "").unwrap();
        assert_eq!(template.source(), "fetch_user(user_id={user_id},region={region})");

        let prefixed = KeyTemplate::derive(&sig(), None, "app").unwrap();
        assert_eq!(
            prefixed.source(),
            "app:fetch_user(user_id={user_id},region={region})"
        );
    }

    #[test]
    fn test_explicit_template_gets_prefix() {
        let template = KeyTemplate::derive(&sig(), Some("user:{user_id}"), "app").unwrap();
        assert_eq!(template.source(), "app:user:{user_id}");
    }

    #[test]
    fn test_positional_and_named_resolve_identically() {
        let sig = sig();
        let template = KeyTemplate::derive(&sig, None, "").unwrap();

        let by_position = CallArgs::new().positional(42).positional("us");
        let by_name = CallArgs::new().named("region", "us").named("user_id", 42);
        let mixed = CallArgs::new().positional(42).named("region", "us");

        let k1 = template.resolve(&sig.bind(&by_position).unwrap()).unwrap();
        let k2 = template.resolve(&sig.bind(&by_name).unwrap()).unwrap();
        let k3 = template.resolve(&sig.bind(&mixed).unwrap()).unwrap();
        assert_eq!(k1, "fetch_user(user_id=42,region=us)");
        assert_eq!(k1, k2);
        assert_eq!(k1, k3);
    }

    #[test]
    fn test_defaults_fill_missing_values() {
        let sig = sig();
        let template = KeyTemplate::derive(&sig, None, "").unwrap();
        let key = template
            .resolve(&sig.bind(&CallArgs::new().positional(7)).unwrap())
            .unwrap();
        assert_eq!(key, "fetch_user(user_id=7,region=eu)");
    }

    #[test]
    fn test_binding_errors() {
        let sig = sig();

        let too_many = CallArgs::new().positional(1).positional(2).positional(3);
        assert!(sig.bind(&too_many).is_err());

        let unknown = CallArgs::new().named("nope", 1);
        assert!(sig.bind(&unknown).is_err());

        let doubled = CallArgs::new().positional(1).named("user_id", 2);
        assert!(sig.bind(&doubled).is_err());
    }

    #[test]
    fn test_missing_required_value() {
        let sig = sig();
        let template = KeyTemplate::derive(&sig, None, "").unwrap();
        let bound = sig.bind(&CallArgs::new()).unwrap();
        // user_id has no default, so resolution must fail.
        assert!(template.resolve(&bound).is_err());
    }

    #[test]
    fn test_unknown_placeholder_rejected_at_registration() {
        let err = KeyTemplate::derive(&sig(), Some("user:{unknown}"), "").unwrap_err();
        assert!(err.to_string().contains("unknown"));
    }

    #[test]
    fn test_parse_errors() {
        assert!(KeyTemplate::parse("user:{id").is_err());
        assert!(KeyTemplate::parse("user:{}").is_err());
        assert!(KeyTemplate::parse("user:}").is_err());
        assert!(KeyTemplate::parse("user:{a{b}}").is_err());
        assert!(KeyTemplate::parse("user:{with space}").is_err());
    }

    #[test]
    fn test_match_pattern() {
        let sig = sig();
        let template = KeyTemplate::derive(&sig, None, "app").unwrap();
        assert_eq!(
            template.match_pattern(),
            "app:fetch_user(user_id=*,region=*)"
        );

        let explicit = KeyTemplate::derive(&sig, Some("user:{user_id}"), "").unwrap();
        assert_eq!(explicit.match_pattern(), "user:*");
    }

    #[test]
    fn test_no_params_function() {
        let sig = FnSignature::new("refresh_rates");
        let template = KeyTemplate::derive(&sig, None, "fx").unwrap();
        let key = template.resolve(&sig.bind(&CallArgs::new()).unwrap()).unwrap();
        assert_eq!(key, "fx:refresh_rates()");
    }
}
