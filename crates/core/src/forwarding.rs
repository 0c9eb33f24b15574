// Header forwarding directives and their resolution against a request

use crate::context::RequestContext;
use crate::expression::{self, ExpressionError};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

/// Configuration-time problems with a directive list
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectiveError {
    #[error("header name is required")]
    MissingName,

    #[error("header '{0}' must have either 'value' or 'valueFrom'")]
    MissingValue(String),

    #[error("header '{0}' cannot have both 'value' and 'valueFrom'")]
    BothValues(String),

    #[error("duplicate header name: {0}")]
    Duplicate(String),
}

/// Evaluation failure; the whole batch is discarded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ForwardingError {
    #[error("failed to evaluate header {name}: {source}")]
    Directive {
        name: String,
        #[source]
        source: ExpressionError,
    },
}

/// Where a directive's value comes from. Expressions keep their source text
/// and are parsed on every resolution, so a malformed one only fails the
/// batch it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectiveValue {
    Literal(String),
    Expression(String),
}

/// A named rule producing one outbound header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingDirective {
    pub name: String,
    pub value: DirectiveValue,
}

impl ForwardingDirective {
    pub fn literal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: DirectiveValue::Literal(value.into()),
        }
    }

    pub fn expression(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: DirectiveValue::Expression(expression.into()),
        }
    }

    fn evaluate(&self, ctx: &RequestContext) -> Result<String, ForwardingError> {
        match &self.value {
            DirectiveValue::Literal(value) => Ok(value.clone()),
            DirectiveValue::Expression(source) => {
                expression::evaluate(source, ctx).map_err(|source| ForwardingError::Directive {
                    name: self.name.clone(),
                    source,
                })
            }
        }
    }
}

/// Unvalidated directive as it appears in configuration files
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawDirective {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, rename = "valueFrom", skip_serializing_if = "Option::is_none")]
    pub value_from: Option<String>,
}

impl RawDirective {
    pub fn literal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
            value_from: None,
        }
    }

    pub fn value_from(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
            value_from: Some(expression.into()),
        }
    }
}

impl TryFrom<RawDirective> for ForwardingDirective {
    type Error = DirectiveError;

    fn try_from(raw: RawDirective) -> Result<Self, Self::Error> {
        let name = raw.name.trim().to_string();
        if name.is_empty() {
            return Err(DirectiveError::MissingName);
        }
        let value = raw.value.filter(|v| !v.is_empty());
        let value_from = raw.value_from.filter(|v| !v.is_empty());

        match (value, value_from) {
            (Some(value), None) => Ok(Self::literal(name, value)),
            (None, Some(expression)) => Ok(Self::expression(name, expression)),
            (Some(_), Some(_)) => Err(DirectiveError::BothValues(name)),
            (None, None) => Err(DirectiveError::MissingValue(name)),
        }
    }
}

impl From<&ForwardingDirective> for RawDirective {
    fn from(directive: &ForwardingDirective) -> Self {
        match &directive.value {
            DirectiveValue::Literal(value) => Self::literal(&directive.name, value),
            DirectiveValue::Expression(source) => Self::value_from(&directive.name, source),
        }
    }
}

// Both serialized forms collapse into the same ordered list at load time.
// Only names and value exclusivity are checked here; expression syntax is
// checked when a batch is resolved.
#[derive(Deserialize)]
#[serde(untagged)]
enum HeadersRepr {
    List(Vec<ItemRepr>),
    FlatMap(BTreeMap<String, String>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ItemRepr {
    Wrapped { header: RawDirective },
    Plain(RawDirective),
}

/// Ordered directive list with unique names
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "HeadersRepr")]
pub struct HeadersConfig {
    directives: Vec<ForwardingDirective>,
}

impl TryFrom<HeadersRepr> for HeadersConfig {
    type Error = DirectiveError;

    fn try_from(repr: HeadersRepr) -> Result<Self, Self::Error> {
        let raw: Vec<RawDirective> = match repr {
            HeadersRepr::List(items) => items
                .into_iter()
                .map(|item| match item {
                    ItemRepr::Wrapped { header } => header,
                    ItemRepr::Plain(raw) => raw,
                })
                .collect(),
            HeadersRepr::FlatMap(map) => map
                .into_iter()
                .map(|(name, value)| RawDirective::literal(name, value))
                .collect(),
        };
        Self::from_raw(raw)
    }
}

impl Serialize for HeadersConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.directives.iter().map(RawDirective::from))
    }
}

impl HeadersConfig {
    pub fn new(directives: Vec<ForwardingDirective>) -> Result<Self, DirectiveError> {
        let config = Self { directives };
        config.validate()?;
        Ok(config)
    }

    pub fn from_raw(raw: Vec<RawDirective>) -> Result<Self, DirectiveError> {
        let directives = raw
            .into_iter()
            .map(ForwardingDirective::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(directives)
    }

    /// Header names must be unique, compared case-insensitively
    pub fn validate(&self) -> Result<(), DirectiveError> {
        let mut seen = HashSet::new();
        for directive in &self.directives {
            if !seen.insert(directive.name.to_ascii_lowercase()) {
                return Err(DirectiveError::Duplicate(directive.name.clone()));
            }
        }
        Ok(())
    }

    /// Reject names shared with another group merged into the same request
    pub fn check_disjoint(&self, other: &HeadersConfig) -> Result<(), DirectiveError> {
        let names: HashSet<String> = other
            .directives
            .iter()
            .map(|d| d.name.to_ascii_lowercase())
            .collect();
        match self
            .directives
            .iter()
            .find(|d| names.contains(&d.name.to_ascii_lowercase()))
        {
            Some(clash) => Err(DirectiveError::Duplicate(clash.name.clone())),
            None => Ok(()),
        }
    }

    pub fn directives(&self) -> &[ForwardingDirective] {
        &self.directives
    }

    pub fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }

    pub fn len(&self) -> usize {
        self.directives.len()
    }

    pub fn resolve(&self, ctx: &RequestContext) -> Result<BTreeMap<String, String>, ForwardingError> {
        resolve(&self.directives, ctx)
    }
}

/// Resolve directives in order. Empty results are omitted. The first syntax
/// error aborts the batch and no partial result is returned.
pub fn resolve(
    directives: &[ForwardingDirective],
    ctx: &RequestContext,
) -> Result<BTreeMap<String, String>, ForwardingError> {
    let mut headers = BTreeMap::new();
    for directive in directives {
        let value = directive.evaluate(ctx)?;
        if !value.is_empty() {
            headers.insert(directive.name.clone(), value);
        }
    }
    Ok(headers)
}
