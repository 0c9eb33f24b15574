// Extraction expressions: locate a value inside an inbound request
//
// Grammar:
//   expr    := ["request."] (keyed | body | raw)
//   keyed   := ("headers" | "query" | "form") "[" key "]" ["." path]
//   body    := "body" ["." path]
//   raw     := ["$."] ("headers" | "query" | "form" | "body" | "method" | "path") ["." path]
//   key     := quote chars quote | bare
//   path    := segment ("." segment)*
//   segment := ident ("[" digits "]")* | digits

use crate::context::RequestContext;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const REQUEST_PREFIX: &str = "request.";
const JSONPATH_ROOT: &str = "$.";

/// Syntax errors. A key or path that is merely absent is not an error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionError {
    #[error("empty expression")]
    Empty,

    #[error("unbalanced bracket in expression '{0}'")]
    UnbalancedBracket(String),

    #[error("empty key in expression '{0}'")]
    EmptyKey(String),

    #[error("unterminated quote in expression '{0}'")]
    UnterminatedQuote(String),

    #[error("unknown source '{source_name}' in expression '{expression}'")]
    UnknownSource {
        source_name: String,
        expression: String,
    },

    #[error("unexpected characters '{rest}' after key in expression '{expression}'")]
    TrailingCharacters { rest: String, expression: String },

    #[error("invalid array index '{index}' in expression '{expression}'")]
    InvalidIndex { index: String, expression: String },
}

/// Where the base value of an expression comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Header(String),
    Query(String),
    Form(String),
    Body,
    /// Raw path rooted at a top-level context field
    Raw(RawRoot),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawRoot {
    Headers,
    Query,
    Form,
    Body,
    Method,
    Path,
}

impl RawRoot {
    fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "headers" => Some(Self::Headers),
            "query" => Some(Self::Query),
            "form" => Some(Self::Form),
            "body" => Some(Self::Body),
            "method" => Some(Self::Method),
            "path" => Some(Self::Path),
            _ => None,
        }
    }
}

/// One step of a structural descent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Field(String),
    Index(usize),
}

/// A parsed extraction expression. Parsing happens once; evaluation is pure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expression {
    raw: String,
    source: Source,
    path: Vec<Segment>,
}

impl Expression {
    pub fn parse(input: &str) -> Result<Self, ExpressionError> {
        Parser::new(input).run()
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn path(&self) -> &[Segment] {
        &self.path
    }

    /// Resolve against a context. Anything not present resolves to `""`.
    pub fn evaluate(&self, ctx: &RequestContext) -> String {
        match &self.source {
            Source::Header(key) => self.evaluate_keyed(ctx.header(key)),
            Source::Query(key) => self.evaluate_keyed(ctx.query(key)),
            Source::Form(key) => self.evaluate_keyed(ctx.form(key)),
            Source::Body => match ctx.body() {
                Some(body) => coerce(descend(body, &self.path)),
                None => String::new(),
            },
            Source::Raw(root) => {
                let base = raw_root_value(ctx, *root);
                let path = match (root, self.path.first()) {
                    (RawRoot::Headers, Some(Segment::Field(name))) => {
                        let mut path = self.path.clone();
                        path[0] = Segment::Field(name.to_ascii_lowercase());
                        path
                    }
                    _ => self.path.clone(),
                };
                coerce(descend(&base, &path))
            }
        }
    }

    // Keyed sources hold strings; a nested path only applies when that string is JSON.
    fn evaluate_keyed(&self, base: Option<&str>) -> String {
        let Some(base) = base else {
            return String::new();
        };
        if self.path.is_empty() {
            return base.to_string();
        }
        match serde_json::from_str::<Value>(base) {
            Ok(parsed) => coerce(descend(&parsed, &self.path)),
            Err(_) => {
                tracing::debug!(
                    expression = %self.raw,
                    "base value is not JSON, ignoring nested path"
                );
                base.to_string()
            }
        }
    }
}

impl FromStr for Expression {
    type Err = ExpressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for Expression {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for Expression {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Expression::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Parse and evaluate in one step
pub fn evaluate(expression: &str, ctx: &RequestContext) -> Result<String, ExpressionError> {
    Ok(Expression::parse(expression)?.evaluate(ctx))
}

/// Tokenizer states, visited in order
#[derive(Debug)]
enum State {
    Source,
    BracketKey(Keyed),
    NestedPath(Source),
}

#[derive(Debug, Clone, Copy)]
enum Keyed {
    Headers,
    Query,
    Form,
}

struct Parser<'a> {
    raw: &'a str,
    rest: &'a str,
}

impl<'a> Parser<'a> {
    fn new(raw: &'a str) -> Self {
        let raw = raw.trim();
        Self { raw, rest: raw }
    }

    fn run(mut self) -> Result<Expression, ExpressionError> {
        if self.rest.is_empty() {
            return Err(ExpressionError::Empty);
        }
        self.rest = self.rest.strip_prefix(REQUEST_PREFIX).unwrap_or(self.rest);

        let mut state = State::Source;
        loop {
            state = match state {
                State::Source => {
                    let end = self
                        .rest
                        .find(|c: char| c == '[' || c == '.')
                        .unwrap_or(self.rest.len());
                    let keyword = &self.rest[..end];
                    let next = self.rest[end..].chars().next();

                    let keyed = match (keyword, next) {
                        ("headers", Some('[')) => Keyed::Headers,
                        ("query", Some('[')) => Keyed::Query,
                        ("form", Some('[')) => Keyed::Form,
                        ("body", None | Some('.')) => {
                            self.rest = &self.rest[end..];
                            state = State::NestedPath(Source::Body);
                            continue;
                        }
                        _ => return self.raw_path(),
                    };
                    self.rest = &self.rest[end + 1..];
                    State::BracketKey(keyed)
                }
                State::BracketKey(keyed) => {
                    let (key, after) = self.bracket_key()?;
                    self.rest = after;
                    State::NestedPath(match keyed {
                        Keyed::Headers => Source::Header(key.to_ascii_lowercase()),
                        Keyed::Query => Source::Query(key),
                        Keyed::Form => Source::Form(key),
                    })
                }
                State::NestedPath(source) => {
                    if self.rest.is_empty() {
                        return Ok(self.finish(source, Vec::new()));
                    }
                    let Some(nested) = self.rest.strip_prefix('.') else {
                        return Err(ExpressionError::TrailingCharacters {
                            rest: self.rest.to_string(),
                            expression: self.raw.to_string(),
                        });
                    };
                    let path = parse_path(nested, self.raw)?;
                    return Ok(self.finish(source, path));
                }
            };
        }
    }

    fn finish(&self, source: Source, path: Vec<Segment>) -> Expression {
        Expression {
            raw: self.raw.to_string(),
            source,
            path,
        }
    }

    /// Scan the bracketed key. Returns the key and the text after `]`.
    fn bracket_key(&self) -> Result<(String, &'a str), ExpressionError> {
        let input = self.rest.trim_start();

        let (key, after) = match input.chars().next() {
            Some(quote @ ('\'' | '"')) => self.quoted_key(input, quote)?,
            _ => {
                let Some(end) = input.find(']') else {
                    return Err(ExpressionError::UnbalancedBracket(self.raw.to_string()));
                };
                let key = input[..end].trim();
                if key.contains('[') {
                    return Err(ExpressionError::UnbalancedBracket(self.raw.to_string()));
                }
                (key.to_string(), &input[end + 1..])
            }
        };

        if key.is_empty() {
            return Err(ExpressionError::EmptyKey(self.raw.to_string()));
        }
        Ok((key, after))
    }

    fn quoted_key(&self, input: &'a str, quote: char) -> Result<(String, &'a str), ExpressionError> {
        let mut key = String::new();
        let mut chars = input.char_indices().skip(1);
        let mut closed_at = None;

        while let Some((i, c)) = chars.next() {
            if c == '\\' {
                match chars.next() {
                    Some((_, escaped)) => key.push(escaped),
                    None => break,
                }
            } else if c == quote {
                closed_at = Some(i + c.len_utf8());
                break;
            } else {
                key.push(c);
            }
        }

        let Some(closed_at) = closed_at else {
            return Err(ExpressionError::UnterminatedQuote(self.raw.to_string()));
        };
        match input[closed_at..].trim_start().strip_prefix(']') {
            Some(after) => Ok((key, after)),
            None => Err(ExpressionError::UnbalancedBracket(self.raw.to_string())),
        }
    }

    // Fallback for expressions without a keyed source: a dotted path from the context root.
    fn raw_path(&self) -> Result<Expression, ExpressionError> {
        let text = self.rest.strip_prefix(JSONPATH_ROOT).unwrap_or(self.rest);
        let end = text
            .find(|c: char| c == '.' || c == '[')
            .unwrap_or(text.len());
        let Some(root) = RawRoot::from_keyword(&text[..end]) else {
            return Err(ExpressionError::UnknownSource {
                source_name: text[..end].to_string(),
                expression: self.raw.to_string(),
            });
        };
        let path = parse_path(&text[end..], self.raw)?;
        Ok(self.finish(Source::Raw(root), path))
    }
}

fn parse_path(text: &str, expression: &str) -> Result<Vec<Segment>, ExpressionError> {
    let mut segments = Vec::new();
    for part in text.split('.') {
        if part.is_empty() {
            continue;
        }
        if part.bytes().all(|b| b.is_ascii_digit()) {
            segments.push(Segment::Index(parse_index(part, expression)?));
            continue;
        }

        let (field, mut indices) = match part.find('[') {
            Some(open) => (&part[..open], &part[open..]),
            None => (part, ""),
        };
        if field.contains(']') {
            return Err(ExpressionError::UnbalancedBracket(expression.to_string()));
        }
        if !field.is_empty() {
            segments.push(Segment::Field(field.to_string()));
        }

        while !indices.is_empty() {
            let Some(inner) = indices.strip_prefix('[') else {
                return Err(ExpressionError::UnbalancedBracket(expression.to_string()));
            };
            let Some(close) = inner.find(']') else {
                return Err(ExpressionError::UnbalancedBracket(expression.to_string()));
            };
            let index = inner[..close].trim();
            if index.contains('[') {
                return Err(ExpressionError::UnbalancedBracket(expression.to_string()));
            }
            segments.push(Segment::Index(parse_index(index, expression)?));
            indices = &inner[close + 1..];
        }
    }
    Ok(segments)
}

fn parse_index(text: &str, expression: &str) -> Result<usize, ExpressionError> {
    text.parse().map_err(|_| ExpressionError::InvalidIndex {
        index: text.to_string(),
        expression: expression.to_string(),
    })
}

fn descend<'v>(value: &'v Value, path: &[Segment]) -> Option<&'v Value> {
    path.iter().try_fold(value, |current, segment| match segment {
        Segment::Field(name) => current.as_object()?.get(name),
        Segment::Index(index) => current.as_array()?.get(*index),
    })
}

fn coerce(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn raw_root_value(ctx: &RequestContext, root: RawRoot) -> Value {
    fn map_value(map: &std::collections::HashMap<String, String>) -> Value {
        Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        )
    }

    match root {
        RawRoot::Headers => map_value(ctx.headers()),
        RawRoot::Query => map_value(ctx.query_params()),
        RawRoot::Form => map_value(ctx.form_fields()),
        RawRoot::Body => ctx.body().cloned().unwrap_or(Value::Null),
        RawRoot::Method => Value::String(ctx.method().to_string()),
        RawRoot::Path => Value::String(ctx.path().to_string()),
    }
}
