// Normalized view of an inbound request, consumed by expression evaluation

use serde_json::Value;
use std::collections::HashMap;

/// Read-only snapshot of an inbound request.
///
/// Header names are lower-cased on entry; query and form keys keep their
/// original casing. Built once through [`RequestContextBuilder`] and never
/// mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestContext {
    headers: HashMap<String, String>,
    query: HashMap<String, String>,
    form: HashMap<String, String>,
    body: Option<Value>,
    method: String,
    path: String,
}

impl RequestContext {
    pub fn builder() -> RequestContextBuilder {
        RequestContextBuilder::default()
    }

    /// Context with no request data, used by transports without a request envelope
    pub fn empty() -> Self {
        Self::default()
    }

    /// Header lookup; the name is matched case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn query(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    pub fn form(&self, key: &str) -> Option<&str> {
        self.form.get(key).map(String::as_str)
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn query_params(&self) -> &HashMap<String, String> {
        &self.query
    }

    pub fn form_fields(&self) -> &HashMap<String, String> {
        &self.form
    }

    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Builder for [`RequestContext`]. Repeated keys keep the first value seen.
#[derive(Debug, Default)]
pub struct RequestContextBuilder {
    inner: RequestContext,
}

impl RequestContextBuilder {
    pub fn header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.inner
            .headers
            .entry(name.as_ref().to_ascii_lowercase())
            .or_insert_with(|| value.into());
        self
    }

    pub fn headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (name, value) in headers {
            self = self.header(name, value);
        }
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inner.query.entry(key.into()).or_insert_with(|| value.into());
        self
    }

    pub fn query_pairs<I, K, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in pairs {
            self = self.query(key, value);
        }
        self
    }

    pub fn form(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inner.form.entry(key.into()).or_insert_with(|| value.into());
        self
    }

    pub fn form_pairs<I, K, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in pairs {
            self = self.form(key, value);
        }
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.inner.body = Some(body);
        self
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.inner.method = method.into();
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.inner.path = path.into();
        self
    }

    pub fn build(self) -> RequestContext {
        self.inner
    }
}
