//! Outbound HTTP client for backend API calls and remote spec fetches.

use crate::config::{ApiKeyLocation, AuthType, OpenApiConfig};
use crate::context::RequestContext;
use crate::forwarding::{ForwardingError, HeadersConfig};
use crate::openapi::{self, ApiOperation, ParameterLocation};
use anyhow::{bail, Context};
use base64::Engine;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("base URL not configured")]
    MissingBaseUrl,

    #[error("invalid request URL '{url}': {reason}")]
    Url { url: String, reason: String },

    #[error("required {location} parameter '{name}' not provided")]
    MissingParameter { name: String, location: ParameterLocation },

    #[error("invalid parameter: header '{0}' has an invalid name or value")]
    InvalidHeader(String),

    #[error("failed to evaluate headers: {0}")]
    Forwarding(#[from] ForwardingError),

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("request timeout after {attempts} attempts ({timeout:?} each)")]
    Timeout {
        attempts: u32,
        timeout: Duration,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to make request after {attempts} attempts: {source}")]
    Request {
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to read response body: {0}")]
    Body(#[source] reqwest::Error),

    #[error("API request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to fetch OpenAPI spec: HTTP {0}")]
    SpecStatus(u16),

    #[error("failed to serialize request body: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Linear backoff between attempts on transport failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Duration::from_secs(1),
        }
    }

    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff * (attempt + 1)
    }
}

/// Backend response handed back to the tool caller
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiResponse {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    config: OpenApiConfig,
    retry: RetryPolicy,
}

impl ApiClient {
    pub fn new(config: OpenApiConfig) -> Result<Self, ApiError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(ApiError::Client)?;
        let retry = RetryPolicy::new(config.max_retries);
        Ok(Self { http, config, retry })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &OpenApiConfig {
        &self.config
    }

    /// Invoke one backend operation with tool arguments.
    ///
    /// Auth-group directive failures are logged and skipped; general-group
    /// failures fail the call.
    pub async fn call(
        &self,
        operation: &ApiOperation,
        args: &Map<String, Value>,
        ctx: &RequestContext,
    ) -> Result<ApiResponse, ApiError> {
        if self.config.debug {
            debug!(
                tool = %operation.name,
                method = %operation.method,
                path = %operation.path,
                arguments = %serde_json::Value::Object(args.clone()),
                "Invoking API operation"
            );
        }

        let url = self.build_url(operation, args)?;
        let method = Method::from_bytes(operation.method.as_bytes()).map_err(|_| ApiError::Url {
            url: url.to_string(),
            reason: format!("unsupported method {}", operation.method),
        })?;

        let mut headers = HeaderMap::new();
        for param in operation.parameters_in(ParameterLocation::Header) {
            match args.get(&param.name) {
                Some(value) => set_header(&mut headers, &param.name, &value_to_string(value))?,
                None if param.required => {
                    return Err(ApiError::MissingParameter {
                        name: param.name.clone(),
                        location: ParameterLocation::Header,
                    })
                }
                None => {}
            }
        }
        headers.extend(self.credential_headers()?);
        self.apply_auth_directives(&mut headers, ctx);
        apply_directives(&mut headers, &self.config.headers, ctx)?;

        if self.config.debug {
            debug!(url = %url, headers = ?redacted(&headers), "Outbound request");
        }

        let mut request = self.http.request(method, url.clone());
        request = self.attach_body(request, &mut headers, operation, args)?;
        let request = request.headers(headers);

        let response = self.send_with_retry(request).await?;
        self.read_response(response).await
    }

    /// Fetch a remote API description. The forwarding context is built from the
    /// credential headers already set on the fetch request.
    pub async fn fetch_spec(&self, spec_url: &str) -> Result<String, ApiError> {
        let url = Url::parse(spec_url).map_err(|e| ApiError::Url {
            url: spec_url.to_string(),
            reason: e.to_string(),
        })?;

        let mut headers = self.credential_headers()?;
        let ctx = fetch_context(&headers);
        self.apply_auth_directives(&mut headers, &ctx);
        let ctx = fetch_context(&headers);
        apply_directives(&mut headers, &self.config.headers, &ctx)?;

        let response = self
            .send_with_retry(self.http.get(url).headers(headers))
            .await?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(ApiError::SpecStatus(status));
        }
        response.text().await.map_err(ApiError::Body)
    }

    fn build_url(&self, operation: &ApiOperation, args: &Map<String, Value>) -> Result<Url, ApiError> {
        let base = self
            .config
            .base_url
            .as_deref()
            .filter(|b| !b.is_empty())
            .ok_or(ApiError::MissingBaseUrl)?;
        let mut url = Url::parse(base).map_err(|e| ApiError::Url {
            url: base.to_string(),
            reason: e.to_string(),
        })?;

        let mut segments = Vec::new();
        for segment in operation.path.split('/').filter(|s| !s.is_empty()) {
            let mut segment = segment.to_string();
            for param in operation.parameters_in(ParameterLocation::Path) {
                let placeholder = format!("{{{}}}", param.name);
                if !segment.contains(&placeholder) {
                    continue;
                }
                match args.get(&param.name) {
                    Some(value) => segment = segment.replace(&placeholder, &value_to_string(value)),
                    None => {
                        return Err(ApiError::MissingParameter {
                            name: param.name.clone(),
                            location: ParameterLocation::Path,
                        })
                    }
                }
            }
            segments.push(segment);
        }
        url.path_segments_mut()
            .map_err(|_| ApiError::Url {
                url: base.to_string(),
                reason: "base URL cannot carry a path".to_string(),
            })?
            .pop_if_empty()
            .extend(segments);

        let mut query = Vec::new();
        for param in operation.parameters_in(ParameterLocation::Query) {
            match args.get(&param.name) {
                Some(Value::Array(items)) => {
                    query.extend(items.iter().map(|v| (param.name.clone(), value_to_string(v))))
                }
                Some(value) => query.push((param.name.clone(), value_to_string(value))),
                None if param.required => {
                    return Err(ApiError::MissingParameter {
                        name: param.name.clone(),
                        location: ParameterLocation::Query,
                    })
                }
                None => {}
            }
        }
        let auth = &self.config.auth;
        if auth.auth_type == AuthType::ApiKey && auth.api_key_in == ApiKeyLocation::Query {
            if let (Some(name), Some(key)) = (&auth.api_key_name, &auth.api_key) {
                query.push((name.clone(), key.clone()));
            }
        }
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    fn attach_body(
        &self,
        request: RequestBuilder,
        headers: &mut HeaderMap,
        operation: &ApiOperation,
        args: &Map<String, Value>,
    ) -> Result<RequestBuilder, ApiError> {
        if !operation.sends_body() {
            return Ok(request);
        }

        let form: Vec<(String, String)> = operation
            .parameters_in(ParameterLocation::FormData)
            .filter_map(|p| args.get(&p.name).map(|v| (p.name.clone(), value_to_string(v))))
            .collect();
        if !form.is_empty() {
            return Ok(request.form(&form));
        }

        if operation.request_body.is_none() {
            return Ok(request);
        }
        let (bytes, content_type) = match args.get("body") {
            None => return Ok(request),
            Some(Value::String(text)) => (text.clone().into_bytes(), "text/plain"),
            Some(value @ (Value::Object(_) | Value::Array(_))) => {
                (serde_json::to_vec(value)?, "application/json")
            }
            Some(other) => (other.to_string().into_bytes(), "text/plain"),
        };
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        Ok(request.body(bytes))
    }

    /// Static credentials from the auth configuration
    fn credential_headers(&self) -> Result<HeaderMap, ApiError> {
        let auth = &self.config.auth;
        let mut headers = HeaderMap::new();
        match auth.auth_type {
            AuthType::Bearer => {
                if let Some(token) = auth.token.as_deref().filter(|t| !t.is_empty()) {
                    set_header(&mut headers, AUTHORIZATION.as_str(), &format!("Bearer {}", token))?;
                }
            }
            AuthType::Basic => {
                if let (Some(user), Some(pass)) = (&auth.username, &auth.password) {
                    let encoded = base64::engine::general_purpose::STANDARD
                        .encode(format!("{}:{}", user, pass));
                    set_header(&mut headers, AUTHORIZATION.as_str(), &format!("Basic {}", encoded))?;
                }
            }
            AuthType::ApiKey if auth.api_key_in == ApiKeyLocation::Header => {
                if let (Some(name), Some(key)) = (&auth.api_key_name, &auth.api_key) {
                    set_header(&mut headers, name, key)?;
                }
            }
            _ => {}
        }
        Ok(headers)
    }

    /// Auth-group failures are logged and the request proceeds without any of
    /// that group's headers.
    fn apply_auth_directives(&self, headers: &mut HeaderMap, ctx: &RequestContext) {
        let mut staged = HeaderMap::new();
        match apply_directives(&mut staged, &self.config.auth.headers, ctx) {
            Ok(()) => headers.extend(staged),
            Err(e) => warn!(error = %e, "Failed to evaluate auth headers, continuing without them"),
        }
    }

    async fn send_with_retry(&self, request: RequestBuilder) -> Result<Response, ApiError> {
        let mut attempt = 0;
        loop {
            let Some(attempt_request) = request.try_clone() else {
                return request.send().await.map_err(|source| self.transport_error(1, source));
            };
            match attempt_request.send().await {
                Ok(response) => {
                    if attempt > 0 {
                        debug!(attempt = attempt + 1, "Request succeeded after retry");
                    }
                    return Ok(response);
                }
                Err(e) if attempt < self.retry.max_retries => {
                    let backoff = self.retry.backoff_for_attempt(attempt);
                    warn!(
                        error = %e,
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        "Request failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(self.transport_error(attempt + 1, e)),
            }
        }
    }

    fn transport_error(&self, attempts: u32, source: reqwest::Error) -> ApiError {
        if source.is_timeout() {
            ApiError::Timeout {
                attempts,
                timeout: self.config.timeout,
                source,
            }
        } else {
            ApiError::Request { attempts, source }
        }
    }

    async fn read_response(&self, response: Response) -> Result<ApiResponse, ApiError> {
        let status = response.status().as_u16();
        let mut headers = BTreeMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers
                    .entry(name.as_str().to_string())
                    .or_insert_with(|| value.to_string());
            }
        }
        let text = response.text().await.map_err(ApiError::Body)?;

        if self.config.debug {
            debug!(status, body = %text, "API response");
        }
        if status >= 400 {
            return Err(ApiError::Status { status, body: text });
        }

        let body = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok(ApiResponse {
            status_code: status,
            headers,
            body,
        })
    }
}

/// Load the API description, settle the base URL and build the client.
///
/// Base URL precedence: configured value, then the document, then the origin
/// of a remote spec URL.
pub async fn load_api(mut config: OpenApiConfig) -> anyhow::Result<(ApiClient, Vec<ApiOperation>)> {
    let doc = if config.is_remote_spec() {
        let fetcher = ApiClient::new(config.clone())?;
        let content = fetcher
            .fetch_spec(&config.spec_path)
            .await
            .with_context(|| format!("failed to load OpenAPI spec from {}", config.spec_path))?;
        openapi::parse_document(&content)?
    } else {
        openapi::load_document_file(Path::new(&config.spec_path))?
    };

    if config.base_url.as_deref().map_or(true, str::is_empty) {
        config.base_url = openapi::base_url_from_document(&doc)
            .or_else(|| openapi::base_url_from_spec_url(&config.spec_path));
        match &config.base_url {
            Some(url) => info!(base_url = %url, "Derived API base URL"),
            None => bail!("no base URL configured and none could be derived from the OpenAPI spec"),
        }
    }

    let operations = openapi::generate_operations(&doc, &config)?;
    info!(count = operations.len(), spec = %config.spec_path, "Loaded API operations");
    Ok((ApiClient::new(config)?, operations))
}

fn apply_directives(
    headers: &mut HeaderMap,
    directives: &HeadersConfig,
    ctx: &RequestContext,
) -> Result<(), ApiError> {
    for (name, value) in directives.resolve(ctx)? {
        set_header(headers, &name, &value)?;
    }
    Ok(())
}

fn set_header(headers: &mut HeaderMap, name: &str, value: &str) -> Result<(), ApiError> {
    let header_name =
        HeaderName::from_bytes(name.as_bytes()).map_err(|_| ApiError::InvalidHeader(name.to_string()))?;
    let header_value =
        HeaderValue::from_str(value).map_err(|_| ApiError::InvalidHeader(name.to_string()))?;
    headers.insert(header_name, header_value);
    Ok(())
}

fn redacted(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            let shown = if name == AUTHORIZATION {
                "[REDACTED]".to_string()
            } else {
                value.to_str().unwrap_or("<binary>").to_string()
            };
            (name.as_str().to_string(), shown)
        })
        .collect()
}

fn fetch_context(headers: &HeaderMap) -> RequestContext {
    RequestContext::builder()
        .headers(
            headers
                .iter()
                .filter_map(|(name, value)| Some((name.as_str(), value.to_str().ok()?.to_string()))),
        )
        .method("GET")
        .path("/")
        .build()
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
