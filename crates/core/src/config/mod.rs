// Gateway configuration: model, defaults and validation

pub mod duration_format;
mod loader;
pub mod size_format;

pub use loader::ConfigLoader;

use crate::forwarding::{DirectiveError, HeadersConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported configuration file format: {0}")]
    UnsupportedFormat(String),

    #[error("failed to parse configuration file: {0}")]
    Parse(String),

    #[error("invalid transport type: {0} (must be 'stdio' or 'http')")]
    InvalidTransport(String),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("invalid headers: {0}")]
    Headers(#[source] DirectiveError),

    #[error("invalid auth headers: {0}")]
    AuthHeaders(#[source] DirectiveError),

    #[error("duplicate header name between auth and general headers: {0}")]
    DuplicateAcrossGroups(String),
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub openapi: OpenApiConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.openapi.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Http,
}

impl std::str::FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stdio" => Ok(Self::Stdio),
            "http" => Ok(Self::Http),
            other => Err(ConfigError::InvalidTransport(other.to_string())),
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdio => f.write_str("stdio"),
            Self::Http => f.write_str("http"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_transport")]
    pub transport: TransportKind,

    #[serde(default)]
    pub http: HttpConfig,
}

fn default_transport() -> TransportKind {
    TransportKind::Stdio
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: default_transport(),
            http: HttpConfig::default(),
        }
    }
}

impl ServerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.transport == TransportKind::Http {
            self.http.validate()?;
        }
        Ok(())
    }
}

/// Streamable HTTP transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_session_timeout", with = "duration_format")]
    pub session_timeout: Duration,

    #[serde(default = "default_max_sessions", alias = "max_connections")]
    pub max_sessions: usize,

    #[serde(default = "default_max_request_size", with = "size_format")]
    pub max_request_size: u64,

    #[serde(default = "default_shutdown_grace", with = "duration_format")]
    pub shutdown_grace: Duration,

    #[serde(default)]
    pub cors: CorsConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_endpoint() -> String {
    "/mcp".to_string()
}

fn default_session_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_max_sessions() -> usize {
    100
}

fn default_max_request_size() -> u64 {
    1 << 20
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(30)
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            endpoint: default_endpoint(),
            session_timeout: default_session_timeout(),
            max_sessions: default_max_sessions(),
            max_request_size: default_max_request_size(),
            shutdown_grace: default_shutdown_grace(),
            cors: CorsConfig::default(),
        }
    }
}

impl HttpConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::invalid("port", "must be between 1 and 65535"));
        }
        if !self.endpoint.starts_with('/') {
            return Err(ConfigError::invalid("endpoint", "must start with '/'"));
        }
        if self.session_timeout.is_zero() {
            return Err(ConfigError::invalid("session_timeout", "must be positive"));
        }
        if self.max_sessions == 0 {
            return Err(ConfigError::invalid("max_sessions", "must be at least 1"));
        }
        if self.max_request_size == 0 {
            return Err(ConfigError::invalid("max_request_size", "must be at least 1 byte"));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default = "default_cors_enabled")]
    pub enabled: bool,

    #[serde(default = "default_cors_origins")]
    pub origins: Vec<String>,
}

fn default_cors_enabled() -> bool {
    true
}

fn default_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:3000".to_string(),
        "http://127.0.0.1:3000".to_string(),
    ]
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: default_cors_enabled(),
            origins: default_cors_origins(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[serde(alias = "text")]
    Pretty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: LogFormat,

    #[serde(default = "default_log_output")]
    pub output: LogOutput,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_log_output() -> LogOutput {
    LogOutput::Stderr
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            output: default_log_output(),
        }
    }
}

/// Backend API description and outbound call settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenApiConfig {
    #[serde(default)]
    pub spec_path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(default = "default_api_timeout", with = "duration_format")]
    pub timeout: Duration,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default)]
    pub tool_prefix: String,

    #[serde(default)]
    pub include_paths: Vec<String>,

    #[serde(default)]
    pub exclude_paths: Vec<String>,

    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub headers: HeadersConfig,
}

fn default_api_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_retries() -> u32 {
    3
}

impl Default for OpenApiConfig {
    fn default() -> Self {
        Self {
            spec_path: String::new(),
            base_url: None,
            timeout: default_api_timeout(),
            max_retries: default_max_retries(),
            tool_prefix: String::new(),
            include_paths: Vec::new(),
            exclude_paths: Vec::new(),
            debug: false,
            auth: AuthConfig::default(),
            headers: HeadersConfig::default(),
        }
    }
}

impl OpenApiConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.spec_path.trim().is_empty() {
            return Err(ConfigError::invalid("spec_path", "is required"));
        }
        if self.timeout < Duration::from_secs(1) {
            return Err(ConfigError::invalid("timeout", "must be at least 1 second"));
        }
        if let Some(base_url) = &self.base_url {
            url::Url::parse(base_url)
                .map_err(|e| ConfigError::invalid("base_url", e.to_string()))?;
        }
        self.auth.validate()?;

        self.headers.validate().map_err(ConfigError::Headers)?;
        self.auth.headers.validate().map_err(ConfigError::AuthHeaders)?;
        self.headers
            .check_disjoint(&self.auth.headers)
            .map_err(|e| match e {
                DirectiveError::Duplicate(name) => ConfigError::DuplicateAcrossGroups(name),
                other => ConfigError::Headers(other),
            })
    }

    pub fn is_remote_spec(&self) -> bool {
        self.spec_path.starts_with("http://") || self.spec_path.starts_with("https://")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    #[default]
    None,
    Bearer,
    Basic,
    ApiKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyLocation {
    #[default]
    Header,
    Query,
}

/// Credentials passed through to the backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default, rename = "type")]
    pub auth_type: AuthType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_name: Option<String>,

    #[serde(default)]
    pub api_key_in: ApiKeyLocation,

    #[serde(default)]
    pub headers: HeadersConfig,
}

impl AuthConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        match self.auth_type {
            AuthType::None => Ok(()),
            AuthType::Bearer if self.token.as_deref().unwrap_or_default().is_empty() => {
                Err(ConfigError::invalid("auth.token", "is required for bearer auth"))
            }
            AuthType::Basic if self.username.as_deref().unwrap_or_default().is_empty() => {
                Err(ConfigError::invalid("auth.username", "is required for basic auth"))
            }
            AuthType::ApiKey if self.api_key_name.as_deref().unwrap_or_default().is_empty() => {
                Err(ConfigError::invalid("auth.api_key_name", "is required for api_key auth"))
            }
            _ => Ok(()),
        }
    }
}
