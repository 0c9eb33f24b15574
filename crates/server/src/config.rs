use crate::api::session::SessionStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use toolgate_core::config::{Config, HttpConfig, TransportKind};
use toolgate_mcp::McpServer;

/// Shared state for the HTTP transport
pub struct AppState {
    pub server: Arc<McpServer>,
    pub sessions: Arc<SessionStore>,
    pub http: HttpConfig,
    pub shutdown: CancellationToken,
    /// Cancelled when the grace period after `shutdown` runs out
    pub force_close: CancellationToken,
}

impl AppState {
    pub fn new(server: Arc<McpServer>, http: HttpConfig, shutdown: CancellationToken) -> Self {
        let sessions = Arc::new(SessionStore::new(http.session_timeout, http.max_sessions));
        Self {
            server,
            sessions,
            http,
            shutdown,
            force_close: CancellationToken::new(),
        }
    }
}

/// Command-line values that take precedence over the configuration file
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub transport: Option<TransportKind>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub spec: Option<String>,
    pub base_url: Option<String>,
    pub debug: bool,
}

fn replace<T>(field: &str, current: &mut T, value: T)
where
    T: PartialEq + std::fmt::Display,
{
    if *current != value {
        tracing::warn!(
            field,
            config = %current,
            flag = %value,
            "Command-line flag overrides configuration value"
        );
        *current = value;
    }
}

impl Overrides {
    pub fn apply(&self, config: &mut Config) {
        if let Some(transport) = self.transport {
            replace("server.transport", &mut config.server.transport, transport);
        }
        if let Some(host) = &self.host {
            replace("server.http.host", &mut config.server.http.host, host.clone());
        }
        if let Some(port) = self.port {
            replace("server.http.port", &mut config.server.http.port, port);
        }
        if let Some(spec) = &self.spec {
            replace("openapi.spec_path", &mut config.openapi.spec_path, spec.clone());
        }
        if let Some(base_url) = &self.base_url {
            let mut current = config.openapi.base_url.clone().unwrap_or_default();
            replace("openapi.base_url", &mut current, base_url.clone());
            config.openapi.base_url = Some(current);
        }
        if self.debug {
            config.openapi.debug = true;
            config.logging.level = "debug".to_string();
        }
    }
}
