use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use toolgate_core::config::{Config, ConfigLoader, LogFormat, LogOutput, LoggingConfig, TransportKind};
use toolgate_mcp::tools::registry_from_operations;
use toolgate_mcp::transport::StdioTransport;
use toolgate_mcp::McpServer;

mod api;
mod config;
mod middleware;

use config::{AppState, Overrides};

#[derive(Parser, Debug)]
#[command(name = "toolgate")]
#[command(about = "Expose a REST API described by OpenAPI as MCP tools", long_about = None)]
struct Args {
    /// Path to configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "TOOLGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Transport to serve: stdio or http
    #[arg(short, long)]
    transport: Option<TransportKind>,

    /// Host to bind the HTTP transport to
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Port for the HTTP transport
    #[arg(short, long)]
    port: Option<u16>,

    /// OpenAPI spec file path or URL
    #[arg(short, long)]
    spec: Option<String>,

    /// Base URL of the backend API
    #[arg(short, long)]
    base_url: Option<String>,

    /// Verbose logging, including outbound request details
    #[arg(short, long)]
    debug: bool,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            transport: self.transport,
            host: self.host.clone(),
            port: self.port,
            spec: self.spec.clone(),
            base_url: self.base_url.clone(),
            debug: self.debug,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = ConfigLoader::load(args.config.as_deref()).context("Failed to load configuration")?;
    let transport = args.transport.unwrap_or(config.server.transport);
    let mut logging = config.logging.clone();
    if args.debug {
        logging.level = "debug".to_string();
    }
    init_tracing(&logging, transport);

    args.overrides().apply(&mut config);
    config.validate().context("Invalid configuration")?;
    log_summary(&config);

    let (client, operations) = toolgate_core::load_api(config.openapi.clone()).await?;
    let registry = registry_from_operations(operations, Arc::new(client))?;
    tracing::info!(tools = registry.len(), "Registered tools");
    let server = Arc::new(McpServer::new(Arc::new(registry)));

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    match config.server.transport {
        TransportKind::Stdio => {
            let transport = StdioTransport::new(server);
            tokio::select! {
                result = transport.run_stdio() => result?,
                _ = shutdown.cancelled() => tracing::info!("Stdio transport interrupted"),
            }
        }
        TransportKind::Http => {
            let state = Arc::new(AppState::new(server, config.server.http.clone(), shutdown));
            api::serve(state).await?;
        }
    }

    Ok(())
}

/// Stdout carries the protocol on the stdio transport, so logs go to stderr there.
fn init_tracing(logging: &LoggingConfig, transport: TransportKind) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let stdout = logging.output == LogOutput::Stdout && transport != TransportKind::Stdio;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match (logging.format, stdout) {
        (LogFormat::Json, true) => builder.json().with_writer(std::io::stdout).init(),
        (LogFormat::Json, false) => builder.json().with_writer(std::io::stderr).init(),
        (LogFormat::Pretty, true) => builder.pretty().with_writer(std::io::stdout).init(),
        (LogFormat::Pretty, false) => builder.pretty().with_writer(std::io::stderr).init(),
    }
}

fn log_summary(config: &Config) {
    let openapi = &config.openapi;
    tracing::info!(
        transport = %config.server.transport,
        spec = %openapi.spec_path,
        base_url = openapi.base_url.as_deref().unwrap_or("<from spec>"),
        auth = ?openapi.auth.auth_type,
        forwarded_headers = openapi.headers.len(),
        auth_headers = openapi.auth.headers.len(),
        timeout_secs = openapi.timeout.as_secs(),
        "Starting toolgate"
    );
    if config.server.transport == TransportKind::Http {
        let http = &config.server.http;
        tracing::info!(
            address = %http.bind_address(),
            endpoint = %http.endpoint,
            max_sessions = http.max_sessions,
            session_timeout_secs = http.session_timeout.as_secs(),
            cors = http.cors.enabled,
            "HTTP transport configured"
        );
    }
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
    token.cancel();
}
