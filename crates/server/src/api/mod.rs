use crate::config::AppState;
use crate::middleware;
use anyhow::{Context, Result};
use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    routing::get,
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use toolgate_core::config::CorsConfig;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

mod context;
mod handlers;
pub mod session;

pub use handlers::SESSION_HEADER;

/// Bind the configured address and serve until shutdown
pub async fn serve(state: Arc<AppState>) -> Result<()> {
    let addr = state.http.bind_address();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!(address = %addr, endpoint = %state.http.endpoint, "HTTP transport listening");
    serve_listener(listener, state).await
}

/// How long connections get to close after in-flight requests were force-closed
const FORCE_CLOSE_WAIT: Duration = Duration::from_secs(5);

/// Serve on an already-bound listener. When the shutdown token fires, in-flight
/// requests get `shutdown_grace` to finish. Requests still running after that
/// are answered with 503 and their connections closed.
pub async fn serve_listener(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    let shutdown = state.shutdown.clone();
    let force_close = state.force_close.clone();
    let grace = state.http.shutdown_grace;
    let reaper = state.sessions.spawn_reaper(shutdown.clone());

    let app = create_router(state);
    let graceful = {
        let shutdown = shutdown.clone();
        async move { shutdown.cancelled().await }
    };
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app).with_graceful_shutdown(graceful).await
    });

    let result = tokio::select! {
        result = &mut server => Some(result),
        _ = shutdown.cancelled() => None,
    };
    let result = match result {
        Some(result) => result,
        None => {
            tracing::info!(grace_secs = grace.as_secs(), "Shutting down, draining in-flight requests");
            match tokio::time::timeout(grace, &mut server).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!("Shutdown grace period elapsed, closing in-flight requests");
                    force_close.cancel();
                    match tokio::time::timeout(FORCE_CLOSE_WAIT, &mut server).await {
                        Ok(result) => result,
                        Err(_) => {
                            tracing::warn!("Connections still open after force-close, aborting server");
                            server.abort();
                            reaper.abort();
                            return Ok(());
                        }
                    }
                }
            }
        }
    };

    reaper.abort();
    result.context("HTTP server task failed")?.context("HTTP server error")?;
    tracing::info!("HTTP transport stopped");
    Ok(())
}

/// Create the MCP router
pub fn create_router(state: Arc<AppState>) -> Router {
    let endpoint = state.http.endpoint.clone();
    let cors = cors_layer(&state.http.cors);
    let force_close = state.force_close.clone();

    let router = Router::new()
        .route(
            &endpoint,
            get(handlers::open_stream)
                .post(handlers::post_message)
                .delete(handlers::delete_session),
        )
        .route_layer(axum::middleware::from_fn(middleware::require_supported_version))
        .route("/health", get(handlers::health_check))
        .layer(axum::middleware::from_fn_with_state(
            force_close,
            middleware::abort_on_force_close,
        ))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new())
                .on_response(DefaultOnResponse::new()),
        );

    let router = match cors {
        Some(cors) => router.layer(cors),
        None => router,
    };
    router.with_state(state)
}

fn cors_layer(config: &CorsConfig) -> Option<CorsLayer> {
    if !config.enabled {
        return None;
    }

    let origins = if config.origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(config.origins.iter().filter_map(|origin| {
            match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                    None
                }
            }
        }))
    };

    let session = HeaderName::from_static(SESSION_HEADER);
    Some(
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers([
                header::CONTENT_TYPE,
                header::ACCEPT,
                header::AUTHORIZATION,
                session.clone(),
                HeaderName::from_static(middleware::PROTOCOL_VERSION_HEADER),
            ])
            .expose_headers([session]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use axum::response::Response;
    use serde_json::{json, Value};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::sync::CancellationToken;
    use toolgate_core::config::HttpConfig;
    use toolgate_core::RequestContext;
    use toolgate_mcp::protocol::ToolSchema;
    use toolgate_mcp::tools::{Tool, ToolRegistry};
    use toolgate_mcp::McpServer;
    use tower::ServiceExt;

    /// Echoes what header forwarding would see
    struct Forwarded;

    #[async_trait::async_trait]
    impl Tool for Forwarded {
        fn schema(&self) -> ToolSchema {
            ToolSchema {
                name: "whoami".to_string(),
                description: "Echo forwarding inputs".to_string(),
                input_schema: json!({"type": "object"}),
            }
        }

        async fn execute(&self, _arguments: Value, ctx: &RequestContext) -> anyhow::Result<Value> {
            let key = toolgate_core::expression::evaluate(
                "request.headers['x-provider-data'].apikey",
                ctx,
            )?;
            Ok(json!({"Authorization": key, "tenant": ctx.query("tenant")}))
        }
    }

    /// Takes a fixed time to answer
    struct Slow(Duration);

    #[async_trait::async_trait]
    impl Tool for Slow {
        fn schema(&self) -> ToolSchema {
            ToolSchema {
                name: "slow".to_string(),
                description: "Sleep, then answer".to_string(),
                input_schema: json!({"type": "object"}),
            }
        }

        async fn execute(&self, _arguments: Value, _ctx: &RequestContext) -> anyhow::Result<Value> {
            tokio::time::sleep(self.0).await;
            Ok(json!({"slept_ms": self.0.as_millis() as u64}))
        }
    }

    fn state_with(http: HttpConfig) -> Arc<AppState> {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Forwarded)).unwrap();
        let server = Arc::new(McpServer::new(Arc::new(registry)));
        Arc::new(AppState::new(server, http, CancellationToken::new()))
    }

    fn state() -> Arc<AppState> {
        state_with(HttpConfig::default())
    }

    fn post() -> axum::http::request::Builder {
        Request::builder()
            .method("POST")
            .uri("/mcp")
            .header("content-type", "application/json")
            .header("accept", "application/json, text/event-stream")
    }

    async fn send(state: &Arc<AppState>, req: Request<Body>) -> Response {
        create_router(state.clone()).oneshot(req).await.unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn session_of(response: &Response) -> String {
        response.headers()[SESSION_HEADER].to_str().unwrap().to_string()
    }

    const INITIALIZE: &str =
        r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2025-06-18"}}"#;

    #[tokio::test]
    async fn test_initialize_creates_session() {
        let state = state();
        let response = send(&state, post().body(Body::from(INITIALIZE)).unwrap()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let id = session_of(&response);
        assert!(uuid::Uuid::parse_str(&id).is_ok());
        let body = json_body(response).await;
        assert_eq!(body["result"]["protocolVersion"], "2025-06-18");
        assert_eq!(state.sessions.count(), 1);
    }

    #[tokio::test]
    async fn test_forwarded_header_reaches_tool() {
        let state = state();
        let call = r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"whoami"}}"#;
        let req = Request::builder()
            .method("POST")
            .uri("/mcp?tenant=acme")
            .header("content-type", "application/json")
            .header("X-Provider-Data", r#"{"apikey":"sk-999"}"#)
            .body(Body::from(call))
            .unwrap();
        let response = send(&state, req).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        let text = body["result"]["content"][0]["text"].as_str().unwrap();
        assert_eq!(text, r#"{"Authorization":"sk-999","tenant":"acme"}"#);
    }

    #[tokio::test]
    async fn test_notification_accepted() {
        let state = state();
        let note = r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#;
        let response = send(&state, post().body(Body::from(note)).unwrap()).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn test_only_initialize_opens_session() {
        let state = state();
        let messages = [
            r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#,
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#,
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
        ];
        for message in messages {
            let response = send(&state, post().body(Body::from(message)).unwrap()).await;
            assert!(response.status().is_success(), "{}", message);
            assert!(response.headers().get(SESSION_HEADER).is_none(), "{}", message);
        }
        assert_eq!(state.sessions.count(), 0);

        send(&state, post().body(Body::from(INITIALIZE)).unwrap()).await;
        assert_eq!(state.sessions.count(), 1);
    }

    #[tokio::test]
    async fn test_error_bands_map_to_status() {
        let state = state();
        let cases = [
            ("{not json", StatusCode::BAD_REQUEST, -32700),
            (r#"{"jsonrpc":"2.0","id":1}"#, StatusCode::BAD_REQUEST, -32600),
            (r#"{"jsonrpc":"2.0","id":1,"method":"nope"}"#, StatusCode::NOT_FOUND, -32601),
            (
                r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"missing"}}"#,
                StatusCode::NOT_FOUND,
                -1302,
            ),
        ];
        for (body, status, code) in cases {
            let response = send(&state, post().body(Body::from(body)).unwrap()).await;
            assert_eq!(response.status(), status, "{}", body);
            assert_eq!(json_body(response).await["error"]["code"], code, "{}", body);
        }
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let state = state();
        let ping = r#"{"jsonrpc":"2.0","id":5,"method":"ping"}"#;
        let req = post()
            .header(SESSION_HEADER, "00000000-0000-4000-8000-000000000000")
            .body(Body::from(ping))
            .unwrap();
        let response = send(&state, req).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = json_body(response).await;
        assert_eq!(body["error"]["code"], -1303);
        assert_eq!(body["id"], 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_session_rejected_distinctly() {
        let http = HttpConfig {
            session_timeout: Duration::from_secs(30),
            ..Default::default()
        };
        let state = state_with(http);
        let response = send(&state, post().body(Body::from(INITIALIZE)).unwrap()).await;
        let id = session_of(&response);

        let ping = r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#;
        let with_session = |id: &str| {
            post()
                .header(SESSION_HEADER, id)
                .body(Body::from(ping))
                .unwrap()
        };
        assert_eq!(send(&state, with_session(&id)).await.status(), StatusCode::OK);

        tokio::time::advance(Duration::from_secs(31)).await;
        let response = send(&state, with_session(&id)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["error"]["code"], -1303);

        let malformed = post().header(SESSION_HEADER, &id).body(Body::from("{")).unwrap();
        assert_eq!(send(&state, malformed).await.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_capacity_refuses_initialize_only() {
        let http = HttpConfig {
            max_sessions: 1,
            ..Default::default()
        };
        let state = state_with(http);
        let first = send(&state, post().body(Body::from(INITIALIZE)).unwrap()).await;
        let id = session_of(&first);

        let refused = send(&state, post().body(Body::from(INITIALIZE)).unwrap()).await;
        assert_eq!(refused.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(refused).await["error"]["code"], -3001);

        let ping = r#"{"jsonrpc":"2.0","id":3,"method":"ping"}"#;
        let stateless = send(&state, post().body(Body::from(ping)).unwrap()).await;
        assert_eq!(stateless.status(), StatusCode::OK);
        assert!(stateless.headers().get(SESSION_HEADER).is_none());

        let existing = post().header(SESSION_HEADER, &id).body(Body::from(ping)).unwrap();
        assert_eq!(send(&state, existing).await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_body_limit() {
        let http = HttpConfig {
            max_request_size: 64,
            ..Default::default()
        };
        let state = state_with(http);
        let big = format!(
            r#"{{"jsonrpc":"2.0","id":1,"method":"ping","params":{{"pad":"{}"}}}}"#,
            "x".repeat(128)
        );
        let req = post()
            .header("content-length", big.len())
            .body(Body::from(big.clone()))
            .unwrap();
        let response = send(&state, req).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(json_body(response).await["error"]["code"], -32600);

        // Without a declared length the streamed body is still capped.
        let stream = futures::stream::iter(vec![Ok::<_, std::io::Error>(big.into_bytes())]);
        let req = post().body(Body::from_stream(stream)).unwrap();
        assert_eq!(send(&state, req).await.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_sse_only_accept_gets_event() {
        let state = state();
        let ping = r#"{"jsonrpc":"2.0","id":"s","method":"ping"}"#;
        let req = Request::builder()
            .method("POST")
            .uri("/mcp")
            .header("content-type", "application/json")
            .header("accept", "text/event-stream")
            .body(Body::from(ping))
            .unwrap();
        let response = send(&state, req).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.starts_with("event: message\n"));
        assert!(text.contains(r#"data: {"jsonrpc":"2.0","id":"s","result":{}}"#));
    }

    #[tokio::test]
    async fn test_protocol_version_header() {
        let state = state();
        let ping = r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#;
        let bad = post()
            .header("MCP-Protocol-Version", "1999-01-01")
            .body(Body::from(ping))
            .unwrap();
        let response = send(&state, bad).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"]["code"], -32600);

        let good = post()
            .header("MCP-Protocol-Version", "2025-03-26")
            .body(Body::from(ping))
            .unwrap();
        assert_eq!(send(&state, good).await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_get_requires_event_stream_accept() {
        let state = state();
        let req = Request::builder()
            .method("GET")
            .uri("/mcp")
            .header("accept", "application/json")
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&state, req).await.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_get_stream_delivers_pushed_messages() {
        let state = state();
        let id = state.sessions.create().unwrap();
        let req = Request::builder()
            .method("GET")
            .uri("/mcp")
            .header("accept", "text/event-stream")
            .header(SESSION_HEADER, &id)
            .body(Body::empty())
            .unwrap();
        let response = send(&state, req).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(session_of(&response), id);

        state
            .sessions
            .push(&id, json!({"jsonrpc": "2.0", "method": "notifications/tools/list_changed"}))
            .unwrap();
        assert!(state.sessions.remove(&id));

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("event: message"));
        assert!(text.contains("notifications/tools/list_changed"));
    }

    #[tokio::test]
    async fn test_delete_session() {
        let state = state();
        let id = state.sessions.create().unwrap();
        let delete = |id: &str| {
            Request::builder()
                .method("DELETE")
                .uri("/mcp")
                .header(SESSION_HEADER, id)
                .body(Body::empty())
                .unwrap()
        };
        assert_eq!(send(&state, delete(&id)).await.status(), StatusCode::NO_CONTENT);
        assert_eq!(send(&state, delete(&id)).await.status(), StatusCode::NOT_FOUND);
        assert_eq!(state.sessions.count(), 0);
    }

    #[tokio::test]
    async fn test_health() {
        let state = state();
        state.sessions.create().unwrap();
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = send(&state, req).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({"status": "ok", "sessions": 1}));
    }

    #[tokio::test]
    async fn test_cors_allow_list() {
        let state = state();
        let preflight = |origin: &str| {
            Request::builder()
                .method("OPTIONS")
                .uri("/mcp")
                .header("origin", origin)
                .header("access-control-request-method", "POST")
                .header("access-control-request-headers", "mcp-session-id")
                .body(Body::empty())
                .unwrap()
        };

        let allowed = send(&state, preflight("http://localhost:3000")).await;
        assert_eq!(
            allowed.headers()["access-control-allow-origin"],
            "http://localhost:3000"
        );

        let denied = send(&state, preflight("http://evil.example")).await;
        assert!(denied.headers().get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn test_cors_disabled_and_wildcard() {
        let mut http = HttpConfig::default();
        http.cors.enabled = false;
        assert!(cors_layer(&http.cors).is_none());

        http.cors.enabled = true;
        http.cors.origins = vec!["*".to_string()];
        let state = state_with(http);
        let ping = r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#;
        let req = post()
            .header("origin", "http://anywhere.example")
            .body(Body::from(ping))
            .unwrap();
        let response = send(&state, req).await;
        assert_eq!(response.headers()["access-control-allow-origin"], "*");
        assert_eq!(
            response.headers()["access-control-expose-headers"],
            "mcp-session-id"
        );
    }

    #[tokio::test]
    async fn test_graceful_shutdown() {
        let state = state();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let shutdown = state.shutdown.clone();
        let handle = tokio::spawn(serve_listener(listener, state));
        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    const SLOW_CALL: &str =
        r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"slow","arguments":{}}}"#;

    fn slow_state(delay: Duration, grace: Duration) -> Arc<AppState> {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Slow(delay))).unwrap();
        let server = Arc::new(McpServer::new(Arc::new(registry)));
        let http = HttpConfig {
            shutdown_grace: grace,
            ..Default::default()
        };
        Arc::new(AppState::new(server, http, CancellationToken::new()))
    }

    async fn raw_post(addr: std::net::SocketAddr, body: &'static str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "POST /mcp HTTP/1.1\r\nhost: localhost\r\ncontent-type: application/json\r\n\
             accept: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        String::from_utf8_lossy(&response).into_owned()
    }

    #[tokio::test]
    async fn test_shutdown_drains_in_flight_request() {
        let state = slow_state(Duration::from_millis(300), Duration::from_secs(5));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = state.shutdown.clone();
        let server = tokio::spawn(serve_listener(listener, state));

        let client = tokio::spawn(raw_post(addr, SLOW_CALL));
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();

        let response = client.await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
        assert!(response.contains("slept_ms"));
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_force_closes_after_grace() {
        let state = slow_state(Duration::from_secs(30), Duration::from_millis(200));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = state.shutdown.clone();
        let force_close = state.force_close.clone();
        let server = tokio::spawn(serve_listener(listener, state));

        let client = tokio::spawn(raw_post(addr, SLOW_CALL));
        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = std::time::Instant::now();
        shutdown.cancel();

        let response = tokio::time::timeout(Duration::from_secs(3), client)
            .await
            .unwrap()
            .unwrap();
        assert!(response.starts_with("HTTP/1.1 503"), "{}", response);
        assert!(response.contains("-3001"));

        tokio::time::timeout(Duration::from_secs(3), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(force_close.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
