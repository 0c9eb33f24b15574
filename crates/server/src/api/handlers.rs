use super::context::request_context;
use super::session::SessionStream;
use crate::config::AppState;
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::{future, stream};
use serde_json::{json, Value};
use std::sync::Arc;
use toolgate_mcp::protocol::{JsonRpcError, JsonRpcResponse};
use toolgate_mcp::McpServer;
use tracing::{debug, info};

pub const SESSION_HEADER: &str = "mcp-session-id";

const EVENT_STREAM: &str = "text/event-stream";

fn session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn accept(headers: &HeaderMap) -> &str {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

/// SSE only when the client accepts it and does not accept JSON
fn wants_sse(headers: &HeaderMap) -> bool {
    let accept = accept(headers);
    accept.contains(EVENT_STREAM) && !accept.contains("application/json")
}

fn status_of(response: &JsonRpcResponse) -> StatusCode {
    match &response.error {
        None => StatusCode::OK,
        Some(error) => {
            StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn with_session(mut response: Response, session: Option<&str>) -> Response {
    if let Some(value) = session.and_then(|id| HeaderValue::from_str(id).ok()) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

/// Render a JSON-RPC response as JSON or as a single SSE `message` event
fn render(response: &JsonRpcResponse, session: Option<&str>, sse: bool) -> Response {
    let status = status_of(response);
    let rendered = if sse {
        let event = Event::default().event("message").json_data(response);
        (status, Sse::new(stream::once(future::ready(event)))).into_response()
    } else {
        (status, Json(response)).into_response()
    };
    with_session(rendered, session)
}

fn reject(error: JsonRpcError, id: Value, sse: bool) -> Response {
    render(&JsonRpcResponse::error(id, error), None, sse)
}

fn too_large(limit: u64) -> Response {
    let error = JsonRpcError::invalid_request(format!("request body exceeds {} bytes", limit));
    (
        StatusCode::PAYLOAD_TOO_LARGE,
        Json(JsonRpcResponse::error(Value::Null, error)),
    )
        .into_response()
}

/// POST: one JSON-RPC message per request
pub async fn post_message(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let limit = state.http.max_request_size;
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared.is_some_and(|len| len > limit) {
        return too_large(limit);
    }
    let bytes = match axum::body::to_bytes(body, usize::try_from(limit).unwrap_or(usize::MAX)).await {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!(error = %e, "Failed to read request body");
            return too_large(limit);
        }
    };

    let sse = wants_sse(&headers);
    let ctx = request_context(&method, &uri, &headers, &bytes);
    let raw = match std::str::from_utf8(&bytes) {
        Ok(raw) => raw,
        Err(e) => return reject(JsonRpcError::parse_error(e.to_string()), Value::Null, sse),
    };
    let request = match McpServer::parse_message(raw) {
        Ok(request) => request,
        Err(response) => return render(&response, None, sse),
    };

    let session = match session_id(&headers) {
        Some(id) => match state.sessions.touch(&id) {
            Ok(()) => Some(id),
            Err(e) => {
                debug!(session = %id, error = %e, "Rejected session token");
                return reject(JsonRpcError::session_not_found(), request.response_id(), sse);
            }
        },
        // Only initialize opens a session; anything else is served statelessly.
        None if request.method == "initialize" => match state.sessions.create() {
            Ok(id) => {
                info!(session = %id, "Created session");
                Some(id)
            }
            Err(e) => {
                return reject(
                    JsonRpcError::service_unavailable(e.to_string()),
                    request.response_id(),
                    sse,
                );
            }
        },
        None => None,
    };

    let notification = request.is_notification();
    let response = state.server.handle_request(request, &ctx).await;
    if notification {
        return with_session(StatusCode::ACCEPTED.into_response(), session.as_deref());
    }
    render(&response, session.as_deref(), sse)
}

/// GET: server-to-client event stream bound to a session
pub async fn open_stream(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !accept(&headers).contains(EVENT_STREAM) {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    let id = match session_id(&headers) {
        Some(id) => id,
        None => match state.sessions.create() {
            Ok(id) => {
                info!(session = %id, "Created session for event stream");
                id
            }
            Err(e) => {
                return reject(JsonRpcError::service_unavailable(e.to_string()), Value::Null, false)
            }
        },
    };
    let SessionStream {
        mut messages,
        closed,
    } = match state.sessions.open_stream(&id) {
        Ok(stream) => stream,
        Err(_) => return reject(JsonRpcError::session_not_found(), Value::Null, false),
    };

    let shutdown = state.shutdown.clone();
    let session = id.clone();
    let events = async_stream::stream! {
        loop {
            let message = tokio::select! {
                biased;
                message = messages.recv() => message,
                _ = closed.cancelled() => None,
                _ = shutdown.cancelled() => None,
            };
            match message {
                Some(message) => yield Event::default().event("message").json_data(&message),
                None => break,
            }
        }
        debug!(session = %session, "Event stream closed");
    };

    with_session(
        Sse::new(events).keep_alive(KeepAlive::default()).into_response(),
        Some(&id),
    )
}

/// DELETE: end a session
pub async fn delete_session(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(id) = session_id(&headers) else {
        return reject(
            JsonRpcError::invalid_request("missing Mcp-Session-Id header"),
            Value::Null,
            false,
        );
    };
    if state.sessions.remove(&id) {
        info!(session = %id, "Session terminated by client");
        StatusCode::NO_CONTENT.into_response()
    } else {
        reject(JsonRpcError::session_not_found(), Value::Null, false)
    }
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "sessions": state.sessions.count(),
    }))
}
