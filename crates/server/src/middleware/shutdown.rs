// Force-close of requests still running when the shutdown grace period ends

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use toolgate_mcp::protocol::{JsonRpcError, JsonRpcResponse};

/// Race the handler against the force-close token. A cancelled handler is
/// dropped, which also cancels its outbound calls, and the client gets a 503
/// so the connection can finish and close.
pub async fn abort_on_force_close(
    State(force_close): State<CancellationToken>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();
    tokio::select! {
        biased;
        response = next.run(req) => response,
        _ = force_close.cancelled() => {
            tracing::warn!(path = %path, "Aborting in-flight request at end of shutdown grace period");
            let error = JsonRpcError::service_unavailable("server is shutting down");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(JsonRpcResponse::error(Value::Null, error)),
            )
                .into_response()
        }
    }
}
