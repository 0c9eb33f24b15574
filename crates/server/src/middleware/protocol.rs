// MCP-Protocol-Version header enforcement

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;
use toolgate_mcp::protocol::{is_supported_version, JsonRpcError, JsonRpcResponse};

pub const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";

/// Reject requests announcing a protocol revision this server does not speak.
/// Requests without the header pass through.
pub async fn require_supported_version(req: Request, next: Next) -> Response {
    if let Some(value) = req.headers().get(PROTOCOL_VERSION_HEADER) {
        let version = value.to_str().unwrap_or_default();
        if !is_supported_version(version) {
            tracing::warn!(version = %version, "Rejected unsupported protocol version");
            let error = JsonRpcError::invalid_request(format!(
                "unsupported protocol version '{}'",
                version
            ));
            return (
                StatusCode::BAD_REQUEST,
                Json(JsonRpcResponse::error(Value::Null, error)),
            )
                .into_response();
        }
    }
    next.run(req).await
}
