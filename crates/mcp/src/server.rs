// Transport-independent MCP protocol engine

use crate::protocol::{
    negotiate_version, CallToolParams, CallToolResult, InitializeParams, InitializeResult,
    JsonRpcError, JsonRpcRequest, JsonRpcResponse, ListToolsResult, ServerCapabilities,
    ServerInfo, ToolContent, ToolsCapability, JSONRPC_VERSION,
};
use crate::tools::ToolRegistry;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use toolgate_core::RequestContext;
use tracing::{debug, info, warn};

/// Dispatches JSON-RPC messages against a read-only tool registry.
///
/// Holds no per-call state, so one instance serves every transport task.
pub struct McpServer {
    registry: Arc<ToolRegistry>,
    info: ServerInfo,
}

impl McpServer {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            info: ServerInfo::default(),
        }
    }

    pub fn with_info(mut self, info: ServerInfo) -> Self {
        self.info = info;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Parse one raw message. Failures come back as the error response to send.
    pub fn parse_message(raw: &str) -> Result<JsonRpcRequest, JsonRpcResponse> {
        let value: Value = serde_json::from_str(raw).map_err(|e| {
            JsonRpcResponse::error(salvage_id(raw), JsonRpcError::parse_error(e.to_string()))
        })?;

        let id = value.get("id").cloned().unwrap_or(Value::Null);
        if !value.is_object() {
            return Err(JsonRpcResponse::error(
                id,
                JsonRpcError::invalid_request("message must be a JSON object"),
            ));
        }

        match serde_json::from_value::<JsonRpcRequest>(value) {
            Ok(req) if req.jsonrpc == JSONRPC_VERSION => Ok(req),
            Ok(req) => Err(JsonRpcResponse::error(
                id,
                JsonRpcError::invalid_request(format!(
                    "unsupported jsonrpc version '{}'",
                    req.jsonrpc
                )),
            )),
            Err(e) => Err(JsonRpcResponse::error(
                id,
                JsonRpcError::invalid_request(e.to_string()),
            )),
        }
    }

    /// Parse and dispatch one raw message
    pub async fn handle_message(&self, raw: &str, ctx: &RequestContext) -> JsonRpcResponse {
        match Self::parse_message(raw) {
            Ok(req) => self.handle_request(req, ctx).await,
            Err(response) => {
                debug!(code = ?response.error_code(), "Rejected malformed message");
                response
            }
        }
    }

    pub async fn handle_request(&self, req: JsonRpcRequest, ctx: &RequestContext) -> JsonRpcResponse {
        let id = req.response_id();
        match req.method.as_str() {
            "initialize" => self.initialize(id, req.params),
            "notifications/initialized" | "ping" => JsonRpcResponse::success(id, json!({})),
            "tools/list" => respond(
                id,
                ListToolsResult {
                    tools: self.registry.list_schemas(),
                },
            ),
            "tools/call" => self.call_tool(id, req.params, ctx).await,
            other => {
                debug!(method = %other, "Unknown method requested");
                JsonRpcResponse::error(id, JsonRpcError::method_not_found(other))
            }
        }
    }

    fn initialize(&self, id: Value, params: Option<Value>) -> JsonRpcResponse {
        let params: InitializeParams = params
            .and_then(|p| serde_json::from_value(p).ok())
            .unwrap_or_default();
        let version = negotiate_version(params.protocol_version.as_deref());

        if let Some(client) = &params.client_info {
            info!(client = %client.name, client_version = %client.version, protocol = version, "Client initialized");
        }

        respond(
            id,
            InitializeResult {
                protocol_version: version.to_string(),
                capabilities: ServerCapabilities {
                    tools: ToolsCapability {
                        list_changed: false,
                    },
                },
                server_info: self.info.clone(),
            },
        )
    }

    async fn call_tool(&self, id: Value, params: Option<Value>, ctx: &RequestContext) -> JsonRpcResponse {
        let params = match params {
            Some(params @ Value::Object(_)) => params,
            _ => {
                return JsonRpcResponse::error(
                    id,
                    JsonRpcError::invalid_params("params must be an object"),
                )
            }
        };
        let params: CallToolParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return JsonRpcResponse::error(id, JsonRpcError::invalid_params(e.to_string())),
        };
        let arguments = match params.arguments {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(args @ Value::Object(_)) => args,
            Some(_) => {
                return JsonRpcResponse::error(
                    id,
                    JsonRpcError::invalid_params("arguments must be an object"),
                )
            }
        };

        let Some(tool) = self.registry.get(&params.name) else {
            warn!(tool = %params.name, "Tool not found");
            return JsonRpcResponse::error(id, JsonRpcError::tool_not_found(&params.name));
        };

        match tool.execute(arguments, ctx).await {
            Ok(result) => {
                info!(tool = %params.name, "Tool execution successful");
                let text = match serde_json::to_string(&result) {
                    Ok(text) => text,
                    Err(e) => {
                        return JsonRpcResponse::error(id, JsonRpcError::internal_error(e.to_string()))
                    }
                };
                respond(
                    id,
                    CallToolResult {
                        content: vec![ToolContent::text(text)],
                    },
                )
            }
            Err(e) => {
                let error = JsonRpcError::tool_failure(&e);
                warn!(
                    tool = %params.name,
                    code = error.code,
                    label = %error.message,
                    error = %format!("{:#}", e),
                    "Tool execution failed"
                );
                JsonRpcResponse::error(id, error)
            }
        }
    }
}

fn respond(id: Value, result: impl Serialize) -> JsonRpcResponse {
    match serde_json::to_value(result) {
        Ok(result) => JsonRpcResponse::success(id, result),
        Err(e) => JsonRpcResponse::error(id, JsonRpcError::internal_error(e.to_string())),
    }
}

/// Best-effort id recovery from text that failed to parse: the value that
/// follows the first `"id":` key that still parses on its own.
fn salvage_id(raw: &str) -> Value {
    let mut rest = raw;
    while let Some(pos) = rest.find("\"id\"") {
        rest = &rest[pos + 4..];
        let Some(after_colon) = rest.trim_start().strip_prefix(':') else {
            continue;
        };
        let mut values = serde_json::Deserializer::from_str(after_colon).into_iter::<Value>();
        if let Some(Ok(id)) = values.next() {
            if id.is_string() || id.is_number() {
                return id;
            }
        }
    }
    Value::Null
}
