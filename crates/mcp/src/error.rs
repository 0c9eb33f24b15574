//! Error codes, tool failure classification and the HTTP status of each band.

use crate::protocol::JsonRpcError;
use toolgate_core::ApiError;

pub mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    pub const TOOL_NOT_FOUND: i32 = -1302;
    pub const SESSION_NOT_FOUND: i32 = -1303;
    pub const SERVICE_UNAVAILABLE: i32 = -3001;

    pub const TOOL_EXECUTION_FAILED: i32 = -4000;
    pub const TOOL_NETWORK_ERROR: i32 = -4001;
    pub const TOOL_TIMEOUT: i32 = -4002;
    pub const TOOL_AUTH_ERROR: i32 = -4003;
    pub const TOOL_VALIDATION_ERROR: i32 = -4004;
    pub const TOOL_SERIALIZATION_ERROR: i32 = -4005;
    pub const TOOL_PARAMETER_ERROR: i32 = -4006;
}

/// Band of a failed tool call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolErrorKind {
    Generic,
    Network,
    Timeout,
    Auth,
    Validation,
    Serialization,
    Parameter,
}

/// Result of classifying an error's text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: ToolErrorKind,
    pub label: &'static str,
}

impl Classification {
    fn new(kind: ToolErrorKind, label: &'static str) -> Self {
        Self { kind, label }
    }
}

const NETWORK: [&str; 6] = [
    "connection refused",
    "no such host",
    "dns error",
    "network is unreachable",
    "connection reset",
    "error sending request",
];

const AUTH: [&str; 6] = [
    "unauthorized",
    "authentication failed",
    "invalid credentials",
    "token expired",
    "forbidden",
    "access denied",
];

const PARAMETER: [&str; 4] = [
    "invalid parameter",
    "validation failed",
    "invalid format",
    "missing required field",
];

const SERIALIZATION: [&str; 4] = ["marshal", "serialize", "json", "serialization"];

impl ToolErrorKind {
    /// Classify an error by its text. First match wins.
    pub fn classify(text: &str) -> Classification {
        let lower = text.to_lowercase();
        let has = |needle: &str| lower.contains(needle);
        let any = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

        if has("timeout") || has("deadline exceeded") {
            return Classification::new(Self::Timeout, "Tool execution timed out");
        }
        if any(&NETWORK) {
            return Classification::new(Self::Network, "Network error during tool execution");
        }
        if any(&AUTH) {
            return Classification::new(Self::Auth, "Authentication failed during tool execution");
        }
        if (has("required") && has("not provided")) || any(&PARAMETER) {
            return Classification::new(
                Self::Parameter,
                "Invalid or missing parameters for tool execution",
            );
        }
        if any(&SERIALIZATION) {
            return Classification::new(
                Self::Serialization,
                "Data serialization error during tool execution",
            );
        }

        let by_status = [
            ("status 400", Self::Validation, "Invalid request parameters"),
            ("bad request", Self::Validation, "Invalid request parameters"),
            ("status 401", Self::Auth, "Authentication required"),
            ("status 403", Self::Auth, "Access forbidden"),
            ("status 404", Self::Validation, "Resource not found"),
            ("status 422", Self::Validation, "Request validation failed"),
            ("status 429", Self::Validation, "Rate limit exceeded"),
            ("status 5", Self::Generic, "Server error during tool execution"),
        ];
        for (needle, kind, label) in by_status {
            if has(needle) {
                return Classification::new(kind, label);
            }
        }

        Classification::new(Self::Generic, "Tool execution failed")
    }

    pub fn code(self) -> i32 {
        match self {
            Self::Generic => codes::TOOL_EXECUTION_FAILED,
            Self::Network => codes::TOOL_NETWORK_ERROR,
            Self::Timeout => codes::TOOL_TIMEOUT,
            Self::Auth => codes::TOOL_AUTH_ERROR,
            Self::Validation => codes::TOOL_VALIDATION_ERROR,
            Self::Serialization => codes::TOOL_SERIALIZATION_ERROR,
            Self::Parameter => codes::TOOL_PARAMETER_ERROR,
        }
    }
}

/// HTTP status for a JSON-RPC error code
pub fn http_status(code: i32) -> u16 {
    match code {
        codes::PARSE_ERROR | codes::INVALID_REQUEST | codes::INVALID_PARAMS => 400,
        codes::METHOD_NOT_FOUND | codes::TOOL_NOT_FOUND | codes::SESSION_NOT_FOUND => 404,
        codes::SERVICE_UNAVAILABLE => 503,
        codes::TOOL_NETWORK_ERROR => 502,
        codes::TOOL_TIMEOUT => 504,
        codes::TOOL_AUTH_ERROR => 401,
        codes::TOOL_VALIDATION_ERROR | codes::TOOL_PARAMETER_ERROR => 422,
        _ => 500,
    }
}

impl JsonRpcError {
    pub fn parse_error(detail: impl Into<String>) -> Self {
        Self::new(codes::PARSE_ERROR, "Parse error").with_data(detail.into())
    }

    pub fn invalid_request(detail: impl Into<String>) -> Self {
        Self::new(codes::INVALID_REQUEST, "Invalid Request").with_data(detail.into())
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, "Method not found").with_data(method)
    }

    pub fn invalid_params(detail: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, "Invalid params").with_data(detail.into())
    }

    pub fn internal_error(detail: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, "Internal error").with_data(detail.into())
    }

    pub fn tool_not_found(name: &str) -> Self {
        Self::new(codes::TOOL_NOT_FOUND, "Tool not found").with_data(name)
    }

    pub fn session_not_found() -> Self {
        Self::new(codes::SESSION_NOT_FOUND, "Session not found")
    }

    pub fn service_unavailable(detail: impl Into<String>) -> Self {
        Self::new(codes::SERVICE_UNAVAILABLE, "Service unavailable").with_data(detail.into())
    }

    /// Failed tool call: full chain as data. The band comes from the API error
    /// when there is one, else from the root cause, so context added on the
    /// way up never shifts it.
    pub fn tool_failure(err: &anyhow::Error) -> Self {
        let basis = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<ApiError>())
            .map(ToString::to_string)
            .unwrap_or_else(|| err.root_cause().to_string());
        let class = ToolErrorKind::classify(&basis);
        Self::new(class.kind.code(), class.label).with_data(format!("{:#}", err))
    }

    pub fn http_status(&self) -> u16 {
        http_status(self.code)
    }
}
