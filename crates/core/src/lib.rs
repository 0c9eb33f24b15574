// Core types for the toolgate REST-to-MCP gateway: request context, header
// forwarding expressions, configuration, API description loading and the
// outbound API client.

pub mod client;
pub mod config;
pub mod context;
pub mod expression;
pub mod forwarding;
pub mod openapi;

pub use client::{load_api, ApiClient, ApiError, ApiResponse, RetryPolicy};
pub use config::{Config, ConfigError, ConfigLoader};
pub use context::{RequestContext, RequestContextBuilder};
pub use expression::{Expression, ExpressionError};
pub use forwarding::{
    DirectiveError, DirectiveValue, ForwardingDirective, ForwardingError, HeadersConfig,
    RawDirective,
};
pub use openapi::{ApiOperation, ApiParameter, ParameterLocation};
