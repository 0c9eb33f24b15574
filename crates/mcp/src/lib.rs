// MCP (Model Context Protocol) engine: JSON-RPC framing, error taxonomy,
// tool registry and the line-delimited stdio transport

pub mod error;
pub mod protocol;
pub mod server;
pub mod tools;
pub mod transport;

pub use error::{http_status, ToolErrorKind};
pub use server::McpServer;
