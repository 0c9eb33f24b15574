mod api;
mod registry;

pub use api::{registry_from_operations, ApiTool};
pub use registry::{Tool, ToolRegistry};
