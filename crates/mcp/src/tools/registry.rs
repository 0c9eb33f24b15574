// Tool trait and the registry the engine dispatches against

use crate::protocol::ToolSchema;
use anyhow::{bail, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use toolgate_core::RequestContext;

/// Tool executor trait
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool schema for MCP
    fn schema(&self) -> ToolSchema;

    /// Execute the tool. `arguments` is always a JSON object; `ctx` is the
    /// inbound request the call arrived on.
    async fn execute(&self, arguments: Value, ctx: &RequestContext) -> Result<Value>;
}

/// Registered tools, keyed and listed by name. Read-only once serving starts.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool; two tools may not share a name
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.schema().name;
        if self.tools.contains_key(&name) {
            bail!("tool '{}' is already registered", name);
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Schemas sorted by tool name
    pub fn list_schemas(&self) -> Vec<ToolSchema> {
        self.tools.values().map(|t| t.schema()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
