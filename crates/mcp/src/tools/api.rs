// Tool backed by one REST operation

use crate::protocol::ToolSchema;
use crate::tools::{Tool, ToolRegistry};
use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::sync::Arc;
use toolgate_core::{ApiClient, ApiOperation, RequestContext};

pub struct ApiTool {
    operation: ApiOperation,
    client: Arc<ApiClient>,
}

impl ApiTool {
    pub fn new(operation: ApiOperation, client: Arc<ApiClient>) -> Self {
        Self { operation, client }
    }

    pub fn operation(&self) -> &ApiOperation {
        &self.operation
    }
}

#[async_trait::async_trait]
impl Tool for ApiTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.operation.name.clone(),
            description: self.operation.description.clone(),
            input_schema: self.operation.input_schema(),
        }
    }

    async fn execute(&self, arguments: Value, ctx: &RequestContext) -> Result<Value> {
        let args = match arguments {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => anyhow::bail!("invalid parameter: arguments must be an object, got {}", other),
        };

        let response = self
            .client
            .call(&self.operation, &args, ctx)
            .await
            .with_context(|| format!("{} {} failed", self.operation.method, self.operation.path))?;

        Ok(serde_json::to_value(response)?)
    }
}

/// Registry with one tool per API operation
pub fn registry_from_operations(
    operations: Vec<ApiOperation>,
    client: Arc<ApiClient>,
) -> Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    for operation in operations {
        tracing::debug!(tool = %operation.name, method = %operation.method, path = %operation.path, "Registering tool");
        registry.register(Arc::new(ApiTool::new(operation, client.clone())))?;
    }
    Ok(registry)
}
