//! Tool registry keyed by MCP tool name.

use crate::error::{Result, ToolError};
use crate::protocol::{CallToolParams, CallToolResult, Tool};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument};

/// One callable MCP tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn definition(&self) -> Tool;

    /// Run the tool. `Err` is reserved for malformed calls; failures the caller should read
    /// and act on come back as an `isError` result.
    async fn execute(&self, arguments: Value) -> Result<CallToolResult>;
}

pub struct ToolRegistry {
    tools: DashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: DashMap::new(),
        }
    }

    pub fn register<T: ToolHandler + 'static>(&self, tool: T) {
        let definition = tool.definition();
        let name = definition.name.clone();
        debug!("Registering tool: {}", name);
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.get(name).map(|r| Arc::clone(&*r))
    }

    /// Tool definitions ordered by name.
    pub fn list(&self) -> Vec<Tool> {
        let mut tools: Vec<Tool> = self.tools.iter().map(|r| r.value().definition()).collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    #[instrument(skip(self, params), fields(tool = %params.name))]
    pub async fn execute(&self, params: CallToolParams) -> Result<CallToolResult> {
        let tool = self
            .get(&params.name)
            .ok_or_else(|| ToolError::NotFound(params.name.clone()))?;

        let start = Instant::now();
        let result = tool.execute(params.arguments).await?;
        info!(
            is_error = result.is_error,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Tool call finished"
        );
        Ok(result)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[macro_export]
macro_rules! define_tool {
    (
        name: $name:expr,
        description: $desc:expr,
        schema: $schema:tt
    ) => {
        $crate::protocol::Tool {
            name: $name.into(),
            description: $desc.into(),
            input_schema: serde_json::json!($schema),
        }
    };
}

pub fn text_result(text: impl Into<String>) -> CallToolResult {
    CallToolResult::text(text)
}

pub fn error_result(message: impl Into<String>) -> CallToolResult {
    CallToolResult::error(message)
}
