//! MCP request handler implementation.

use crate::error::ProtocolResult;
use crate::protocol::{
    CallToolParams, CallToolResult, Handler, Implementation, InitializeParams, InitializeResult,
    ListToolsResult, MCP_VERSION, ServerCapabilities, ToolsCapability,
};
use crate::server::state::ServerState;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info};

/// MCP request handler that processes protocol messages.
pub struct McpHandler {
    state: Arc<ServerState>,
}

impl McpHandler {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    fn instructions(&self) -> String {
        let policy = self.state.executor.policy();
        let mut text = format!(
            "OMOP CDM database server. Call Get_Information_Schema to list the tables and \
            columns you may use, then Select_Query to run a single read-only SELECT. \
            Results are CSV, capped at {} rows.",
            self.state.executor.row_limit()
        );
        if !policy.allow_source_value_columns() {
            text.push_str(
                " Source value columns (*_source_value, *_source_concept_id) are not available; \
                join on the concept table through the *_concept_id columns instead.",
            );
        }
        text
    }
}

#[async_trait]
impl Handler for McpHandler {
    async fn initialize(&self, params: InitializeParams) -> ProtocolResult<InitializeResult> {
        info!(
            "Initialize request from {} v{}",
            params.client_info.name, params.client_info.version
        );
        debug!("Client capabilities: {}", params.capabilities);

        self.state.set_initialized(params.client_info);

        Ok(InitializeResult {
            protocol_version: MCP_VERSION.into(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: Some(false),
                }),
            },
            server_info: Implementation {
                name: self.state.config.name.to_string(),
                version: self.state.config.version.to_string(),
            },
            instructions: Some(self.instructions()),
        })
    }

    async fn initialized(&self) -> ProtocolResult<()> {
        info!("Server initialized successfully");
        Ok(())
    }

    async fn list_tools(&self) -> ProtocolResult<ListToolsResult> {
        let tools = self.state.tools.list();
        debug!("Listing {} tools", tools.len());

        Ok(ListToolsResult {
            tools,
            next_cursor: None,
        })
    }

    async fn call_tool(&self, params: CallToolParams) -> ProtocolResult<CallToolResult> {
        let call = self.state.record_tool_call();
        debug!(call, "Tool call: {}", params.name);

        match self.state.tools.execute(params).await {
            Ok(result) => Ok(result),
            Err(e) => {
                error!("Tool execution error: {}", e);
                Ok(CallToolResult::error(format!("Error: {e}")))
            }
        }
    }
}
