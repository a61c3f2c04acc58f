//! `Select_Query`: run one validated SELECT and return CSV.

use crate::error::{Result, ToolError};
use crate::executor::QueryExecutor;
use crate::protocol::{CallToolResult, Tool};
use crate::tools::registry::{ToolHandler, error_result, text_result};
use crate::tools::render_error;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{instrument, warn};

pub const SELECT_QUERY: &str = "Select_Query";

#[derive(Debug, Deserialize)]
pub struct SelectQueryArgs {
    pub query: String,
}

pub struct SelectQueryTool {
    executor: Arc<QueryExecutor>,
}

impl SelectQueryTool {
    pub fn new(executor: Arc<QueryExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl ToolHandler for SelectQueryTool {
    fn definition(&self) -> Tool {
        let row_limit = self.executor.row_limit();
        crate::define_tool! {
            name: SELECT_QUERY,
            description: format!(
                "Execute a select query against the OMOP database. \
                Only a single SELECT statement over OMOP CDM tables is accepted. \
                Results are returned as CSV and capped at {row_limit} rows. \
                Use Get_Information_Schema first to see the available tables and columns."
            ),
            schema: {
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "SQL SELECT query to execute"
                    }
                },
                "required": ["query"]
            }
        }
    }

    #[instrument(skip(self, arguments), fields(tool = SELECT_QUERY))]
    async fn execute(&self, arguments: Value) -> Result<CallToolResult> {
        let args: SelectQueryArgs = serde_json::from_value(arguments)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;

        match self.executor.select_query_csv(&args.query).await {
            Ok(csv) => Ok(text_result(csv)),
            Err(e) => {
                warn!(error = %e, "Select_Query failed");
                Ok(error_result(render_error(&e)))
            }
        }
    }
}
