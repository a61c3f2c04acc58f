//! `Get_Information_Schema`: the tables and columns a query may use.

use crate::error::Result;
use crate::executor::QueryExecutor;
use crate::protocol::{CallToolResult, Tool};
use crate::tools::registry::{ToolHandler, error_result, text_result};
use crate::tools::render_error;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{instrument, warn};

pub const GET_INFORMATION_SCHEMA: &str = "Get_Information_Schema";

pub struct GetInformationSchemaTool {
    executor: Arc<QueryExecutor>,
}

impl GetInformationSchemaTool {
    pub fn new(executor: Arc<QueryExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl ToolHandler for GetInformationSchemaTool {
    fn definition(&self) -> Tool {
        crate::define_tool! {
            name: GET_INFORMATION_SCHEMA,
            description: "Get the information schema of the OMOP database. \
                Lists schema, table, column and data type as CSV, restricted to the tables \
                and columns queries are allowed to use.",
            schema: {
                "type": "object",
                "properties": {}
            }
        }
    }

    #[instrument(skip(self, _arguments), fields(tool = GET_INFORMATION_SCHEMA))]
    async fn execute(&self, _arguments: Value) -> Result<CallToolResult> {
        match self.executor.information_schema_csv().await {
            Ok(csv) => Ok(text_result(csv)),
            Err(e) => {
                warn!(error = %e, "Get_Information_Schema failed");
                Ok(error_result(render_error(&e)))
            }
        }
    }
}
