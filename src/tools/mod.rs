//! MCP tool definitions and registry.

pub mod query;
pub mod registry;
pub mod schema;

pub use query::{SELECT_QUERY, SelectQueryTool};
pub use registry::{ToolHandler, ToolRegistry, error_result, text_result};
pub use schema::{GET_INFORMATION_SCHEMA, GetInformationSchemaTool};

use crate::error::{DatabaseError, McpError, ValidationError};
use crate::executor::QueryExecutor;
use crate::security::FindingKind;
use std::sync::Arc;

/// Create and register all tools.
pub fn create_registry(executor: Arc<QueryExecutor>) -> ToolRegistry {
    let registry = ToolRegistry::new();
    registry.register(GetInformationSchemaTool::new(Arc::clone(&executor)));
    registry.register(SelectQueryTool::new(executor));
    registry
}

/// Text shown to the agent when a tool call fails. Always starts with `Error:` and ends with
/// what to do next.
pub fn render_error(error: &McpError) -> String {
    match error {
        McpError::Validation(v) => render_validation(v),
        McpError::Database(DatabaseError::Timeout(ms)) => format!(
            "Error: Query did not finish within {ms}ms. \
            Please narrow the query with filters or aggregate before returning rows."
        ),
        McpError::Database(e @ DatabaseError::QueryFailed(_)) => format!(
            "Error: {e}. Please check column names and table references."
        ),
        McpError::Database(e) => format!(
            "Error: {e}. The database is unavailable; please contact the administrator if this issue persists."
        ),
        other => format!(
            "Error: Unexpected error: {other}. Please contact the administrator if this issue persists."
        ),
    }
}

fn render_validation(error: &ValidationError) -> String {
    let mut out = String::from("Error: Query validation failed.");
    for finding in error.findings() {
        let sep = if finding.message.ends_with('.') { " " } else { ". " };
        out.push_str("\n- ");
        out.push_str(&finding.message);
        out.push_str(sep);
        out.push_str(hint(finding.kind));
    }
    out
}

fn hint(kind: FindingKind) -> &'static str {
    match kind {
        FindingKind::EmptyQuery => "Please provide a non-empty SQL query.",
        FindingKind::SyntaxError => "Please check your SQL syntax and try again.",
        FindingKind::NotSelect => "Please submit a single read-only SELECT statement.",
        FindingKind::UnknownTable => "Please check that you're using valid table names.",
        FindingKind::ForbiddenTable => "Please use only the authorized tables.",
        FindingKind::ForbiddenColumn => "Please use only the authorized columns.",
    }
}
