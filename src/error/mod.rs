//! Error types for the OMOP MCP server.
//!
//! Uses `thiserror` for ergonomic error definitions with automatic `From` conversions.
//! Validation failures and store failures are kept in separate enums so callers can tell
//! a query they must rewrite from one they may retry.

use crate::security::Finding;
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;

/// Main error type for the server.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {message}")]
    Internal { message: Cow<'static, str> },
}

/// Aggregate of every rule a query broke.
///
/// Never empty when produced by the validator. The display form lists each finding on its
/// own line so the caller can fix all of them in one round-trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    findings: Vec<Finding>,
}

impl ValidationError {
    pub fn new(findings: Vec<Finding>) -> Self {
        Self { findings }
    }

    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    pub fn into_findings(self) -> Vec<Finding> {
        self.findings
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Query validation failed")?;
        for finding in &self.findings {
            write!(f, "\n- [{}] {}", finding.kind, finding.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

/// Errors raised by the backing store.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("No live database connection: {0}")]
    NotConnected(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    #[error("Query timeout after {0}ms")]
    Timeout(u64),
}

impl DatabaseError {
    /// Connection-class errors are fatal at startup; the rest are per-query.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::NotConnected(_) | Self::ConnectionFailed(_))
    }
}

/// JSON-RPC 2.0 and MCP protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Parse error: invalid JSON")]
    ParseError,

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(Cow<'static, str>),

    #[error("Internal error: {0}")]
    InternalError(Cow<'static, str>),
}

impl ProtocolError {
    /// Returns the JSON-RPC 2.0 error code.
    pub fn code(&self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::MethodNotFound(_) => -32601,
            Self::InvalidParams(_) => -32602,
            Self::InternalError(_) => -32603,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required field: {0}")]
    MissingField(Cow<'static, str>),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue {
        field: Cow<'static, str>,
        message: Cow<'static, str>,
    },

    #[error("Environment variable not found: {0}")]
    EnvNotFound(String),
}

/// Tool execution errors.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
}

/// Result type alias for McpError.
pub type Result<T> = std::result::Result<T, McpError>;

/// Result type alias for DatabaseError.
pub type DbResult<T> = std::result::Result<T, DatabaseError>;

/// Result type alias for ProtocolError.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::FindingKind;

    #[test]
    fn test_protocol_error_codes() {
        assert_eq!(ProtocolError::ParseError.code(), -32700);
        assert_eq!(ProtocolError::MethodNotFound("test".into()).code(), -32601);
        assert_eq!(ProtocolError::InvalidParams("test".into()).code(), -32602);
        assert_eq!(ProtocolError::InternalError("test".into()).code(), -32603);
    }

    #[test]
    fn test_error_conversion() {
        let db_error = DatabaseError::ConnectionFailed("test".into());
        assert!(db_error.is_connection_error());
        let mcp_error: McpError = db_error.into();
        assert!(matches!(mcp_error, McpError::Database(_)));
    }

    #[test]
    fn test_validation_error_keeps_every_message() {
        let error = ValidationError::new(vec![
            Finding::new(
                FindingKind::UnknownTable,
                vec!["users".into()],
                "Tables not found in OMOP CDM: users",
            ),
            Finding::new(
                FindingKind::ForbiddenColumn,
                vec!["gender_source_value".into()],
                "Source value columns are not allowed: gender_source_value",
            ),
        ]);

        let text = error.to_string();
        assert!(text.starts_with("Query validation failed"));
        assert!(text.contains("[UnknownTable] Tables not found in OMOP CDM: users"));
        assert!(text.contains("[ForbiddenColumn] Source value columns are not allowed"));
        assert_eq!(error.findings().len(), 2);
    }
}
