//! MCP server giving AI agents validated, read-only SQL access to an OMOP CDM database.
//!
//! Every query passes the [`SqlValidator`] before it reaches the store: only a single SELECT
//! over OMOP tables is accepted, deny-listed tables and columns are refused, and source value
//! columns stay hidden unless explicitly allowed. Accepted queries run through the
//! [`QueryExecutor`], which caps rows and caches results by query text.
//!
//! # Example
//!
//! ```no_run
//! use omop_mcp::{
//!     config::ServerConfig,
//!     executor::QueryExecutor,
//!     protocol::McpServer,
//!     server::{McpHandler, ServerState},
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ServerConfig::from_env()?;
//!     let executor = Arc::new(QueryExecutor::connect(&config).await?);
//!     let state = Arc::new(ServerState::new(config, executor));
//!
//!     let server = McpServer::new(McpHandler::new(state), "omop-mcp", "0.1.0");
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod executor;
pub mod protocol;
pub mod security;
pub mod server;
pub mod tools;

pub use config::{DatabaseConfig, ExecutorConfig, PolicyConfig, ServerConfig, StoreKind};
#[cfg(feature = "duckdb")]
pub use database::DuckDbDriver;
pub use database::{DatabaseDriver, PostgresDriver, QueryResult, create_driver};
pub use error::{McpError, Result, ValidationError};
pub use executor::QueryExecutor;
pub use protocol::McpServer;
pub use security::{Finding, FindingKind, Policy, SqlValidator, ValidationResult, validate};
pub use server::{McpHandler, ServerState};
