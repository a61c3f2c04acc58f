//! MCP server binary entry point.

use anyhow::{Context, Result};
use omop_mcp::{
    config::ServerConfig,
    executor::QueryExecutor,
    protocol::McpServer,
    server::{McpHandler, ServerState},
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!(
        "Starting {} v{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let config = ServerConfig::from_env().context("invalid configuration")?;
    info!(
        cdm_schema = %config.database.cdm_schema,
        vocab_schema = %config.database.vocab_schema,
        store = ?config.database.store_kind(),
        dialect = ?config.policy.dialect,
        excluded_tables = config.policy.exclude_tables.len(),
        excluded_columns = config.policy.exclude_columns.len(),
        "Configuration loaded"
    );

    let executor = QueryExecutor::connect(&config)
        .await
        .context("failed to connect to the OMOP database")?;

    let name = config.name.to_string();
    let version = config.version.to_string();
    let state = Arc::new(ServerState::new(config, Arc::new(executor)));
    info!("Server state initialized with {} tools", state.tools.len());

    let server = McpServer::new(McpHandler::new(state), name, version);
    info!("MCP server ready, waiting for requests on stdin");

    server.run().await?;

    info!("Server shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("omop_mcp=info,warn"));

    // JSON to stderr; stdout carries the protocol.
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .json()
        .init();
}
