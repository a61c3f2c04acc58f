//! Shared server state.

use crate::config::ServerConfig;
use crate::executor::QueryExecutor;
use crate::protocol::Implementation;
use crate::tools::ToolRegistry;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct ServerState {
    pub config: ServerConfig,
    pub executor: Arc<QueryExecutor>,
    pub tools: ToolRegistry,
    client_info: RwLock<Option<Implementation>>,
    tool_calls: AtomicU64,
}

impl ServerState {
    /// Build the state and register every tool against `executor`.
    pub fn new(config: ServerConfig, executor: Arc<QueryExecutor>) -> Self {
        let tools = crate::tools::create_registry(Arc::clone(&executor));
        Self {
            config,
            executor,
            tools,
            client_info: RwLock::new(None),
            tool_calls: AtomicU64::new(0),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.client_info.read().is_some()
    }

    pub fn set_initialized(&self, client_info: Implementation) {
        *self.client_info.write() = Some(client_info);
    }

    pub fn client_info(&self) -> Option<Implementation> {
        self.client_info.read().clone()
    }

    pub fn record_tool_call(&self) -> u64 {
        self.tool_calls.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn tool_calls(&self) -> u64 {
        self.tool_calls.load(Ordering::Relaxed)
    }
}
