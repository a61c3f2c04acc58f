//! MCP server loop with session lifecycle tracking.

use crate::error::{McpError, ProtocolError, Result};
use crate::protocol::handler::{Dispatcher, Handler};
use crate::protocol::transport::{StdioTransport, Transport};
use crate::protocol::types::*;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Server created but not initialized.
    Created,
    /// Initialize request received, awaiting the initialized notification.
    Initializing,
    /// Server is fully operational.
    Running,
    /// Input closed or transport failed.
    Stopped,
}

/// MCP Server.
pub struct McpServer<H: Handler> {
    name: String,
    version: String,
    handler: Arc<H>,
    state: RwLock<SessionState>,
}

impl<H: Handler> McpServer<H> {
    pub fn new(handler: H, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            handler: Arc::new(handler),
            state: RwLock::new(SessionState::Created),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Serve over stdin/stdout until the client closes its end.
    #[instrument(skip(self), fields(server = %self.name))]
    pub async fn run(&self) -> Result<()> {
        self.run_with_transport(&StdioTransport::stdio()).await
    }

    /// Serve over `transport` until it reports end of input.
    pub async fn run_with_transport<T: Transport>(&self, transport: &T) -> Result<()> {
        info!("Starting MCP server: {} v{}", self.name, self.version);
        let dispatcher = Dispatcher::new(Arc::clone(&self.handler));

        loop {
            let message = match transport.read_message().await {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    debug!("EOF received, shutting down");
                    break;
                }
                Err(McpError::Protocol(ProtocolError::ParseError)) => {
                    let response = JsonRpcResponse::error(None, JsonRpcError::parse_error());
                    if let Err(e) = transport.write_response(&response).await {
                        error!("Failed to send error response: {}", e);
                    }
                    continue;
                }
                Err(e) => {
                    error!("Transport error: {}", e);
                    *self.state.write() = SessionState::Stopped;
                    return Err(e);
                }
            };

            match message {
                Message::Request(request) => {
                    self.update_state_for_method(&request.method);
                    if let Some(response) = dispatcher.dispatch(request).await
                        && let Err(e) = transport.write_response(&response).await
                    {
                        error!("Failed to send response: {}", e);
                    }
                }
                Message::Response(response) => {
                    warn!("Unexpected response received: {:?}", response.id);
                }
            }
        }

        *self.state.write() = SessionState::Stopped;
        info!("Server stopped");
        Ok(())
    }

    fn update_state_for_method(&self, method: &str) {
        let mut state = self.state.write();
        match (method, *state) {
            ("initialize", SessionState::Created) => *state = SessionState::Initializing,
            ("notifications/initialized" | "initialized", SessionState::Initializing) => {
                *state = SessionState::Running;
                info!("Server initialized and running");
            }
            _ => {}
        }
    }
}
