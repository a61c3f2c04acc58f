//! Request handler and method dispatcher.

use crate::error::{ProtocolError, ProtocolResult};
use crate::protocol::types::*;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, instrument, warn};

/// Handler trait for processing MCP requests.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn initialize(&self, params: InitializeParams) -> ProtocolResult<InitializeResult>;

    /// Handle the `notifications/initialized` notification.
    async fn initialized(&self) -> ProtocolResult<()>;

    async fn list_tools(&self) -> ProtocolResult<ListToolsResult>;

    async fn call_tool(&self, params: CallToolParams) -> ProtocolResult<CallToolResult>;

    async fn ping(&self) -> ProtocolResult<Value> {
        Ok(serde_json::json!({}))
    }
}

/// Routes JSON-RPC methods to a [`Handler`].
pub struct Dispatcher<H: Handler> {
    handler: Arc<H>,
}

impl<H: Handler> Dispatcher<H> {
    pub fn new(handler: Arc<H>) -> Self {
        Self { handler }
    }

    /// Dispatch a request. Notifications are handled but produce no response.
    #[instrument(skip(self, request), fields(method = %request.method))]
    pub async fn dispatch(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        debug!("Dispatching request: {}", request.method);
        let notification = request.is_notification();

        let result = match request.method.as_str() {
            "initialize" => match parse_params(request.params) {
                Ok(params) => to_value(self.handler.initialize(params).await),
                Err(e) => Err(e),
            },
            "notifications/initialized" | "initialized" => {
                self.handler.initialized().await.map(|_| Value::Null)
            }
            "ping" => self.handler.ping().await,
            "tools/list" => to_value(self.handler.list_tools().await),
            "tools/call" => match parse_params(request.params) {
                Ok(params) => to_value(self.handler.call_tool(params).await),
                Err(e) => Err(e),
            },
            method if method.starts_with("notifications/") => {
                debug!("Ignoring notification: {}", method);
                Ok(Value::Null)
            }
            method => {
                warn!("Unknown method: {}", method);
                Err(ProtocolError::MethodNotFound(method.to_string()))
            }
        };

        if notification {
            return None;
        }

        Some(match result {
            Ok(value) => JsonRpcResponse::success(request.id, value),
            Err(e) => {
                error!("Request failed: {}", e);
                JsonRpcResponse::error(request.id, JsonRpcError::new(e.code(), e.to_string()))
            }
        })
    }
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> ProtocolResult<T> {
    let params = params.ok_or_else(|| ProtocolError::InvalidParams("Missing params".into()))?;
    serde_json::from_value(params).map_err(|e| ProtocolError::InvalidParams(e.to_string().into()))
}

fn to_value<T: Serialize>(result: ProtocolResult<T>) -> ProtocolResult<Value> {
    serde_json::to_value(result?).map_err(|e| ProtocolError::InternalError(e.to_string().into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct MockHandler {
        initialized: AtomicBool,
    }

    #[async_trait]
    impl Handler for MockHandler {
        async fn initialize(&self, params: InitializeParams) -> ProtocolResult<InitializeResult> {
            Ok(InitializeResult {
                protocol_version: params.protocol_version,
                capabilities: ServerCapabilities::default(),
                server_info: Implementation {
                    name: "test".into(),
                    version: "1.0".into(),
                },
                instructions: None,
            })
        }

        async fn initialized(&self) -> ProtocolResult<()> {
            self.initialized.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn list_tools(&self) -> ProtocolResult<ListToolsResult> {
            Ok(ListToolsResult {
                tools: vec![],
                next_cursor: None,
            })
        }

        async fn call_tool(&self, params: CallToolParams) -> ProtocolResult<CallToolResult> {
            Ok(CallToolResult::text(params.name))
        }
    }

    fn request(id: Option<i64>, method: &str, params: Option<Value>) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: "2.0".into(),
            id: id.map(RequestId::Number),
            method: method.into(),
            params,
        }
    }

    #[tokio::test]
    async fn test_dispatcher_initialize() {
        let dispatcher = Dispatcher::new(Arc::new(MockHandler::default()));

        let request = request(
            Some(1),
            "initialize",
            Some(serde_json::json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": {"name": "test-client", "version": "1.0"}
            })),
        );

        let response = dispatcher.dispatch(request).await.unwrap();
        assert!(response.error.is_none());
        assert_eq!(response.result.unwrap()["serverInfo"]["name"], "test");
    }

    #[tokio::test]
    async fn test_notification_gets_no_response() {
        let handler = Arc::new(MockHandler::default());
        let dispatcher = Dispatcher::new(Arc::clone(&handler));

        let response = dispatcher
            .dispatch(request(None, "notifications/initialized", None))
            .await;
        assert!(response.is_none());
        assert!(handler.initialized.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_dispatcher_errors() {
        let dispatcher = Dispatcher::new(Arc::new(MockHandler::default()));

        let response = dispatcher
            .dispatch(request(Some(1), "unknown/method", None))
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, -32601);

        let response = dispatcher
            .dispatch(request(Some(2), "tools/call", None))
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, -32602);
    }
}
