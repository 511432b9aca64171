use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, error, warn};

use crate::config::ClientConfig;
use crate::error::{McpError, Result};
use crate::protocol::models::*;
use crate::types::{McpCallResult, McpTool};

/// Transport contract for MCP communication
#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn connect(&mut self) -> Result<()>;
    async fn disconnect(&mut self) -> Result<()>;
    async fn send(&self, message: String) -> Result<()>;
    async fn receive(&self) -> Result<Option<String>>;
    fn is_connected(&self) -> bool;
}

/// Pending request waiting for its correlated response
struct PendingRequest {
    sender: oneshot::Sender<Result<JsonRpcResponse>>,
}

/// MCP protocol client: request/response correlation over any transport.
///
/// A background pump task reads inbound messages and resolves pending
/// requests by id; server notifications are logged and dropped.
pub struct McpProtocolClient {
    transport: Arc<RwLock<Box<dyn McpTransport>>>,
    config: ClientConfig,
    next_id: AtomicU64,
    pending_requests: Arc<RwLock<HashMap<u64, PendingRequest>>>,
    pump: Option<tokio::task::JoinHandle<()>>,
}

impl McpProtocolClient {
    pub fn new(transport: Box<dyn McpTransport>, config: ClientConfig) -> Self {
        Self {
            transport: Arc::new(RwLock::new(transport)),
            config,
            next_id: AtomicU64::new(1),
            pending_requests: Arc::new(RwLock::new(HashMap::new())),
            pump: None,
        }
    }

    pub async fn connect(&mut self) -> Result<()> {
        {
            let mut transport = self.transport.write().await;
            transport.connect().await?;
        }

        self.start_pump();
        Ok(())
    }

    pub async fn disconnect(&mut self) -> Result<()> {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }

        let mut transport = self.transport.write().await;
        transport.disconnect().await
    }

    fn start_pump(&mut self) {
        let transport = self.transport.clone();
        let pending_requests = self.pending_requests.clone();

        let pump = tokio::spawn(async move {
            loop {
                let transport = transport.read().await;
                if !transport.is_connected() {
                    break;
                }

                match transport.receive().await {
                    Ok(Some(message)) => {
                        Self::handle_message(&message, &pending_requests).await;
                    }
                    Ok(None) => {
                        // No message available yet
                        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
                    }
                    Err(e) => {
                        error!("Transport error: {}", e);
                        break;
                    }
                }
            }
        });

        self.pump = Some(pump);
    }

    async fn handle_message(
        message: &str,
        pending_requests: &RwLock<HashMap<u64, PendingRequest>>,
    ) {
        if let Ok(response) = serde_json::from_str::<JsonRpcResponse>(message) {
            let mut pending = pending_requests.write().await;
            if let Some(request) = pending.remove(&response.id) {
                let _ = request.sender.send(Ok(response));
            } else {
                debug!("Response for unknown request id {}", response.id);
            }
            return;
        }

        if let Ok(notification) = serde_json::from_str::<JsonRpcNotification>(message) {
            debug!("Server notification: {}", notification.method);
            return;
        }

        warn!("Unrecognized message shape: {}", message);
    }

    async fn send_request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let timeout_ms = self.config.request_timeout_ms;

        let request = JsonRpcRequest::new(id, method, params);
        let request_json = serde_json::to_string(&request)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending_requests.write().await;
            pending.insert(id, PendingRequest { sender: tx });
        }

        {
            let transport = self.transport.read().await;
            transport.send(request_json).await?;
        }

        match tokio::time::timeout(tokio::time::Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(Ok(response))) => {
                if let Some(error) = response.error {
                    Err(McpError::Protocol(format!(
                        "{}: {}",
                        error.code, error.message
                    )))
                } else {
                    Ok(response)
                }
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(McpError::Disconnected),
            Err(_) => {
                self.pending_requests.write().await.remove(&id);
                Err(McpError::Timeout(format!(
                    "Request {} timed out after {}ms",
                    id, timeout_ms
                )))
            }
        }
    }

    async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = JsonRpcNotification {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        };
        let transport = self.transport.read().await;
        transport.send(serde_json::to_string(&notification)?).await
    }

    /// Perform the initialize handshake and acknowledge it
    pub async fn initialize(&self) -> Result<InitializeResult> {
        let params = serde_json::to_value(InitializeParams::new(&self.config))?;

        let response = self.send_request("initialize", Some(params)).await?;
        let result: InitializeResult = serde_json::from_value(
            response
                .result
                .ok_or_else(|| McpError::Protocol("Missing result".to_string()))?,
        )?;

        self.send_notification("notifications/initialized", None)
            .await?;

        Ok(result)
    }

    pub async fn list_tools(&self) -> Result<Vec<McpTool>> {
        let response = self.send_request("tools/list", None).await?;

        let result: ToolListResult = serde_json::from_value(
            response
                .result
                .ok_or_else(|| McpError::Protocol("Missing result".to_string()))?,
        )?;

        Ok(result
            .tools
            .into_iter()
            .map(|t| McpTool {
                name: t.name,
                description: t.description,
                parameters: t.input_schema.unwrap_or_else(|| serde_json::json!({})),
            })
            .collect())
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<McpCallResult> {
        let params = serde_json::to_value(ToolCallParams {
            name: name.to_string(),
            arguments: Some(arguments),
        })?;

        let response = self.send_request("tools/call", Some(params)).await?;

        let result: ToolCallResult = serde_json::from_value(
            response
                .result
                .ok_or_else(|| McpError::Protocol("Missing result".to_string()))?,
        )?;

        Ok(McpCallResult {
            content: result.content,
            is_error: result.is_error,
        })
    }
}
