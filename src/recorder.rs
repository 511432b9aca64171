//! Per-session recording of tool-call exchanges from instrumented transports.

use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::notify::{NotificationSink, MCP_MANAGER_UPDATE};
use crate::protocol::McpTransport;
use crate::transports::InstrumentedTransport;
use crate::types::{ExchangeState, ToolExchange};

/// Builds ordered per-session logs of `tools/call` exchanges by observing
/// raw wire traffic, and broadcasts change notifications for UI refresh.
pub struct ExchangeRecorder {
    exchanges: DashMap<String, Vec<ToolExchange>>,
    sink: Arc<dyn NotificationSink>,
}

/// Render a JSON-RPC id as the string used for correlation
fn stringify_id(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl ExchangeRecorder {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            exchanges: DashMap::new(),
            sink,
        }
    }

    /// Wrap a transport so all of its traffic is recorded under `key`
    pub fn instrument(
        self: Arc<Self>,
        key: &str,
        transport: Box<dyn McpTransport>,
    ) -> Box<dyn McpTransport> {
        let send_recorder = self.clone();
        let send_key = key.to_string();
        let receive_recorder = self;
        let receive_key = key.to_string();

        Box::new(InstrumentedTransport::new(
            transport,
            Some(Arc::new(move |message: &str| {
                send_recorder.record_outbound(&send_key, message);
            })),
            Some(Arc::new(move |message: &str| {
                receive_recorder.record_inbound(&receive_key, message);
            })),
        ))
    }

    /// Outbound: only `tools/call` requests open a new exchange.
    /// Notifications (no id) and other methods are ignored.
    fn record_outbound(&self, key: &str, raw: &str) {
        let Ok(value) = serde_json::from_str::<Value>(raw) else {
            return;
        };
        let Some(object) = value.as_object() else {
            return;
        };
        if !object.contains_key("id") {
            return;
        }
        if object.get("method").and_then(Value::as_str) != Some("tools/call") {
            return;
        }

        let params = object.get("params");
        let tool_name = params
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let input = params.and_then(|p| p.get("arguments")).cloned();
        let tool_call_id = stringify_id(object.get("id").unwrap_or(&Value::Null));

        debug!("Recording tool call '{}' ({}) for {}", tool_name, tool_call_id, key);

        self.exchanges
            .entry(key.to_string())
            .or_default()
            .push(ToolExchange {
                tool_call_id,
                tool_name,
                input,
                output: None,
                state: ExchangeState::InputAvailable,
                is_error: None,
            });
    }

    /// Inbound: only responses are considered. The first pending exchange
    /// with a matching id resolves; a change notification goes out after
    /// every response, matched or not, so the UI refreshes either way.
    fn record_inbound(&self, key: &str, raw: &str) {
        let Ok(value) = serde_json::from_str::<Value>(raw) else {
            return;
        };
        let Some(object) = value.as_object() else {
            return;
        };
        if object.contains_key("method") {
            // Request or notification from the server, not a response
            return;
        }
        let Some(id) = object.get("id") else {
            return;
        };
        let result = object.get("result");
        let error = object.get("error");
        if result.is_none() && error.is_none() {
            return;
        }

        let tool_call_id = stringify_id(id);

        if let Some(mut log) = self.exchanges.get_mut(key) {
            if let Some(exchange) = log.iter_mut().find(|e| {
                e.state == ExchangeState::InputAvailable && e.tool_call_id == tool_call_id
            }) {
                match error {
                    Some(error) => {
                        exchange.output =
                            Some(serde_json::json!({"isError": true, "toolResult": error}));
                        exchange.is_error = Some(true);
                    }
                    None => {
                        exchange.output = result.cloned();
                    }
                }
                exchange.state = ExchangeState::OutputAvailable;
            } else {
                debug!("No pending tool call for response {} on {}", tool_call_id, key);
            }
        }

        self.sink.send(
            MCP_MANAGER_UPDATE,
            serde_json::json!({ "sessionKey": key }),
        );
    }

    /// Current log for `key`, empty if none exists
    pub fn exchanges(&self, key: &str) -> Vec<ToolExchange> {
        self.exchanges
            .get(key)
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    /// Drop the entire log for `key`; safe for unknown keys
    pub fn clear(&self, key: &str) {
        self.exchanges.remove(key);
    }
}
