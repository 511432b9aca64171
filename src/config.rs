use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Stdio transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StdioConfig {
    /// Command to execute
    pub command: String,
    /// Arguments for the command
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// SSE transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SseConfig {
    /// SSE endpoint URL
    pub url: String,
    /// Additional headers
    #[serde(default)]
    pub headers: Vec<HeaderConfig>,
    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

fn default_connect_timeout() -> u64 {
    10000 // 10 seconds
}

/// HTTP header configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderConfig {
    pub name: String,
    pub value: String,
}

/// Protocol client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Request timeout in milliseconds, applied to every protocol request
    /// including the initialize handshake
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// Client name reported during the handshake
    #[serde(default = "default_client_name")]
    pub client_name: String,
    /// Client version reported during the handshake
    #[serde(default = "default_client_version")]
    pub client_version: String,
}

fn default_request_timeout() -> u64 {
    60000 // 60 seconds
}

fn default_client_name() -> String {
    "mcp-manager".to_string()
}

fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout(),
            client_name: default_client_name(),
            client_version: default_client_version(),
        }
    }
}
