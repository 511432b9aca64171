use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum McpError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Server disconnected")]
    Disconnected,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Package has no identifier")]
    MissingIdentifier,

    #[error("Missing required variable: {0}")]
    MissingRequiredVariable(String),

    #[error("Missing required argument: {0}")]
    MissingRequiredArgument(String),

    #[error("Missing required value: {0}")]
    MissingRequiredValue(String),

    #[error("Unsupported registry kind: {0}")]
    UnsupportedRegistryKind(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session already registered: {0}")]
    SessionExists(String),

    #[error("Failed to construct session client: {0}")]
    ClientConstruction(String),
}

impl From<serde_json::Error> for McpError {
    fn from(e: serde_json::Error) -> Self {
        McpError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for McpError {
    fn from(e: std::io::Error) -> Self {
        McpError::Transport(e.to_string())
    }
}

impl From<reqwest::Error> for McpError {
    fn from(e: reqwest::Error) -> Self {
        McpError::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, McpError>;
