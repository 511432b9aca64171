//! MCP (Model Context Protocol) connection and exchange manager
//!
//! This crate establishes, multiplexes, instruments, and tears down sessions
//! with tool-providing MCP servers, whether reached over a remote transport
//! or spawned locally from a package registry. Tools from all active
//! sessions aggregate into a single tool set for an inference layer, and
//! every tool-call exchange is recorded for observability and UI replay.

pub mod config;
pub mod error;
pub mod inputs;
pub mod manager;
pub mod notify;
pub mod protocol;
pub mod recorder;
pub mod registry;
pub mod spawner;
pub mod transports;
pub mod types;

pub use config::*;
pub use error::{McpError, Result};
pub use manager::{
    ClientFactory, ConnectionManager, ProtocolClientFactory, SessionClient, SessionParams,
};
pub use notify::{ChannelSink, NotificationSink, MCP_MANAGER_UPDATE};
pub use protocol::{McpProtocolClient, McpTransport};
pub use recorder::ExchangeRecorder;
pub use registry::{PackageResolver, RegistryKind, ResolvedPackage};
pub use spawner::{Disposable, PackageSpawner};
pub use transports::*;
pub use types::*;
