//! Change-notification seam toward UI stores.

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

/// Event name broadcast after registration, removal, and exchange updates
pub const MCP_MANAGER_UPDATE: &str = "mcp-manager-update";

/// Narrow broadcast interface. Payloads are "something changed" signals;
/// consumers re-read state rather than interpret deltas.
pub trait NotificationSink: Send + Sync {
    fn send(&self, event: &str, payload: Value);
}

/// Sink backed by a tokio channel. Lossy on a full channel, which is fine
/// for coalescable refresh signals.
pub struct ChannelSink {
    tx: mpsc::Sender<(String, Value)>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<(String, Value)>) -> Self {
        Self { tx }
    }
}

impl NotificationSink for ChannelSink {
    fn send(&self, event: &str, payload: Value) {
        if self.tx.try_send((event.to_string(), payload)).is_err() {
            debug!("Notification channel full or closed, dropping '{}'", event);
        }
    }
}
