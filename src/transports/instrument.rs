//! Transparent instrumentation of a transport's send/receive paths.

use async_trait::async_trait;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

use crate::error::Result;
use crate::protocol::McpTransport;

/// Observer invoked with the raw wire text of a message
pub type MessageHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Decorator that exposes the same contract as the wrapped transport while
/// reporting every outbound and inbound message to optional hooks.
///
/// Hooks see raw message text only; no method names or ids are interpreted
/// here. A panicking hook is caught and logged so instrumentation can never
/// corrupt the protocol path.
pub struct InstrumentedTransport {
    inner: Box<dyn McpTransport>,
    on_send: Option<MessageHook>,
    on_receive: Option<MessageHook>,
}

impl InstrumentedTransport {
    pub fn new(
        inner: Box<dyn McpTransport>,
        on_send: Option<MessageHook>,
        on_receive: Option<MessageHook>,
    ) -> Self {
        Self {
            inner,
            on_send,
            on_receive,
        }
    }
}

fn fire(hook: &Option<MessageHook>, direction: &str, message: &str) {
    if let Some(hook) = hook {
        if catch_unwind(AssertUnwindSafe(|| hook(message))).is_err() {
            warn!("Instrumentation hook panicked on {} message; continuing", direction);
        }
    }
}

#[async_trait]
impl McpTransport for InstrumentedTransport {
    async fn connect(&mut self) -> Result<()> {
        self.inner.connect().await
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.inner.disconnect().await
    }

    async fn send(&self, message: String) -> Result<()> {
        fire(&self.on_send, "outbound", &message);
        self.inner.send(message).await
    }

    async fn receive(&self) -> Result<Option<String>> {
        let received = self.inner.receive().await?;
        if let Some(message) = &received {
            fire(&self.on_receive, "inbound", message);
        }
        Ok(received)
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }
}
