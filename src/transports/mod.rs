pub mod instrument;
pub mod sse;
pub mod stdio;

pub use instrument::{InstrumentedTransport, MessageHook};
pub use sse::SseTransport;
pub use stdio::{StdioShutdownHandle, StdioTransport};
