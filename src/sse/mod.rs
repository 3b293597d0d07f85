//! Realtime delivery over server-sent events.
//!
//! [`service`] opens the stream, [`parser`] decodes it, [`heartbeat`] and
//! [`retry`] keep it alive, and [`manager`] ties them together. The
//! [`lifecycle`] controller decides when a connection is wanted.

pub mod error;
pub mod heartbeat;
pub mod lifecycle;
pub mod manager;
pub mod parser;
pub mod retry;
pub mod service;

pub use error::{SseError, TransportFault, classify_sse_error};
pub use heartbeat::{HeartbeatTimeout, HeartbeatWatchdog};
pub use lifecycle::SseLifecycleController;
pub use manager::{ConnectionOptions, ConnectionState, FallbackReason, SseConnectionManager};
pub use parser::{
    SseFrame, SseFrameDecoder, parse_heartbeat_timeout_ms, parse_inbox_messages, parse_messages,
};
pub use retry::{RetryDecision, RetryPolicy};
pub use service::{HttpSseTransport, StreamEvent, StreamTransport};
