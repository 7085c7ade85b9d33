//! Cross-process bridge between the relay server and the host application.
//!
//! The server pushes `{id, tool, params}` envelopes onto a request queue and
//! blocks per request; the host executor drains that queue on its own thread
//! and answers on a response queue.

pub mod bridge;
pub mod executor;
pub mod queue;

pub use bridge::IpcBridge;
pub use executor::{execute_request, HostExecutor};
pub use queue::{
    memory_pair, EnvelopeReceiver, EnvelopeSender, HostEnd, QueueError, ServerEnd,
    STREAM_WRITE_TIMEOUT,
};

#[cfg(unix)]
pub use queue::{stream_pair, stream_pair_with_write_timeout};
