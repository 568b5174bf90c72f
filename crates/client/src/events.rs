//! Observer hooks for the agent lifecycle.
//!
//! One implementor is wired at construction and receives every connection and
//! stream lifecycle event. This is the surface an embedding process uses to
//! drive its own health endpoints or notifications; the core never depends on
//! what the sink does.

use crate::error::ClientError;

/// Lifecycle event sink. All methods default to no-ops so implementors only
/// override what they observe.
pub trait AgentEvents: Send + Sync {
    /// A transport to the core server was established.
    fn on_connected(&self) {}

    /// The current transport was torn down. Fires once per connected episode.
    fn on_disconnected(&self) {}

    /// A connection attempt or frame-level operation failed.
    fn on_error(&self, _error: &ClientError) {}

    fn on_stream_created(&self, _stream_id: u32) {}

    fn on_stream_closed(&self, _stream_id: u32) {}
}

/// Sink that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEvents;

impl AgentEvents for NullEvents {}
