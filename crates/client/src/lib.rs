//! Tunnel agent core.
//!
//! A long-lived client that maintains one authenticated transport to a remote
//! core server, multiplexes request/response streams over it with the frame
//! protocol from the `protocol` crate, and bridges each inbound stream to a
//! local HTTP backend.
//!
//! The [`Agent`] wires the pieces together:
//!
//! - [`connector::Connector`] owns the transport, the retry/backoff policy
//!   and the single-writer send queue.
//! - [`dispatcher::Dispatcher`] owns the read loop and routes control frames
//!   and data-stream frames.
//! - [`stream::StreamRegistry`] tracks the active streams and their bounded
//!   inbound queues.
//! - [`auth::Authenticator`] and [`heartbeat::Heartbeat`] run the control
//!   stream.
//! - [`forward::LocalForwarder`] replays tunneled HTTP requests against the
//!   local service.

pub mod agent;
pub mod auth;
pub mod config;
pub mod connector;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod forward;
pub mod health;
pub mod heartbeat;
pub mod metrics;
pub mod stream;
mod tls;

pub use agent::Agent;
pub use config::{AgentConfig, TlsConfig};
pub use error::{ClientError, Result};
pub use events::{AgentEvents, NullEvents};
pub use health::{HealthChecker, HealthStatus};
pub use metrics::{Metrics, MetricsSnapshot};
