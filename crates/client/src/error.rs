use thiserror::Error;

/// Errors that can occur in the tunnel client.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("not connected to server")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("stream not found")]
    StreamNotFound,

    #[error("stream already exists")]
    StreamAlreadyExists,

    #[error("invalid frame")]
    InvalidFrame,

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("local service error: {0}")]
    LocalService(String),

    #[error("already running")]
    AlreadyRunning,

    #[error("send queue full")]
    SendQueueFull,

    #[error("operation timed out")]
    Timeout,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] protocol::ProtocolError),
}

pub type Result<T> = std::result::Result<T, ClientError>;
