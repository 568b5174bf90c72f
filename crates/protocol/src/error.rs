use thiserror::Error;

/// Errors produced while encoding or decoding frames.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The peer closed the connection at a frame boundary.
    #[error("connection closed")]
    Eof,

    /// The bytes on the wire cannot be a valid frame.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),
}
