//! Binary frame protocol spoken with the core server.
//!
//! Every message on the wire is one [`Frame`]: a fixed 11-byte header followed
//! by an opaque payload. The header carries the total frame length so the
//! decoder can validate size bounds before allocating anything.
//!
//! Wire format (big-endian):
//!
//! ```text
//! [length: u32][version: u8][type: u8][flags: u8][stream id: u32][payload]
//! ```
//!
//! `length` counts the whole frame including the header. Stream id 0 is
//! reserved for control frames (auth, heartbeat, close); ids above 0 identify
//! multiplexed data streams.

pub mod codec;
mod error;

pub use codec::{encode, read_frame, write_frame};
pub use error::ProtocolError;

use bytes::Bytes;

/// Current wire protocol version. Bump when making breaking changes.
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the fixed frame header in bytes:
/// length (4) + version (1) + type (1) + flags (1) + stream id (4).
pub const HEADER_SIZE: usize = 11;

/// Maximum allowed frame size: 1 MB.
pub const MAX_FRAME_SIZE: usize = 1_048_576;

/// Stream id reserved for control frames.
pub const CONTROL_STREAM_ID: u32 = 0;

/// No flags set.
pub const FLAG_NONE: u8 = 0;
/// The sender will emit no further frames on this stream.
pub const FLAG_END_STREAM: u8 = 0x01;
/// The payload is a human-readable error message.
pub const FLAG_ERROR: u8 = 0x02;
/// The frame acknowledges a previous frame of the same type.
pub const FLAG_ACK: u8 = 0x04;

/// All defined flag bits. Frames carrying any other bit fail decode.
pub(crate) const FLAG_MASK: u8 = FLAG_END_STREAM | FLAG_ERROR | FLAG_ACK;

/// Frame type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Authentication request/response on the control stream.
    Auth,
    /// Keep-alive ping on the control stream.
    Heartbeat,
    /// Connection (stream id 0) or stream close.
    Close,
    /// Opens a new data stream; the payload carries the initial request bytes.
    OpenStream,
    /// Data on an established stream.
    Data,
    /// Unrecognized type byte. Decode keeps the raw value so the dispatch
    /// layer can warn and skip without dropping the connection.
    Unknown(u8),
}

impl FrameType {
    /// Map a wire byte to a frame type.
    pub fn from_u8(byte: u8) -> Self {
        match byte {
            1 => FrameType::Auth,
            2 => FrameType::Heartbeat,
            3 => FrameType::Close,
            4 => FrameType::OpenStream,
            5 => FrameType::Data,
            other => FrameType::Unknown(other),
        }
    }

    /// The wire byte for this frame type.
    pub fn as_u8(self) -> u8 {
        match self {
            FrameType::Auth => 1,
            FrameType::Heartbeat => 2,
            FrameType::Close => 3,
            FrameType::OpenStream => 4,
            FrameType::Data => 5,
            FrameType::Unknown(other) => other,
        }
    }
}

/// One unit of the binary protocol exchanged with the core server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub frame_type: FrameType,
    pub flags: u8,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    /// Build a frame at the current protocol version.
    pub fn new(frame_type: FrameType, flags: u8, stream_id: u32, payload: Bytes) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            frame_type,
            flags,
            stream_id,
            payload,
        }
    }

    /// Build a control frame (stream id 0).
    pub fn control(frame_type: FrameType, flags: u8, payload: Bytes) -> Self {
        Self::new(frame_type, flags, CONTROL_STREAM_ID, payload)
    }

    /// Build a plain data frame for `stream_id`.
    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self::new(FrameType::Data, FLAG_NONE, stream_id, payload)
    }

    /// Build the empty `Data | END_STREAM` frame that half-closes a stream.
    pub fn end_stream(stream_id: u32) -> Self {
        Self::new(FrameType::Data, FLAG_END_STREAM, stream_id, Bytes::new())
    }

    /// Build a `Data | ERROR` frame carrying `message` as its payload.
    pub fn error(stream_id: u32, message: &str) -> Self {
        Self::new(
            FrameType::Data,
            FLAG_ERROR,
            stream_id,
            Bytes::copy_from_slice(message.as_bytes()),
        )
    }

    /// Total encoded size of this frame including the header.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Whether this frame belongs to the control stream.
    pub fn is_control(&self) -> bool {
        self.stream_id == CONTROL_STREAM_ID
    }

    pub fn is_end_stream(&self) -> bool {
        self.flags & FLAG_END_STREAM != 0
    }

    pub fn is_error(&self) -> bool {
        self.flags & FLAG_ERROR != 0
    }

    pub fn is_ack(&self) -> bool {
        self.flags & FLAG_ACK != 0
    }

    /// Try to decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(Some((frame, consumed)))` when a complete frame is
    /// available, `Ok(None)` when more bytes are needed, and an error when the
    /// buffered bytes cannot be a valid frame. Size bounds are checked as soon
    /// as the length field is available, before any payload allocation.
    ///
    /// The payload is copied out of `buf`; the caller may reuse the buffer
    /// after advancing past `consumed` bytes.
    pub fn decode(buf: &[u8]) -> Result<Option<(Frame, usize)>, ProtocolError> {
        codec::decode(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_type_roundtrip() {
        for byte in [1u8, 2, 3, 4, 5] {
            assert_eq!(FrameType::from_u8(byte).as_u8(), byte);
        }
    }

    #[test]
    fn unknown_frame_type_keeps_raw_byte() {
        assert_eq!(FrameType::from_u8(99), FrameType::Unknown(99));
        assert_eq!(FrameType::Unknown(99).as_u8(), 99);
    }

    #[test]
    fn control_predicate_matches_stream_id() {
        let control = Frame::control(FrameType::Heartbeat, FLAG_NONE, Bytes::new());
        assert!(control.is_control());

        let data = Frame::data(7, Bytes::from_static(b"x"));
        assert!(!data.is_control());
    }

    #[test]
    fn flag_predicates() {
        let end = Frame::end_stream(3);
        assert!(end.is_end_stream());
        assert!(!end.is_error());
        assert!(!end.is_ack());

        let err = Frame::error(3, "boom");
        assert!(err.is_error());
        assert_eq!(&err.payload[..], b"boom");

        let ack = Frame::control(FrameType::Auth, FLAG_ACK, Bytes::new());
        assert!(ack.is_ack());
    }

    #[test]
    fn encoded_len_includes_header() {
        let frame = Frame::data(1, Bytes::from_static(b"hello"));
        assert_eq!(frame.encoded_len(), HEADER_SIZE + 5);
    }
}
