//! Frame encode/decode.
//!
//! The codec is purely mechanical: it knows nothing about timeouts or
//! connection policy. The declared frame length is validated against
//! [`HEADER_SIZE`]..=[`MAX_FRAME_SIZE`] before the payload buffer is
//! allocated, so a hostile peer cannot force large allocations.

use crate::{Frame, FrameType, ProtocolError, FLAG_MASK, HEADER_SIZE, MAX_FRAME_SIZE};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Parsed fixed header fields.
struct Header {
    length: usize,
    version: u8,
    frame_type: FrameType,
    flags: u8,
    stream_id: u32,
}

fn parse_header(buf: &[u8; HEADER_SIZE]) -> Result<Header, ProtocolError> {
    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if !(HEADER_SIZE..=MAX_FRAME_SIZE).contains(&length) {
        return Err(ProtocolError::InvalidFrame(format!(
            "declared length {length} outside {HEADER_SIZE}..={MAX_FRAME_SIZE}"
        )));
    }
    let flags = buf[6];
    if flags & !FLAG_MASK != 0 {
        return Err(ProtocolError::InvalidFrame(format!(
            "undefined flag bits in {flags:#04x}"
        )));
    }
    Ok(Header {
        length,
        version: buf[4],
        frame_type: FrameType::from_u8(buf[5]),
        flags,
        stream_id: u32::from_be_bytes([buf[7], buf[8], buf[9], buf[10]]),
    })
}

/// Serialize `frame` into a fresh buffer, header first.
pub fn encode(frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
    let total = frame.encoded_len();
    if total > MAX_FRAME_SIZE {
        return Err(ProtocolError::InvalidFrame(format!(
            "frame of {total} bytes exceeds maximum {MAX_FRAME_SIZE}"
        )));
    }
    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&(total as u32).to_be_bytes());
    buf.push(frame.version);
    buf.push(frame.frame_type.as_u8());
    buf.push(frame.flags);
    buf.extend_from_slice(&frame.stream_id.to_be_bytes());
    buf.extend_from_slice(&frame.payload);
    Ok(buf)
}

/// Incremental decode from the front of `buf`; see [`Frame::decode`].
pub(crate) fn decode(buf: &[u8]) -> Result<Option<(Frame, usize)>, ProtocolError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if !(HEADER_SIZE..=MAX_FRAME_SIZE).contains(&length) {
        return Err(ProtocolError::InvalidFrame(format!(
            "declared length {length} outside {HEADER_SIZE}..={MAX_FRAME_SIZE}"
        )));
    }
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }
    let mut header = [0u8; HEADER_SIZE];
    header.copy_from_slice(&buf[..HEADER_SIZE]);
    let header = parse_header(&header)?;
    if buf.len() < header.length {
        return Ok(None);
    }
    let payload = Bytes::copy_from_slice(&buf[HEADER_SIZE..header.length]);
    Ok(Some((
        Frame {
            version: header.version,
            frame_type: header.frame_type,
            flags: header.flags,
            stream_id: header.stream_id,
            payload,
        },
        header.length,
    )))
}

/// Write one frame to `writer` as a single logical write.
///
/// The caller is expected to wrap the transport in a buffered writer and
/// decide when to flush.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let buf = encode(frame)?;
    writer.write_all(&buf).await.map_err(ProtocolError::Io)?;
    Ok(())
}

/// Read one frame from `reader`.
///
/// A peer close before the first header byte is reported as
/// [`ProtocolError::Eof`]; a close mid-frame is an [`ProtocolError::InvalidFrame`].
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        let n = reader
            .read(&mut header[filled..])
            .await
            .map_err(ProtocolError::Io)?;
        if n == 0 {
            if filled == 0 {
                return Err(ProtocolError::Eof);
            }
            return Err(ProtocolError::InvalidFrame(
                "connection closed mid-header".to_string(),
            ));
        }
        filled += n;
    }

    let header = parse_header(&header)?;
    let mut payload = vec![0u8; header.length - HEADER_SIZE];
    if !payload.is_empty() {
        reader.read_exact(&mut payload).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                ProtocolError::InvalidFrame("connection closed mid-payload".to_string())
            } else {
                ProtocolError::Io(e)
            }
        })?;
    }

    Ok(Frame {
        version: header.version,
        frame_type: header.frame_type,
        flags: header.flags,
        stream_id: header.stream_id,
        payload: Bytes::from(payload),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FLAG_ACK, FLAG_END_STREAM, FLAG_ERROR, FLAG_NONE, PROTOCOL_VERSION};

    async fn roundtrip(frame: &Frame) -> Frame {
        let encoded = encode(frame).expect("encode failed");
        assert_eq!(encoded.len(), frame.encoded_len());

        // Incremental decode must agree with the streaming reader.
        let (decoded, consumed) = decode(&encoded)
            .expect("decode failed")
            .expect("decode incomplete");
        assert_eq!(consumed, encoded.len());
        assert_eq!(&decoded, frame);

        let mut reader = encoded.as_slice();
        let read = read_frame(&mut reader).await.expect("read_frame failed");
        assert_eq!(&read, frame);

        // Re-encoding the decoded frame reproduces the original bytes.
        assert_eq!(encode(&decoded).expect("re-encode failed"), encoded);
        decoded
    }

    #[tokio::test]
    async fn roundtrip_auth() {
        roundtrip(&Frame::control(
            FrameType::Auth,
            FLAG_NONE,
            Bytes::from_static(br#"{"token":"secret"}"#),
        ))
        .await;
    }

    #[tokio::test]
    async fn roundtrip_heartbeat_empty_payload() {
        roundtrip(&Frame::control(FrameType::Heartbeat, FLAG_NONE, Bytes::new())).await;
    }

    #[tokio::test]
    async fn roundtrip_open_stream() {
        roundtrip(&Frame::new(
            FrameType::OpenStream,
            FLAG_NONE,
            7,
            Bytes::from_static(b"GET /status HTTP/1.1\r\nHost: foo\r\n\r\n"),
        ))
        .await;
    }

    #[tokio::test]
    async fn roundtrip_data_with_flags() {
        roundtrip(&Frame::new(
            FrameType::Data,
            FLAG_END_STREAM,
            42,
            Bytes::new(),
        ))
        .await;
        roundtrip(&Frame::new(
            FrameType::Data,
            FLAG_ERROR,
            42,
            Bytes::from_static(b"connection refused"),
        ))
        .await;
        roundtrip(&Frame::control(FrameType::Auth, FLAG_ACK, Bytes::new())).await;
    }

    #[tokio::test]
    async fn roundtrip_large_payload() {
        roundtrip(&Frame::data(9, Bytes::from(vec![0x42u8; 128 * 1024]))).await;
    }

    #[tokio::test]
    async fn unknown_type_byte_decodes() {
        let mut encoded = encode(&Frame::data(1, Bytes::from_static(b"x"))).expect("encode");
        encoded[5] = 200;
        let mut reader = encoded.as_slice();
        let frame = read_frame(&mut reader).await.expect("read");
        assert_eq!(frame.frame_type, FrameType::Unknown(200));
    }

    #[tokio::test]
    async fn eof_before_header_is_clean_close() {
        let mut reader: &[u8] = &[];
        match read_frame(&mut reader).await {
            Err(ProtocolError::Eof) => {}
            other => panic!("expected Eof, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn eof_mid_header_is_invalid() {
        let encoded = encode(&Frame::data(1, Bytes::from_static(b"x"))).expect("encode");
        let mut reader = &encoded[..5];
        match read_frame(&mut reader).await {
            Err(ProtocolError::InvalidFrame(_)) => {}
            other => panic!("expected InvalidFrame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn eof_mid_payload_is_invalid() {
        let encoded = encode(&Frame::data(1, Bytes::from_static(b"hello"))).expect("encode");
        let mut reader = &encoded[..encoded.len() - 2];
        match read_frame(&mut reader).await {
            Err(ProtocolError::InvalidFrame(_)) => {}
            other => panic!("expected InvalidFrame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn undersize_declared_length_rejected() {
        let mut encoded = encode(&Frame::data(1, Bytes::new())).expect("encode");
        let bad = (HEADER_SIZE as u32 - 1).to_be_bytes();
        encoded[..4].copy_from_slice(&bad);
        let mut reader = encoded.as_slice();
        match read_frame(&mut reader).await {
            Err(ProtocolError::InvalidFrame(_)) => {}
            other => panic!("expected InvalidFrame, got {other:?}"),
        }
        match decode(&encoded) {
            Err(ProtocolError::InvalidFrame(_)) => {}
            other => panic!("expected InvalidFrame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversize_declared_length_rejected_before_allocation() {
        // Header only: the declared length points at a payload we never send.
        // Decode must fail on the length field alone.
        let mut header = [0u8; HEADER_SIZE];
        header[..4].copy_from_slice(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes());
        header[4] = PROTOCOL_VERSION;
        header[5] = FrameType::Data.as_u8();
        header[10] = 1;
        let mut reader = header.as_slice();
        match read_frame(&mut reader).await {
            Err(ProtocolError::InvalidFrame(_)) => {}
            other => panic!("expected InvalidFrame, got {other:?}"),
        }
        match decode(&header) {
            Err(ProtocolError::InvalidFrame(_)) => {}
            other => panic!("expected InvalidFrame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn undefined_flag_bits_rejected() {
        let mut encoded = encode(&Frame::data(1, Bytes::new())).expect("encode");
        encoded[6] = 0x80;
        let mut reader = encoded.as_slice();
        match read_frame(&mut reader).await {
            Err(ProtocolError::InvalidFrame(_)) => {}
            other => panic!("expected InvalidFrame, got {other:?}"),
        }
    }

    #[test]
    fn oversize_encode_rejected() {
        let frame = Frame::data(1, Bytes::from(vec![0u8; MAX_FRAME_SIZE]));
        match encode(&frame) {
            Err(ProtocolError::InvalidFrame(_)) => {}
            other => panic!("expected InvalidFrame, got {other:?}"),
        }
    }

    #[test]
    fn incremental_decode_waits_for_more_bytes() {
        let encoded = encode(&Frame::data(5, Bytes::from_static(b"abcdef"))).expect("encode");
        for cut in [0, 3, HEADER_SIZE, encoded.len() - 1] {
            assert!(
                decode(&encoded[..cut]).expect("partial decode errored").is_none(),
                "decode of {cut} bytes should be incomplete"
            );
        }
        let (frame, consumed) = decode(&encoded).expect("decode").expect("complete");
        assert_eq!(consumed, encoded.len());
        assert_eq!(&frame.payload[..], b"abcdef");
    }

    #[test]
    fn incremental_decode_leaves_trailing_bytes() {
        let first = encode(&Frame::data(1, Bytes::from_static(b"one"))).expect("encode");
        let second = encode(&Frame::data(2, Bytes::from_static(b"two"))).expect("encode");
        let mut wire = first.clone();
        wire.extend_from_slice(&second);

        let (frame, consumed) = decode(&wire).expect("decode").expect("complete");
        assert_eq!(frame.stream_id, 1);
        assert_eq!(consumed, first.len());

        let (frame, consumed) = decode(&wire[first.len()..]).expect("decode").expect("complete");
        assert_eq!(frame.stream_id, 2);
        assert_eq!(consumed, second.len());
    }
}
