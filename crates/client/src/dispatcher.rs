//! Frame read loop: decodes frames from the current transport and routes
//! control frames (stream id 0) and data-stream frames to the handler.
//!
//! The dispatcher owns the read task but not the transport; the supervisor
//! installs a new read half per connected episode. Read timeouts are normal
//! on idle connections (the heartbeat carries liveness) and never end the
//! episode; EOF and decode errors do.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use protocol::Frame;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::connector::FrameReader;
use crate::error::{ClientError, Result};
use crate::metrics::Metrics;

/// How long to wait before re-checking for an installed transport.
const NO_CONNECTION_BACKOFF: Duration = Duration::from_millis(100);

/// Initial capacity of the receive buffer.
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Routing target for decoded frames; implemented once by the agent core.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    /// Handle a frame with stream id 0.
    async fn handle_control(&self, frame: Frame) -> Result<()>;

    /// Handle a frame with a non-zero stream id. May block on per-stream
    /// backpressure, which stalls the read loop by design.
    async fn handle_stream(&self, frame: Frame) -> Result<()>;
}

pub struct Dispatcher {
    reader: Arc<Mutex<Option<FrameReader>>>,
    handler: Arc<dyn FrameHandler>,
    metrics: Arc<Metrics>,
    read_timeout: Duration,
    running: Arc<AtomicBool>,
    stop: Mutex<CancellationToken>,
}

impl Dispatcher {
    pub fn new(
        read_timeout: Duration,
        handler: Arc<dyn FrameHandler>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            reader: Arc::new(Mutex::new(None)),
            handler,
            metrics,
            read_timeout,
            running: Arc::new(AtomicBool::new(false)),
            stop: Mutex::new(CancellationToken::new()),
        }
    }

    /// Install the byte source for the read loop, replacing (and dropping)
    /// any previous one.
    pub fn set_connection(&self, reader: FrameReader) {
        *self.reader.lock() = Some(reader);
    }

    /// Spawn the read loop. Fails with [`ClientError::AlreadyRunning`] when a
    /// loop is already active. The returned handle completes when the loop
    /// exits, which signals the end of the connected episode.
    pub fn start(&self) -> Result<JoinHandle<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ClientError::AlreadyRunning);
        }

        let stop = CancellationToken::new();
        *self.stop.lock() = stop.clone();

        Ok(tokio::spawn(read_loop(
            self.reader.clone(),
            self.handler.clone(),
            self.metrics.clone(),
            self.read_timeout,
            stop,
            self.running.clone(),
        )))
    }

    /// Cancel the read loop. Idempotent.
    pub fn stop(&self) {
        self.stop.lock().cancel();
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

async fn read_loop(
    reader_slot: Arc<Mutex<Option<FrameReader>>>,
    handler: Arc<dyn FrameHandler>,
    metrics: Arc<Metrics>,
    read_timeout: Duration,
    stop: CancellationToken,
    running: Arc<AtomicBool>,
) {
    use tokio::io::AsyncReadExt;

    let mut reader: Option<FrameReader> = None;
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    'outer: loop {
        if stop.is_cancelled() {
            break;
        }

        let Some(current) = reader.as_mut() else {
            reader = reader_slot.lock().take();
            if reader.is_none() {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(NO_CONNECTION_BACKOFF) => {}
                }
            }
            continue;
        };

        tokio::select! {
            _ = stop.cancelled() => break,
            read = tokio::time::timeout(read_timeout, current.read_buf(&mut buf)) => {
                match read {
                    // Idle connection; the deadline resets on the next
                    // iteration. Partially buffered frames are kept.
                    Err(_elapsed) => {
                        debug!("read timeout with no incoming data, continuing");
                    }
                    Ok(Ok(0)) => {
                        if buf.is_empty() {
                            debug!("connection closed by peer (EOF)");
                        } else {
                            warn!(buffered = buf.len(), "connection closed mid-frame");
                            metrics.inc_frames_error();
                        }
                        break;
                    }
                    Ok(Ok(_)) => {
                        loop {
                            match Frame::decode(&buf) {
                                Ok(Some((frame, consumed))) => {
                                    buf.advance(consumed);
                                    metrics.inc_frames_received();
                                    dispatch(&*handler, &metrics, frame).await;
                                }
                                Ok(None) => break,
                                Err(err) => {
                                    warn!(error = %err, "frame decode error");
                                    metrics.inc_frames_error();
                                    break 'outer;
                                }
                            }
                        }
                    }
                    Ok(Err(err)) => {
                        warn!(error = %err, "transport read error");
                        metrics.inc_frames_error();
                        break;
                    }
                }
            }
        }
    }

    running.store(false, Ordering::SeqCst);
}

/// Route one frame. Handler errors are logged and counted but never end the
/// read loop; the protocol is resilient to individual bad frames.
async fn dispatch(handler: &dyn FrameHandler, metrics: &Metrics, frame: Frame) {
    let frame_type = frame.frame_type;
    let stream_id = frame.stream_id;

    let result = if frame.is_control() {
        handler.handle_control(frame).await
    } else {
        handler.handle_stream(frame).await
    };

    if let Err(err) = result {
        error!(error = %err, ?frame_type, stream_id, "frame handling error");
        metrics.inc_frames_error();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::BoxedIo;
    use bytes::Bytes;
    use protocol::{write_frame, FrameType, FLAG_NONE};
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    /// Handler that records routed frames and optionally fails on command.
    struct RecordingHandler {
        control_tx: mpsc::UnboundedSender<Frame>,
        stream_tx: mpsc::UnboundedSender<Frame>,
        fail_streams: bool,
    }

    #[async_trait]
    impl FrameHandler for RecordingHandler {
        async fn handle_control(&self, frame: Frame) -> Result<()> {
            self.control_tx.send(frame).ok();
            Ok(())
        }

        async fn handle_stream(&self, frame: Frame) -> Result<()> {
            self.stream_tx.send(frame).ok();
            if self.fail_streams {
                return Err(ClientError::StreamNotFound);
            }
            Ok(())
        }
    }

    fn harness(
        read_timeout: Duration,
        fail_streams: bool,
    ) -> (
        Dispatcher,
        tokio::io::DuplexStream,
        mpsc::UnboundedReceiver<Frame>,
        mpsc::UnboundedReceiver<Frame>,
        Arc<Metrics>,
    ) {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (stream_tx, stream_rx) = mpsc::unbounded_channel();
        let handler = Arc::new(RecordingHandler {
            control_tx,
            stream_tx,
            fail_streams,
        });
        let metrics = Arc::new(Metrics::default());
        let dispatcher = Dispatcher::new(read_timeout, handler, metrics.clone());
        let (reader, _writer) = tokio::io::split(Box::new(near) as BoxedIo);
        dispatcher.set_connection(reader);
        (dispatcher, far, control_rx, stream_rx, metrics)
    }

    #[tokio::test]
    async fn routes_control_and_stream_frames() {
        let (dispatcher, mut far, mut control_rx, mut stream_rx, _metrics) =
            harness(Duration::from_secs(5), false);
        let task = dispatcher.start().expect("start");

        write_frame(
            &mut far,
            &Frame::control(FrameType::Heartbeat, FLAG_NONE, Bytes::new()),
        )
        .await
        .expect("write control");
        write_frame(&mut far, &Frame::data(9, Bytes::from_static(b"payload")))
            .await
            .expect("write data");
        far.flush().await.expect("flush");

        let control = control_rx.recv().await.expect("control frame routed");
        assert_eq!(control.frame_type, FrameType::Heartbeat);

        let stream = stream_rx.recv().await.expect("stream frame routed");
        assert_eq!(stream.stream_id, 9);

        dispatcher.stop();
        task.await.expect("join");
        assert!(!dispatcher.is_running());
    }

    #[tokio::test]
    async fn handler_errors_do_not_end_the_loop() {
        let (dispatcher, mut far, _control_rx, mut stream_rx, metrics) =
            harness(Duration::from_secs(5), true);
        let task = dispatcher.start().expect("start");

        write_frame(&mut far, &Frame::data(1, Bytes::from_static(b"a")))
            .await
            .expect("write");
        write_frame(&mut far, &Frame::data(2, Bytes::from_static(b"b")))
            .await
            .expect("write");
        far.flush().await.expect("flush");

        assert_eq!(stream_rx.recv().await.expect("first").stream_id, 1);
        assert_eq!(stream_rx.recv().await.expect("second").stream_id, 2);
        assert!(metrics.snapshot().frames_error >= 2);

        dispatcher.stop();
        task.await.expect("join");
    }

    #[tokio::test]
    async fn eof_ends_the_loop() {
        let (dispatcher, far, _control_rx, _stream_rx, _metrics) =
            harness(Duration::from_secs(5), false);
        let task = dispatcher.start().expect("start");

        drop(far);
        task.await.expect("join");
        assert!(!dispatcher.is_running());
    }

    #[tokio::test]
    async fn read_timeout_does_not_end_the_loop() {
        let (dispatcher, mut far, _control_rx, mut stream_rx, _metrics) =
            harness(Duration::from_millis(50), false);
        let task = dispatcher.start().expect("start");

        // Stay idle across several read deadlines, then deliver a frame.
        tokio::time::sleep(Duration::from_millis(160)).await;
        assert!(dispatcher.is_running());

        write_frame(&mut far, &Frame::data(4, Bytes::from_static(b"late")))
            .await
            .expect("write");
        far.flush().await.expect("flush");

        let frame = stream_rx.recv().await.expect("late frame still routed");
        assert_eq!(frame.stream_id, 4);

        dispatcher.stop();
        task.await.expect("join");
    }

    #[tokio::test]
    async fn invalid_frame_ends_the_loop() {
        let (dispatcher, mut far, _control_rx, _stream_rx, metrics) =
            harness(Duration::from_secs(5), false);
        let task = dispatcher.start().expect("start");

        // Declared length below the header size.
        let mut bad = vec![0u8; protocol::HEADER_SIZE];
        bad[..4].copy_from_slice(&((protocol::HEADER_SIZE as u32) - 1).to_be_bytes());
        far.write_all(&bad).await.expect("write");
        far.flush().await.expect("flush");

        task.await.expect("join");
        assert!(!dispatcher.is_running());
        assert!(metrics.snapshot().frames_error >= 1);
    }

    #[tokio::test]
    async fn second_start_reports_already_running() {
        let (dispatcher, _far, _control_rx, _stream_rx, _metrics) =
            harness(Duration::from_secs(5), false);
        let task = dispatcher.start().expect("start");

        match dispatcher.start() {
            Err(ClientError::AlreadyRunning) => {}
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }

        dispatcher.stop();
        task.await.expect("join");
    }
}
