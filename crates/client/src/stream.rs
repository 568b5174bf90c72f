//! Logical streams multiplexed over the tunnel connection.
//!
//! A [`Stream`] is created when the peer opens a stream id the registry has
//! not seen; it is destroyed exactly once via [`StreamRegistry::close`].
//! Inbound chunks arrive through a bounded FIFO which preserves wire order
//! per stream and propagates backpressure to the dispatcher. Outbound writes
//! become `Data` frames on the supervisor's send queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use protocol::Frame;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connector::Connector;
use crate::error::{ClientError, Result};
use crate::events::AgentEvents;
use crate::health::{HealthChecker, HealthStatus, CHECK_STREAMS};
use crate::metrics::Metrics;

/// Capacity of the per-stream inbound chunk queue.
const INBOUND_QUEUE_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Init,
    Open,
    Data,
    Closed,
    Error,
}

struct ChunkReader {
    rx: mpsc::Receiver<Bytes>,
    /// Tail of a partially consumed chunk, served before the queue.
    pending: Option<Bytes>,
}

/// One logical bidirectional byte channel identified by a non-zero id.
pub struct Stream {
    id: u32,
    created_at: Instant,
    state: Mutex<StreamState>,
    metadata: Mutex<HashMap<String, String>>,

    inbound_tx: mpsc::Sender<Bytes>,
    reader: tokio::sync::Mutex<ChunkReader>,
    closed: CancellationToken,

    connector: Arc<Connector>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Stream {
    fn new(id: u32, connector: Arc<Connector>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        Self {
            id,
            created_at: Instant::now(),
            state: Mutex::new(StreamState::Init),
            metadata: Mutex::new(HashMap::new()),
            inbound_tx,
            reader: tokio::sync::Mutex::new(ChunkReader {
                rx: inbound_rx,
                pending: None,
            }),
            closed: CancellationToken::new(),
            connector,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn state(&self) -> StreamState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: StreamState) {
        *self.state.lock() = state;
    }

    pub fn set_metadata(&self, key: &str, value: &str) {
        self.metadata.lock().insert(key.to_string(), value.to_string());
    }

    pub fn metadata(&self, key: &str) -> Option<String> {
        self.metadata.lock().get(key).cloned()
    }

    /// Fires on teardown; wakes blocked readers.
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    /// Enqueue an inbound chunk, racing the close signal so a send never
    /// lands on a torn-down stream. Blocks while the FIFO is full, which
    /// stalls the dispatcher's delivery branch and propagates backpressure
    /// to the peer.
    pub(crate) async fn deliver(&self, data: Bytes) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(ClientError::StreamNotFound),
            sent = self.inbound_tx.send(data) => {
                sent.map_err(|_| ClientError::StreamNotFound)
            }
        }
    }

    /// Receive the next inbound chunk, draining anything already queued
    /// before honouring the close signal. Returns `None` at end of stream.
    pub async fn recv_chunk(&self) -> Option<Bytes> {
        let mut reader = self.reader.lock().await;
        if let Some(pending) = reader.pending.take() {
            return Some(pending);
        }
        loop {
            match reader.rx.try_recv() {
                Ok(data) => return Some(data),
                Err(mpsc::error::TryRecvError::Disconnected) => return None,
                Err(mpsc::error::TryRecvError::Empty) => {}
            }
            if self.closed.is_cancelled() {
                return None;
            }
            tokio::select! {
                biased;
                chunk = reader.rx.recv() => return chunk,
                // Loop once more to drain a chunk that raced with the close.
                _ = self.closed.cancelled() => continue,
            }
        }
    }

    /// Read adapter: copy inbound bytes into `buf`, keeping the tail of a
    /// partially consumed chunk for the next call. `Ok(0)` is end of stream.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        {
            let mut reader = self.reader.lock().await;
            if let Some(mut pending) = reader.pending.take() {
                let n = pending.len().min(buf.len());
                buf[..n].copy_from_slice(&pending[..n]);
                if n < pending.len() {
                    reader.pending = Some(pending.split_off(n));
                }
                return Ok(n);
            }
        }

        match self.recv_chunk().await {
            Some(chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    self.reader.lock().await.pending = Some(chunk.slice(n..));
                }
                Ok(n)
            }
            None => Ok(0),
        }
    }

    /// Write adapter: emit `data` to the peer as one `Data` frame. Never a
    /// short write; fails with the send-queue error instead.
    pub fn write(&self, data: Bytes) -> Result<usize> {
        let len = data.len();
        self.connector.send_frame(Frame::data(self.id, data))?;
        Ok(len)
    }

    /// Close adapter: signal half-close with one empty `Data | END_STREAM`
    /// frame. Registry teardown is a separate step.
    pub fn half_close(&self) -> Result<()> {
        self.connector.send_frame(Frame::end_stream(self.id))
    }

    /// Report a failure to the peer as one `Data | ERROR` frame carrying the
    /// message text.
    pub fn send_error(&self, message: &str) -> Result<()> {
        self.connector.send_frame(Frame::error(self.id, message))
    }
}

/// Registry of active streams: at most one instance per live id.
pub struct StreamRegistry {
    streams: Mutex<HashMap<u32, Arc<Stream>>>,
    connector: Arc<Connector>,
    events: Arc<dyn AgentEvents>,
    metrics: Arc<Metrics>,
    health: Arc<HealthChecker>,
}

impl StreamRegistry {
    pub fn new(
        connector: Arc<Connector>,
        events: Arc<dyn AgentEvents>,
        metrics: Arc<Metrics>,
        health: Arc<HealthChecker>,
    ) -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            connector,
            events,
            metrics,
            health,
        }
    }

    /// Create a stream for `id`, or fail if one is already live.
    pub fn create(&self, id: u32) -> Result<Arc<Stream>> {
        let stream = {
            let mut streams = self.streams.lock();
            if streams.contains_key(&id) {
                return Err(ClientError::StreamAlreadyExists);
            }
            let stream = Arc::new(Stream::new(id, self.connector.clone()));
            streams.insert(id, stream.clone());
            stream
        };

        self.metrics.inc_streams_total();
        self.metrics.inc_streams_active();
        self.health
            .update(CHECK_STREAMS, HealthStatus::Healthy, "streams active");
        self.events.on_stream_created(id);
        debug!(stream_id = id, "stream created");

        Ok(stream)
    }

    pub fn get(&self, id: u32) -> Option<Arc<Stream>> {
        self.streams.lock().get(&id).cloned()
    }

    /// Tear down `id` exactly once: mark it closed, fire the close signal so
    /// blocked readers wake, remove it from the registry, and notify the
    /// event sink. A stream that ended in [`StreamState::Error`] counts as
    /// failed, anything else as completed.
    pub fn close(&self, id: u32) -> Result<()> {
        let stream = self
            .streams
            .lock()
            .remove(&id)
            .ok_or(ClientError::StreamNotFound)?;

        let failed = stream.state() == StreamState::Error;
        stream.set_state(StreamState::Closed);
        stream.closed.cancel();

        self.metrics.dec_streams_active();
        if failed {
            self.metrics.inc_streams_failed();
        } else {
            self.metrics.inc_streams_completed();
        }
        if self.metrics.streams_active() == 0 {
            self.health
                .update(CHECK_STREAMS, HealthStatus::Healthy, "no active streams");
        }

        self.events.on_stream_closed(id);
        debug!(stream_id = id, "stream closed");
        Ok(())
    }

    /// Tear down every live stream; used when a connected episode ends.
    pub fn close_all(&self) {
        let ids: Vec<u32> = self.streams.lock().keys().copied().collect();
        for id in ids {
            let _ = self.close(id);
        }
    }

    pub fn len(&self) -> usize {
        self.streams.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.lock().is_empty()
    }
}
