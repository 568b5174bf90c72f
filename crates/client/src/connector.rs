//! Connection supervisor: owns the transport to the core server.
//!
//! The connector dials (optionally over TLS), retries with exponential
//! backoff, and runs a dedicated write task per connected episode. All
//! outbound frames pass through a bounded queue; having exactly one writer
//! makes frame interleaving on the wire well-defined without per-send locking.
//!
//! The read half of each transport is handed to the dispatcher through the
//! [`Episode`] returned by [`Connector::connect`], which keeps ownership
//! between supervisor and dispatcher explicit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use protocol::Frame;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::error::{ClientError, Result};
use crate::events::AgentEvents;
use crate::health::{HealthChecker, HealthStatus, CHECK_CONNECTION};
use crate::metrics::Metrics;
use crate::tls;

/// Capacity of the bounded outbound frame queue.
pub const SEND_QUEUE_CAPACITY: usize = 100;

/// Size of the buffered writer wrapping the transport write half.
const WRITE_BUFFER_SIZE: usize = 4 * 1024;

/// Soft latency bound: the write task flushes at least this often.
const FLUSH_INTERVAL: Duration = Duration::from_millis(10);

/// After this many consecutive dial failures the backoff grows more
/// aggressively.
const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Byte stream to the core server; plain TCP or TLS.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

pub type BoxedIo = Box<dyn Io>;

/// Read half of the current transport, consumed by the dispatcher.
pub type FrameReader = ReadHalf<BoxedIo>;

/// One connected episode. `ended` fires when the episode is over for any
/// reason: write failure, [`Connector::disconnect`], or supervisor shutdown.
pub struct Episode {
    pub reader: FrameReader,
    pub ended: CancellationToken,
}

impl std::fmt::Debug for Episode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Episode").finish_non_exhaustive()
    }
}

struct CurrentEpisode {
    send_tx: mpsc::Sender<Frame>,
    ended: CancellationToken,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector").finish_non_exhaustive()
    }
}

pub struct Connector {
    server_addr: String,
    tls_config: Option<Arc<rustls::ClientConfig>>,
    tls_server_name: Option<rustls::pki_types::ServerName<'static>>,

    retry_interval: Duration,
    backoff_factor: f64,
    max_backoff: Duration,
    max_retries: i32,

    current: RwLock<Option<CurrentEpisode>>,
    connected: AtomicBool,

    cancel: CancellationToken,
    events: Arc<dyn AgentEvents>,
    metrics: Arc<Metrics>,
    health: Arc<HealthChecker>,
}

impl Connector {
    pub fn new(
        config: &AgentConfig,
        cancel: CancellationToken,
        events: Arc<dyn AgentEvents>,
        metrics: Arc<Metrics>,
        health: Arc<HealthChecker>,
    ) -> Result<Self> {
        let (tls_config, tls_server_name) = match &config.tls {
            Some(tls_cfg) => {
                let client_config = Arc::new(tls::build_client_config(tls_cfg)?);
                let host = config
                    .server_addr
                    .rsplit_once(':')
                    .map(|(host, _)| host)
                    .unwrap_or(&config.server_addr);
                let name = tls_cfg
                    .server_name
                    .clone()
                    .unwrap_or_else(|| host.to_string());
                let server_name = rustls::pki_types::ServerName::try_from(name.clone())
                    .map_err(|_| ClientError::Config(format!("invalid TLS server name {name:?}")))?;
                (Some(client_config), Some(server_name))
            }
            None => (None, None),
        };

        Ok(Self {
            server_addr: config.server_addr.clone(),
            tls_config,
            tls_server_name,
            retry_interval: config.retry_interval,
            backoff_factor: config.backoff_factor,
            max_backoff: config.max_backoff,
            max_retries: config.max_retries,
            current: RwLock::new(None),
            connected: AtomicBool::new(false),
            cancel,
            events,
            metrics,
            health,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Dial until a transport is established, with exponential backoff.
    ///
    /// Returns the new [`Episode`] once connected. Fails only when the
    /// supervisor token is cancelled or `max_retries` is exhausted.
    pub async fn connect(&self) -> Result<Episode> {
        let mut backoff = self.retry_interval;
        let mut retries: i32 = 0;
        let mut consecutive_errors: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(ClientError::ConnectionClosed);
            }

            match self.dial().await {
                Ok(io) => {
                    consecutive_errors = 0;
                    return Ok(self.install_transport(io));
                }
                Err(err) => {
                    consecutive_errors += 1;
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        backoff = backoff
                            .mul_f64(self.backoff_factor * 1.5)
                            .min(self.max_backoff * 2);
                    }

                    warn!(error = %err, attempt = retries + 1, "connection attempt failed");
                    self.events.on_error(&err);

                    if self.max_retries > 0 && retries >= self.max_retries {
                        error!(attempts = retries, "max connection retries exceeded");
                        return Err(err);
                    }
                    retries += 1;

                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(ClientError::ConnectionClosed),
                        _ = tokio::time::sleep(backoff) => {
                            backoff = backoff.mul_f64(self.backoff_factor).min(self.max_backoff);
                        }
                    }
                }
            }
        }
    }

    async fn dial(&self) -> Result<BoxedIo> {
        let tcp = TcpStream::connect(&self.server_addr).await?;
        match (&self.tls_config, &self.tls_server_name) {
            (Some(config), Some(name)) => {
                let connector = TlsConnector::from(config.clone());
                let stream = connector.connect(name.clone(), tcp).await?;
                Ok(Box::new(stream))
            }
            _ => Ok(Box::new(tcp)),
        }
    }

    /// Split `io`, start the write task, and publish the new episode.
    pub(crate) fn install_transport(&self, io: BoxedIo) -> Episode {
        let (reader, writer) = tokio::io::split(io);
        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let ended = CancellationToken::new();

        *self.current.write() = Some(CurrentEpisode {
            send_tx,
            ended: ended.clone(),
        });
        self.connected.store(true, Ordering::SeqCst);

        self.metrics.inc_connections_total();
        self.metrics.inc_connections_active();
        self.metrics.set_last_connection_now();
        self.health
            .update(CHECK_CONNECTION, HealthStatus::Healthy, "connected to server");

        info!(address = %self.server_addr, "connection established");

        tokio::spawn(write_loop(
            writer,
            send_rx,
            self.metrics.clone(),
            ended.clone(),
        ));

        self.events.on_connected();

        Episode { reader, ended }
    }

    /// Enqueue a frame for asynchronous transmission. Never blocks: a
    /// saturated queue reports [`ClientError::SendQueueFull`].
    pub fn send_frame(&self, frame: Frame) -> Result<()> {
        let current = self.current.read();
        let Some(episode) = current.as_ref() else {
            return Err(ClientError::NotConnected);
        };
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        match episode.send_tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(ClientError::SendQueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ClientError::NotConnected),
        }
    }

    /// Tear down the current transport. Idempotent; `on_disconnected` fires
    /// once per connected episode.
    pub fn disconnect(&self) {
        let current = self.current.write().take();
        let was_connected = self.connected.swap(false, Ordering::SeqCst);

        if let Some(episode) = current {
            // Dropping the sender drains the write task; cancelling wakes
            // anyone waiting on the episode.
            episode.ended.cancel();
        }

        if !was_connected {
            return;
        }

        self.metrics.dec_connections_active();
        self.health.update(
            CHECK_CONNECTION,
            HealthStatus::Unhealthy,
            "disconnected from server",
        );
        info!("connection closed");
        self.events.on_disconnected();
    }

    /// Tear down and dial again with the full retry policy.
    pub async fn reconnect(&self) -> Result<Episode> {
        info!("reconnecting to server");
        self.metrics.inc_reconnections_total();
        self.disconnect();

        match self.connect().await {
            Ok(episode) => {
                info!("reconnection successful");
                Ok(episode)
            }
            Err(err) => {
                self.metrics.inc_reconnection_errors();
                error!(error = %err, "reconnection failed");
                Err(err)
            }
        }
    }

    /// Permanent shutdown: cancels the supervisor token and disconnects.
    pub fn close(&self) {
        self.cancel.cancel();
        self.disconnect();
    }
}

/// Single writer for one connected episode.
///
/// Frames are encoded into a buffered writer and flushed when the queue is
/// momentarily empty or on the flush tick, whichever comes first. On any I/O
/// error the episode token is cancelled so the supervisor reconnects.
async fn write_loop(
    writer: WriteHalf<BoxedIo>,
    mut send_rx: mpsc::Receiver<Frame>,
    metrics: Arc<Metrics>,
    ended: CancellationToken,
) {
    let mut writer = BufWriter::with_capacity(WRITE_BUFFER_SIZE, writer);
    let mut flush_tick = tokio::time::interval(FLUSH_INTERVAL);
    flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            frame = send_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if let Err(err) = protocol::write_frame(&mut writer, &frame).await {
                            error!(error = %err, "write task I/O error");
                            ended.cancel();
                            return;
                        }
                        metrics.inc_frames_sent();

                        if send_rx.is_empty() {
                            if let Err(err) = writer.flush().await {
                                error!(error = %err, "write task flush error");
                                ended.cancel();
                                return;
                            }
                        }
                    }
                    None => {
                        // Queue dropped on disconnect; flush what is buffered.
                        if let Err(err) = writer.flush().await {
                            debug!(error = %err, "flush during teardown failed");
                        }
                        return;
                    }
                }
            }
            _ = flush_tick.tick() => {
                if let Err(err) = writer.flush().await {
                    error!(error = %err, "write task flush error");
                    ended.cancel();
                    return;
                }
            }
        }
    }
}
