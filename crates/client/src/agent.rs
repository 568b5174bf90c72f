//! Agent orchestrator: wires the connector, dispatcher, stream registry,
//! authenticator, heartbeat and forwarder together and drives the connection
//! lifecycle until shutdown.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use protocol::{Frame, FrameType, FLAG_NONE};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::Authenticator;
use crate::config::AgentConfig;
use crate::connector::Connector;
use crate::dispatcher::{Dispatcher, FrameHandler};
use crate::error::{ClientError, Result};
use crate::events::{AgentEvents, NullEvents};
use crate::forward::LocalForwarder;
use crate::health::{HealthChecker, HealthStatus, CHECK_CONNECTION, CHECK_LOCAL_SERVICE, CHECK_STREAMS};
use crate::heartbeat::Heartbeat;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::stream::{StreamRegistry, StreamState};

/// Grace period for the write task to flush the final `Close` frame.
const SHUTDOWN_FLUSH_GRACE: Duration = Duration::from_millis(100);

/// Everything the frame handler and forwarder tasks share.
struct AgentCore {
    connector: Arc<Connector>,
    registry: Arc<StreamRegistry>,
    authenticator: Authenticator,
    heartbeat: Arc<Heartbeat>,
    forwarder: Arc<LocalForwarder>,
    health: Arc<HealthChecker>,
    request_timeout: Duration,
}

impl AgentCore {
    fn handle_open_stream(&self, frame: Frame) -> Result<()> {
        let stream = self.registry.create(frame.stream_id)?;
        stream.set_state(StreamState::Open);

        let registry = self.registry.clone();
        let forwarder = self.forwarder.clone();
        let health = self.health.clone();
        let request_timeout = self.request_timeout;
        let stream_id = frame.stream_id;
        let payload = frame.payload;

        tokio::spawn(async move {
            let result =
                match tokio::time::timeout(request_timeout, forwarder.forward(stream.clone(), payload))
                    .await
                {
                    Ok(result) => result,
                    Err(_elapsed) => Err(ClientError::Timeout),
                };

            match result {
                Ok(()) => {
                    health.update(
                        CHECK_LOCAL_SERVICE,
                        HealthStatus::Healthy,
                        "local service responding",
                    );
                    // The terminating frame: nothing follows on this stream.
                    if let Err(err) = stream.half_close() {
                        warn!(error = %err, stream_id, "failed to send end-of-stream frame");
                    }
                }
                Err(err) => {
                    error!(error = %err, stream_id, "failed to forward request");
                    health.update(CHECK_LOCAL_SERVICE, HealthStatus::Degraded, &err.to_string());
                    stream.set_state(StreamState::Error);
                    if let Err(send_err) = stream.send_error(&err.to_string()) {
                        warn!(error = %send_err, stream_id, "failed to send error frame");
                    }
                }
            }

            // Already gone when an inbound END_STREAM or Close raced us.
            let _ = registry.close(stream_id);
        });

        Ok(())
    }

    async fn handle_stream_data(&self, frame: Frame) -> Result<()> {
        let Some(stream) = self.registry.get(frame.stream_id) else {
            return Err(ClientError::StreamNotFound);
        };

        let end_of_stream = frame.is_end_stream();
        if !frame.payload.is_empty() {
            stream.set_state(StreamState::Data);
            stream.deliver(frame.payload).await?;
        }
        if end_of_stream {
            let _ = self.registry.close(frame.stream_id);
        }
        Ok(())
    }
}

#[async_trait]
impl FrameHandler for AgentCore {
    async fn handle_control(&self, frame: Frame) -> Result<()> {
        match frame.frame_type {
            FrameType::Auth => match self.authenticator.handle_auth_response(&frame) {
                Ok(()) => {
                    info!(agent_id = ?self.authenticator.agent_id(), "authentication successful");
                    self.health
                        .update(CHECK_CONNECTION, HealthStatus::Healthy, "authenticated");
                    self.heartbeat.start();
                    Ok(())
                }
                Err(err) => {
                    error!(error = %err, "authentication failed");
                    self.health.update(
                        CHECK_CONNECTION,
                        HealthStatus::Unhealthy,
                        "authentication failed",
                    );
                    // Fatal for this episode; the supervisor reconnects.
                    self.connector.disconnect();
                    Err(err)
                }
            },
            FrameType::Heartbeat => {
                debug!("heartbeat ACK received");
                Ok(())
            }
            FrameType::Close => {
                info!("server requested connection close");
                self.health.update(
                    CHECK_CONNECTION,
                    HealthStatus::Unhealthy,
                    "server requested close",
                );
                self.connector.disconnect();
                Ok(())
            }
            other => {
                warn!(frame_type = ?other, "unknown control frame type");
                Ok(())
            }
        }
    }

    async fn handle_stream(&self, frame: Frame) -> Result<()> {
        match frame.frame_type {
            FrameType::OpenStream => self.handle_open_stream(frame),
            FrameType::Data => self.handle_stream_data(frame).await,
            FrameType::Close => self.registry.close(frame.stream_id),
            other => {
                warn!(frame_type = ?other, stream_id = frame.stream_id, "unknown stream frame type");
                Ok(())
            }
        }
    }
}

/// The tunnel agent: a long-lived client bridging the core server to a local
/// HTTP service.
pub struct Agent {
    core: Arc<AgentCore>,
    dispatcher: Dispatcher,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
}

impl Agent {
    /// Build an agent with no event sink.
    pub fn new(config: AgentConfig) -> Result<Self> {
        Self::with_events(config, Arc::new(NullEvents))
    }

    /// Build an agent with `events` wired into every component.
    pub fn with_events(config: AgentConfig, events: Arc<dyn AgentEvents>) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(Metrics::default());
        let health = Arc::new(HealthChecker::default());
        health.update(CHECK_CONNECTION, HealthStatus::Degraded, "not connected");
        health.update(CHECK_STREAMS, HealthStatus::Healthy, "no active streams");
        health.update(
            CHECK_LOCAL_SERVICE,
            HealthStatus::Healthy,
            "local service available",
        );

        let shutdown = CancellationToken::new();

        let connector = Arc::new(Connector::new(
            &config,
            shutdown.child_token(),
            events.clone(),
            metrics.clone(),
            health.clone(),
        )?);
        let registry = Arc::new(StreamRegistry::new(
            connector.clone(),
            events.clone(),
            metrics.clone(),
            health.clone(),
        ));
        let authenticator = Authenticator::new(&config);
        let heartbeat = Arc::new(Heartbeat::new(
            connector.clone(),
            config.heartbeat_interval,
            metrics.clone(),
        ));
        let forwarder = Arc::new(LocalForwarder::new(&config, metrics.clone())?);

        let core = Arc::new(AgentCore {
            connector,
            registry,
            authenticator,
            heartbeat,
            forwarder,
            health,
            request_timeout: config.request_timeout,
        });

        let dispatcher = Dispatcher::new(config.read_timeout, core.clone(), metrics.clone());

        Ok(Self {
            core,
            dispatcher,
            metrics,
            shutdown,
        })
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn health(&self) -> Arc<HealthChecker> {
        self.core.health.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.core.connector.is_connected()
    }

    /// Token that ends [`Agent::run`] gracefully when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Connect and serve until the shutdown token fires.
    ///
    /// Returns an error only when the initial connect (or a later reconnect)
    /// exhausts `max_retries`; read errors and peer closes reconnect with
    /// backoff instead.
    pub async fn run(&self) -> Result<()> {
        let mut episode = match self.core.connector.connect().await {
            Ok(episode) => episode,
            Err(err) => {
                if self.shutdown.is_cancelled() {
                    return Ok(());
                }
                return Err(err);
            }
        };

        loop {
            self.dispatcher.set_connection(episode.reader);
            let mut read_task = self.dispatcher.start()?;

            match self.core.authenticator.create_auth_frame() {
                Ok(frame) => match self.core.connector.send_frame(frame) {
                    Ok(()) => debug!("authentication frame sent"),
                    Err(err) => warn!(error = %err, "failed to send auth frame"),
                },
                Err(err) => warn!(error = %err, "failed to build auth frame"),
            }

            let mut shutting_down = false;
            let mut read_done = false;
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    shutting_down = true;
                }
                _ = episode.ended.cancelled() => {
                    debug!("connection episode ended");
                }
                _ = &mut read_task => {
                    debug!("read loop exited");
                    read_done = true;
                }
            }

            if shutting_down {
                self.graceful_shutdown().await;
                if !read_done {
                    let _ = read_task.await;
                }
                return Ok(());
            }

            self.core.heartbeat.stop();
            self.dispatcher.stop();
            if !read_done {
                let _ = read_task.await;
            }
            self.core.connector.disconnect();
            self.core.registry.close_all();

            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            episode = match self.core.connector.reconnect().await {
                Ok(episode) => episode,
                Err(err) => {
                    if self.shutdown.is_cancelled() {
                        return Ok(());
                    }
                    return Err(err);
                }
            };
        }
    }

    /// Send one `Close` control frame, let the write buffer flush, then stop
    /// heartbeat and dispatcher and disconnect.
    async fn graceful_shutdown(&self) {
        info!("shutting down");

        let close = Frame::control(FrameType::Close, FLAG_NONE, Bytes::new());
        if let Err(err) = self.core.connector.send_frame(close) {
            warn!(error = %err, "failed to send close frame");
        }
        tokio::time::sleep(SHUTDOWN_FLUSH_GRACE).await;

        self.core.heartbeat.stop();
        self.dispatcher.stop();
        self.core.connector.close();
        self.core.registry.close_all();

        info!("shutdown complete");
    }
}
