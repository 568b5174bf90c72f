//! Periodic keepalive on the control stream.
//!
//! Each heartbeat is fire-and-forget; the read loop's timeout handling is
//! what detects a dead peer, not the heartbeat itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use protocol::{Frame, FrameType, FLAG_NONE};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::connector::Connector;
use crate::metrics::Metrics;

pub struct Heartbeat {
    connector: Arc<Connector>,
    interval: Duration,
    metrics: Arc<Metrics>,
    running: AtomicBool,
    cancel: Mutex<CancellationToken>,
}

impl Heartbeat {
    pub fn new(connector: Arc<Connector>, interval: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            connector,
            interval,
            metrics,
            running: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Start the heartbeat task. Idempotent while running.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();

        let heartbeat = self.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + heartbeat.interval;
            let mut tick = tokio::time::interval_at(start, heartbeat.interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tick.tick() => {
                        if !heartbeat.connector.is_connected() {
                            continue;
                        }
                        let frame = Frame::control(FrameType::Heartbeat, FLAG_NONE, Bytes::new());
                        match heartbeat.connector.send_frame(frame) {
                            Ok(()) => {
                                heartbeat.metrics.inc_heartbeats_sent();
                                heartbeat.metrics.set_last_heartbeat_now();
                            }
                            Err(err) => {
                                heartbeat.metrics.inc_heartbeats_failed();
                                warn!(error = %err, "heartbeat send failed");
                            }
                        }
                    }
                }
            }
        });
    }

    /// Cancel the heartbeat task.
    pub fn stop(&self) {
        self.cancel.lock().cancel();
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
