//! Process-wide counters for observation.
//!
//! Counters are atomic and written from every component; they are not part of
//! correctness. [`Metrics::snapshot`] is the accessor an embedding process
//! polls from its metrics endpoint.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

#[derive(Debug, Default)]
struct Timestamps {
    last_connection: Option<SystemTime>,
    last_request: Option<SystemTime>,
    last_heartbeat: Option<SystemTime>,
}

/// Monotonic counters plus last-event timestamps.
#[derive(Debug, Default)]
pub struct Metrics {
    connections_total: AtomicU64,
    connections_active: AtomicI64,
    reconnections_total: AtomicU64,
    reconnection_errors: AtomicU64,

    streams_total: AtomicU64,
    streams_active: AtomicI64,
    streams_completed: AtomicU64,
    streams_failed: AtomicU64,

    requests_total: AtomicU64,
    requests_success: AtomicU64,
    requests_failed: AtomicU64,
    request_duration_us: AtomicU64,

    frames_received: AtomicU64,
    frames_sent: AtomicU64,
    frames_error: AtomicU64,

    heartbeats_sent: AtomicU64,
    heartbeats_failed: AtomicU64,

    local_requests_total: AtomicU64,
    local_requests_error: AtomicU64,
    local_request_duration_us: AtomicU64,

    timestamps: Mutex<Timestamps>,
}

impl Metrics {
    pub fn inc_connections_total(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_connections_active(&self) {
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_connections_active(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_reconnections_total(&self) {
        self.reconnections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reconnection_errors(&self) {
        self.reconnection_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_streams_total(&self) {
        self.streams_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_streams_active(&self) {
        self.streams_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_streams_active(&self) {
        self.streams_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_streams_completed(&self) {
        self.streams_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_streams_failed(&self) {
        self.streams_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_requests_total(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_requests_success(&self) {
        self.requests_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_requests_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_duration(&self, duration: Duration) {
        self.request_duration_us
            .store(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn inc_frames_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_frames_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_frames_error(&self) {
        self.frames_error.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_heartbeats_sent(&self) {
        self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_heartbeats_failed(&self) {
        self.heartbeats_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_local_requests_total(&self) {
        self.local_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_local_requests_error(&self) {
        self.local_requests_error.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_local_request_duration(&self, duration: Duration) {
        self.local_request_duration_us
            .store(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn set_last_connection_now(&self) {
        self.timestamps.lock().last_connection = Some(SystemTime::now());
    }

    pub fn set_last_request_now(&self) {
        self.timestamps.lock().last_request = Some(SystemTime::now());
    }

    pub fn set_last_heartbeat_now(&self) {
        self.timestamps.lock().last_heartbeat = Some(SystemTime::now());
    }

    /// Current number of active streams.
    pub fn streams_active(&self) -> i64 {
        self.streams_active.load(Ordering::Relaxed)
    }

    /// Consistent-enough point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let timestamps = self.timestamps.lock();
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            reconnections_total: self.reconnections_total.load(Ordering::Relaxed),
            reconnection_errors: self.reconnection_errors.load(Ordering::Relaxed),
            streams_total: self.streams_total.load(Ordering::Relaxed),
            streams_active: self.streams_active.load(Ordering::Relaxed),
            streams_completed: self.streams_completed.load(Ordering::Relaxed),
            streams_failed: self.streams_failed.load(Ordering::Relaxed),
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success: self.requests_success.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            request_duration_us: self.request_duration_us.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_error: self.frames_error.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            heartbeats_failed: self.heartbeats_failed.load(Ordering::Relaxed),
            local_requests_total: self.local_requests_total.load(Ordering::Relaxed),
            local_requests_error: self.local_requests_error.load(Ordering::Relaxed),
            local_request_duration_us: self.local_request_duration_us.load(Ordering::Relaxed),
            last_connection: timestamps.last_connection,
            last_request: timestamps.last_request,
            last_heartbeat: timestamps.last_heartbeat,
        }
    }
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: i64,
    pub reconnections_total: u64,
    pub reconnection_errors: u64,

    pub streams_total: u64,
    pub streams_active: i64,
    pub streams_completed: u64,
    pub streams_failed: u64,

    pub requests_total: u64,
    pub requests_success: u64,
    pub requests_failed: u64,
    pub request_duration_us: u64,

    pub frames_received: u64,
    pub frames_sent: u64,
    pub frames_error: u64,

    pub heartbeats_sent: u64,
    pub heartbeats_failed: u64,

    pub local_requests_total: u64,
    pub local_requests_error: u64,
    pub local_request_duration_us: u64,

    pub last_connection: Option<SystemTime>,
    pub last_request: Option<SystemTime>,
    pub last_heartbeat: Option<SystemTime>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::default();
        metrics.inc_frames_received();
        metrics.inc_frames_received();
        metrics.inc_frames_sent();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.frames_received, 2);
        assert_eq!(snapshot.frames_sent, 1);
        assert_eq!(snapshot.frames_error, 0);
    }

    #[test]
    fn stream_accounting_balances() {
        let metrics = Metrics::default();
        for _ in 0..5 {
            metrics.inc_streams_total();
            metrics.inc_streams_active();
        }
        for _ in 0..3 {
            metrics.dec_streams_active();
            metrics.inc_streams_completed();
        }
        metrics.dec_streams_active();
        metrics.inc_streams_failed();

        let s = metrics.snapshot();
        assert_eq!(
            s.streams_active,
            s.streams_total as i64 - s.streams_completed as i64 - s.streams_failed as i64
        );
    }

    #[test]
    fn timestamps_start_unset() {
        let metrics = Metrics::default();
        let s = metrics.snapshot();
        assert!(s.last_connection.is_none());
        assert!(s.last_heartbeat.is_none());

        metrics.set_last_heartbeat_now();
        assert!(metrics.snapshot().last_heartbeat.is_some());
    }
}
