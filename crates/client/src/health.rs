//! Named health checks with a worst-of overall status.

use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;

use parking_lot::RwLock;

/// The connection check: Healthy after auth, Unhealthy on disconnect.
pub const CHECK_CONNECTION: &str = "connection";
/// The stream check: reflects whether streams are flowing normally.
pub const CHECK_STREAMS: &str = "streams";
/// The local service check: Degraded while forwarding fails.
pub const CHECK_LOCAL_SERVICE: &str = "local_service";

/// Health of one check, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

/// State of one registered check.
#[derive(Debug, Clone)]
pub struct CheckState {
    pub status: HealthStatus,
    pub message: String,
    pub last_check: SystemTime,
}

/// Registry of named health checks.
#[derive(Debug, Default)]
pub struct HealthChecker {
    checks: RwLock<HashMap<String, CheckState>>,
}

impl HealthChecker {
    /// Register `name` as Healthy with no message.
    pub fn register(&self, name: &str) {
        self.checks.write().insert(
            name.to_string(),
            CheckState {
                status: HealthStatus::Healthy,
                message: String::new(),
                last_check: SystemTime::now(),
            },
        );
    }

    /// Set the status and message of `name`, registering it if needed.
    pub fn update(&self, name: &str, status: HealthStatus, message: &str) {
        self.checks.write().insert(
            name.to_string(),
            CheckState {
                status,
                message: message.to_string(),
                last_check: SystemTime::now(),
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<CheckState> {
        self.checks.read().get(name).cloned()
    }

    /// The worst status across all registered checks; Healthy when none exist.
    pub fn overall(&self) -> HealthStatus {
        self.checks
            .read()
            .values()
            .map(|check| check.status)
            .max()
            .unwrap_or(HealthStatus::Healthy)
    }

    /// Copy of every registered check, keyed by name.
    pub fn all(&self) -> HashMap<String, CheckState> {
        self.checks.read().clone()
    }
}
