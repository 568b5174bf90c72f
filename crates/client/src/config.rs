//! Agent configuration.
//!
//! The binary builds this from its CLI surface; tests build it directly.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ClientError, Result};

/// TLS settings for the core server connection.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Accept any server certificate. Only for development setups.
    pub skip_verify: bool,
    /// Additional CA certificate bundle (PEM) trusted alongside the
    /// built-in web PKI roots.
    pub ca_cert: Option<PathBuf>,
    /// Server name presented during the handshake. Defaults to the host
    /// part of the server address.
    pub server_name: Option<String>,
}

/// Everything the agent needs to run.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Core server address as `host:port`.
    pub server_addr: String,
    /// TLS dial configuration; `None` means plain TCP.
    pub tls: Option<TlsConfig>,

    /// Authentication token (required).
    pub token: String,
    /// Agent id offered during authentication; the server may assign one.
    pub agent_id: Option<String>,
    /// Agent version string reported to the server.
    pub version: String,
    /// Capabilities advertised during authentication.
    pub capabilities: Vec<String>,
    /// Free-form metadata sent with the auth request.
    pub metadata: HashMap<String, String>,

    /// Default base URL of the local HTTP service.
    pub local_url: String,
    /// Subdomain -> base URL overrides consulted before `local_url`.
    pub services: HashMap<String, String>,

    pub heartbeat_interval: Duration,
    pub read_timeout: Duration,
    pub request_timeout: Duration,

    pub retry_interval: Duration,
    pub backoff_factor: f64,
    pub max_backoff: Duration,
    /// `-1` retries forever; a positive bound fails `connect` once exceeded.
    pub max_retries: i32,
}

impl AgentConfig {
    /// Configuration with the default intervals and backoff policy.
    pub fn new(
        server_addr: impl Into<String>,
        token: impl Into<String>,
        local_url: impl Into<String>,
    ) -> Self {
        Self {
            server_addr: server_addr.into(),
            tls: None,
            token: token.into(),
            agent_id: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
            capabilities: Vec::new(),
            metadata: HashMap::new(),
            local_url: local_url.into(),
            services: HashMap::new(),
            heartbeat_interval: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            retry_interval: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_backoff: Duration::from_secs(60),
            max_retries: -1,
        }
    }

    /// Reject configurations the agent cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.token.is_empty() {
            return Err(ClientError::Config("authentication token is required".into()));
        }
        if self.server_addr.is_empty() {
            return Err(ClientError::Config("server address is required".into()));
        }
        if self.local_url.is_empty() {
            return Err(ClientError::Config("local service URL is required".into()));
        }
        if self.backoff_factor < 1.0 {
            return Err(ClientError::Config(
                "backoff factor must be at least 1.0".into(),
            ));
        }
        Ok(())
    }
}
