//! Authentication handshake with the core server.
//!
//! The first frame on every connected episode is a control `Auth` frame with
//! a JSON payload; the server answers with an `Auth | ACK` frame. A rejected
//! or malformed response ends the episode.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;
use protocol::{Frame, FrameType, FLAG_NONE};
use serde::{Deserialize, Serialize};

use crate::config::AgentConfig;
use crate::error::{ClientError, Result};

/// Payload of the outbound `Auth` frame.
#[derive(Debug, Serialize)]
struct AuthRequest {
    token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    capabilities: Vec<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    metadata: HashMap<String, String>,
}

/// Payload of the `Auth | ACK` response.
#[derive(Debug, Deserialize)]
struct AuthResponse {
    success: bool,
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    server_time: Option<i64>,
    #[serde(default)]
    #[allow(dead_code)]
    config: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

pub struct Authenticator {
    token: String,
    agent_id: Mutex<Option<String>>,
    version: String,
    capabilities: Vec<String>,
    metadata: HashMap<String, String>,
}

impl Authenticator {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            token: config.token.clone(),
            agent_id: Mutex::new(config.agent_id.clone()),
            version: config.version.clone(),
            capabilities: config.capabilities.clone(),
            metadata: config.metadata.clone(),
        }
    }

    /// The agent id currently in effect; updated from the server's response.
    pub fn agent_id(&self) -> Option<String> {
        self.agent_id.lock().clone()
    }

    /// Build the control `Auth` frame sent right after connecting.
    pub fn create_auth_frame(&self) -> Result<Frame> {
        let request = AuthRequest {
            token: self.token.clone(),
            agent_id: self.agent_id.lock().clone(),
            version: Some(self.version.clone()),
            capabilities: self.capabilities.clone(),
            metadata: self.metadata.clone(),
        };
        let payload = serde_json::to_vec(&request)?;
        Ok(Frame::control(FrameType::Auth, FLAG_NONE, Bytes::from(payload)))
    }

    /// Validate the server's `Auth` response and adopt the assigned agent id.
    pub fn handle_auth_response(&self, frame: &Frame) -> Result<()> {
        if frame.frame_type != FrameType::Auth || !frame.is_control() {
            return Err(ClientError::InvalidFrame);
        }
        if !frame.is_ack() {
            return Err(ClientError::AuthFailed("response missing ACK flag".into()));
        }

        let response: AuthResponse =
            serde_json::from_slice(&frame.payload).map_err(|_| ClientError::InvalidFrame)?;

        if !response.success {
            return Err(ClientError::AuthFailed(
                response
                    .error
                    .unwrap_or_else(|| "server rejected authentication".into()),
            ));
        }

        if let Some(assigned) = response.agent_id {
            *self.agent_id.lock() = Some(assigned);
        }
        Ok(())
    }
}
