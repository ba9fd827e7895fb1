//! Session lifecycle types and the session start/stop wire contract

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle status reported by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Connected and streaming
    Online,
    /// Playing idle fallback clips while the session is re-established
    Offline,
    /// Online and the renderer is actively presenting
    Visible,
    /// Real-time processing paused by the host
    Invisible,
    /// Terminal
    Close,
    /// The host reported the network came back
    NetworkOn,
    /// The host reported the network dropped
    NetworkOff,
}

impl SessionStatus {
    /// Whether the session is streaming from the server.
    pub fn is_live(self) -> bool {
        matches!(self, SessionStatus::Online | SessionStatus::Visible)
    }

    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        self == SessionStatus::Close
    }
}

/// Request sent to the session service to open a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRequest {
    /// Avatar to drive
    pub avatar_id: String,

    /// Previous session id when restarting after a failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_session_id: Option<String>,
}

/// Response of a successful session start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartResponse {
    pub session_id: String,
    pub room: String,
    pub token: String,
    pub transport_url: String,

    /// Base URL the segment names resolve against
    #[serde(default)]
    pub resource_pack: String,

    /// Server-side reconnect window in seconds
    #[serde(default = "default_reconnect_timeout")]
    pub reconnect_timeout: u64,

    /// How long the client may spend reconnecting while offline, in seconds
    #[serde(default = "default_reconnect_client_timeout")]
    pub reconnect_client_timeout: u64,

    /// Opaque server configuration
    #[serde(default)]
    pub config: serde_json::Value,
}

fn default_reconnect_timeout() -> u64 {
    60
}

fn default_reconnect_client_timeout() -> u64 {
    20
}

/// Why a session is being stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The host destroyed the session
    ClientClose,
    /// The session is being replaced by a restart
    Restart,
    /// No traffic for the inactivity window
    Inactivity,
    /// Retries were exhausted
    Failure,
}

/// Request sent to the session service to stop a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopRequest {
    pub session_id: String,
    pub stop_reason: StopReason,
}

/// An established session.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub session_id: String,
    pub room: String,
    pub token: String,
    pub transport_url: String,
    pub resource_pack: String,
    pub reconnect_timeout_s: u64,
    pub reconnect_client_timeout_s: u64,
    pub status: SessionStatus,
}

impl Session {
    /// Bind a start response to a new session in `Online` status.
    pub fn from_start(response: StartResponse) -> Self {
        Self {
            session_id: response.session_id,
            room: response.room,
            token: response.token,
            transport_url: response.transport_url,
            resource_pack: response.resource_pack,
            reconnect_timeout_s: response.reconnect_timeout,
            reconnect_client_timeout_s: response.reconnect_client_timeout,
            status: SessionStatus::Online,
        }
    }

    /// Client-side reconnect budget.
    pub fn reconnect_client_timeout(&self) -> Duration {
        Duration::from_secs(self.reconnect_client_timeout_s)
    }
}

/// Playback position handed to the server when a session resumes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResumeParams {
    pub last_decoded_frame: Option<u32>,
    pub current_clip_name: Option<String>,
    pub current_clip_frame: Option<u32>,
    pub next_state: Option<String>,
    pub last_session_id: Option<String>,
}
