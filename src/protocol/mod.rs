//! Protocol client: one realtime connection to an established session.
//!
//! [`ProtocolClient::spawn`] starts an actor that owns the
//! [`Transport`](crate::transport::Transport). It performs the enter / time-sync
//! handshake, routes validated inbound messages into the frame caches and the
//! decode pool, and reconnects under the transport retry policy after unexpected
//! closes. Anything the session
//! orchestrator must react to is reported as a [`ProtocolEvent`].

mod driver;
pub mod handshake;

pub use driver::{ClientChannels, ClientConfig, ClientParams, ProtocolClient, ProtocolHandle};
pub use handshake::FrameClock;

use crate::codec::CodecError;
use crate::transport::CloseReason;

/// Connection lifecycle of a [`ProtocolClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Disconnected,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    pub fn is_open(self) -> bool {
        self == ConnectionState::Open
    }
}

/// Why the client gave up on its connection and needs a fresh session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartReason {
    /// Initial connect failed
    ConnectFailed(String),
    /// No inbound traffic for the inactivity window
    Inactivity,
    /// Transport retry policy exhausted
    ReconnectExhausted { rounds: u32 },
    /// Reconnect budget ran out while the network was down
    ReconnectTimeout,
}

impl std::fmt::Display for RestartReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestartReason::ConnectFailed(reason) => write!(f, "connect failed: {}", reason),
            RestartReason::Inactivity => write!(f, "inactivity timeout"),
            RestartReason::ReconnectExhausted { rounds } => {
                write!(f, "reconnect exhausted after {} rounds", rounds)
            }
            RestartReason::ReconnectTimeout => write!(f, "reconnect timed out while offline"),
        }
    }
}

/// Notification from the client to its owner.
#[derive(Debug, Clone)]
pub enum ProtocolEvent {
    /// Handshake complete; `resumed` is set when resume parameters were sent
    Ready { resumed: bool, clock: FrameClock },
    /// Server-side avatar state change
    StateChanged { state: String },
    /// One inbound message was dropped
    FrameDropped { event: String, error: CodecError },
    /// Non-fatal server error report
    ServerError { code: i32, message: String },
    /// The server ended the session
    Kicked { code: i32, message: String },
    /// The transport closed unexpectedly; reconnect is under way
    Disconnected { reason: CloseReason },
    /// The connection cannot be recovered in place
    RestartRequired { reason: RestartReason },
    /// The client stopped
    Closed,
}
