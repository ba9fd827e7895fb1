//! Transport capability traits
//!
//! The host supplies the socket. The protocol client only needs a way to open a
//! connection ([`Connector`]) and a bidirectional event channel on it
//! ([`Transport`]); reconnect policy lives in the client, not here.

use bytes::Bytes;
use serde_json::Value;

use crate::Result;

/// Message body as delivered by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Binary(Bytes),
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Binary(bytes)
    }
}

/// Why a transport closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The client asked for the close
    ClientRequested,
    /// The server closed with a code
    Server { code: u16, reason: String },
    /// The connection dropped without a close handshake
    Lost,
}

impl CloseReason {
    /// Whether the close was initiated locally and needs no recovery.
    pub fn is_manual(&self) -> bool {
        matches!(self, CloseReason::ClientRequested)
    }
}

/// Something the transport observed.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message { event: String, payload: Payload },
    Error(String),
    Closed(CloseReason),
}

/// An open connection.
#[async_trait::async_trait]
pub trait Transport: Send + 'static {
    /// Send one event.
    async fn send(&mut self, event: &str, payload: Value) -> Result<()>;

    /// Wait for the next event.
    ///
    /// Returns `None` once the transport is gone and nothing more will arrive.
    /// Must be cancel-safe: the client polls it inside `tokio::select!`.
    async fn recv(&mut self) -> Option<TransportEvent>;

    /// Close the connection. Closing twice is a no-op.
    async fn close(&mut self);

    /// Whether the connection is currently usable.
    fn is_connected(&self) -> bool;
}

/// Opens transports.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str, query: &[(String, String)]) -> Result<Box<dyn Transport>>;
}
