//! Error types for avatar session processing.
//!
//! This module provides the error taxonomy for the avatar-sync engine. All errors
//! implement the `std::error::Error` trait and carry enough structured context to
//! decide whether a failure is isolated, retried, or terminal.
//!
//! ## Error Classes
//!
//! - **Transient**: A single bad frame, a segment fetch timeout, a failed decode.
//!   Skipped without touching the session.
//! - **Recoverable**: Transport disconnects, inactivity timeouts, handshake or
//!   session-start failures. Routed through the bounded retry policy.
//! - **Fatal**: Server kicks, exhausted retries, invalid configuration. The session
//!   goes straight to `Close`.
//!
//! ```rust
//! use avatar_sync::{ErrorClass, SessionError};
//!
//! let error = SessionError::connection_failed("socket reset");
//! assert_eq!(error.class(), ErrorClass::Recoverable);
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::time::Duration;
use thiserror::Error;

use crate::codec::CodecError;

/// Result type alias for session operations.
pub type Result<T, E = SessionError> = std::result::Result<T, E>;

/// How a failure propagates through the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Isolated to one frame or segment; the session continues.
    Transient,
    /// Handled by the reconnect/restart retry policy.
    Recoverable,
    /// Terminates the session.
    Fatal,
}

/// Main error type for session operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SessionError {
    #[error("Transport connection failed: {reason}")]
    Connection {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Transport is not connected")]
    NotConnected,

    #[error("Session handshake failed: {reason}")]
    Handshake { reason: String },

    #[error("Session start failed: {reason}")]
    SessionStart {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("No inbound traffic for {duration:?}")]
    Inactivity { duration: Duration },

    #[error("Fetching '{resource}' failed: {reason}")]
    Fetch { resource: String, reason: String },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Frame decode failed")]
    Codec(#[from] CodecError),

    #[error("Segment '{segment}' could not be decoded: {reason}")]
    SegmentDecode { segment: String, reason: String },

    #[error("Server closed the session ({code}): {message}")]
    Kicked { code: i32, message: String },

    #[error("Server reported error {code}: {message}")]
    Server { code: i32, message: String },

    #[error("Retry policy exhausted after {rounds} rounds")]
    RetriesExhausted { rounds: u32 },

    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    #[error("Session is closed")]
    Closed,
}

impl SessionError {
    /// Classify this error for propagation.
    pub fn class(&self) -> ErrorClass {
        match self {
            SessionError::Fetch { .. } => ErrorClass::Transient,
            SessionError::Timeout { .. } => ErrorClass::Transient,
            SessionError::Codec(_) => ErrorClass::Transient,
            SessionError::SegmentDecode { .. } => ErrorClass::Transient,
            SessionError::NotConnected => ErrorClass::Transient,
            SessionError::Connection { .. } => ErrorClass::Recoverable,
            SessionError::Handshake { .. } => ErrorClass::Recoverable,
            SessionError::SessionStart { .. } => ErrorClass::Recoverable,
            SessionError::Inactivity { .. } => ErrorClass::Recoverable,
            SessionError::Server { .. } => ErrorClass::Recoverable,
            SessionError::Kicked { .. } => ErrorClass::Fatal,
            SessionError::RetriesExhausted { .. } => ErrorClass::Fatal,
            SessionError::Config { .. } => ErrorClass::Fatal,
            SessionError::Closed => ErrorClass::Fatal,
        }
    }

    /// Returns whether the session restart policy should handle this error.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Recoverable
    }

    /// Returns whether this error terminates the session outright.
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            SessionError::Connection { .. } | SessionError::NotConnected => vec![
                "Check network connectivity",
                "Verify the transport URL returned by session start",
                "Wait for the reconnect policy to complete",
            ],
            SessionError::Handshake { .. } => vec![
                "Verify the session token has not expired",
                "Check server clock synchronization",
            ],
            SessionError::SessionStart { .. } => vec![
                "Verify app id and secret",
                "Check the session service endpoint",
                "Retry after the backoff interval",
            ],
            SessionError::Inactivity { .. } => {
                vec!["Check server health", "Increase the inactivity timeout"]
            }
            SessionError::Fetch { .. } | SessionError::Timeout { .. } => vec![
                "Check resource store availability",
                "Increase the segment fetch timeout",
            ],
            SessionError::Codec(_) | SessionError::SegmentDecode { .. } => vec![
                "Verify server and client codec versions match",
                "Inspect the offending frame payload",
            ],
            SessionError::Kicked { .. } => vec![
                "Check account permissions",
                "Start a new session explicitly",
            ],
            SessionError::Server { .. } => vec!["Inspect server logs for the reported code"],
            SessionError::RetriesExhausted { .. } => vec![
                "Start a new session once connectivity is restored",
                "Increase retry rounds in the configuration",
            ],
            SessionError::Config { .. } => vec!["Fix the reported configuration field"],
            SessionError::Closed => vec!["Create a new session"],
        }
    }

    /// Helper constructor for transport connection errors.
    pub fn connection_failed(reason: impl Into<String>) -> Self {
        SessionError::Connection { reason: reason.into(), source: None }
    }

    /// Helper constructor for transport connection errors with source.
    pub fn connection_failed_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        SessionError::Connection { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for session start errors.
    pub fn session_start_failed(reason: impl Into<String>) -> Self {
        SessionError::SessionStart { reason: reason.into(), source: None }
    }

    /// Helper constructor for resource fetch errors.
    pub fn fetch_failed(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        SessionError::Fetch { resource: resource.into(), reason: reason.into() }
    }

    /// Helper constructor for configuration errors.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        SessionError::Config { reason: reason.into() }
    }

    /// Copy of this error without its source chain, for fan-out to several
    /// listeners.
    pub fn detached(&self) -> Self {
        match self {
            SessionError::Connection { reason, .. } => {
                SessionError::connection_failed(reason.clone())
            }
            SessionError::NotConnected => SessionError::NotConnected,
            SessionError::Handshake { reason } => {
                SessionError::Handshake { reason: reason.clone() }
            }
            SessionError::SessionStart { reason, .. } => {
                SessionError::session_start_failed(reason.clone())
            }
            SessionError::Inactivity { duration } => {
                SessionError::Inactivity { duration: *duration }
            }
            SessionError::Fetch { resource, reason } => {
                SessionError::fetch_failed(resource.clone(), reason.clone())
            }
            SessionError::Timeout { duration } => SessionError::Timeout { duration: *duration },
            SessionError::Codec(error) => SessionError::Codec(error.clone()),
            SessionError::SegmentDecode { segment, reason } => {
                SessionError::SegmentDecode { segment: segment.clone(), reason: reason.clone() }
            }
            SessionError::Kicked { code, message } => {
                SessionError::Kicked { code: *code, message: message.clone() }
            }
            SessionError::Server { code, message } => {
                SessionError::Server { code: *code, message: message.clone() }
            }
            SessionError::RetriesExhausted { rounds } => {
                SessionError::RetriesExhausted { rounds: *rounds }
            }
            SessionError::Config { reason } => SessionError::invalid_config(reason.clone()),
            SessionError::Closed => SessionError::Closed,
        }
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::SessionStart {
            reason: "malformed service response".to_string(),
            source: Some(Box::new(err)),
        }
    }
}
