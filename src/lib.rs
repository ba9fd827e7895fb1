//! Session protocol client and frame synchronization engine for remotely driven
//! digital avatars.
//!
//! A server drives the avatar over a realtime transport: body animation units
//! that reference pre-rendered video clips, compressed facial animation, audio
//! and scheduled events. avatar-sync keeps that session alive and turns the
//! streams into frames indexed on a single render clock.
//!
//! # Features
//!
//! - **Session lifecycle**: signed start/stop requests, enter and time-sync
//!   handshake, bounded reconnect and restart policies, idle fallback while offline
//! - **Frame sync**: interval caches per stream, versioned by animation unit,
//!   pruned as the renderer advances
//! - **Segment decoding**: an actor-owned decode pool with seek reconciliation
//!   and generation-based cancellation
//! - **Pluggable edges**: the host supplies the transport, the HTTP fetcher and
//!   the segment decoder through traits
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use avatar_sync::{AvatarSession, SessionConfig};
//! # use avatar_sync::transport::Connector;
//! # use avatar_sync::resource::ResourceFetcher;
//! # use avatar_sync::decode::SegmentDecoder;
//! # async fn run(
//! #     connector: Arc<dyn Connector>,
//! #     fetcher: Arc<dyn ResourceFetcher>,
//! #     decoder: Arc<dyn SegmentDecoder>,
//! # ) -> avatar_sync::Result<()> {
//! let config = SessionConfig::builder("https://api.example.test", "avatar-7")
//!     .credentials("app-id", "app-secret")
//!     .idle_clip("idle01", 24)
//!     .build()?;
//!
//! let session = AvatarSession::builder(config)
//!     .connector(connector)
//!     .fetcher(fetcher)
//!     .decoder(decoder)
//!     .build()?;
//! session.start().await?;
//!
//! // Render loop
//! if let Some(index) = session.current_frame() {
//!     let visual = session.next_visual_frame(index);
//!     let animation = session.next_animation_frame(index);
//!     # let _ = (visual, animation);
//! }
//! session.destroy().await;
//! # Ok(())
//! # }
//! ```

// Core types and error handling
mod error;
#[cfg(any(test, feature = "test-utils", feature = "benchmark"))]
pub mod test_utils;
pub mod types;

// Configuration and policies
pub mod config;
pub mod retry;

// Codecs and caches
pub mod cache;
pub mod codec;

// Session pipeline
pub mod decode;
pub mod protocol;
pub mod resource;
pub mod session;
pub mod stream;
pub mod transport;

// Core exports
pub use error::*;
pub use types::*;

// Main API exports
pub use cache::FrameStore;
pub use config::{IdleClip, RetrySettings, SessionConfig, SessionConfigBuilder};
pub use decode::DeviceClass;
pub use protocol::FrameClock;
pub use retry::RetryPolicy;
pub use session::{AvatarSession, AvatarSessionBuilder, SessionEvent};
