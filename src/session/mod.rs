//! Session lifecycle: orchestration, offline fallback and playback tracking.

mod offline;
mod orchestrator;
mod playback;

pub use offline::OFFLINE_BODY_ID;
pub use orchestrator::{AvatarSession, AvatarSessionBuilder, SessionEvent};
pub use playback::PlaybackTracker;
