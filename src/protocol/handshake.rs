//! Session handshake: enter, time sync, frame reference

use std::time::Duration;
use tokio::time::Instant;

use crate::codec::wire::Command;
use crate::types::{ResumeParams, Session};

/// Frame reference established by the time-sync handshake.
///
/// Frame zero is the client instant the server timestamp arrived; the server
/// timestamp is kept so frame indices can be mapped back to server time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameClock {
    server_time: f64,
    anchor: Instant,
    fps: u32,
}

impl FrameClock {
    pub fn new(server_time: f64, anchor: Instant, fps: u32) -> Self {
        Self { server_time, anchor, fps: fps.max(1) }
    }

    pub fn server_time(&self) -> f64 {
        self.server_time
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps as f64)
    }

    /// Frame index on the render clock at `now`.
    pub fn frame_at(&self, now: Instant) -> u32 {
        let elapsed = now.saturating_duration_since(self.anchor).as_secs_f64();
        let frame = (elapsed * self.fps as f64).floor();
        if frame >= u32::MAX as f64 { u32::MAX } else { frame as u32 }
    }

    /// Server timestamp of frame `index`.
    pub fn server_time_of(&self, index: u32) -> f64 {
        self.server_time + index as f64 / self.fps as f64
    }
}

/// First command after the transport opens.
pub fn enter_command(session: &Session) -> Command {
    Command::Enter {
        session_id: session.session_id.clone(),
        room: session.room.clone(),
        token: session.token.clone(),
    }
}

/// Acknowledge a time sync, attaching resume parameters when resuming.
pub fn sync_ack(clock: &FrameClock, resume: Option<ResumeParams>) -> Command {
    Command::SyncAck { server_time: clock.server_time(), fps: clock.fps(), resume }
}

/// Query parameters for the transport URL.
pub fn connect_query(session: &Session) -> Vec<(String, String)> {
    vec![
        ("session_id".to_string(), session.session_id.clone()),
        ("room".to_string(), session.room.clone()),
        ("token".to_string(), session.token.clone()),
    ]
}
