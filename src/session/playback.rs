//! Playback position shared between the render tick, the decode pool and the
//! resume handshake

use parking_lot::Mutex;
use std::sync::Arc;

use crate::types::ResumeParams;

#[derive(Debug, Default)]
struct PlaybackState {
    last_decoded_frame: Option<u32>,
    last_rendered_frame: Option<u32>,
    current_clip: Option<(Arc<str>, u32)>,
    next_state: Option<String>,
    session_id: Option<String>,
}

/// Where playback is, for resuming a session where the last one left off.
#[derive(Debug, Default)]
pub struct PlaybackTracker {
    state: Mutex<PlaybackState>,
}

impl PlaybackTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The decode pool delivered global frame `index`.
    pub fn record_decoded(&self, index: u32) {
        let mut state = self.state.lock();
        state.last_decoded_frame =
            Some(state.last_decoded_frame.map_or(index, |last| last.max(index)));
    }

    /// The renderer presented `local_index` of `clip` at global frame `index`.
    pub fn record_rendered(&self, index: u32, clip: &Arc<str>, local_index: u32) {
        let mut state = self.state.lock();
        state.last_rendered_frame = Some(index);
        state.current_clip = Some((Arc::clone(clip), local_index));
    }

    /// State the host asked for most recently.
    pub fn set_next_state(&self, next_state: impl Into<String>) {
        self.state.lock().next_state = Some(next_state.into());
    }

    pub fn set_session_id(&self, session_id: impl Into<String>) {
        self.state.lock().session_id = Some(session_id.into());
    }

    pub fn last_decoded_frame(&self) -> Option<u32> {
        self.state.lock().last_decoded_frame
    }

    pub fn last_rendered_frame(&self) -> Option<u32> {
        self.state.lock().last_rendered_frame
    }

    /// Snapshot for the resume handshake.
    pub fn resume_params(&self) -> ResumeParams {
        let state = self.state.lock();
        ResumeParams {
            last_decoded_frame: state.last_decoded_frame,
            current_clip_name: state.current_clip.as_ref().map(|(name, _)| name.to_string()),
            current_clip_frame: state.current_clip.as_ref().map(|(_, frame)| *frame),
            next_state: state.next_state.clone(),
            last_session_id: state.session_id.clone(),
        }
    }

    /// Forget decode progress after a generation change; clip and session survive.
    pub fn reset_decoded(&self) {
        self.state.lock().last_decoded_frame = None;
    }

    pub fn reset(&self) {
        *self.state.lock() = PlaybackState::default();
    }
}
