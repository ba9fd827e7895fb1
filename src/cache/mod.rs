//! Per-stream frame buffers.
//!
//! Each stream (body, face, audio, event, decoded visual frames) has its own
//! [`FrameCache`] keyed by validity interval. The [`FrameStore`] bundles them for
//! the protocol client (producer), the decode pool (producer of visual frames) and
//! the render tick (consumer).
//!
//! ## Consumption Discipline
//!
//! Reads at an index prune everything lying entirely before that index, so the
//! render tick only ever moves forward. Network arrival may be out of order; the
//! cache buffers until the tick reaches a record.

mod frame_cache;

pub use frame_cache::{AppendOutcome, FrameCache};

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use crate::types::{
    AnimationFrame, AudioChunk, BodyFrame, EventFrame, FaceFrame, FrameRecord, VisualFrame,
};

/// Stream a cache buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Body,
    Face,
    Audio,
    Event,
    Visual,
}

/// All stream caches for one avatar.
#[derive(Debug)]
pub struct FrameStore {
    body: Mutex<FrameCache<BodyFrame>>,
    face: Mutex<FrameCache<FaceFrame>>,
    audio: Mutex<FrameCache<AudioChunk>>,
    events: Mutex<FrameCache<EventFrame>>,
    visual: Mutex<FrameCache<VisualFrame>>,
}

impl Default for FrameStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            body: Mutex::new(FrameCache::new(StreamKind::Body)),
            face: Mutex::new(FrameCache::new(StreamKind::Face)),
            audio: Mutex::new(FrameCache::new(StreamKind::Audio)),
            events: Mutex::new(FrameCache::new(StreamKind::Event)),
            visual: Mutex::new(FrameCache::new(StreamKind::Visual)),
        }
    }

    pub fn append_body(&self, records: Vec<FrameRecord<BodyFrame>>) -> AppendOutcome {
        self.body.lock().append_batch(records)
    }

    pub fn append_face(&self, records: Vec<FrameRecord<FaceFrame>>) -> AppendOutcome {
        self.face.lock().append_batch(records)
    }

    /// Append audio after applying the discontinuity truncation rule.
    pub fn append_audio(&self, records: Vec<FrameRecord<AudioChunk>>) -> AppendOutcome {
        let mut audio = self.audio.lock();
        audio.check_validity(&records);
        audio.append_batch(records)
    }

    pub fn append_events(&self, records: Vec<FrameRecord<EventFrame>>) -> AppendOutcome {
        self.events.lock().append_batch(records)
    }

    /// Store one decoded frame.
    pub fn insert_visual(&self, record: FrameRecord<VisualFrame>) -> AppendOutcome {
        self.visual.lock().append_batch([record])
    }

    /// Pull the decoded frame for `index`, pruning older frames.
    pub fn next_visual_frame(&self, index: u32) -> Option<VisualFrame> {
        self.visual.lock().take_at(index).map(|record| record.payload)
    }

    /// Pull everything scheduled for `index` besides the video frame.
    pub fn next_animation_frame(&self, index: u32) -> Option<AnimationFrame> {
        let face = self.face.lock().take_at(index).map(|r| r.payload);
        let audio = self.audio.lock().take_at(index).map(|r| r.payload);
        let events = self.events.lock().take_at(index).map(|r| r.payload).into_iter().collect();
        let body = {
            let mut body = self.body.lock();
            body.prune_before(index);
            body.covering(index).map(|r| r.payload.clone())
        };

        let frame = AnimationFrame { index, face, body, audio, events };
        (!frame.is_empty()).then_some(frame)
    }

    /// Body unit covering `index`, without consuming anything.
    pub fn body_at(&self, index: u32) -> Option<FrameRecord<BodyFrame>> {
        self.body.lock().covering(index).cloned()
    }

    /// Distinct clips with decoded frames waiting to be rendered.
    pub fn buffered_clips(&self) -> usize {
        self.visual.lock().clip_count()
    }

    /// Highest decoded frame index waiting to be rendered.
    pub fn last_visual_index(&self) -> Option<u32> {
        self.visual.lock().iter().next_back().map(|r| r.start_frame)
    }

    /// Drop decoded frames at or after `index`.
    pub fn truncate_visual_from(&self, index: u32) -> usize {
        self.visual.lock().truncate_from(index)
    }

    /// Clear the face and body caches (invisible mode toggles).
    pub fn clear_animation(&self) {
        self.face.lock().clear_all();
        self.body.lock().clear_all();
        debug!("Cleared face and body caches");
    }

    /// Clear every cache.
    pub fn clear_all(&self) {
        self.body.lock().clear_all();
        self.face.lock().clear_all();
        self.audio.lock().clear_all();
        self.events.lock().clear_all();
        self.visual.lock().clear_all();
        debug!("Cleared all frame caches");
    }

    pub fn body(&self) -> MutexGuard<'_, FrameCache<BodyFrame>> {
        self.body.lock()
    }

    pub fn face(&self) -> MutexGuard<'_, FrameCache<FaceFrame>> {
        self.face.lock()
    }

    pub fn audio(&self) -> MutexGuard<'_, FrameCache<AudioChunk>> {
        self.audio.lock()
    }

    pub fn events(&self) -> MutexGuard<'_, FrameCache<EventFrame>> {
        self.events.lock()
    }

    pub fn visual(&self) -> MutexGuard<'_, FrameCache<VisualFrame>> {
        self.visual.lock()
    }
}
