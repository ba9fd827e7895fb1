//! Idle fallback scheduling while the session is offline

use std::sync::Arc;

use crate::config::IdleClip;
use crate::decode::SegmentTask;
use crate::types::{BodyFrame, FrameRecord};

/// Version carried by idle fallback units. Server units start at 1, so any
/// server unit supersedes idle frames covering the same range.
pub const OFFLINE_BODY_ID: u32 = 0;

/// Cycles the configured idle clips back to back on the render clock.
#[derive(Debug)]
pub(crate) struct OfflinePlayer {
    clips: Vec<IdleClip>,
    /// Frames to keep scheduled past the playhead
    lookahead: u32,
    next_clip: usize,
    next_start: Option<u32>,
    scheduled: u64,
}

impl OfflinePlayer {
    pub fn new(clips: Vec<IdleClip>, lookahead: u32) -> Self {
        Self { clips, lookahead, next_clip: 0, next_start: None, scheduled: 0 }
    }

    /// Forget the previous offline stretch.
    pub fn restart(&mut self) {
        self.next_clip = 0;
        self.next_start = None;
    }

    /// Schedule the next clip if fewer than `lookahead` frames are queued past
    /// `playhead`.
    ///
    /// `earliest` is the first free frame on the clock. Preloaded clips are
    /// preferred; when none are preloaded every clip is eligible.
    pub fn next_task(
        &mut self,
        playhead: u32,
        earliest: u32,
        is_preloaded: impl Fn(&str) -> bool,
    ) -> Option<SegmentTask> {
        if self.clips.is_empty() {
            return None;
        }

        let start = self.next_start.unwrap_or(0).max(earliest).max(playhead);
        if start > playhead.saturating_add(self.lookahead) {
            return None;
        }

        let count = self.clips.len();
        let first = self.next_clip % count;
        let index = (0..count)
            .map(|i| (first + i) % count)
            .find(|&i| is_preloaded(&self.clips[i].name))
            .unwrap_or(first);
        let clip = &self.clips[index];

        let end = start.checked_add(clip.frames)?;
        self.next_clip = (index + 1) % count;
        self.next_start = Some(end);
        self.scheduled += 1;

        Some(SegmentTask {
            name: Arc::from(clip.name.as_str()),
            local_start: 0,
            local_end: clip.frames.saturating_sub(1),
            global_start: start,
            global_end: end,
            body_id: OFFLINE_BODY_ID,
            offset_vector: Arc::from(Vec::new()),
        })
    }

    /// Clips scheduled since creation.
    pub fn scheduled(&self) -> u64 {
        self.scheduled
    }
}

/// Body record placing an idle task on the clock.
pub(crate) fn body_record(task: &SegmentTask) -> FrameRecord<BodyFrame> {
    FrameRecord::new(
        task.global_start,
        task.global_end,
        BodyFrame {
            body_id: task.body_id,
            name: Arc::clone(&task.name),
            local_start: task.local_start,
            local_end: task.local_end,
            offset: Arc::clone(&task.offset_vector),
            state: Some("idle".to_string()),
        },
    )
}
