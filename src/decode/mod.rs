//! Segment decode pool
//!
//! Turns compressed video segments into per-index [`VisualFrame`](crate::types::VisualFrame)s
//! on the global frame clock. Work arrives as [`SegmentTask`]s from body messages,
//! is queued and reconciled against seeks in [`queue`], and is executed by a
//! bounded set of [`worker`]s owned by the [`pool`] actor.
//!
//! ## Generations
//!
//! Every seek that cannot be absorbed by the current queue starts a new
//! generation. Worker messages carry the generation they were spawned in and are
//! discarded once it is stale, so superseded work never reaches the frame store.

pub mod pool;
pub mod queue;
mod worker;

pub use pool::{DecodePool, PoolContext, PoolSnapshot, WorkerMessage, WorkerMessageKind};
pub use queue::{DecodeQueue, ReconcileOutcome};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::Result;
use crate::types::DecodedImage;

/// One unit of decode work: a clip and the slice of it that is valid.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentTask {
    /// Clip name, resolved against the resource pack
    pub name: Arc<str>,
    /// First valid local frame
    pub local_start: u32,
    /// Last valid local frame (inclusive)
    pub local_end: u32,
    /// Global frame of `local_start`
    pub global_start: u32,
    /// Global end (exclusive)
    pub global_end: u32,
    /// Animation unit version
    pub body_id: u32,
    pub offset_vector: Arc<[f32]>,
}

impl SegmentTask {
    /// Map a local frame to the global clock, or `None` outside the valid range.
    pub fn global_index(&self, local: u32) -> Option<u32> {
        if local < self.local_start || local > self.local_end {
            return None;
        }
        let global = self.global_start.checked_add(local - self.local_start)?;
        (global < self.global_end).then_some(global)
    }

    /// Number of frames this task places on the clock.
    pub fn frame_count(&self) -> u32 {
        let local = self.local_end.saturating_sub(self.local_start).saturating_add(1);
        local.min(self.global_end.saturating_sub(self.global_start))
    }
}

/// Decodes segment bytes into frames.
#[async_trait::async_trait]
pub trait SegmentDecoder: Send + Sync + 'static {
    /// Decode every frame of the segment, in local index order starting at 0.
    async fn decode(&self, name: &str, bytes: Bytes) -> Result<Vec<DecodedImage>>;
}

/// Host capability class, bounding how many decoded clips may be in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    #[default]
    Desktop,
    Constrained,
}

impl DeviceClass {
    /// Maximum clips in flight (decoding or decoded but not yet rendered).
    pub fn clip_ceiling(self) -> usize {
        match self {
            DeviceClass::Desktop => 4,
            DeviceClass::Constrained => 2,
        }
    }
}

/// Decode pool tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodePoolConfig {
    /// Concurrent workers
    pub max_parallel: usize,
    /// Segment fetch budget in milliseconds
    pub fetch_timeout_ms: u64,
    /// Upper bound on clips fetched ahead of the active task
    pub prefetch_ahead: usize,
    /// How often the pool retries dispatch when blocked on the clip ceiling
    pub pump_interval_ms: u64,
}

impl Default for DecodePoolConfig {
    fn default() -> Self {
        Self { max_parallel: 1, fetch_timeout_ms: 2000, prefetch_ahead: 2, pump_interval_ms: 40 }
    }
}

impl DecodePoolConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn pump_interval(&self) -> Duration {
        Duration::from_millis(self.pump_interval_ms.max(1))
    }
}

#[cfg(test)]
pub(crate) fn task(name: &str, start: u32, end: u32, body_id: u32) -> SegmentTask {
    SegmentTask {
        name: Arc::from(name),
        local_start: 0,
        local_end: end.saturating_sub(start).saturating_sub(1),
        global_start: start,
        global_end: end,
        body_id,
        offset_vector: Arc::from(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_index_respects_local_range() {
        let task = SegmentTask { local_start: 5, local_end: 9, ..task("talk", 100, 105, 1) };
        assert_eq!(task.global_index(4), None);
        assert_eq!(task.global_index(5), Some(100));
        assert_eq!(task.global_index(9), Some(104));
        assert_eq!(task.global_index(10), None);
        assert_eq!(task.frame_count(), 5);
    }

    #[test]
    fn global_index_never_passes_global_end() {
        let task = SegmentTask { local_end: 50, ..task("idle", 0, 10, 1) };
        assert_eq!(task.global_index(9), Some(9));
        assert_eq!(task.global_index(10), None);
        assert_eq!(task.frame_count(), 10);
    }

    #[test]
    fn device_ceilings() {
        assert_eq!(DeviceClass::Desktop.clip_ceiling(), 4);
        assert_eq!(DeviceClass::Constrained.clip_ceiling(), 2);
        assert_eq!(DecodePoolConfig::default().fetch_timeout(), Duration::from_millis(2000));
    }
}
