//! Frame record types shared by the codec, the caches and the renderer pull API

use std::sync::Arc;

use super::DecodedImage;

/// Payloads stored in a [`FrameCache`](crate::cache::FrameCache).
///
/// Only body-derived payloads carry a version; the cache uses it to reject
/// stale records and evict superseded ones.
pub trait FramePayload {
    /// Monotonic server-issued animation unit id, if this stream is versioned.
    fn version(&self) -> Option<u32> {
        None
    }

    /// Name of the clip this payload belongs to, if any.
    fn clip(&self) -> Option<&str> {
        None
    }
}

/// A payload valid over the render-frame interval `[start_frame, end_frame)`.
///
/// Zero-length records (`start_frame == end_frame`) are valid at exactly
/// `start_frame`.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRecord<T> {
    /// First render frame this record applies to
    pub start_frame: u32,

    /// Exclusive end of the validity interval
    pub end_frame: u32,

    /// Stream-specific payload
    pub payload: T,
}

impl<T> FrameRecord<T> {
    /// Create a record, clamping `end_frame` so that `start_frame <= end_frame` holds.
    pub fn new(start_frame: u32, end_frame: u32, payload: T) -> Self {
        Self { start_frame, end_frame: end_frame.max(start_frame), payload }
    }

    /// Create a record valid for exactly one frame.
    pub fn single(index: u32, payload: T) -> Self {
        Self { start_frame: index, end_frame: index.saturating_add(1), payload }
    }

    /// Whether `index` lies inside the validity interval.
    pub fn contains(&self, index: u32) -> bool {
        if self.start_frame == self.end_frame {
            return index == self.start_frame;
        }
        self.start_frame <= index && index < self.end_frame
    }

    /// Whether two intervals share at least one frame.
    pub fn overlaps(&self, start: u32, end: u32) -> bool {
        let self_end = self.end_frame.max(self.start_frame.saturating_add(1));
        let other_end = end.max(start.saturating_add(1));
        self.start_frame < other_end && start < self_end
    }

    /// Number of frames covered.
    pub fn len(&self) -> u32 {
        self.end_frame - self.start_frame
    }

    /// Whether the interval is zero-length.
    pub fn is_empty(&self) -> bool {
        self.start_frame == self.end_frame
    }
}

/// Skeletal/body animation unit issued by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct BodyFrame {
    /// Monotonically increasing per server animation unit
    pub body_id: u32,

    /// Video clip backing this unit
    pub name: Arc<str>,

    /// First valid frame inside the clip
    pub local_start: u32,

    /// Last valid frame inside the clip (inclusive)
    pub local_end: u32,

    /// Secondary offset vector, dequantized
    pub offset: Arc<[f32]>,

    /// Server-side animation state the unit belongs to
    pub state: Option<String>,
}

impl FramePayload for BodyFrame {
    fn version(&self) -> Option<u32> {
        Some(self.body_id)
    }

    fn clip(&self) -> Option<&str> {
        Some(&self.name)
    }
}

/// One frame of facial animation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FaceFrame {
    /// Blendshape weights in `[-1, 1]`
    pub blendshapes: Vec<f32>,

    /// Joint translations, xyz triples
    pub joint_translate: Vec<f32>,

    /// Joint rotation deltas, quaternion components
    pub joint_rotate: Vec<f32>,

    /// Mesh vertex indices for sparse deformation
    pub mesh_indices: Vec<u32>,

    /// Weights paired with `mesh_indices`
    pub mesh_weights: Vec<f32>,
}

impl FramePayload for FaceFrame {}

/// A chunk of utterance audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    /// Speak request this audio answers, when the server tags it
    pub speak_id: Option<u64>,

    /// Signed 16-bit PCM samples
    pub samples: Arc<[i16]>,

    /// Sample rate in Hz
    pub sample_rate: u32,
}

impl FramePayload for AudioChunk {}

/// UI or application event scheduled on the frame clock.
#[derive(Debug, Clone, PartialEq)]
pub struct EventFrame {
    /// Event kind as sent by the server
    pub kind: String,

    /// Opaque event data
    pub data: serde_json::Value,
}

impl FramePayload for EventFrame {}

/// A decoded video frame placed on the global frame clock.
#[derive(Debug, Clone)]
pub struct VisualFrame {
    /// Pixels
    pub image: DecodedImage,

    /// Clip the frame was decoded from
    pub clip: Arc<str>,

    /// Animation unit the clip belongs to
    pub body_id: u32,

    /// Index within the clip
    pub local_index: u32,

    /// Offset vector of the owning task
    pub offset: Arc<[f32]>,
}

impl FramePayload for VisualFrame {
    fn version(&self) -> Option<u32> {
        Some(self.body_id)
    }

    fn clip(&self) -> Option<&str> {
        Some(&self.clip)
    }
}

/// Everything the renderer needs for one tick besides the video frame.
#[derive(Debug, Clone, Default)]
pub struct AnimationFrame {
    /// Render frame index
    pub index: u32,

    /// Facial animation starting at this index
    pub face: Option<FaceFrame>,

    /// Body unit covering this index
    pub body: Option<BodyFrame>,

    /// Audio chunk starting at this index
    pub audio: Option<AudioChunk>,

    /// Events scheduled at this index
    pub events: Vec<EventFrame>,
}

impl AnimationFrame {
    /// Whether nothing is scheduled for this tick.
    pub fn is_empty(&self) -> bool {
        self.face.is_none() && self.body.is_none() && self.audio.is_none() && self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_clamps_inverted_intervals() {
        let record = FrameRecord::new(10, 4, ());
        assert_eq!(record.start_frame, 10);
        assert_eq!(record.end_frame, 10);
        assert!(record.is_empty());
    }

    #[test]
    fn contains_respects_exclusive_end() {
        let record = FrameRecord::new(0, 24, ());
        assert!(record.contains(0));
        assert!(record.contains(23));
        assert!(!record.contains(24));

        let point = FrameRecord::new(7, 7, ());
        assert!(point.contains(7));
        assert!(!point.contains(8));
    }

    #[test]
    fn overlap_detection() {
        let record = FrameRecord::new(10, 20, ());
        assert!(record.overlaps(15, 25));
        assert!(record.overlaps(0, 11));
        assert!(!record.overlaps(20, 30));
        assert!(!record.overlaps(0, 10));
        assert!(record.overlaps(12, 12));
    }

    #[test]
    fn body_payload_is_versioned() {
        let body = BodyFrame {
            body_id: 7,
            name: Arc::from("idle01"),
            local_start: 0,
            local_end: 23,
            offset: Arc::from(Vec::new()),
            state: None,
        };
        assert_eq!(body.version(), Some(7));
        assert_eq!(body.clip(), Some("idle01"));
        assert_eq!(FaceFrame::default().version(), None);
    }
}
