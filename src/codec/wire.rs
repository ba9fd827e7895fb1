//! Protocol message types
//!
//! Inbound `(event, payload)` pairs from the transport are validated into
//! [`InboundMessage`] here, at the boundary. Outbound [`Command`]s serialize to an
//! event name plus a JSON payload.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{CodecError, quantized};
use crate::decode::SegmentTask;
use crate::transport::Payload;
use crate::types::{AudioChunk, BodyFrame, EventFrame, FrameRecord, ResumeParams};

/// Server error codes that end the session without retrying.
pub const KICK_CODES: &[i32] = &[4001, 4003, 4009];

const DEFAULT_SAMPLE_RATE: u32 = 16_000;

/// Inbound message, validated.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Server clock sample completing the handshake
    TimeSync { server_time: f64 },
    /// Body animation units
    Body(Vec<BodyMessage>),
    /// Compressed face batch, decoded by [`face`](super::face)
    Face(Bytes),
    /// Audio chunks
    Audio(Vec<AudioMessage>),
    /// Scheduled UI events
    Event(Vec<EventMessage>),
    /// Server-side state change
    StateChange { state: String },
    /// Error report, possibly a kick
    Error(ServerErrorMessage),
    /// Keep-alive answer
    Pong,
}

impl InboundMessage {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::TimeSync { .. } => "time_sync",
            InboundMessage::Body(_) => "body",
            InboundMessage::Face(_) => "face",
            InboundMessage::Audio(_) => "audio",
            InboundMessage::Event(_) => "event",
            InboundMessage::StateChange { .. } => "state",
            InboundMessage::Error(_) => "error",
            InboundMessage::Pong => "pong",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> From<OneOrMany<T>> for Vec<T> {
    fn from(value: OneOrMany<T>) -> Self {
        match value {
            OneOrMany::One(item) => vec![item],
            OneOrMany::Many(items) => items,
        }
    }
}

/// One body animation unit as sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BodyMessage {
    /// Clip name
    pub n: String,
    /// Global start frame
    pub sf: u32,
    /// Global end frame (exclusive)
    pub ef: u32,
    pub body_id: u32,
    /// First valid frame inside the clip
    #[serde(default)]
    pub ls: Option<u32>,
    /// Last valid frame inside the clip (inclusive)
    #[serde(default)]
    pub le: Option<u32>,
    /// Quantized offset vector
    #[serde(default)]
    pub offset: Vec<i16>,
    #[serde(default)]
    pub state: Option<String>,
}

impl BodyMessage {
    /// Last valid clip frame, or `None` when it does not fit in a `u32`.
    pub fn local_end(&self) -> Option<u32> {
        match self.le {
            Some(le) => Some(le),
            None => {
                let span = self.ef.saturating_sub(self.sf);
                self.ls.unwrap_or(0).checked_add(span.saturating_sub(1))
            }
        }
    }

    /// Split into the cache record and the decode task for the same unit.
    pub fn into_parts(self) -> (FrameRecord<BodyFrame>, SegmentTask) {
        let local_start = self.ls.unwrap_or(0);
        let local_end = self.local_end().unwrap_or(u32::MAX);
        let name: Arc<str> = Arc::from(self.n);
        let offset: Arc<[f32]> = Arc::from(quantized::decode(&self.offset));

        let record = FrameRecord::new(
            self.sf,
            self.ef,
            BodyFrame {
                body_id: self.body_id,
                name: Arc::clone(&name),
                local_start,
                local_end,
                offset: Arc::clone(&offset),
                state: self.state,
            },
        );
        let task = SegmentTask {
            name,
            local_start,
            local_end,
            global_start: self.sf,
            global_end: self.ef.max(self.sf),
            body_id: self.body_id,
            offset_vector: offset,
        };
        (record, task)
    }
}

/// Audio chunk as sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioMessage {
    pub sf: u32,
    pub ef: u32,
    #[serde(default)]
    pub sid: Option<u64>,
    pub pcm: Vec<i16>,
    #[serde(default = "default_sample_rate")]
    pub rate: u32,
}

fn default_sample_rate() -> u32 {
    DEFAULT_SAMPLE_RATE
}

impl AudioMessage {
    /// Convert into a cache record.
    pub fn into_record(self) -> FrameRecord<AudioChunk> {
        FrameRecord::new(
            self.sf,
            self.ef,
            AudioChunk { speak_id: self.sid, samples: Arc::from(self.pcm), sample_rate: self.rate },
        )
    }
}

/// Scheduled event as sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub sf: u32,
    #[serde(default)]
    pub ef: Option<u32>,
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl EventMessage {
    /// Convert into a cache record; events without an end are single-frame.
    pub fn into_record(self) -> FrameRecord<EventFrame> {
        let end = self.ef.unwrap_or_else(|| self.sf.saturating_add(1));
        FrameRecord::new(self.sf, end, EventFrame { kind: self.kind, data: self.data })
    }
}

/// Error report from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerErrorMessage {
    pub code: i32,
    #[serde(default)]
    pub message: String,
    /// Explicit kick for policy reasons
    #[serde(default)]
    pub kick: bool,
}

impl ServerErrorMessage {
    /// Whether this error ends the session without retrying.
    pub fn is_kick(&self) -> bool {
        self.kick || KICK_CODES.contains(&self.code)
    }
}

#[derive(Debug, Deserialize)]
struct TimeSyncMessage {
    server_time: f64,
}

#[derive(Debug, Deserialize)]
struct StateMessage {
    state: String,
}

/// Validate an inbound transport message.
pub fn parse_inbound(event: &str, payload: Payload) -> Result<InboundMessage, CodecError> {
    match event {
        "face" => match payload {
            Payload::Binary(bytes) => Ok(InboundMessage::Face(bytes)),
            Payload::Json(_) => {
                Err(CodecError::UnexpectedPayload { event: event.to_string(), expected: "binary" })
            }
        },
        "pong" => Ok(InboundMessage::Pong),
        "time_sync" => {
            let msg: TimeSyncMessage = json_payload(event, payload)?;
            if !msg.server_time.is_finite() || msg.server_time < 0.0 {
                return Err(CodecError::message(
                    event,
                    "server_time must be a finite positive number",
                ));
            }
            Ok(InboundMessage::TimeSync { server_time: msg.server_time })
        }
        "body" => {
            let batch: OneOrMany<BodyMessage> = json_payload(event, payload)?;
            let batch: Vec<BodyMessage> = batch.into();
            if let Some(bad) = batch.iter().find(|b| b.ef < b.sf) {
                return Err(CodecError::message(
                    event,
                    format!(
                        "body {} ends at {} before it starts at {}",
                        bad.body_id, bad.ef, bad.sf
                    ),
                ));
            }
            if let Some(bad) = batch.iter().find(|b| b.local_end().is_none()) {
                return Err(CodecError::message(
                    event,
                    format!("body {} clip range overflows from {:?}", bad.body_id, bad.ls),
                ));
            }
            Ok(InboundMessage::Body(batch))
        }
        "audio" => {
            let batch: OneOrMany<AudioMessage> = json_payload(event, payload)?;
            Ok(InboundMessage::Audio(batch.into()))
        }
        "event" => {
            let batch: OneOrMany<EventMessage> = json_payload(event, payload)?;
            Ok(InboundMessage::Event(batch.into()))
        }
        "state" => {
            let msg: StateMessage = json_payload(event, payload)?;
            Ok(InboundMessage::StateChange { state: msg.state })
        }
        "error" => Ok(InboundMessage::Error(json_payload(event, payload)?)),
        other => Err(CodecError::UnknownEvent { event: other.to_string() }),
    }
}

fn json_payload<T: serde::de::DeserializeOwned>(
    event: &str,
    payload: Payload,
) -> Result<T, CodecError> {
    match payload {
        Payload::Json(value) => {
            serde_json::from_value(value).map_err(|e| CodecError::message(event, e))
        }
        Payload::Binary(bytes) => {
            serde_json::from_slice(&bytes).map_err(|e| CodecError::message(event, e))
        }
    }
}

/// Outbound command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// First message after the transport opens
    Enter { session_id: String, room: String, token: String },
    /// Acknowledges the server clock and carries resume parameters
    SyncAck { server_time: f64, fps: u32, resume: Option<ResumeParams> },
    /// Ask the server to move the avatar to another state
    StateChange { state: String },
    /// Utterance chunk
    Speak { speak_id: u64, text: String, start: bool, end: bool },
    /// Pause or resume real-time streams
    Invisible { enabled: bool },
    /// Keep-alive
    Ping,
    /// Client-initiated leave
    Leave,
}

impl Command {
    /// Transport event name.
    pub fn event(&self) -> &'static str {
        match self {
            Command::Enter { .. } => "enter",
            Command::SyncAck { .. } => "sync_ack",
            Command::StateChange { .. } => "state_change",
            Command::Speak { .. } => "speak",
            Command::Invisible { .. } => "invisible",
            Command::Ping => "ping",
            Command::Leave => "leave",
        }
    }

    /// JSON payload.
    pub fn payload(&self) -> Value {
        match self {
            Command::Enter { session_id, room, token } => {
                json!({ "session_id": session_id, "room": room, "token": token })
            }
            Command::SyncAck { server_time, fps, resume } => {
                json!({ "server_time": server_time, "fps": fps, "resume": resume })
            }
            Command::StateChange { state } => json!({ "state": state }),
            Command::Speak { speak_id, text, start, end } => {
                json!({ "speak_id": speak_id, "text": text, "start": start, "end": end })
            }
            Command::Invisible { enabled } => json!({ "enabled": enabled }),
            Command::Ping | Command::Leave => json!({}),
        }
    }

    /// Whether this command may only be sent on a live transport.
    pub fn requires_connection(&self) -> bool {
        matches!(self, Command::StateChange { .. } | Command::Speak { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_accepts_single_object_and_fills_local_range() {
        let payload = Payload::Json(json!({ "n": "idle01", "sf": 0, "ef": 24, "body_id": 1 }));
        let InboundMessage::Body(batch) = parse_inbound("body", payload).unwrap() else {
            panic!("expected body");
        };
        assert_eq!(batch.len(), 1);

        let (record, task) = batch.into_iter().next().unwrap().into_parts();
        assert_eq!(record.start_frame, 0);
        assert_eq!(record.end_frame, 24);
        assert_eq!(task.local_start, 0);
        assert_eq!(task.local_end, 23);
        assert_eq!(task.global_end, 24);
        assert_eq!(&*task.name, "idle01");
    }

    #[test]
    fn body_batch_with_offset_vector() {
        let payload = Payload::Json(json!([
            {
                "n": "talk01", "sf": 10, "ef": 20, "body_id": 2,
                "ls": 5, "le": 14, "offset": [32767, 0]
            },
            { "n": "talk02", "sf": 20, "ef": 30, "body_id": 3 }
        ]));
        let InboundMessage::Body(batch) = parse_inbound("body", payload).unwrap() else {
            panic!("expected body");
        };
        let (record, task) = batch[0].clone().into_parts();
        assert_eq!(task.local_start, 5);
        assert_eq!(task.local_end, 14);
        assert_eq!(&*record.payload.offset, &[1.0, 0.0]);
    }

    #[test]
    fn inverted_body_interval_is_rejected() {
        let payload = Payload::Json(json!({ "n": "x", "sf": 10, "ef": 2, "body_id": 1 }));
        assert!(matches!(parse_inbound("body", payload), Err(CodecError::Message { .. })));
    }

    #[test]
    fn overflowing_clip_range_is_rejected() {
        let payload =
            Payload::Json(json!({ "n": "x", "ls": u32::MAX, "sf": 0, "ef": 3, "body_id": 1 }));
        assert!(matches!(parse_inbound("body", payload), Err(CodecError::Message { .. })));

        let unit = BodyMessage {
            n: "x".into(),
            sf: 0,
            ef: 3,
            body_id: 1,
            ls: Some(u32::MAX),
            le: None,
            offset: Vec::new(),
            state: None,
        };
        assert_eq!(unit.local_end(), None);
        let (_, task) = unit.into_parts();
        assert_eq!(task.local_end, u32::MAX);
    }

    #[test]
    fn face_requires_binary() {
        let err = parse_inbound("face", Payload::Json(json!({}))).unwrap_err();
        assert!(matches!(err, CodecError::UnexpectedPayload { expected: "binary", .. }));
    }

    #[test]
    fn json_over_binary_frames_is_accepted() {
        let payload = Payload::Binary(Bytes::from_static(br#"{"server_time": 100.0}"#));
        assert_eq!(
            parse_inbound("time_sync", payload).unwrap(),
            InboundMessage::TimeSync { server_time: 100.0 }
        );
    }

    #[test]
    fn unknown_events_are_reported() {
        let err = parse_inbound("heartbeat", Payload::Json(json!({}))).unwrap_err();
        assert_eq!(err, CodecError::UnknownEvent { event: "heartbeat".into() });
    }

    #[test]
    fn kick_detection() {
        let kicked = ServerErrorMessage { code: 4001, message: "auth".into(), kick: false };
        let flagged = ServerErrorMessage { code: 500, message: "admin".into(), kick: true };
        let plain = ServerErrorMessage { code: 500, message: "oops".into(), kick: false };
        assert!(kicked.is_kick());
        assert!(flagged.is_kick());
        assert!(!plain.is_kick());
    }

    #[test]
    fn commands_serialize_with_event_names() {
        let speak = Command::Speak { speak_id: 3, text: "hi".into(), start: true, end: false };
        assert_eq!(speak.event(), "speak");
        assert_eq!(speak.payload()["speak_id"], 3);
        assert!(speak.requires_connection());

        let ack = Command::SyncAck { server_time: 100.0, fps: 25, resume: None };
        assert!(ack.payload()["resume"].is_null());
        assert!(!ack.requires_connection());
    }

    #[test]
    fn audio_defaults_sample_rate() {
        let payload = Payload::Json(json!({ "sf": 0, "ef": 10, "pcm": [1, 2, 3] }));
        let InboundMessage::Audio(batch) = parse_inbound("audio", payload).unwrap() else {
            panic!("expected audio");
        };
        let record = batch[0].clone().into_record();
        assert_eq!(record.payload.sample_rate, 16_000);
        assert_eq!(record.payload.samples.len(), 3);
    }
}
