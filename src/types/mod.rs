//! Core types for avatar stream representation.
//!
//! ## Architecture
//!
//! - [`FrameRecord`] binds a payload to a `[start_frame, end_frame)` interval on the
//!   render-frame clock
//! - [`BodyFrame`], [`FaceFrame`], [`AudioChunk`], [`EventFrame`] and [`VisualFrame`]
//!   are the per-stream payloads
//! - [`DecodedImage`] is an RAII handle to decoded pixels
//! - [`Session`], [`SessionStatus`] and the start/stop structs model the session
//!   service contract

mod frame;
mod image;
mod session;

pub use frame::{
    AnimationFrame, AudioChunk, BodyFrame, EventFrame, FaceFrame, FramePayload, FrameRecord,
    VisualFrame,
};
pub use image::DecodedImage;
pub use session::{
    ResumeParams, Session, SessionStatus, StartRequest, StartResponse, StopReason, StopRequest,
};
