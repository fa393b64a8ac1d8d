//! Frame layer and method catalog.
//!
//! The generic [`Frame`] envelope is the canonical in-memory form held in
//! queues; [`FrameBuffer`] reassembles frames from partial socket reads; the
//! typed frames and [`Method`] payloads convert to and from the envelope,
//! driven by the static [`catalog`].

pub mod catalog;

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::{
    BasicProperties, BodyFrame, CloseReason, ContentHeaderFrame, HeartbeatFrame, Method,
    MethodFrame,
};
pub use frame_buffer::{FrameBuffer, FrameLimit, INITIAL_FRAME_LIMIT};
pub use wire_format::{Frame, FrameType, FRAME_END, FRAME_HEADER_SIZE, PROTOCOL_HEADER};
