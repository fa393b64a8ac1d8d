//! Frame envelope encoding.
//!
//! Every unit of transmission is a frame:
//!
//! ```text
//! ┌─────────┬───────────┬─────────┬──────────────┬───────────┐
//! │ type    │ channel   │ size    │ payload      │ frame-end │
//! │ 1 byte  │ 2 bytes   │ 4 bytes │ size bytes   │ 1 byte    │
//! │         │ uint16 BE │ u32 BE  │              │ 0xCE      │
//! └─────────┴───────────┴─────────┴──────────────┴───────────┘
//! ```
//!
//! All multi-byte integers are Big Endian.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{AmqwireError, Result};

/// Frame header size in bytes (type + channel + size).
pub const FRAME_HEADER_SIZE: usize = 7;

/// Frame end sentinel, required after every payload.
pub const FRAME_END: u8 = 0xCE;

/// Protocol header written by the client immediately after connect:
/// `"AMQP" 0x00 0x00 0x09 0x01`.
pub const PROTOCOL_HEADER: [u8; 8] = [0x41, 0x4D, 0x51, 0x50, 0x00, 0x00, 0x09, 0x01];

/// Wire frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// A method call or reply.
    Method = 1,
    /// A content header preceding body frames.
    Header = 2,
    /// A chunk of content body.
    Body = 3,
    /// A payloadless liveness probe, always on channel 0.
    Heartbeat = 8,
}

impl FrameType {
    /// Decode a frame type byte. An unknown byte is a protocol error.
    pub fn from_wire(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(FrameType::Method),
            2 => Ok(FrameType::Header),
            3 => Ok(FrameType::Body),
            8 => Ok(FrameType::Heartbeat),
            other => Err(AmqwireError::Protocol(format!(
                "unknown frame type 0x{other:02x}"
            ))),
        }
    }
}

/// A generic frame - the canonical in-memory form held in queues.
///
/// Payload bytes are shared zero-copy via `bytes::Bytes`.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Frame type byte.
    pub frame_type: FrameType,
    /// Channel the frame belongs to (0 = connection control).
    pub channel: u16,
    /// Raw payload, excluding the frame-end sentinel.
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame from parts.
    pub fn new(frame_type: FrameType, channel: u16, payload: Bytes) -> Self {
        Self {
            frame_type,
            channel,
            payload,
        }
    }

    /// A heartbeat frame: empty payload, pinned to channel 0.
    pub fn heartbeat() -> Self {
        Self::new(FrameType::Heartbeat, 0, Bytes::new())
    }

    /// Payload length in bytes.
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Total encoded size of this frame.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len() + 1
    }

    /// Encode the full frame: header, payload, frame-end sentinel. The size
    /// field is always recomputed from the payload.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(self.frame_type as u8);
        buf.put_u16(self.channel);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.put_u8(FRAME_END);
        buf.freeze()
    }
}
