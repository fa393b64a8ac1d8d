//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management and a small state
//! machine for fragmented frames:
//! - `WaitingForHeader`: need the 7 header bytes
//! - `WaitingForPayload`: header parsed, need payload + frame-end byte
//!
//! The maximum accepted frame size is shared through an `Arc<AtomicU32>` so
//! the connection can raise it once frame-max has been negotiated while the
//! receiver loop owns the buffer.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use super::wire_format::{Frame, FrameType, FRAME_END, FRAME_HEADER_SIZE};
use crate::error::{AmqwireError, Result};

/// Frame size accepted before Tune has negotiated a limit. Large enough for
/// any handshake method frame.
pub const INITIAL_FRAME_LIMIT: u32 = 128 * 1024;

/// Shared, adjustable frame-size limit. A value of zero means unlimited.
#[derive(Debug, Clone)]
pub struct FrameLimit(Arc<AtomicU32>);

impl FrameLimit {
    /// Create a limit starting at [`INITIAL_FRAME_LIMIT`].
    pub fn new() -> Self {
        Self(Arc::new(AtomicU32::new(INITIAL_FRAME_LIMIT)))
    }

    /// Replace the limit (0 = unlimited).
    pub fn set(&self, max: u32) {
        self.0.store(max, Ordering::Relaxed);
    }

    fn get(&self) -> u32 {
        let v = self.0.load(Ordering::Relaxed);
        if v == 0 {
            u32::MAX
        } else {
            v
        }
    }
}

impl Default for FrameLimit {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
enum State {
    WaitingForHeader,
    WaitingForPayload {
        frame_type: FrameType,
        channel: u16,
        payload_len: usize,
    },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
    limit: FrameLimit,
}

impl FrameBuffer {
    /// Create a buffer with its own frame-size limit.
    pub fn new() -> Self {
        Self::with_limit(FrameLimit::new())
    }

    /// Create a buffer observing a shared frame-size limit.
    pub fn with_limit(limit: FrameLimit) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForHeader,
            limit,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Partial data is retained for the next push. Errors on an unknown
    /// frame type, an oversized frame, or a bad frame-end sentinel; all of
    /// these are fatal to the connection.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        match self.state {
            State::WaitingForHeader => {
                if self.buffer.len() < FRAME_HEADER_SIZE {
                    return Ok(None);
                }

                let frame_type = FrameType::from_wire(self.buffer[0])?;
                let channel = u16::from_be_bytes([self.buffer[1], self.buffer[2]]);
                let size = u32::from_be_bytes([
                    self.buffer[3],
                    self.buffer[4],
                    self.buffer[5],
                    self.buffer[6],
                ]);

                if size > self.limit.get() {
                    return Err(AmqwireError::Protocol(format!(
                        "frame size {} exceeds maximum {}",
                        size,
                        self.limit.get()
                    )));
                }

                let _ = self.buffer.split_to(FRAME_HEADER_SIZE);
                self.state = State::WaitingForPayload {
                    frame_type,
                    channel,
                    payload_len: size as usize,
                };
                self.try_extract_one()
            }

            State::WaitingForPayload {
                frame_type,
                channel,
                payload_len,
            } => {
                // Payload plus the trailing frame-end byte.
                if self.buffer.len() < payload_len + 1 {
                    return Ok(None);
                }

                let payload: Bytes = self.buffer.split_to(payload_len).freeze();
                let end = self.buffer.split_to(1)[0];
                if end != FRAME_END {
                    return Err(AmqwireError::Protocol(format!(
                        "bad frame end: expected 0x{FRAME_END:02x}, got 0x{end:02x}"
                    )));
                }

                self.state = State::WaitingForHeader;
                Ok(Some(Frame::new(frame_type, channel, payload)))
            }
        }
    }

    /// Buffered byte count.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the buffer holds no pending bytes.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
