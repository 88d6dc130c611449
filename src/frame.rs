/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! Encoded-frame model and the packed wire format carried inside slots.

use serde::{Deserialize, Serialize};

use crate::error::{FrameBufferError, Result};

/// Marker identifying a packed frame header.
const FRAME_MAGIC: u16 = 0x4e46;

/// Size of the packed header preceding the encoded payload.
pub const FRAME_HEADER_LEN: usize = 20;

/// The type of a video frame, indicating its dependency on other frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameType {
    /// A keyframe (or I-frame) can be decoded independently of any other frame.
    Key,
    /// A delta frame (or P-frame) depends on the preceding frame.
    Delta,
}

impl FrameType {
    fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(FrameType::Key),
            1 => Some(FrameType::Delta),
            _ => None,
        }
    }

    fn to_wire(self) -> u8 {
        match self {
            FrameType::Key => 0,
            FrameType::Delta => 1,
        }
    }
}

/// A coded video picture recovered from an assembled slot, ready for the
/// decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedFrame {
    /// The type of the frame (key or delta).
    pub frame_type: FrameType,
    /// Encoded picture width in pixels.
    pub width: u16,
    /// Encoded picture height in pixels.
    pub height: u16,
    /// Capture timestamp in milliseconds.
    pub timestamp_ms: u64,
    /// The encoded bitstream.
    pub data: Vec<u8>,
}

/// The codec seam between the buffer and the decode layer.
///
/// Implementations must be stateless with respect to calls: `unpack` may be
/// invoked concurrently from multiple threads.
pub trait FrameUnpacker: Send + Sync {
    /// Recover an encoded frame from assembled slot bytes.
    fn unpack(&self, data: &[u8]) -> Result<EncodedFrame>;
}

/// The little-endian packed header format used on the wire:
///
/// ```text
/// magic u16 | frame_type u8 | flags u8 | width u16 | height u16 |
/// timestamp_ms u64 | payload_len u32 | payload...
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct PackedFrameCodec;

impl PackedFrameCodec {
    /// Pack a frame into the wire format. The producer-side counterpart of
    /// [`FrameUnpacker::unpack`], also used by tests and demos.
    pub fn pack(frame: &EncodedFrame) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + frame.data.len());
        out.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
        out.push(frame.frame_type.to_wire());
        out.push(0); // flags
        out.extend_from_slice(&frame.width.to_le_bytes());
        out.extend_from_slice(&frame.height.to_le_bytes());
        out.extend_from_slice(&frame.timestamp_ms.to_le_bytes());
        out.extend_from_slice(&(frame.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&frame.data);
        out
    }
}

impl FrameUnpacker for PackedFrameCodec {
    fn unpack(&self, data: &[u8]) -> Result<EncodedFrame> {
        if data.len() < FRAME_HEADER_LEN {
            return Err(FrameBufferError::MalformedFrame(format!(
                "{} bytes is too short for a frame header",
                data.len()
            )));
        }

        let magic = u16::from_le_bytes([data[0], data[1]]);
        if magic != FRAME_MAGIC {
            return Err(FrameBufferError::MalformedFrame(format!(
                "bad header marker {magic:#06x}"
            )));
        }

        let frame_type = FrameType::from_wire(data[2]).ok_or_else(|| {
            FrameBufferError::MalformedFrame(format!("unknown frame type {}", data[2]))
        })?;
        let width = u16::from_le_bytes([data[4], data[5]]);
        let height = u16::from_le_bytes([data[6], data[7]]);
        let timestamp_ms = u64::from_le_bytes([
            data[8], data[9], data[10], data[11], data[12], data[13], data[14], data[15],
        ]);
        let payload_len = u32::from_le_bytes([data[16], data[17], data[18], data[19]]) as usize;

        let available = data.len() - FRAME_HEADER_LEN;
        if payload_len > available {
            return Err(FrameBufferError::MalformedFrame(format!(
                "payload length {payload_len} exceeds {available} assembled bytes"
            )));
        }

        log::trace!(
            "unpacked {frame_type:?} frame {width}x{height} ts={timestamp_ms} ({payload_len} bytes)"
        );

        Ok(EncodedFrame {
            frame_type,
            width,
            height,
            timestamp_ms,
            data: data[FRAME_HEADER_LEN..FRAME_HEADER_LEN + payload_len].to_vec(),
        })
    }
}
