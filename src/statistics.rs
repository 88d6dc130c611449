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

//! Buffer counters, exposed as a serializable snapshot.

use serde::{Deserialize, Serialize};

/// Counters accumulated over the buffer's lifetime plus live occupancy
/// gauges, as returned by [`FrameBuffer::stats`](crate::FrameBuffer::stats).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferStats {
    /// Frames that claimed a slot.
    pub frames_booked: u64,
    /// Frames that reached full assembly.
    pub frames_completed: u64,
    /// Segments copied into slots.
    pub segments_stored: u64,
    /// Repeated segment arrivals, detected and ignored.
    pub duplicate_segments: u64,
    /// Segments refused for violating slot geometry.
    pub rejected_segments: u64,
    /// Timeouts reported by the fetch layer.
    pub segment_timeouts: u64,
    /// Assembled payloads the codec could not unpack.
    pub decode_failures: u64,
    /// Whole-buffer flushes.
    pub flush_count: u64,
    /// Slots currently on the free stack.
    pub free_slots: usize,
    /// Frames currently mapped to slots.
    pub mapped_frames: usize,
}
