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

//! A slot: one fixed-size byte region plus the assembly state machine for
//! the frame currently occupying it.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use crate::frame::{EncodedFrame, FrameUnpacker};

/// Assembly state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Not mapped to any frame.
    Free,
    /// Booked for a frame, geometry not yet known.
    New,
    /// Geometry known, collecting segments.
    Assembling,
    /// All expected segments stored; payload is decodable.
    Ready,
    /// Pinned by a consumer; protected from recycling.
    Locked,
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SlotState::Free => "Free",
            SlotState::New => "New",
            SlotState::Assembling => "Assembling",
            SlotState::Ready => "Ready",
            SlotState::Locked => "Locked",
        };
        f.write_str(name)
    }
}

/// Outcome of writing one segment into a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AppendOutcome {
    /// Bytes copied and counted.
    Stored {
        /// This was the first segment stored for the frame.
        first: bool,
        /// The frame is now fully assembled.
        complete: bool,
    },
    /// Segment already present; nothing changed.
    Duplicate,
    /// Segment index or byte range violates the slot geometry; nothing changed.
    Rejected,
    /// The slot is not collecting segments.
    NotWritable(SlotState),
}

/// One fixed-capacity reassembly buffer, recycled across frames.
pub struct Slot {
    state: SlotState,
    /// State held immediately before the transition to `Locked`.
    stashed_state: SlotState,
    frame_number: Option<u32>,
    segment_size: usize,
    segments_num: usize,
    stored_segments: usize,
    assembled_data_size: usize,
    /// One bit per expected segment; repeats are detected here and ignored.
    received: Vec<u64>,
    data: Vec<u8>,
}

impl Slot {
    pub(crate) fn new(slot_size: usize) -> Self {
        Self {
            state: SlotState::Free,
            stashed_state: SlotState::Free,
            frame_number: None,
            segment_size: 0,
            segments_num: 0,
            stored_segments: 0,
            assembled_data_size: 0,
            received: Vec::new(),
            data: vec![0; slot_size],
        }
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn frame_number(&self) -> Option<u32> {
        self.frame_number
    }

    pub fn stored_segments(&self) -> usize {
        self.stored_segments
    }

    pub fn segments_num(&self) -> usize {
        self.segments_num
    }

    pub fn assembled_data_size(&self) -> usize {
        self.assembled_data_size
    }

    pub(crate) fn stashed_state(&self) -> SlotState {
        self.stashed_state
    }

    /// Take ownership of the slot for a newly booked frame.
    pub(crate) fn mark_new(&mut self, frame_number: u32) {
        self.state = SlotState::New;
        self.stashed_state = SlotState::New;
        self.frame_number = Some(frame_number);
        self.segment_size = 0;
        self.segments_num = 0;
        self.stored_segments = 0;
        self.assembled_data_size = 0;
        self.received.clear();
    }

    /// Record the frame geometry once the first segment reveals it.
    pub(crate) fn mark_assembling(&mut self, segments_num: usize, segment_size: usize) {
        self.state = SlotState::Assembling;
        self.segments_num = segments_num;
        self.segment_size = segment_size;
        self.received = vec![0; segments_num.div_ceil(64)];
    }

    /// Copy one segment into its byte range and advance the assembly state.
    pub(crate) fn append_segment(&mut self, segment_no: u32, payload: &[u8]) -> AppendOutcome {
        if self.state != SlotState::Assembling {
            return AppendOutcome::NotWritable(self.state);
        }

        let index = segment_no as usize;
        if index >= self.segments_num {
            log::warn!(
                "segment {segment_no} outside expected count {} for frame {:?}",
                self.segments_num,
                self.frame_number
            );
            return AppendOutcome::Rejected;
        }

        let offset = index * self.segment_size;
        if offset + payload.len() > self.data.len() {
            log::warn!(
                "segment {segment_no} ({} bytes at offset {offset}) overflows slot of {} bytes",
                payload.len(),
                self.data.len()
            );
            return AppendOutcome::Rejected;
        }

        let (word, bit) = (index / 64, 1u64 << (index % 64));
        if self.received[word] & bit != 0 {
            log::debug!(
                "duplicate segment {segment_no} for frame {:?}",
                self.frame_number
            );
            return AppendOutcome::Duplicate;
        }

        self.data[offset..offset + payload.len()].copy_from_slice(payload);
        self.received[word] |= bit;
        self.stored_segments += 1;
        self.assembled_data_size += payload.len();

        let complete = self.stored_segments == self.segments_num;
        if complete {
            self.state = SlotState::Ready;
        }
        AppendOutcome::Stored {
            first: self.stored_segments == 1,
            complete,
        }
    }

    /// Pin the slot so its payload survives until `mark_unlocked`.
    pub(crate) fn mark_locked(&mut self) {
        if self.state == SlotState::Locked {
            log::warn!("slot for frame {:?} is already locked", self.frame_number);
            return;
        }
        self.stashed_state = self.state;
        self.state = SlotState::Locked;
    }

    /// Restore the state held before the lock.
    pub(crate) fn mark_unlocked(&mut self) {
        if self.state != SlotState::Locked {
            log::warn!(
                "unlock on slot in state {} (frame {:?})",
                self.state,
                self.frame_number
            );
            return;
        }
        self.state = self.stashed_state;
    }

    /// Return the slot to the free state. Refused while locked.
    pub(crate) fn mark_free(&mut self) -> bool {
        if self.state == SlotState::Locked {
            log::warn!(
                "refusing to free locked slot (frame {:?})",
                self.frame_number
            );
            return false;
        }
        self.state = SlotState::Free;
        self.stashed_state = SlotState::Free;
        self.frame_number = None;
        self.segment_size = 0;
        self.segments_num = 0;
        self.stored_segments = 0;
        self.assembled_data_size = 0;
        self.received.clear();
        true
    }

    /// Recover the encoded frame from the assembled bytes.
    ///
    /// Only meaningful once every segment is stored: the slot must be Ready,
    /// or Locked with Ready stashed. Anything else yields `None`, as does a
    /// codec failure.
    pub fn frame(&self, unpacker: &dyn FrameUnpacker) -> Option<EncodedFrame> {
        let readable = self.state == SlotState::Ready
            || (self.state == SlotState::Locked && self.stashed_state == SlotState::Ready);
        if !readable {
            return None;
        }

        match unpacker.unpack(&self.data[..self.assembled_data_size]) {
            Ok(frame) => Some(frame),
            Err(e) => {
                log::error!(
                    "failed to unpack frame {:?}: {e}",
                    self.frame_number
                );
                None
            }
        }
    }
}

/// Shared slot storage. Transitions happen under the pool mutex with the
/// write side; handle reads take only the read side.
pub(crate) type SharedSlot = Arc<RwLock<Slot>>;

/// Read-only capability on a slot, carried by events.
///
/// The handle shares ownership of the slot's storage, so dereferencing it
/// is always memory-safe. It does not pin the slot's contents: once the
/// frame the event was emitted for is freed, the slot can be recycled for a
/// later frame, and the handle then observes that frame's state and bytes.
/// To attribute [`SlotHandle::frame`] to the event's `frame_no`, lock that
/// frame ([`FrameBuffer::lock_slot`](crate::FrameBuffer::lock_slot)) before
/// reading and keep it locked until done; a locked slot cannot be recycled.
#[derive(Clone)]
pub struct SlotHandle {
    slot: SharedSlot,
}

impl SlotHandle {
    pub(crate) fn new(slot: SharedSlot) -> Self {
        Self { slot }
    }

    pub fn state(&self) -> SlotState {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state()
    }

    pub fn frame_number(&self) -> Option<u32> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .frame_number()
    }

    /// Recover the assembled frame, if the slot currently holds one.
    ///
    /// The result belongs to the event's `frame_no` only while the caller
    /// holds that frame locked; an unlocked slot may have been recycled and
    /// reassembled for a different frame since the event fired. Check
    /// [`frame_number`](Self::frame_number) or lock first.
    pub fn frame(&self, unpacker: &dyn FrameUnpacker) -> Option<EncodedFrame> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .frame(unpacker)
    }
}

// Hand-written so formatting never takes the slot lock.
impl fmt::Debug for SlotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SlotHandle")
    }
}
