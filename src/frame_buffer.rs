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

//! The frame buffer facade: slot booking, segment assembly, event delivery.

use std::sync::{Mutex, PoisonError};
use web_time::Duration;

use crate::error::{FrameBufferError, Result};
use crate::events::{Event, EventKind, EventQueue};
use crate::frame::{EncodedFrame, FrameUnpacker, PackedFrameCodec};
use crate::pool::{write_slot, BookOutcome, FreeOutcome, SlotPool};
use crate::slot::{AppendOutcome, SlotHandle, SlotState};
use crate::statistics::BufferStats;

/// Frame buffer configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BufferConfig {
    /// Number of slots to allocate.
    pub buffer_size: usize,
    /// Capacity of each slot in bytes; caps segment geometry per frame.
    pub slot_size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            // Two seconds of video at 30 fps.
            buffer_size: 60,
            slot_size: 32 * 1024,
        }
    }
}

/// Result codes for buffer operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallResult {
    /// Operation applied to a mapped slot.
    Ok,
    /// Slot newly booked.
    New,
    /// Idempotent booking hit.
    Booked,
    /// No free slot available.
    Full,
    /// No slot mapped for that frame.
    NotFound,
    /// Segment accepted; assembly continues (or just finished).
    Assembling,
    /// Refused because the slot is locked.
    Locked,
    /// Bad state or bad segment geometry.
    Error,
}

struct Inner {
    pool: SlotPool,
    stats: BufferStats,
}

/// Receiver-side reassembly buffer: a fixed pool of fixed-size slots, a
/// frame-to-slot mapping, and a blocking event stream.
///
/// All operations take `&self` and are safe to call from multiple threads;
/// the network fetch layer appends segments while a consumer thread blocks
/// in [`wait_for_events`](FrameBuffer::wait_for_events) and retrieves
/// completed frames.
pub struct FrameBuffer {
    inner: Mutex<Inner>,
    events: EventQueue,
    unpacker: Box<dyn FrameUnpacker>,
    config: BufferConfig,
}

impl FrameBuffer {
    /// Create a buffer with the built-in packed-header codec.
    pub fn new(config: BufferConfig) -> Result<Self> {
        Self::with_unpacker(config, Box::new(PackedFrameCodec))
    }

    /// Create a buffer that recovers frames through `unpacker`.
    ///
    /// Allocates `config.buffer_size` slots of `config.slot_size` bytes and
    /// emits one `FREE_SLOT` event per created slot, in creation order.
    pub fn with_unpacker(config: BufferConfig, unpacker: Box<dyn FrameUnpacker>) -> Result<Self> {
        if config.buffer_size == 0 || config.slot_size == 0 {
            return Err(FrameBufferError::InvalidConfig(format!(
                "buffer_size {} and slot_size {} must both be non-zero",
                config.buffer_size, config.slot_size
            )));
        }

        let pool = SlotPool::new(config.buffer_size, config.slot_size);
        let events = EventQueue::new();
        for slot in pool.iter_free() {
            events.push(Event::new(
                EventKind::FREE_SLOT,
                0,
                0,
                SlotHandle::new(slot.clone()),
            ));
        }

        log::debug!(
            "created frame buffer: {} slots x {} bytes",
            config.buffer_size,
            config.slot_size
        );

        Ok(Self {
            inner: Mutex::new(Inner {
                pool,
                stats: BufferStats::default(),
            }),
            events,
            unpacker,
            config,
        })
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    /// Reserve a slot for `frame_no`.
    ///
    /// Returns [`CallResult::Booked`] if the frame is already mapped,
    /// [`CallResult::Full`] when no slot is free, otherwise claims a slot
    /// and returns [`CallResult::New`]. Booking emits no event.
    pub fn book_slot(&self, frame_no: u32) -> CallResult {
        let mut inner = self.lock_inner();
        match inner.pool.book(frame_no) {
            BookOutcome::AlreadyBooked => CallResult::Booked,
            BookOutcome::Exhausted => {
                log::debug!("no free slot for frame {frame_no}");
                CallResult::Full
            }
            BookOutcome::New(_) => {
                inner.stats.frames_booked += 1;
                CallResult::New
            }
        }
    }

    /// Record the frame's segment geometry once the first data packet
    /// reveals it, moving the slot from New to Assembling.
    pub fn mark_assembling(&self, frame_no: u32, segments_num: usize, segment_size: usize) -> CallResult {
        let inner = self.lock_inner();
        let Some(slot) = inner.pool.get(frame_no) else {
            log::warn!("cannot mark frame {frame_no} assembling - not booked");
            return CallResult::NotFound;
        };

        let mut guard = write_slot(slot);
        if guard.state() != SlotState::New {
            log::warn!(
                "cannot mark frame {frame_no} assembling from state {}",
                guard.state()
            );
            return CallResult::Error;
        }
        guard.mark_assembling(segments_num, segment_size);
        CallResult::Ok
    }

    /// Copy one segment into the frame's slot.
    ///
    /// Returns [`CallResult::Assembling`] whenever the segment is accepted,
    /// including the final one; completion is announced through the `READY`
    /// event. Duplicates are ignored and also report `Assembling`.
    pub fn append_segment(&self, frame_no: u32, segment_no: u32, payload: &[u8]) -> CallResult {
        let mut inner = self.lock_inner();
        let Some(slot) = inner.pool.get(frame_no) else {
            log::warn!("segment {segment_no} for unbooked frame {frame_no}");
            return CallResult::NotFound;
        };
        let slot = slot.clone();

        let outcome = write_slot(&slot).append_segment(segment_no, payload);
        match outcome {
            AppendOutcome::Stored { first, complete } => {
                inner.stats.segments_stored += 1;
                if complete {
                    inner.stats.frames_completed += 1;
                    self.events.push(Event::new(
                        EventKind::READY,
                        frame_no,
                        segment_no,
                        SlotHandle::new(slot),
                    ));
                } else if first {
                    self.events.push(Event::new(
                        EventKind::FIRST_SEGMENT,
                        frame_no,
                        segment_no,
                        SlotHandle::new(slot),
                    ));
                }
                CallResult::Assembling
            }
            AppendOutcome::Duplicate => {
                inner.stats.duplicate_segments += 1;
                CallResult::Assembling
            }
            AppendOutcome::Rejected => {
                inner.stats.rejected_segments += 1;
                CallResult::Error
            }
            AppendOutcome::NotWritable(state) => {
                log::warn!("segment {segment_no} for frame {frame_no} in state {state}");
                if state == SlotState::Locked {
                    CallResult::Locked
                } else {
                    CallResult::Error
                }
            }
        }
    }

    /// Report a segment fetch timeout. Emits a `TIMEOUT` event and leaves
    /// the slot untouched; the fetch layer decides whether to retry.
    pub fn notify_segment_timeout(&self, frame_no: u32, segment_no: u32) -> CallResult {
        let mut inner = self.lock_inner();
        let Some(slot) = inner.pool.get(frame_no) else {
            log::warn!("timeout for unbooked frame {frame_no}");
            return CallResult::NotFound;
        };
        let handle = SlotHandle::new(slot.clone());
        inner.stats.segment_timeouts += 1;
        self.events
            .push(Event::new(EventKind::TIMEOUT, frame_no, segment_no, handle));
        CallResult::Ok
    }

    /// Pin the frame's slot so it survives until [`unlock_slot`](Self::unlock_slot).
    pub fn lock_slot(&self, frame_no: u32) -> CallResult {
        let inner = self.lock_inner();
        let Some(slot) = inner.pool.get(frame_no) else {
            log::warn!("cannot lock frame {frame_no} - not booked");
            return CallResult::NotFound;
        };
        write_slot(slot).mark_locked();
        CallResult::Ok
    }

    /// Restore the state the slot held before [`lock_slot`](Self::lock_slot).
    pub fn unlock_slot(&self, frame_no: u32) -> CallResult {
        let inner = self.lock_inner();
        let Some(slot) = inner.pool.get(frame_no) else {
            log::warn!("cannot unlock frame {frame_no} - not booked");
            return CallResult::NotFound;
        };
        write_slot(slot).mark_unlocked();
        CallResult::Ok
    }

    /// Return the frame's slot to the free stack and emit `FREE_SLOT`.
    ///
    /// Ignored with a warning while the slot is locked.
    pub fn mark_slot_free(&self, frame_no: u32) -> CallResult {
        let mut inner = self.lock_inner();
        match inner.pool.release_frame(frame_no) {
            FreeOutcome::Freed(slot) => {
                self.events.push(Event::new(
                    EventKind::FREE_SLOT,
                    frame_no,
                    0,
                    SlotHandle::new(slot),
                ));
                CallResult::Ok
            }
            FreeOutcome::Locked => {
                log::warn!("cannot free frame {frame_no} - slot is locked");
                CallResult::Locked
            }
            FreeOutcome::Unknown => {
                log::warn!("cannot free frame {frame_no} - not booked");
                CallResult::NotFound
            }
        }
    }

    /// Current assembly state; `Free` for frames without a slot.
    pub fn state(&self, frame_no: u32) -> SlotState {
        let inner = self.lock_inner();
        match inner.pool.get(frame_no) {
            Some(slot) => slot
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .state(),
            None => SlotState::Free,
        }
    }

    /// Decode the assembled payload of a Ready frame.
    ///
    /// Yields `None` for unknown, incomplete, or locked frames (consumers
    /// holding a lock read through the event's [`SlotHandle`] instead) and
    /// for payloads the codec rejects.
    pub fn encoded_frame(&self, frame_no: u32) -> Option<EncodedFrame> {
        let mut inner = self.lock_inner();
        let Some(slot) = inner.pool.get(frame_no) else {
            return None;
        };
        let slot = slot.clone();

        let guard = slot.read().unwrap_or_else(PoisonError::into_inner);
        if guard.state() != SlotState::Ready {
            return None;
        }
        let frame = guard.frame(self.unpacker.as_ref());
        if frame.is_none() {
            inner.stats.decode_failures += 1;
        }
        frame
    }

    /// Block until an event matching `mask` is pending, then take it.
    ///
    /// `None` waits forever. Returns the zeroed `ERROR` sentinel on timeout
    /// or once [`release`](Self::release) has been called; see
    /// [`Event::is_sentinel`].
    pub fn wait_for_events(&self, mask: EventKind, timeout: Option<Duration>) -> Event {
        self.events.wait(mask, timeout)
    }

    /// Return every non-locked mapped slot to the free stack, emitting one
    /// `FREE_SLOT` event per slot. Bulk frees carry `frame_no` zero, unlike
    /// [`mark_slot_free`](Self::mark_slot_free). Locked slots survive.
    /// Returns the number of slots freed.
    pub fn flush(&self) -> usize {
        let mut inner = self.lock_inner();
        let freed = inner.pool.flush_unlocked();
        inner.stats.flush_count += 1;
        let count = freed.len();
        for (_, slot) in freed {
            self.events
                .push(Event::new(EventKind::FREE_SLOT, 0, 0, SlotHandle::new(slot)));
        }
        log::debug!("flushed {count} slots");
        count
    }

    /// Shutdown hook: wake every waiter with the sentinel, permanently.
    /// Construct a new buffer to start over.
    pub fn release(&self) {
        log::debug!("releasing frame buffer");
        self.events.release();
    }

    /// True once [`release`](Self::release) has been called.
    pub fn is_released(&self) -> bool {
        self.events.is_released()
    }

    /// Snapshot of lifetime counters and current occupancy.
    pub fn stats(&self) -> BufferStats {
        let inner = self.lock_inner();
        let mut stats = inner.stats.clone();
        stats.free_slots = inner.pool.free_len();
        stats.mapped_frames = inner.pool.mapped_len();
        stats
    }

    pub fn free_slot_count(&self) -> usize {
        self.lock_inner().pool.free_len()
    }

    pub fn mapped_frame_count(&self) -> usize {
        self.lock_inner().pool.mapped_len()
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameType, PackedFrameCodec};

    fn buffer(buffer_size: usize, slot_size: usize) -> FrameBuffer {
        FrameBuffer::new(BufferConfig {
            buffer_size,
            slot_size,
        })
        .unwrap()
    }

    fn drain_free_slot_events(fb: &FrameBuffer, n: usize) {
        for _ in 0..n {
            let event = fb.wait_for_events(EventKind::FREE_SLOT, Some(Duration::from_millis(10)));
            assert_eq!(event.kind, EventKind::FREE_SLOT);
        }
    }

    fn packed_key_frame(payload_len: usize) -> Vec<u8> {
        PackedFrameCodec::pack(&crate::frame::EncodedFrame {
            frame_type: FrameType::Key,
            width: 320,
            height: 240,
            timestamp_ms: 1000,
            data: vec![0x5a; payload_len],
        })
    }

    #[test]
    fn test_zero_sizes_are_rejected() {
        assert!(FrameBuffer::new(BufferConfig {
            buffer_size: 0,
            slot_size: 4096
        })
        .is_err());
        assert!(FrameBuffer::new(BufferConfig {
            buffer_size: 4,
            slot_size: 0
        })
        .is_err());
    }

    #[test]
    fn test_creation_emits_one_free_slot_event_per_slot() {
        let fb = buffer(3, 1024);
        for _ in 0..3 {
            let event = fb.wait_for_events(EventKind::FREE_SLOT, Some(Duration::from_millis(10)));
            assert_eq!(event.kind, EventKind::FREE_SLOT);
            assert_eq!(event.frame_no, 0);
            assert_eq!(event.segment_no, 0);
            assert!(event.slot.is_some());
        }
        assert!(fb
            .wait_for_events(EventKind::FREE_SLOT, Some(Duration::from_millis(10)))
            .is_sentinel());
    }

    #[test]
    fn test_booking_until_full() {
        let fb = buffer(2, 1024);
        assert_eq!(fb.book_slot(1), CallResult::New);
        assert_eq!(fb.book_slot(2), CallResult::New);
        assert_eq!(fb.book_slot(3), CallResult::Full);

        assert_eq!(fb.mark_slot_free(1), CallResult::Ok);
        assert_eq!(fb.book_slot(3), CallResult::New);
    }

    #[test]
    fn test_booking_is_idempotent() {
        let fb = buffer(2, 1024);
        assert_eq!(fb.book_slot(7), CallResult::New);
        assert_eq!(fb.book_slot(7), CallResult::Booked);
        assert_eq!(fb.free_slot_count(), 1);
    }

    #[test]
    fn test_append_before_booking() {
        let fb = buffer(1, 1024);
        assert_eq!(fb.append_segment(5, 0, &[1, 2, 3]), CallResult::NotFound);
    }

    #[test]
    fn test_append_before_geometry_is_known() {
        let fb = buffer(1, 1024);
        fb.book_slot(5);
        assert_eq!(fb.append_segment(5, 0, &[1, 2, 3]), CallResult::Error);
    }

    #[test]
    fn test_happy_path_events_and_retrieval() {
        let fb = buffer(2, 4096);
        drain_free_slot_events(&fb, 2);

        assert_eq!(fb.book_slot(42), CallResult::New);
        assert_eq!(fb.mark_assembling(42, 3, 1000), CallResult::Ok);

        let wire = packed_key_frame(2800 - crate::frame::FRAME_HEADER_LEN);
        assert_eq!(fb.append_segment(42, 0, &wire[..1000]), CallResult::Assembling);
        let event = fb.wait_for_events(EventKind::FIRST_SEGMENT, Some(Duration::from_millis(10)));
        assert_eq!(event.kind, EventKind::FIRST_SEGMENT);
        assert_eq!(event.frame_no, 42);
        assert_eq!(event.segment_no, 0);

        assert_eq!(fb.append_segment(42, 1, &wire[1000..2000]), CallResult::Assembling);
        assert_eq!(fb.append_segment(42, 2, &wire[2000..]), CallResult::Assembling);

        let event = fb.wait_for_events(EventKind::READY, Some(Duration::from_millis(10)));
        assert_eq!(event.kind, EventKind::READY);
        assert_eq!(event.frame_no, 42);
        assert_eq!(fb.state(42), SlotState::Ready);

        let frame = fb.encoded_frame(42).unwrap();
        assert_eq!(frame.width, 320);
        assert_eq!(frame.frame_type, FrameType::Key);

        assert_eq!(fb.mark_slot_free(42), CallResult::Ok);
        let event = fb.wait_for_events(EventKind::FREE_SLOT, Some(Duration::from_millis(10)));
        assert_eq!(event.frame_no, 42);
        assert_eq!(fb.state(42), SlotState::Free);
    }

    #[test]
    fn test_first_segment_event_fires_once() {
        let fb = buffer(1, 4096);
        drain_free_slot_events(&fb, 1);
        fb.book_slot(9);
        fb.mark_assembling(9, 3, 1000);

        fb.append_segment(9, 1, &[1; 1000]);
        fb.append_segment(9, 2, &[2; 1000]);

        let event = fb.wait_for_events(EventKind::FIRST_SEGMENT, Some(Duration::from_millis(10)));
        assert_eq!(event.segment_no, 1);
        assert!(fb
            .wait_for_events(EventKind::FIRST_SEGMENT, Some(Duration::from_millis(10)))
            .is_sentinel());
    }

    #[test]
    fn test_duplicate_segment_keeps_ready_single_shot() {
        let fb = buffer(1, 4096);
        drain_free_slot_events(&fb, 1);
        fb.book_slot(3);
        fb.mark_assembling(3, 2, 1000);

        assert_eq!(fb.append_segment(3, 0, &[1; 1000]), CallResult::Assembling);
        assert_eq!(fb.append_segment(3, 0, &[1; 1000]), CallResult::Assembling);
        assert_eq!(fb.state(3), SlotState::Assembling);

        assert_eq!(fb.append_segment(3, 1, &[2; 1000]), CallResult::Assembling);
        assert_eq!(fb.state(3), SlotState::Ready);

        let event = fb.wait_for_events(EventKind::READY, Some(Duration::from_millis(10)));
        assert_eq!(event.frame_no, 3);
        assert!(fb
            .wait_for_events(EventKind::READY, Some(Duration::from_millis(10)))
            .is_sentinel());

        let stats = fb.stats();
        assert_eq!(stats.duplicate_segments, 1);
        assert_eq!(stats.segments_stored, 2);
    }

    #[test]
    fn test_segment_overflow_is_an_error() {
        let fb = buffer(1, 2048);
        fb.book_slot(1);
        fb.mark_assembling(1, 3, 1000);
        assert_eq!(fb.append_segment(1, 2, &[0; 500]), CallResult::Error);
        assert_eq!(fb.stats().rejected_segments, 1);
    }

    #[test]
    fn test_append_to_locked_slot() {
        let fb = buffer(1, 4096);
        fb.book_slot(1);
        fb.mark_assembling(1, 2, 1000);
        fb.append_segment(1, 0, &[1; 1000]);
        fb.lock_slot(1);

        assert_eq!(fb.append_segment(1, 1, &[2; 1000]), CallResult::Locked);
    }

    #[test]
    fn test_lock_preserves_frame_across_free_attempt() {
        let fb = buffer(1, 4096);
        drain_free_slot_events(&fb, 1);

        let wire = packed_key_frame(500);
        fb.book_slot(8);
        fb.mark_assembling(8, 1, wire.len());
        fb.append_segment(8, 0, &wire);
        assert_eq!(fb.state(8), SlotState::Ready);

        assert_eq!(fb.lock_slot(8), CallResult::Ok);
        assert_eq!(fb.mark_slot_free(8), CallResult::Locked);
        assert_eq!(fb.state(8), SlotState::Locked);
        // No FREE_SLOT event may leak from the refused free.
        assert!(fb
            .wait_for_events(EventKind::FREE_SLOT, Some(Duration::from_millis(10)))
            .is_sentinel());

        // The consumer still reads the payload through the event handle
        // while the slot is locked.
        let ready = fb.wait_for_events(EventKind::READY, Some(Duration::from_millis(10)));
        let handle = ready.slot.unwrap();
        assert!(handle.frame(&PackedFrameCodec).is_some());

        assert_eq!(fb.unlock_slot(8), CallResult::Ok);
        assert_eq!(fb.state(8), SlotState::Ready);
        assert_eq!(fb.mark_slot_free(8), CallResult::Ok);
        let event = fb.wait_for_events(EventKind::FREE_SLOT, Some(Duration::from_millis(10)));
        assert_eq!(event.frame_no, 8);
    }

    #[test]
    fn test_flush_spares_locked_slots() {
        let fb = buffer(3, 1024);
        drain_free_slot_events(&fb, 3);
        fb.book_slot(1);
        fb.book_slot(2);
        fb.book_slot(3);
        fb.lock_slot(2);

        assert_eq!(fb.flush(), 2);
        assert_eq!(fb.state(2), SlotState::Locked);
        assert_eq!(fb.free_slot_count(), 2);
        assert_eq!(fb.mapped_frame_count(), 1);

        // Bulk frees are anonymous: flush events carry frame_no zero.
        for _ in 0..2 {
            let event = fb.wait_for_events(EventKind::FREE_SLOT, Some(Duration::from_millis(10)));
            assert_eq!(event.kind, EventKind::FREE_SLOT);
            assert_eq!(event.frame_no, 0);
        }
        assert!(fb
            .wait_for_events(EventKind::FREE_SLOT, Some(Duration::from_millis(10)))
            .is_sentinel());
    }

    #[test]
    fn test_timeout_emits_event_without_state_change() {
        let fb = buffer(1, 1024);
        fb.book_slot(4);
        fb.mark_assembling(4, 2, 500);
        assert_eq!(fb.notify_segment_timeout(4, 1), CallResult::Ok);

        let event = fb.wait_for_events(EventKind::TIMEOUT, Some(Duration::from_millis(10)));
        assert_eq!(event.frame_no, 4);
        assert_eq!(event.segment_no, 1);
        assert_eq!(fb.state(4), SlotState::Assembling);

        assert_eq!(fb.notify_segment_timeout(99, 0), CallResult::NotFound);
    }

    #[test]
    fn test_encoded_frame_refused_while_locked() {
        let fb = buffer(1, 4096);
        let wire = packed_key_frame(100);
        fb.book_slot(6);
        fb.mark_assembling(6, 1, wire.len());
        fb.append_segment(6, 0, &wire);

        fb.lock_slot(6);
        assert!(fb.encoded_frame(6).is_none());
        fb.unlock_slot(6);
        assert!(fb.encoded_frame(6).is_some());
    }

    #[test]
    fn test_decode_failure_is_counted_and_empty() {
        let fb = buffer(1, 4096);
        fb.book_slot(2);
        fb.mark_assembling(2, 1, 64);
        fb.append_segment(2, 0, &[0xff; 64]);
        assert_eq!(fb.state(2), SlotState::Ready);

        assert!(fb.encoded_frame(2).is_none());
        assert_eq!(fb.stats().decode_failures, 1);
    }

    #[test]
    fn test_unknown_frame_queries() {
        let fb = buffer(1, 1024);
        assert_eq!(fb.state(77), SlotState::Free);
        assert!(fb.encoded_frame(77).is_none());
        assert_eq!(fb.lock_slot(77), CallResult::NotFound);
        assert_eq!(fb.unlock_slot(77), CallResult::NotFound);
        assert_eq!(fb.mark_slot_free(77), CallResult::NotFound);
        assert_eq!(fb.mark_assembling(77, 1, 100), CallResult::NotFound);
    }

    #[test]
    fn test_stats_gauges_track_occupancy() {
        let fb = buffer(3, 1024);
        fb.book_slot(1);
        fb.book_slot(2);

        let stats = fb.stats();
        assert_eq!(stats.frames_booked, 2);
        assert_eq!(stats.free_slots, 1);
        assert_eq!(stats.mapped_frames, 2);
    }
}
