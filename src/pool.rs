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

//! The slot pool: a free stack plus the frame-to-slot mapping.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};

use crate::slot::{SharedSlot, Slot, SlotState};

/// Outcome of reserving a slot for a frame.
pub(crate) enum BookOutcome {
    /// A free slot was claimed and mapped.
    New(SharedSlot),
    /// The frame already owns a slot.
    AlreadyBooked,
    /// No free slot is available.
    Exhausted,
}

/// Outcome of returning a frame's slot to the free stack.
pub(crate) enum FreeOutcome {
    Freed(SharedSlot),
    Locked,
    Unknown,
}

/// Owns every slot for the buffer's lifetime.
///
/// Each slot is in exactly one of `free_slots` or `frame_slot_mapping`; the
/// two sizes always sum to the slot count fixed at construction.
pub(crate) struct SlotPool {
    /// Stack discipline: the most recently freed slot is handed out first.
    free_slots: Vec<SharedSlot>,
    frame_slot_mapping: HashMap<u32, SharedSlot>,
    buffer_size: usize,
}

pub(crate) fn write_slot(slot: &SharedSlot) -> RwLockWriteGuard<'_, Slot> {
    slot.write().unwrap_or_else(PoisonError::into_inner)
}

impl SlotPool {
    pub(crate) fn new(buffer_size: usize, slot_size: usize) -> Self {
        let free_slots = (0..buffer_size)
            .map(|_| Arc::new(RwLock::new(Slot::new(slot_size))))
            .collect();
        Self {
            free_slots,
            frame_slot_mapping: HashMap::new(),
            buffer_size,
        }
    }

    /// Slots currently on the free stack, in stack order.
    pub(crate) fn iter_free(&self) -> impl Iterator<Item = &SharedSlot> {
        self.free_slots.iter()
    }

    pub(crate) fn free_len(&self) -> usize {
        self.free_slots.len()
    }

    pub(crate) fn mapped_len(&self) -> usize {
        self.frame_slot_mapping.len()
    }

    pub(crate) fn get(&self, frame_number: u32) -> Option<&SharedSlot> {
        self.frame_slot_mapping.get(&frame_number)
    }

    /// Reserve a slot for `frame_number`. Idempotent for frames already
    /// mapped.
    pub(crate) fn book(&mut self, frame_number: u32) -> BookOutcome {
        if self.frame_slot_mapping.contains_key(&frame_number) {
            return BookOutcome::AlreadyBooked;
        }
        let Some(slot) = self.free_slots.pop() else {
            return BookOutcome::Exhausted;
        };
        write_slot(&slot).mark_new(frame_number);
        self.frame_slot_mapping.insert(frame_number, slot.clone());
        self.check_conservation();
        BookOutcome::New(slot)
    }

    /// Unmap a frame and return its slot to the free stack. Locked slots are
    /// left untouched.
    pub(crate) fn release_frame(&mut self, frame_number: u32) -> FreeOutcome {
        let Some(slot) = self.frame_slot_mapping.get(&frame_number) else {
            return FreeOutcome::Unknown;
        };
        let slot = slot.clone();
        if !write_slot(&slot).mark_free() {
            return FreeOutcome::Locked;
        }
        self.frame_slot_mapping.remove(&frame_number);
        self.free_slots.push(slot.clone());
        self.check_conservation();
        FreeOutcome::Freed(slot)
    }

    /// Return every non-locked mapped slot to the free stack.
    ///
    /// Victims are collected before any mapping entry is erased, so the
    /// sweep sees every frame exactly once.
    pub(crate) fn flush_unlocked(&mut self) -> Vec<(u32, SharedSlot)> {
        let victims: Vec<u32> = self
            .frame_slot_mapping
            .iter()
            .filter(|(_, slot)| {
                slot.read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .state()
                    != SlotState::Locked
            })
            .map(|(&frame_number, _)| frame_number)
            .collect();

        let mut freed = Vec::with_capacity(victims.len());
        for frame_number in victims {
            if let FreeOutcome::Freed(slot) = self.release_frame(frame_number) {
                freed.push((frame_number, slot));
            }
        }
        freed
    }

    fn check_conservation(&self) {
        debug_assert_eq!(
            self.free_slots.len() + self.frame_slot_mapping.len(),
            self.buffer_size
        );
    }
}
