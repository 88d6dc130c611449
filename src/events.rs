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

//! Assembly milestone events and the blocking, mask-filtered event queue.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, PoisonError};
use web_time::{Duration, Instant};

use crate::slot::SlotHandle;

bitflags::bitflags! {
    /// Bit set of event types a consumer wants to receive.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventKind: u32 {
        /// A frame finished assembling.
        const READY = 1 << 0;
        /// The first segment of a frame arrived.
        const FIRST_SEGMENT = 1 << 1;
        /// A slot returned to the free stack.
        const FREE_SLOT = 1 << 2;
        /// The fetch layer reported a segment timeout.
        const TIMEOUT = 1 << 3;
        /// Shutdown sentinel or wait timeout.
        const ERROR = 1 << 4;
    }
}

/// An assembly milestone, observable through
/// [`FrameBuffer::wait_for_events`](crate::FrameBuffer::wait_for_events).
#[derive(Debug, Clone)]
pub struct Event {
    /// Exactly one bit of [`EventKind`].
    pub kind: EventKind,
    pub frame_no: u32,
    pub segment_no: u32,
    /// Read-only capability on the slot the event refers to. Absent on the
    /// sentinel. Lock `frame_no` before reading a payload through it; see
    /// [`SlotHandle`] for the recycling caveat.
    pub slot: Option<SlotHandle>,
}

impl Event {
    pub(crate) fn new(kind: EventKind, frame_no: u32, segment_no: u32, slot: SlotHandle) -> Self {
        Self {
            kind,
            frame_no,
            segment_no,
            slot: Some(slot),
        }
    }

    /// The event returned when a wait times out or the buffer is released.
    pub(crate) fn sentinel() -> Self {
        Self {
            kind: EventKind::ERROR,
            frame_no: 0,
            segment_no: 0,
            slot: None,
        }
    }

    /// True for the zeroed Error event produced by timeout or release.
    pub fn is_sentinel(&self) -> bool {
        self.kind == EventKind::ERROR
            && self.frame_no == 0
            && self.segment_no == 0
            && self.slot.is_none()
    }
}

struct QueueInner {
    pending: VecDeque<Event>,
    released: bool,
}

/// FIFO of pending events with a blocking, mask-filtered take.
///
/// A single mutex plus condvar broadcast: every emission wakes all parked
/// consumers, each rescans under the lock, and removal happens under the
/// same lock, so each event is delivered exactly once.
pub(crate) struct EventQueue {
    inner: Mutex<QueueInner>,
    readable: Condvar,
}

impl EventQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                pending: VecDeque::new(),
                released: false,
            }),
            readable: Condvar::new(),
        }
    }

    pub(crate) fn push(&self, event: Event) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.pending.push_back(event);
        self.readable.notify_all();
    }

    /// Remove and return the first pending event matching `mask`, blocking
    /// up to `timeout` (`None` = forever). Returns the sentinel on timeout
    /// or release.
    pub(crate) fn wait(&self, mask: EventKind, timeout: Option<Duration>) -> Event {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        loop {
            if inner.released {
                return Event::sentinel();
            }

            if let Some(pos) = inner.pending.iter().position(|e| e.kind.intersects(mask)) {
                if let Some(event) = inner.pending.remove(pos) {
                    return event;
                }
            }

            inner = match deadline {
                None => self
                    .readable
                    .wait(inner)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Event::sentinel();
                    }
                    self.readable
                        .wait_timeout(inner, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Wake every waiter with the sentinel, permanently.
    pub(crate) fn release(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.released = true;
        self.readable.notify_all();
    }

    pub(crate) fn is_released(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .released
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }
}
