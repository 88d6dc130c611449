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

//! Receiver-side frame reassembly buffer for segmented real-time video
//! over Named-Data Networking.
//!
//! Video frames arrive as independently fetched segments, possibly out of
//! order, late, or lost. [`FrameBuffer`] is the rendezvous between the
//! network fetch layer, which books slots and appends segments as they
//! arrive, and the decode/playout layer, which blocks on
//! [`FrameBuffer::wait_for_events`] and retrieves fully assembled frames.
//!
//! ```
//! use ndn_frame_buffer::{
//!     BufferConfig, CallResult, EncodedFrame, EventKind, FrameBuffer, FrameType,
//!     PackedFrameCodec,
//! };
//!
//! let fb = FrameBuffer::new(BufferConfig {
//!     buffer_size: 4,
//!     slot_size: 8 * 1024,
//! })
//! .unwrap();
//!
//! let wire = PackedFrameCodec::pack(&EncodedFrame {
//!     frame_type: FrameType::Key,
//!     width: 640,
//!     height: 480,
//!     timestamp_ms: 0,
//!     data: vec![0; 1500],
//! });
//!
//! // The fetch layer reserves storage, reveals the geometry, then appends.
//! assert_eq!(fb.book_slot(1), CallResult::New);
//! fb.mark_assembling(1, 2, 1000);
//! fb.append_segment(1, 0, &wire[..1000]);
//! fb.append_segment(1, 1, &wire[1000..]);
//!
//! // The consumer learns of completion through the event stream.
//! let event = fb.wait_for_events(EventKind::READY, None);
//! assert_eq!(event.frame_no, 1);
//! let frame = fb.encoded_frame(1).unwrap();
//! assert_eq!(frame.data.len(), 1500);
//! ```

pub mod error;
pub mod events;
pub mod frame;
pub mod frame_buffer;
mod pool;
pub mod slot;
pub mod statistics;

pub use error::{FrameBufferError, Result};
pub use events::{Event, EventKind};
pub use frame::{EncodedFrame, FrameType, FrameUnpacker, PackedFrameCodec, FRAME_HEADER_LEN};
pub use frame_buffer::{BufferConfig, CallResult, FrameBuffer};
pub use slot::{SlotHandle, SlotState};
pub use statistics::BufferStats;
