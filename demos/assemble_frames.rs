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

use std::sync::Arc;
use std::thread;
use web_time::Duration;

use ndn_frame_buffer::{
    BufferConfig, CallResult, EncodedFrame, EventKind, FrameBuffer, FrameType, PackedFrameCodec,
};

const FRAME_COUNT: u32 = 10;
const SEGMENT_SIZE: usize = 1200;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("NDN Frame Reassembly Buffer Example");
    println!("===================================");

    let fb = Arc::new(FrameBuffer::new(BufferConfig {
        buffer_size: 4,
        slot_size: 32 * 1024,
    })?);

    // The network fetch layer: books slots and appends segments as
    // "interests" are satisfied, shuffled to mimic out-of-order arrival.
    let producer = {
        let fb = fb.clone();
        thread::spawn(move || {
            for frame_no in 0..FRAME_COUNT {
                let wire = PackedFrameCodec::pack(&EncodedFrame {
                    frame_type: if frame_no % 5 == 0 {
                        FrameType::Key
                    } else {
                        FrameType::Delta
                    },
                    width: 1280,
                    height: 720,
                    timestamp_ms: frame_no as u64 * 33,
                    data: vec![frame_no as u8; 3000 + (frame_no as usize * 211) % 2000],
                });

                while fb.book_slot(frame_no) == CallResult::Full {
                    thread::sleep(Duration::from_millis(2));
                }

                let segments: Vec<&[u8]> = wire.chunks(SEGMENT_SIZE).collect();
                fb.mark_assembling(frame_no, segments.len(), SEGMENT_SIZE);

                // Deliver odd segments first, then even ones.
                let order: Vec<usize> = (1..segments.len())
                    .step_by(2)
                    .chain((0..segments.len()).step_by(2))
                    .collect();
                for i in order {
                    fb.append_segment(frame_no, i as u32, segments[i]);
                    thread::sleep(Duration::from_millis(1));
                }

                // Every fourth frame, pretend one interest went unanswered
                // for a while before the retransmission succeeded.
                if frame_no % 4 == 3 {
                    fb.notify_segment_timeout(frame_no, 0);
                }
            }
        })
    };

    // The decode/playout layer: block on the event stream, pick up
    // completed frames, recycle their slots.
    let mask = EventKind::READY | EventKind::FIRST_SEGMENT | EventKind::TIMEOUT;
    let mut completed = 0;
    while completed < FRAME_COUNT {
        let event = fb.wait_for_events(mask, Some(Duration::from_secs(5)));
        if event.is_sentinel() {
            println!("event stream went quiet, giving up");
            break;
        }

        if event.kind == EventKind::FIRST_SEGMENT {
            println!(
                "frame {:>2}: first segment (#{}) arrived",
                event.frame_no, event.segment_no
            );
        } else if event.kind == EventKind::TIMEOUT {
            println!(
                "frame {:>2}: segment #{} timed out, fetch layer retries",
                event.frame_no, event.segment_no
            );
        } else if event.kind == EventKind::READY {
            fb.lock_slot(event.frame_no);
            if let Some(handle) = &event.slot {
                if let Some(frame) = handle.frame(&PackedFrameCodec) {
                    println!(
                        "frame {:>2}: assembled {:?} {}x{} ({} bytes)",
                        event.frame_no,
                        frame.frame_type,
                        frame.width,
                        frame.height,
                        frame.data.len()
                    );
                    completed += 1;
                }
            }
            fb.unlock_slot(event.frame_no);
            fb.mark_slot_free(event.frame_no);
        }
    }

    producer.join().expect("producer thread panicked");

    let stats = fb.stats();
    println!("\nFinal statistics:");
    println!("  frames booked:     {}", stats.frames_booked);
    println!("  frames completed:  {}", stats.frames_completed);
    println!("  segments stored:   {}", stats.segments_stored);
    println!("  segment timeouts:  {}", stats.segment_timeouts);
    println!("  free slots:        {}", stats.free_slots);

    fb.release();
    Ok(())
}
