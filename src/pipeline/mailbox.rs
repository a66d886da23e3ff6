//! Single-slot, drop-latest frame handoff between the decode thread
//! and the render thread.
//!
//! A new frame unconditionally replaces an unconsumed one; intermediate
//! frames are dropped, never queued. This bounds memory and latency at
//! the cost of display fidelity when the renderer falls behind.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crossbeam::utils::CachePadded;

use crate::decode::frame::DecodedFrame;

#[derive(Default)]
struct MailboxStats {
    published: AtomicU64,
    taken: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Default)]
pub struct FrameMailbox {
    slot: Mutex<Option<DecodedFrame>>,
    stats: CachePadded<MailboxStats>,
}

impl FrameMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Producer: replace any unconsumed frame with the new one. The
    /// superseded frame's storage is released here; never blocks beyond
    /// the slot lock.
    pub fn publish(&self, frame: DecodedFrame) {
        let mut slot = self.slot.lock().unwrap();
        if slot.replace(frame).is_some() {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.published.fetch_add(1, Ordering::Relaxed);
    }

    /// Consumer: atomically remove and return the current frame. The
    /// slot is nulled under the same lock as the publish path, so
    /// producer and consumer never observe the same frame.
    pub fn take(&self) -> Option<DecodedFrame> {
        let frame = self.slot.lock().unwrap().take();
        if frame.is_some() {
            self.stats.taken.fetch_add(1, Ordering::Relaxed);
        }
        frame
    }

    /// Discard a pending frame, if any. Used on restart so the decoder
    /// pool is only torn down once no frame it issued is reachable.
    pub fn clear(&self) {
        self.slot.lock().unwrap().take();
    }

    pub fn published(&self) -> u64 {
        self.stats.published.load(Ordering::Relaxed)
    }

    pub fn taken(&self) -> u64 {
        self.stats.taken.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }

    pub fn reset_stats(&self) {
        self.stats.published.store(0, Ordering::Relaxed);
        self.stats.taken.store(0, Ordering::Relaxed);
        self.stats.dropped.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::decode::frame::{live_frame_count, testutil::gray_frame};

    #[test]
    fn take_on_empty_returns_none() {
        let mailbox = FrameMailbox::new();
        assert!(mailbox.take().is_none());
        assert_eq!(mailbox.taken(), 0);
    }

    #[test]
    fn publish_twice_drops_exactly_the_superseded_frame() {
        let mailbox = FrameMailbox::new();
        mailbox.publish(gray_frame(64, 48, 1));
        mailbox.publish(gray_frame(64, 48, 2));

        let got = mailbox.take().expect("latest frame present");
        assert_eq!(got.pts_us, 2);
        assert_eq!(mailbox.dropped(), 1);
        assert_eq!(mailbox.published(), 2);
        assert!(mailbox.take().is_none());
    }

    #[test]
    fn no_frame_leaks_across_publish_take_interleavings() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let before = live_frame_count();
        let mailbox = Arc::new(FrameMailbox::new());
        let done = Arc::new(AtomicBool::new(false));

        let producer = {
            let mailbox = mailbox.clone();
            let done = done.clone();
            thread::spawn(move || {
                for i in 0..1000 {
                    mailbox.publish(gray_frame(32, 32, i));
                }
                done.store(true, Ordering::Release);
            })
        };
        let consumer = {
            let mailbox = mailbox.clone();
            let done = done.clone();
            thread::spawn(move || {
                loop {
                    if let Some(frame) = mailbox.take() {
                        // the slot held at most this one frame
                        assert!(frame.pts_us < 1000);
                    } else if done.load(Ordering::Acquire) {
                        break;
                    }
                }
            })
        };
        producer.join().unwrap();
        consumer.join().unwrap();

        let leftover = mailbox.take();
        assert!(mailbox.take().is_none());
        drop(leftover);

        // every publish either reached a take or was released on overwrite
        assert_eq!(live_frame_count(), before);
        let accounted = mailbox.taken() + mailbox.dropped();
        assert!(accounted <= mailbox.published());
        assert!(mailbox.published() - accounted <= 1);
    }

    #[test]
    fn clear_discards_pending_frame() {
        let before = live_frame_count();
        let mailbox = FrameMailbox::new();
        mailbox.publish(gray_frame(64, 48, 7));
        mailbox.clear();
        assert!(mailbox.take().is_none());
        assert_eq!(live_frame_count(), before);
    }
}
