//! Single-slot, overwrite-not-queue frame exchange between threads

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;

use crate::frame::ProcessedFrame;

/// Latest-frame hand-off from the capture thread to the render thread.
///
/// Publishing moves a frame in, taking moves it out. Both are a single atomic
/// pointer swap, so neither side ever blocks or sees a half-written frame.
pub struct FrameSlot {
    slot: ArcSwapOption<ProcessedFrame>,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    published: AtomicUsize,
    taken: AtomicUsize,
    overwritten: AtomicUsize,
}

/// Counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotStats {
    pub published: usize,
    pub taken: usize,
    pub overwritten: usize,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self {
            slot: ArcSwapOption::const_empty(),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Producer: replace whatever is held. The superseded frame is dropped
    /// here, which returns its buffer to the pool.
    pub fn publish(&self, frame: ProcessedFrame) {
        let previous = self.slot.swap(Some(Arc::new(frame)));
        self.stats.published.fetch_add(1, Ordering::Relaxed);

        if previous.is_some() {
            self.stats.overwritten.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("slot_overwrites").increment(1);
        }
    }

    /// Consumer: remove and return the held frame, if any.
    pub fn take_latest(&self) -> Option<ProcessedFrame> {
        let frame = self.slot.swap(None)?;
        self.stats.taken.fetch_add(1, Ordering::Relaxed);

        // Nothing else keeps a reference, so this moves the frame out; the
        // clone is only a fallback.
        Some(Arc::try_unwrap(frame).unwrap_or_else(|shared| (*shared).clone()))
    }

    pub fn is_empty(&self) -> bool {
        self.slot.load().is_none()
    }

    /// Drop the held frame without consuming it (teardown).
    pub fn clear(&self) -> bool {
        self.slot.swap(None).is_some()
    }

    pub fn stats(&self) -> SlotStats {
        SlotStats {
            published: self.stats.published.load(Ordering::Relaxed),
            taken: self.stats.taken.load(Ordering::Relaxed),
            overwritten: self.stats.overwritten.load(Ordering::Relaxed),
        }
    }
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::EffectKind;
    use crate::frame::ChannelLayout;
    use crate::pipeline::pool::FramePool;
    use std::thread;
    use std::time::Instant;

    fn frame(generation: u64) -> ProcessedFrame {
        ProcessedFrame {
            pixels: vec![generation as u8; 4].into(),
            width: 1,
            height: 1,
            layout: ChannelLayout::Rgba,
            generation,
            timestamp: Instant::now(),
            effect: EffectKind::Identity,
        }
    }

    #[test]
    fn latest_publish_wins() {
        let slot = FrameSlot::new();
        slot.publish(frame(1));
        slot.publish(frame(2));

        assert_eq!(slot.take_latest().map(|f| f.generation), Some(2));
        assert!(slot.take_latest().is_none());
    }

    #[test]
    fn many_publishes_leave_one_frame() {
        let slot = FrameSlot::new();
        for g in 0..10 {
            slot.publish(frame(g));
        }

        assert_eq!(slot.take_latest().map(|f| f.generation), Some(9));
        assert!(slot.is_empty());
        assert_eq!(
            slot.stats(),
            SlotStats {
                published: 10,
                taken: 1,
                overwritten: 9
            }
        );
    }

    #[test]
    fn overwritten_buffers_go_back_to_the_pool() {
        let pool = FramePool::new(4);
        let slot = FrameSlot::new();
        for g in 0..3 {
            let mut f = frame(g);
            f.pixels = pool.acquire(4);
            slot.publish(f);
        }
        assert_eq!(pool.available(), 2);
        assert!(slot.clear());
        assert_eq!(pool.available(), 3);
        assert!(!slot.clear());
    }

    #[test]
    fn concurrent_reader_never_sees_a_frame_twice() {
        let slot = Arc::new(FrameSlot::new());
        let producer = {
            let slot = slot.clone();
            thread::spawn(move || {
                for g in 1..=5_000 {
                    slot.publish(frame(g));
                }
            })
        };

        let mut last = 0;
        let mut seen = 0;
        while !producer.is_finished() || !slot.is_empty() {
            if let Some(f) = slot.take_latest() {
                assert!(f.generation > last, "{} after {}", f.generation, last);
                assert_eq!(f.pixels[0], f.generation as u8);
                last = f.generation;
                seen += 1;
            }
        }
        producer.join().unwrap();

        let stats = slot.stats();
        assert_eq!(stats.taken, seen);
        assert_eq!(stats.published, 5_000);
        assert_eq!(stats.taken + stats.overwritten, 5_000);
    }
}
