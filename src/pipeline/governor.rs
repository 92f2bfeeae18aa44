//! Frame sub-sampling and rolling FPS measurement

use std::num::NonZeroU32;
use std::time::{Duration, Instant};

/// Lets only every Nth captured frame through to the effect stage.
#[derive(Debug, Clone, Copy)]
pub struct RateGovernor {
    every: NonZeroU32,
}

impl RateGovernor {
    /// `every == 0` is treated as 1 (process everything).
    pub fn new(every: u32) -> Self {
        Self {
            every: NonZeroU32::new(every).unwrap_or(NonZeroU32::MIN),
        }
    }

    pub fn every(&self) -> u32 {
        self.every.get()
    }

    pub fn should_process(&self, frame_index: u64) -> bool {
        frame_index % self.every.get() as u64 == 0
    }
}

impl Default for RateGovernor {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Frames-per-second over fixed measurement windows
#[derive(Debug, Clone)]
pub struct FpsCounter {
    window: Duration,
    frame_count: u32,
    window_start: Instant,
    last_fps: Option<f32>,
}

impl FpsCounter {
    pub fn new(window: Duration) -> Self {
        Self::starting_at(window, Instant::now())
    }

    pub fn starting_at(window: Duration, start: Instant) -> Self {
        Self {
            window,
            frame_count: 0,
            window_start: start,
            last_fps: None,
        }
    }

    pub fn record_frame(&mut self) -> Option<f32> {
        self.record_frame_at(Instant::now())
    }

    /// Count one frame; at window rollover return `frames * 1000 / elapsed_ms`
    /// and start a new window.
    pub fn record_frame_at(&mut self, now: Instant) -> Option<f32> {
        self.frame_count += 1;

        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.window {
            return None;
        }

        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        let fps = (self.frame_count as f64 * 1000.0 / elapsed_ms) as f32;
        self.frame_count = 0;
        self.window_start = now;
        self.last_fps = Some(fps);
        Some(fps)
    }

    pub fn last_fps(&self) -> Option<f32> {
        self.last_fps
    }
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}
