//! Frame sources: the camera device and a synthetic test pattern

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::capture::frame::{FrameLease, PixelFormat, Plane, RawFrame};
use crate::error::Result;

/// Lazy sequence of raw sensor frames.
///
/// Sources keep only the latest frame: a consumer that falls behind sees the
/// newest buffer on its next call, never a backlog.
pub trait FrameSource: Send {
    fn name(&self) -> &str;

    /// Next frame, or `None` at end of stream.
    fn next_frame(&mut self) -> Result<Option<FrameLease>>;

    /// Iterate leases until end of stream or the first error.
    fn frames(&mut self) -> Frames<'_, Self>
    where
        Self: Sized,
    {
        Frames { source: self }
    }
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn next_frame(&mut self) -> Result<Option<FrameLease>> {
        (**self).next_frame()
    }
}

pub struct Frames<'a, S> {
    source: &'a mut S,
}

impl<S: FrameSource> Iterator for Frames<'_, S> {
    type Item = Result<FrameLease>;

    fn next(&mut self) -> Option<Self::Item> {
        self.source.next_frame().transpose()
    }
}

/// Moving test pattern in any supported layout.
///
/// Counts releases so tests can check that every lease is handed back.
pub struct SyntheticSource {
    format: PixelFormat,
    width: u32,
    height: u32,
    rotation_degrees: u32,
    limit: Option<u64>,
    interval: Option<Duration>,
    sequence: u64,
    released: Arc<AtomicU64>,
    last_emit: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            format,
            width,
            height,
            rotation_degrees: 0,
            limit: None,
            interval: None,
            sequence: 0,
            released: Arc::new(AtomicU64::new(0)),
            last_emit: None,
        }
    }

    /// Sensor orientation stamped on every frame (not validated here).
    pub fn with_rotation(mut self, degrees: u32) -> Self {
        self.rotation_degrees = degrees;
        self
    }

    /// End the stream after `frames` frames.
    pub fn with_limit(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }

    /// Pace frames like a camera running at `fps`.
    pub fn with_fps(mut self, fps: u32) -> Self {
        self.interval = (fps > 0).then(|| Duration::from_secs(1) / fps);
        self
    }

    /// Shared count of frames handed back so far.
    pub fn release_counter(&self) -> Arc<AtomicU64> {
        self.released.clone()
    }

    fn pattern(&self) -> Vec<Plane> {
        let (w, h) = (self.width as usize, self.height as usize);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        let shift = self.sequence as usize;

        let luma: Vec<u8> = (0..h)
            .flat_map(|y| (0..w).map(move |x| ((x + y + shift * 4) % 256) as u8))
            .collect();
        let u: Vec<u8> = (0..cw * ch).map(|i| ((i * 3 + shift) % 256) as u8).collect();
        let v: Vec<u8> = (0..cw * ch).map(|i| (255 - (i * 5 + shift) % 256) as u8).collect();

        match self.format {
            PixelFormat::Yuv420 => vec![
                Plane::packed(luma, w),
                Plane::packed(u, cw),
                Plane::packed(v, cw),
            ],
            PixelFormat::Nv12 | PixelFormat::Nv21 => {
                let (first, second) = match self.format {
                    PixelFormat::Nv12 => (&u, &v),
                    _ => (&v, &u),
                };
                let chroma: Vec<u8> = first
                    .iter()
                    .zip(second.iter())
                    .flat_map(|(&a, &b)| [a, b])
                    .collect();
                vec![Plane::packed(luma, w), Plane::new(chroma, cw * 2, 2)]
            }
        }
    }
}

impl FrameSource for SyntheticSource {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn next_frame(&mut self) -> Result<Option<FrameLease>> {
        if self.limit.is_some_and(|limit| self.sequence >= limit) {
            info!("Synthetic source finished after {} frames", self.sequence);
            return Ok(None);
        }

        if let (Some(interval), Some(last)) = (self.interval, self.last_emit) {
            let due = last + interval;
            let now = Instant::now();
            if due > now {
                std::thread::sleep(due - now);
            }
        }
        self.last_emit = Some(Instant::now());

        let frame = RawFrame::new(self.format, self.width, self.height, self.pattern())
            .with_rotation(self.rotation_degrees)
            .with_sequence(self.sequence);
        self.sequence += 1;

        let released = self.released.clone();
        Ok(Some(FrameLease::new(frame, move |seq| {
            debug!(seq, "synthetic frame released");
            released.fetch_add(1, Ordering::Relaxed);
        })))
    }
}
