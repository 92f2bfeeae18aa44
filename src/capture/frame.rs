use std::fmt;
use std::ops::Deref;
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Raw sensor layouts we accept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// Three planes (Y, U, V), each with its own row and pixel stride.
    Yuv420,
    /// Y plane followed by interleaved U/V.
    Nv12,
    /// Y plane followed by interleaved V/U.
    Nv21,
}

impl PixelFormat {
    pub fn plane_count(self) -> usize {
        match self {
            PixelFormat::Yuv420 => 3,
            PixelFormat::Nv12 | PixelFormat::Nv21 => 2,
        }
    }
}

/// One byte plane of a raw frame
#[derive(Clone)]
pub struct Plane {
    /// Immutable plane bytes - can be shared across threads without copying
    pub data: Bytes,
    pub row_stride: usize,
    pub pixel_stride: usize,
}

impl Plane {
    pub fn new(data: impl Into<Bytes>, row_stride: usize, pixel_stride: usize) -> Self {
        Self {
            data: data.into(),
            row_stride,
            pixel_stride,
        }
    }

    /// Packed plane: pixel stride 1, rows back to back.
    pub fn packed(data: impl Into<Bytes>, width: usize) -> Self {
        Self::new(data, width, 1)
    }
}

impl fmt::Debug for Plane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plane")
            .field("len", &self.data.len())
            .field("row_stride", &self.row_stride)
            .field("pixel_stride", &self.pixel_stride)
            .finish()
    }
}

/// Axis-aligned sensor-to-display rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    Deg0,
    /// Clockwise
    Deg90,
    Deg180,
    /// Counter-clockwise
    Deg270,
}

impl Rotation {
    pub fn from_degrees(degrees: u32) -> Result<Self> {
        match degrees {
            0 => Ok(Rotation::Deg0),
            90 => Ok(Rotation::Deg90),
            180 => Ok(Rotation::Deg180),
            270 => Ok(Rotation::Deg270),
            other => Err(PipelineError::UnsupportedRotation(other)),
        }
    }

    pub fn swaps_axes(self) -> bool {
        matches!(self, Rotation::Deg90 | Rotation::Deg270)
    }

    /// Output geometry for a `width`x`height` input.
    pub fn output_dims(self, width: u32, height: u32) -> (u32, u32) {
        if self.swaps_axes() {
            (height, width)
        } else {
            (width, height)
        }
    }

    /// Maps a destination pixel back to the source pixel it comes from.
    #[inline(always)]
    pub(crate) fn source_coord(self, dx: usize, dy: usize, width: usize, height: usize) -> (usize, usize) {
        match self {
            Rotation::Deg0 => (dx, dy),
            Rotation::Deg90 => (dy, height - 1 - dx),
            Rotation::Deg180 => (width - 1 - dx, height - 1 - dy),
            Rotation::Deg270 => (width - 1 - dy, dx),
        }
    }
}

/// Immutable capture unit as delivered by the sensor
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub planes: Vec<Plane>,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub rotation_degrees: u32,
    pub sequence: u64,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

impl RawFrame {
    pub fn new(format: PixelFormat, width: u32, height: u32, planes: Vec<Plane>) -> Self {
        Self {
            planes,
            format,
            width,
            height,
            rotation_degrees: 0,
            sequence: 0,
            timestamp: Instant::now(),
        }
    }

    pub fn with_rotation(mut self, degrees: u32) -> Self {
        self.rotation_degrees = degrees;
        self
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }
}

type ReleaseHook = Box<dyn FnOnce(u64) + Send>;

/// A raw frame on loan from its source.
///
/// Dropping the lease hands the buffer back, so the source is acknowledged on
/// every exit path of the capture loop, including early returns on error.
pub struct FrameLease {
    frame: RawFrame,
    on_release: Option<ReleaseHook>,
}

impl FrameLease {
    pub fn new(frame: RawFrame, on_release: impl FnOnce(u64) + Send + 'static) -> Self {
        Self {
            frame,
            on_release: Some(Box::new(on_release)),
        }
    }

    /// Lease with nothing to hand back (owned copies, tests).
    pub fn detached(frame: RawFrame) -> Self {
        Self {
            frame,
            on_release: None,
        }
    }
}

impl Deref for FrameLease {
    type Target = RawFrame;

    fn deref(&self) -> &RawFrame {
        &self.frame
    }
}

impl Drop for FrameLease {
    fn drop(&mut self) {
        if let Some(release) = self.on_release.take() {
            release(self.frame.sequence);
        }
    }
}
