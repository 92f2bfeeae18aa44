//! CPU-side frame buffers flowing from the normalizer to the presenter

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::effects::EffectKind;
use crate::error::{PipelineError, Result};
use crate::pipeline::pool::PooledBuffer;

/// Interleaving of a CPU frame buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelLayout {
    Rgba,
    Luma,
}

impl ChannelLayout {
    pub fn channels(self) -> usize {
        match self {
            ChannelLayout::Rgba => 4,
            ChannelLayout::Luma => 1,
        }
    }
}

/// Display-oriented frame produced by the normalizer
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedFrame {
    pub pixels: PooledBuffer,
    pub width: u32,
    pub height: u32,
    pub layout: ChannelLayout,
    pub sequence: u64,
    pub timestamp: Instant,
}

impl NormalizedFrame {
    pub fn new(pixels: impl Into<PooledBuffer>, width: u32, height: u32, layout: ChannelLayout) -> Self {
        Self {
            pixels: pixels.into(),
            width,
            height,
            layout,
            sequence: 0,
            timestamp: Instant::now(),
        }
    }

    pub fn rgba(pixels: Vec<u8>, width: u32, height: u32) -> Self {
        Self::new(pixels, width, height, ChannelLayout::Rgba)
    }

    pub fn luma(pixels: Vec<u8>, width: u32, height: u32) -> Self {
        Self::new(pixels, width, height, ChannelLayout::Luma)
    }

    pub fn stride(&self) -> usize {
        self.width as usize * self.layout.channels()
    }

    pub fn dims(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Buffer length implied by the geometry.
    pub fn expected_len(&self) -> usize {
        self.stride() * self.height as usize
    }

    pub(crate) fn check_geometry(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(PipelineError::DimensionMismatch(format!(
                "empty frame {}x{}",
                self.width, self.height
            )));
        }
        if self.pixels.len() != self.expected_len() {
            return Err(PipelineError::DimensionMismatch(format!(
                "{}x{} {:?} frame needs {} bytes, buffer holds {}",
                self.width,
                self.height,
                self.layout,
                self.expected_len(),
                self.pixels.len()
            )));
        }
        Ok(())
    }
}

/// Effect output, ready to be published to the exchange slot
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedFrame {
    pub pixels: PooledBuffer,
    pub width: u32,
    pub height: u32,
    pub layout: ChannelLayout,
    /// Monotonic counter used for staleness checks on the render side
    pub generation: u64,
    pub timestamp: Instant,
    /// Effect already baked into `pixels`
    pub effect: EffectKind,
}

impl ProcessedFrame {
    pub fn stride(&self) -> usize {
        self.width as usize * self.layout.channels()
    }

    /// Geometry-only view, for comparing against the source frame.
    pub fn dims(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}
