//! Frame processing capability: software or row-parallel implementation,
//! chosen once at startup.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{kernels, processed_from, EffectSelector};
use crate::capture::frame::RawFrame;
use crate::capture::normalize::NormalizePlan;
use crate::error::{PipelineError, Result};
use crate::frame::{ChannelLayout, NormalizedFrame, ProcessedFrame};
use crate::pipeline::pool::FramePool;

/// Which processor implementation to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AcceleratorKind {
    Software,
    Parallel,
    /// Parallel when more than one core is available
    #[default]
    Auto,
}

/// Row-band work item: fill `dst` starting at output row `first_row`.
pub type BandFn<'a> = dyn Fn(&mut [u8], usize) + Sync + 'a;

/// Normalization and effect application over pooled buffers.
///
/// Implementations only decide how output rows are scheduled; the pixel math
/// is shared, so every implementation produces identical bytes.
pub trait FrameProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fill `dst` (a whole number of `row_bytes` rows) by calling `work` on
    /// one or more disjoint row bands.
    fn run_bands(&self, row_bytes: usize, dst: &mut [u8], work: &BandFn<'_>) -> Result<()>;

    fn normalize(&self, raw: &RawFrame, layout: ChannelLayout, pool: &FramePool) -> Result<NormalizedFrame> {
        let plan = NormalizePlan::new(raw, layout)?;
        let mut pixels = pool.acquire(plan.output_len());
        self.run_bands(plan.row_bytes(), &mut pixels, &|band, first_row| {
            plan.convert_rows(band, first_row)
        })?;

        let (width, height) = plan.output_dims();
        let mut frame = NormalizedFrame::new(pixels, width, height, layout);
        frame.sequence = raw.sequence;
        frame.timestamp = raw.timestamp;
        Ok(frame)
    }

    fn apply(&self, effect: &EffectSelector, frame: &NormalizedFrame, pool: &FramePool) -> Result<ProcessedFrame> {
        kernels::validate(effect, frame, frame.pixels.len())?;

        let mut pixels = pool.acquire(frame.pixels.len());
        self.run_bands(frame.stride(), &mut pixels, &|band, first_row| {
            kernels::apply_rows(effect, frame, band, first_row)
        })?;

        Ok(processed_from(frame, pixels, effect.kind()))
    }
}

/// Single-threaded processor, always available
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwareProcessor;

impl FrameProcessor for SoftwareProcessor {
    fn name(&self) -> &'static str {
        "software"
    }

    fn run_bands(&self, _row_bytes: usize, dst: &mut [u8], work: &BandFn<'_>) -> Result<()> {
        work(dst, 0);
        Ok(())
    }
}

/// Splits output rows across scoped worker threads
#[derive(Debug, Clone, Copy)]
pub struct ParallelProcessor {
    workers: NonZeroUsize,
}

impl ParallelProcessor {
    /// Frames smaller than this many rows per worker run on the caller thread.
    const MIN_ROWS_PER_BAND: usize = 16;

    /// `workers == 0` picks one worker per available core.
    pub fn new(workers: usize) -> Result<Self> {
        let workers = match NonZeroUsize::new(workers) {
            Some(n) => n,
            None => std::thread::available_parallelism().map_err(|e| {
                PipelineError::ResourceUnavailable(format!("cannot query core count: {e}"))
            })?,
        };

        if workers.get() < 2 {
            return Err(PipelineError::ResourceUnavailable(
                "parallel processing needs at least two workers".into(),
            ));
        }

        Ok(Self { workers })
    }

    pub fn workers(&self) -> usize {
        self.workers.get()
    }
}

impl FrameProcessor for ParallelProcessor {
    fn name(&self) -> &'static str {
        "parallel"
    }

    fn run_bands(&self, row_bytes: usize, dst: &mut [u8], work: &BandFn<'_>) -> Result<()> {
        if row_bytes == 0 {
            return Ok(());
        }
        let rows = dst.len() / row_bytes;
        let bands = self.workers.get().min(rows / Self::MIN_ROWS_PER_BAND).max(1);
        if bands == 1 {
            work(dst, 0);
            return Ok(());
        }

        let rows_per_band = rows.div_ceil(bands);
        crossbeam::scope(|scope| {
            for (i, band) in dst.chunks_mut(rows_per_band * row_bytes).enumerate() {
                scope.spawn(move |_| work(band, i * rows_per_band));
            }
        })
        .map_err(|_| PipelineError::ResourceUnavailable("band worker panicked".into()))
    }
}

/// Outcome of picking a processor at startup
pub struct ProcessorSelection {
    pub processor: Arc<dyn FrameProcessor>,
    /// Set when the requested accelerator was unavailable and software was used.
    pub fallback: Option<PipelineError>,
}

/// Pick the processor implementation once; callers only see the trait.
pub fn select_processor(kind: AcceleratorKind, workers: usize) -> ProcessorSelection {
    let software = || -> Arc<dyn FrameProcessor> { Arc::new(SoftwareProcessor) };

    let selection = match kind {
        AcceleratorKind::Software => ProcessorSelection {
            processor: software(),
            fallback: None,
        },
        AcceleratorKind::Parallel => match ParallelProcessor::new(workers) {
            Ok(p) => ProcessorSelection {
                processor: Arc::new(p),
                fallback: None,
            },
            Err(e) => {
                warn!("Parallel processor unavailable, using software: {}", e);
                ProcessorSelection {
                    processor: software(),
                    fallback: Some(e),
                }
            }
        },
        AcceleratorKind::Auto => match ParallelProcessor::new(workers) {
            Ok(p) => ProcessorSelection {
                processor: Arc::new(p),
                fallback: None,
            },
            Err(e) => {
                debug!("Auto-selected software processor: {}", e);
                ProcessorSelection {
                    processor: software(),
                    fallback: None,
                }
            }
        },
    };

    info!("Frame processor: {}", selection.processor.name());
    selection
}

/// Time a processing step into the `process_time_us` histogram.
pub(crate) fn timed<T>(stage: &'static str, f: impl FnOnce() -> T) -> T {
    let start = Instant::now();
    let out = f();
    metrics::histogram!("process_time_us", "stage" => stage).record(start.elapsed().as_micros() as f64);
    out
}
