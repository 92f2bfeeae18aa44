//! Capture-thread loop: source -> normalize -> effect -> slot

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use crate::capture::source::FrameSource;
use crate::effects::processor::timed;
use crate::effects::FrameProcessor;
use crate::error::{PipelineError, Result};
use crate::frame::ChannelLayout;
use crate::pipeline::control::EffectControl;
use crate::pipeline::governor::{FpsCounter, RateGovernor};
use crate::pipeline::pool::FramePool;
use crate::pipeline::slot::FrameSlot;
use crate::pipeline::status::{StatusSink, StatusUpdate};

/// Consecutive device errors tolerated before the worker gives up
const MAX_CAPTURE_ERRORS: u32 = 10;

/// Counters reported when the worker stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub captured: u64,
    /// Skipped by the rate governor
    pub skipped: u64,
    pub published: u64,
    /// Failed normalization or effect application
    pub dropped: u64,
    pub capture_errors: u64,
}

/// What one pass of the loop did
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Published { generation: u64 },
    Skipped,
    Dropped(PipelineError),
    EndOfStream,
}

pub struct CaptureWorker<S> {
    source: S,
    processor: Arc<dyn FrameProcessor>,
    pool: FramePool,
    layout: ChannelLayout,
    governor: RateGovernor,
    fps: FpsCounter,
    slot: Arc<FrameSlot>,
    control: Arc<EffectControl>,
    status: Arc<dyn StatusSink>,
    frame_ready: Option<Box<dyn Fn() + Send>>,
    shutdown: Arc<AtomicBool>,
    core: Option<usize>,
    frame_index: u64,
    stats: PipelineStats,
}

impl<S: FrameSource> CaptureWorker<S> {
    pub fn new(
        source: S,
        processor: Arc<dyn FrameProcessor>,
        slot: Arc<FrameSlot>,
        control: Arc<EffectControl>,
        status: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            source,
            processor,
            pool: FramePool::new(4),
            layout: ChannelLayout::Rgba,
            governor: RateGovernor::default(),
            fps: FpsCounter::default(),
            slot,
            control,
            status,
            frame_ready: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            core: None,
            frame_index: 0,
            stats: PipelineStats::default(),
        }
    }

    pub fn with_pool(mut self, pool: FramePool) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_layout(mut self, layout: ChannelLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_governor(mut self, governor: RateGovernor) -> Self {
        self.governor = governor;
        self
    }

    pub fn with_fps_window(mut self, window: Duration) -> Self {
        self.fps = FpsCounter::new(window);
        self
    }

    /// Called after every publish, typically to request a redraw.
    pub fn on_frame_ready(mut self, notify: impl Fn() + Send + 'static) -> Self {
        self.frame_ready = Some(Box::new(notify));
        self
    }

    pub fn with_shutdown(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = flag;
        self
    }

    /// Pin the capture thread to a core when `run` starts.
    pub fn pin_to_core(mut self, core: Option<usize>) -> Self {
        self.core = core;
        self
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Pull and handle one frame.
    ///
    /// Per-frame failures are reported and turned into `Step::Dropped`; only
    /// source errors are returned. The raw frame is released before this
    /// returns, whatever the outcome.
    #[instrument(skip(self), fields(index = self.frame_index))]
    pub fn step(&mut self) -> Result<Step> {
        let Some(lease) = self.source.next_frame()? else {
            return Ok(Step::EndOfStream);
        };
        let index = self.frame_index;
        self.frame_index += 1;
        self.stats.captured += 1;

        if !self.governor.should_process(index) {
            self.stats.skipped += 1;
            return Ok(Step::Skipped);
        }

        let effect = self.control.cpu_effect();
        let processed = timed("normalize", || self.processor.normalize(&lease, self.layout, &self.pool))
            .and_then(|frame| timed("effect", || self.processor.apply(&effect, &frame, &self.pool)));
        let sequence = lease.sequence;
        drop(lease);

        let frame = match processed {
            Ok(frame) => frame,
            Err(reason) => {
                warn!("Dropping frame {}: {}", sequence, reason);
                self.stats.dropped += 1;
                metrics::counter!("frames_dropped").increment(1);
                self.status.publish(StatusUpdate::FrameDropped { sequence, reason: reason.clone() });
                return Ok(Step::Dropped(reason));
            }
        };

        let generation = frame.generation;
        self.slot.publish(frame);
        self.stats.published += 1;
        if let Some(notify) = &self.frame_ready {
            notify();
        }

        if let Some(fps) = self.fps.record_frame() {
            metrics::histogram!("processed_fps").record(fps as f64);
            self.status.publish(StatusUpdate::Fps(fps));
        }

        Ok(Step::Published { generation })
    }

    /// Loop until end of stream, shutdown, or a run of device errors.
    pub fn run(mut self) -> PipelineStats {
        if let Some(id) = self.core {
            if core_affinity::set_for_current(core_affinity::CoreId { id }) {
                info!("Capture thread pinned to core {}", id);
            } else {
                warn!("Could not pin capture thread to core {}", id);
            }
        }
        info!(
            "Capture worker started: source={}, processor={}, every {} frames",
            self.source.name(),
            self.processor.name(),
            self.governor.every()
        );

        let mut consecutive_errors = 0;
        let reason = loop {
            if self.shutdown.load(Ordering::Acquire) {
                break "shutdown requested".to_string();
            }

            match self.step() {
                Ok(Step::EndOfStream) => break "end of stream".to_string(),
                Ok(step) => {
                    consecutive_errors = 0;
                    debug!(?step);
                }
                Err(e) if e.is_per_frame() => {
                    // Undecodable driver buffer: nothing leased, nothing to release.
                    self.stats.dropped += 1;
                    metrics::counter!("frames_dropped").increment(1);
                    warn!("Capture delivered a bad frame: {}", e);
                }
                Err(e) => {
                    consecutive_errors += 1;
                    self.stats.capture_errors += 1;
                    error!("Capture error: {}", e);
                    if consecutive_errors >= MAX_CAPTURE_ERRORS {
                        break e.to_string();
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        };

        info!("Capture worker stopped ({}): {:?}", reason, self.stats);
        self.status.publish(StatusUpdate::SourceStopped(reason));
        self.stats
    }
}
