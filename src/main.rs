//! fxcam: live camera viewer with CPU and GPU effects

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use color_eyre::Result;
use tracing::{info, warn};
use tracing_subscriber::fmt::time::uptime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use fxcam::capture::{FrameSource, SyntheticSource, V4l2Source};
use fxcam::display::app::{self, DisplayApp, UserEvent};
use fxcam::effects::{select_processor, EffectSelector};
use fxcam::pipeline::{
    CaptureWorker, EffectControl, FilterStage, FramePool, FrameSlot, RateGovernor, StatusSink, StatusUpdate,
};
use fxcam::{utils, Config, SourceKind};

#[derive(Parser, Debug)]
#[command(name = "fxcam", version, about = "Live camera viewer with CPU and GPU effects")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use the moving test pattern instead of a camera
    #[arg(long)]
    synthetic: bool,

    /// Capture device path; empty auto-detects
    #[arg(short, long)]
    device: Option<String>,

    /// Initial effect, e.g. `sepia`, `blur:3`, `edge:50`
    #[arg(short, long)]
    effect: Option<EffectSelector>,

    /// Apply the effect in the presenter's shader instead of on the CPU
    #[arg(long)]
    gpu_filter: bool,

    /// Process every Nth captured frame
    #[arg(long)]
    every: Option<u32>,

    /// Sensor rotation in degrees (0, 90, 180, 270)
    #[arg(long)]
    rotation: Option<u32>,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if self.synthetic {
            config.capture.source = SourceKind::Synthetic;
        }
        if let Some(device) = &self.device {
            config.capture.device.path = device.clone();
        }
        if let Some(effect) = self.effect {
            config.pipeline.effect = effect;
        }
        if self.gpu_filter {
            config.pipeline.filter_stage = FilterStage::Gpu;
        }
        if let Some(every) = self.every {
            config.pipeline.process_every = every;
        }
        if let Some(rotation) = self.rotation {
            config.capture.rotation_degrees = rotation;
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fxcam=info,wgpu_core=warn"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_timer(uptime()));

    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());

    registry.init();
}

fn open_source(config: &mut Config) -> Result<Box<dyn FrameSource>> {
    let capture = &mut config.capture;
    let source: Box<dyn FrameSource> = match capture.source {
        SourceKind::Synthetic => Box::new(
            SyntheticSource::new(capture.device.format, capture.width, capture.height)
                .with_rotation(capture.rotation_degrees)
                .with_fps(capture.fps),
        ),
        SourceKind::V4l2 => {
            if capture.device.path.is_empty() {
                capture.device = utils::auto_detect_device()?;
            }
            info!("Using capture device: {:?}", capture.device);
            let source = V4l2Source::open(capture)?;
            // The driver may round the requested geometry.
            (capture.width, capture.height) = source.dims();
            capture.device.format = source.format();
            info!("Streaming {:?} {}x{}", capture.device.format, capture.width, capture.height);
            Box::new(source)
        }
    };
    Ok(source)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();
    let args = Args::parse();

    info!("fxcam launching...");

    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    let source = open_source(&mut config)?;
    fxcam::CONFIG.store(Arc::new(config.clone()));

    let (status_tx, status_rx) = flume::bounded::<StatusUpdate>(64);
    let status: Arc<dyn StatusSink> = Arc::new(status_tx);

    let selection = select_processor(config.pipeline.accelerator, config.pipeline.workers);
    if let Some(e) = selection.fallback {
        status.publish(StatusUpdate::AcceleratorFallback(e));
    }

    let slot = Arc::new(FrameSlot::new());
    let control = Arc::new(EffectControl::new(config.pipeline.effect, config.pipeline.filter_stage));
    let shutdown = Arc::new(AtomicBool::new(false));

    let event_loop = app::event_loop()?;
    let proxy = event_loop.create_proxy();

    let worker = CaptureWorker::new(source, selection.processor, slot.clone(), control.clone(), status.clone())
        .with_pool(FramePool::new(config.pipeline.pool_depth))
        .with_layout(config.pipeline.layout)
        .with_governor(RateGovernor::new(config.pipeline.process_every))
        .with_fps_window(config.pipeline.fps_window())
        .with_shutdown(shutdown.clone())
        .pin_to_core(config.pipeline.capture_core)
        .on_frame_ready(app::frame_ready_notifier(proxy.clone()));

    // Capture runs on its own blocking thread
    let capture_handle = tokio::task::spawn_blocking(move || worker.run());

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received");
            let _ = proxy.send_event(UserEvent::Shutdown);
        }
    });

    // winit must own the main thread
    let mut app = DisplayApp::new(config.display.clone(), slot, control, status, status_rx, shutdown.clone());
    event_loop.run_app(&mut app)?;

    shutdown.store(true, Ordering::Release);
    match capture_handle.await {
        Ok(stats) => info!("Capture stats: {:?}", stats),
        Err(e) => warn!("Capture thread ended abnormally: {}", e),
    }

    info!("fxcam shutting down");
    Ok(())
}
