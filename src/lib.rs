pub mod capture;
pub mod display;
pub mod effects;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod utils;

use std::path::Path;
use std::time::Duration;

use arc_swap::ArcSwap;
use capture::frame::PixelFormat;
use config::{ConfigError, Environment, File};
use effects::{AcceleratorKind, EffectSelector};
use frame::ChannelLayout;
use pipeline::FilterStage;
use serde::{Deserialize, Serialize};
use tracing::info;

pub use error::{PipelineError, Result};

use crate::utils::FoundDevice;

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub capture: CaptureConfig,
    pub display: DisplayConfig,
    pub pipeline: PipelineConfig,
}

/// Where raw frames come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    V4l2,
    /// Moving test pattern, no camera needed
    Synthetic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub source: SourceKind,
    /// Empty path means auto-detect
    pub device: FoundDevice,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Small counts keep only the latest frames queued in the driver
    pub buffer_count: u32,
    /// Sensor-to-display rotation stamped on every frame
    pub rotation_degrees: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
    pub vsync: bool,
    pub backend: GpuBackend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuBackend {
    Vulkan,
    Metal,
    Dx12,
    OpenGl,
    Auto,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Run the effect stage on every Nth captured frame
    pub process_every: u32,
    pub fps_window_ms: u64,
    pub pool_depth: usize,
    pub accelerator: AcceleratorKind,
    /// Band workers for the parallel processor, 0 = one per core
    pub workers: usize,
    pub layout: ChannelLayout,
    pub effect: EffectSelector,
    pub filter_stage: FilterStage,
    /// Pin the capture thread to this core
    pub capture_core: Option<usize>,
}

impl PipelineConfig {
    pub fn fps_window(&self) -> Duration {
        Duration::from_millis(self.fps_window_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureConfig {
                source: SourceKind::V4l2,
                device: FoundDevice::new("/dev/video0".into(), PixelFormat::Nv12),
                width: 640,
                height: 480,
                fps: 30,
                buffer_count: 2,
                rotation_degrees: 0,
            },
            display: DisplayConfig {
                title: "fxcam".into(),
                width: 800,
                height: 600,
                fullscreen: false,
                vsync: true,
                backend: GpuBackend::Auto,
            },
            pipeline: PipelineConfig {
                process_every: 5,
                fps_window_ms: 1000,
                pool_depth: 4,
                accelerator: AcceleratorKind::Auto,
                workers: 0,
                layout: ChannelLayout::Rgba,
                effect: EffectSelector::Identity,
                filter_stage: FilterStage::Cpu,
                capture_core: None,
            },
        }
    }
}

impl Config {
    /// Layer defaults, then the optional TOML file, then `FXCAM__*`
    /// environment variables (`FXCAM__PIPELINE__PROCESS_EVERY=1`).
    pub fn load(path: Option<&Path>) -> std::result::Result<Self, ConfigError> {
        let mut builder = config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            info!("Loading configuration from {}", path.display());
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(Environment::with_prefix("FXCAM").separator("__").try_parsing(true));

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Message(msg));

        if self.capture.width == 0 || self.capture.height == 0 {
            return invalid(format!(
                "capture size {}x{} must be non-zero",
                self.capture.width, self.capture.height
            ));
        }
        if capture::Rotation::from_degrees(self.capture.rotation_degrees).is_err() {
            return invalid(format!(
                "capture.rotation_degrees must be 0, 90, 180 or 270, got {}",
                self.capture.rotation_degrees
            ));
        }
        if self.capture.buffer_count == 0 {
            return invalid("capture.buffer_count must be at least 1".into());
        }
        if self.pipeline.fps_window_ms == 0 {
            return invalid("pipeline.fps_window_ms must be non-zero".into());
        }
        if self.pipeline.pool_depth == 0 {
            return invalid("pipeline.pool_depth must be at least 1".into());
        }
        Ok(())
    }
}
