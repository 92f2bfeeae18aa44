use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use v4l::{capability::Flags, video::Capture, Device};

use crate::capture::frame::PixelFormat;
use crate::capture::v4l2::{format_for, fourcc_for};
use crate::error::{PipelineError, Result};

// Detected capture device info
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundDevice {
    pub path: String,
    pub format: PixelFormat,
}

impl FoundDevice {
    pub fn new(path: String, format: PixelFormat) -> Self {
        Self { path, format }
    }
}

/// Preference order when a device offers several YUV layouts
const PREFERRED: [PixelFormat; 3] = [PixelFormat::Nv12, PixelFormat::Nv21, PixelFormat::Yuv420];

/// Auto-detect the first capture device with a YUV 4:2:0 format
pub fn auto_detect_device() -> Result<FoundDevice> {
    info!("Auto-detecting capture devices...");

    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        // Check for capture capability
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            continue;
        }
        let Ok(formats) = dev.enum_formats() else {
            continue;
        };

        let offered: Vec<PixelFormat> = formats.iter().filter_map(|f| format_for(f.fourcc)).collect();
        debug!("{} offers {:?}", path, offered);
        if let Some(&format) = PREFERRED.iter().find(|f| offered.contains(f)) {
            info!("Found {} device: {} - {}", fourcc_for(format), path, caps.card);
            return Ok(FoundDevice { path, format });
        }
    }

    Err(PipelineError::ResourceUnavailable(
        "no capture device with NV12, NV21 or YU12 output found".into(),
    ))
}
