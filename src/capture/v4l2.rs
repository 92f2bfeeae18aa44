//! V4L2 camera source delivering NV12 / NV21 / I420 planes

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::frame::{FrameLease, PixelFormat, Plane, RawFrame};
use crate::capture::source::FrameSource;
use crate::error::{PipelineError, Result};
use crate::CaptureConfig;

pub(crate) fn fourcc_for(format: PixelFormat) -> FourCC {
    match format {
        PixelFormat::Nv12 => FourCC::new(b"NV12"),
        PixelFormat::Nv21 => FourCC::new(b"NV21"),
        PixelFormat::Yuv420 => FourCC::new(b"YU12"),
    }
}

pub(crate) fn format_for(fourcc: FourCC) -> Option<PixelFormat> {
    match &fourcc.repr {
        b"NV12" => Some(PixelFormat::Nv12),
        b"NV21" => Some(PixelFormat::Nv21),
        b"YU12" => Some(PixelFormat::Yuv420),
        _ => None,
    }
}

/// Negotiated buffer geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Geometry {
    format: PixelFormat,
    width: u32,
    height: u32,
    /// Luma bytes per line as reported by the driver
    stride: usize,
}

impl Geometry {
    /// Split one contiguous driver buffer into planes.
    fn split(&self, data: Bytes) -> Result<Vec<Plane>> {
        let rows = self.height as usize;
        let chroma_rows = rows.div_ceil(2);
        let luma_len = self.stride * rows;

        let planes = match self.format {
            PixelFormat::Nv12 | PixelFormat::Nv21 => {
                let needed = luma_len + self.stride * chroma_rows;
                self.check_len(&data, needed)?;
                vec![
                    Plane::new(data.slice(..luma_len), self.stride, 1),
                    Plane::new(data.slice(luma_len..needed), self.stride, 2),
                ]
            }
            PixelFormat::Yuv420 => {
                let chroma_stride = self.stride / 2;
                let chroma_len = chroma_stride * chroma_rows;
                let needed = luma_len + 2 * chroma_len;
                self.check_len(&data, needed)?;
                vec![
                    Plane::new(data.slice(..luma_len), self.stride, 1),
                    Plane::new(data.slice(luma_len..luma_len + chroma_len), chroma_stride, 1),
                    Plane::new(data.slice(luma_len + chroma_len..needed), chroma_stride, 1),
                ]
            }
        };
        Ok(planes)
    }

    fn check_len(&self, data: &Bytes, needed: usize) -> Result<()> {
        if data.len() < needed {
            return Err(PipelineError::Format(format!(
                "driver buffer holds {} bytes, {:?} {}x{} needs {needed}",
                data.len(),
                self.format,
                self.width,
                self.height
            )));
        }
        Ok(())
    }
}

fn io_error(context: &str) -> impl FnOnce(std::io::Error) -> PipelineError + '_ {
    move |e| PipelineError::Capture(format!("{context}: {e}"))
}

/// Memory-mapped V4L2 capture.
///
/// Driver buffers are copied out on dequeue, so the lease only tracks frames
/// in flight; the mmap buffer itself is requeued on the next dequeue.
pub struct V4l2Source {
    _device: Device,
    stream: MmapStream<'static>,
    geometry: Geometry,
    rotation_degrees: u32,
    sequence: u64,
    in_flight: Arc<AtomicUsize>,
}

impl V4l2Source {
    pub fn open(config: &CaptureConfig) -> Result<Self> {
        info!("Initializing V4L2 capture: {:?}", config.device);

        let device = Device::with_path(&config.device.path).map_err(io_error("open device"))?;

        let caps = device.query_caps().map_err(io_error("query capabilities"))?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(PipelineError::Capture(format!(
                "{} doesn't support video capture",
                config.device.path
            )));
        }

        let mut fmt = device.format().map_err(io_error("get format"))?;
        fmt.width = config.width;
        fmt.height = config.height;
        fmt.fourcc = fourcc_for(config.device.format);
        let fmt = device.set_format(&fmt).map_err(io_error("set format"))?;

        // Drivers may substitute their own format and size.
        let format = format_for(fmt.fourcc).ok_or_else(|| {
            PipelineError::Format(format!("device negotiated unsupported format {}", fmt.fourcc))
        })?;
        if (fmt.width, fmt.height) != (config.width, config.height) {
            warn!(
                "Requested {}x{}, device delivers {}x{}",
                config.width, config.height, fmt.width, fmt.height
            );
        }
        let stride = if fmt.stride == 0 {
            fmt.width as usize
        } else {
            fmt.stride as usize
        };
        let geometry = Geometry {
            format,
            width: fmt.width,
            height: fmt.height,
            stride,
        };

        // A small buffer count keeps only the latest frames queued.
        let stream = MmapStream::with_buffers(&device, Type::VideoCapture, config.buffer_count)
            .map_err(io_error("map buffers"))?;
        info!(
            "Capture stream started with {} buffers ({:?})",
            config.buffer_count, geometry
        );

        Ok(Self {
            _device: device,
            stream,
            geometry,
            rotation_degrees: config.rotation_degrees,
            sequence: 0,
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn format(&self) -> PixelFormat {
        self.geometry.format
    }

    pub fn dims(&self) -> (u32, u32) {
        (self.geometry.width, self.geometry.height)
    }
}

impl FrameSource for V4l2Source {
    fn name(&self) -> &str {
        "v4l2"
    }

    #[instrument(skip(self), fields(seq = self.sequence))]
    fn next_frame(&mut self) -> Result<Option<FrameLease>> {
        let (buf, meta) = self.stream.next().map_err(io_error("dequeue"))?;
        let timestamp = Instant::now();

        let used = (meta.bytesused as usize).min(buf.len());
        let used = if used == 0 { buf.len() } else { used };
        let data = Bytes::copy_from_slice(&buf[..used]);

        let planes = self.geometry.split(data)?;
        let mut frame = RawFrame::new(
            self.geometry.format,
            self.geometry.width,
            self.geometry.height,
            planes,
        )
        .with_rotation(self.rotation_degrees)
        .with_sequence(self.sequence);
        frame.timestamp = timestamp;
        self.sequence += 1;

        let outstanding = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        if outstanding > 1 {
            debug!(outstanding, "frames still in flight");
        }
        let in_flight = self.in_flight.clone();
        Ok(Some(FrameLease::new(frame, move |_| {
            in_flight.fetch_sub(1, Ordering::AcqRel);
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_round_trip() {
        for format in [PixelFormat::Nv12, PixelFormat::Nv21, PixelFormat::Yuv420] {
            assert_eq!(format_for(fourcc_for(format)), Some(format));
        }
        assert_eq!(format_for(FourCC::new(b"MJPG")), None);
    }

    #[test]
    fn nv12_buffer_splits_at_luma_end() {
        let geometry = Geometry {
            format: PixelFormat::Nv12,
            width: 4,
            height: 2,
            stride: 8,
        };
        let planes = geometry.split(Bytes::from(vec![0u8; 24])).unwrap();
        assert_eq!(planes[0].data.len(), 16);
        assert_eq!(planes[1].data.len(), 8);
        assert_eq!(planes[1].pixel_stride, 2);
    }

    #[test]
    fn i420_buffer_has_three_planes() {
        let geometry = Geometry {
            format: PixelFormat::Yuv420,
            width: 4,
            height: 4,
            stride: 4,
        };
        let planes = geometry.split(Bytes::from(vec![0u8; 24])).unwrap();
        assert_eq!(planes.len(), 3);
        assert_eq!(planes[1].row_stride, 2);
        assert_eq!(planes[2].data.len(), 4);
    }

    #[test]
    fn short_buffer_is_a_format_error() {
        let geometry = Geometry {
            format: PixelFormat::Nv21,
            width: 4,
            height: 4,
            stride: 4,
        };
        assert!(matches!(
            geometry.split(Bytes::from(vec![0u8; 20])),
            Err(PipelineError::Format(_))
        ));
    }
}
