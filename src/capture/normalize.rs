//! YUV 4:2:0 to display-oriented RGBA/luma conversion

use tracing::instrument;

use crate::capture::frame::{PixelFormat, Plane, RawFrame, Rotation};
use crate::error::{PipelineError, Result};
use crate::frame::{ChannelLayout, NormalizedFrame};

/// Strided read-only view of one sample channel
#[derive(Clone, Copy)]
struct PlaneView<'a> {
    data: &'a [u8],
    offset: usize,
    row_stride: usize,
    pixel_stride: usize,
}

impl<'a> PlaneView<'a> {
    fn new(
        name: &str,
        plane: &'a Plane,
        offset: usize,
        width: usize,
        height: usize,
        min_pixel_stride: usize,
    ) -> Result<Self> {
        if plane.pixel_stride < min_pixel_stride {
            return Err(PipelineError::Format(format!(
                "{name} plane pixel stride {} below {min_pixel_stride}",
                plane.pixel_stride
            )));
        }
        let row_span = (width - 1) * plane.pixel_stride + 1;
        if plane.row_stride < row_span {
            return Err(PipelineError::Format(format!(
                "{name} plane row stride {} shorter than a row ({row_span} bytes)",
                plane.row_stride
            )));
        }
        let needed = offset + (height - 1) * plane.row_stride + row_span;
        if plane.data.len() < needed {
            return Err(PipelineError::Format(format!(
                "{name} plane holds {} bytes, {width}x{height} needs {needed}",
                plane.data.len()
            )));
        }

        Ok(Self {
            data: &plane.data,
            offset,
            row_stride: plane.row_stride,
            pixel_stride: plane.pixel_stride,
        })
    }

    #[inline(always)]
    fn at(&self, x: usize, y: usize) -> u8 {
        self.data[self.offset + y * self.row_stride + x * self.pixel_stride]
    }
}

/// BT.601 full-range YUV to RGB
#[inline(always)]
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = y as f32;
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;

    let r = (y + 1.402 * v).round().clamp(0.0, 255.0) as u8;
    let g = (y - 0.344 * u - 0.714 * v).round().clamp(0.0, 255.0) as u8;
    let b = (y + 1.772 * u).round().clamp(0.0, 255.0) as u8;
    [r, g, b]
}

/// A validated raw frame, ready to be converted row by row.
///
/// Destination rows are independent of each other, so callers may convert
/// disjoint row bands concurrently.
pub struct NormalizePlan<'a> {
    luma: PlaneView<'a>,
    cb: PlaneView<'a>,
    cr: PlaneView<'a>,
    src_width: usize,
    src_height: usize,
    rotation: Rotation,
    layout: ChannelLayout,
    out_width: u32,
    out_height: u32,
}

impl<'a> NormalizePlan<'a> {
    pub fn new(raw: &'a RawFrame, layout: ChannelLayout) -> Result<Self> {
        if raw.width == 0 || raw.height == 0 {
            return Err(PipelineError::Format(format!(
                "empty raw frame {}x{}",
                raw.width, raw.height
            )));
        }
        if raw.planes.len() != raw.format.plane_count() {
            return Err(PipelineError::Format(format!(
                "{:?} expects {} planes, got {}",
                raw.format,
                raw.format.plane_count(),
                raw.planes.len()
            )));
        }

        let width = raw.width as usize;
        let height = raw.height as usize;
        let chroma_w = width.div_ceil(2);
        let chroma_h = height.div_ceil(2);

        let luma = PlaneView::new("Y", &raw.planes[0], 0, width, height, 1)?;
        let (cb, cr) = match raw.format {
            PixelFormat::Yuv420 => (
                PlaneView::new("U", &raw.planes[1], 0, chroma_w, chroma_h, 1)?,
                PlaneView::new("V", &raw.planes[2], 0, chroma_w, chroma_h, 1)?,
            ),
            PixelFormat::Nv12 => (
                PlaneView::new("UV", &raw.planes[1], 0, chroma_w, chroma_h, 2)?,
                PlaneView::new("UV", &raw.planes[1], 1, chroma_w, chroma_h, 2)?,
            ),
            PixelFormat::Nv21 => (
                PlaneView::new("VU", &raw.planes[1], 1, chroma_w, chroma_h, 2)?,
                PlaneView::new("VU", &raw.planes[1], 0, chroma_w, chroma_h, 2)?,
            ),
        };

        let rotation = Rotation::from_degrees(raw.rotation_degrees)?;
        let (out_width, out_height) = rotation.output_dims(raw.width, raw.height);

        Ok(Self {
            luma,
            cb,
            cr,
            src_width: width,
            src_height: height,
            rotation,
            layout,
            out_width,
            out_height,
        })
    }

    pub fn output_dims(&self) -> (u32, u32) {
        (self.out_width, self.out_height)
    }

    pub fn layout(&self) -> ChannelLayout {
        self.layout
    }

    pub fn row_bytes(&self) -> usize {
        self.out_width as usize * self.layout.channels()
    }

    pub fn output_len(&self) -> usize {
        self.row_bytes() * self.out_height as usize
    }

    /// Convert the destination rows starting at `first_row` into `dst`.
    ///
    /// `dst` must be a whole number of output rows.
    pub fn convert_rows(&self, dst: &mut [u8], first_row: usize) {
        let row_bytes = self.row_bytes();
        let (w, h) = (self.src_width, self.src_height);

        for (i, row) in dst.chunks_exact_mut(row_bytes).enumerate() {
            let dy = first_row + i;
            match self.layout {
                ChannelLayout::Rgba => {
                    for (dx, px) in row.chunks_exact_mut(4).enumerate() {
                        let (sx, sy) = self.rotation.source_coord(dx, dy, w, h);
                        let [r, g, b] = yuv_to_rgb(
                            self.luma.at(sx, sy),
                            self.cb.at(sx / 2, sy / 2),
                            self.cr.at(sx / 2, sy / 2),
                        );
                        px.copy_from_slice(&[r, g, b, 255]);
                    }
                }
                ChannelLayout::Luma => {
                    for (dx, px) in row.iter_mut().enumerate() {
                        let (sx, sy) = self.rotation.source_coord(dx, dy, w, h);
                        *px = self.luma.at(sx, sy);
                    }
                }
            }
        }
    }
}

/// Convert a raw frame to display-oriented RGBA.
pub fn normalize(raw: &RawFrame) -> Result<NormalizedFrame> {
    normalize_as(raw, ChannelLayout::Rgba)
}

/// Convert a raw frame to the requested channel layout.
#[instrument(skip(raw), fields(seq = raw.sequence, w = raw.width, h = raw.height))]
pub fn normalize_as(raw: &RawFrame, layout: ChannelLayout) -> Result<NormalizedFrame> {
    let plan = NormalizePlan::new(raw, layout)?;
    let mut pixels = vec![0u8; plan.output_len()];
    plan.convert_rows(&mut pixels, 0);

    let (width, height) = plan.output_dims();
    let mut frame = NormalizedFrame::new(pixels, width, height, layout);
    frame.sequence = raw.sequence;
    frame.timestamp = raw.timestamp;
    Ok(frame)
}

/// Convert into a caller-provided buffer, returning the output dimensions.
///
/// `out` must be exactly `width * height * channels` bytes for the rotated
/// geometry.
pub fn normalize_into(raw: &RawFrame, layout: ChannelLayout, out: &mut [u8]) -> Result<(u32, u32)> {
    let plan = NormalizePlan::new(raw, layout)?;
    if out.len() != plan.output_len() {
        return Err(PipelineError::DimensionMismatch(format!(
            "output buffer is {} bytes, expected {}",
            out.len(),
            plan.output_len()
        )));
    }
    plan.convert_rows(out, 0);
    Ok(plan.output_dims())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// I420 frame with a distinct luma value per pixel and neutral chroma.
    fn ramp_i420(width: u32, height: u32) -> RawFrame {
        let (w, h) = (width as usize, height as usize);
        let luma: Vec<u8> = (0..w * h).map(|i| (i * 10) as u8).collect();
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        let chroma = vec![128u8; cw * ch];
        RawFrame::new(
            PixelFormat::Yuv420,
            width,
            height,
            vec![
                Plane::packed(luma, w),
                Plane::packed(chroma.clone(), cw),
                Plane::packed(chroma, cw),
            ],
        )
    }

    #[test]
    fn neutral_chroma_yields_grey() {
        let frame = normalize(&ramp_i420(4, 2)).unwrap();
        assert_eq!(frame.dims(), (4, 2));
        for (i, px) in frame.pixels.chunks_exact(4).enumerate() {
            let y = (i * 10) as u8;
            assert_eq!(px, &[y, y, y, 255]);
        }
    }

    #[test]
    fn rotation_swaps_dimensions() {
        for (deg, dims) in [(0, (4, 2)), (90, (2, 4)), (180, (4, 2)), (270, (2, 4))] {
            let raw = ramp_i420(4, 2).with_rotation(deg);
            let frame = normalize(&raw).unwrap();
            assert_eq!((frame.width, frame.height), dims, "rotation {deg}");
            assert_eq!(frame.pixels.len(), 4 * 2 * 4);
        }
    }

    #[test]
    fn clockwise_rotation_moves_bottom_left_to_top_left() {
        // Source luma (3x2):  0 10 20 / 30 40 50
        let raw = ramp_i420(3, 2).with_rotation(90);
        let frame = normalize_as(&raw, ChannelLayout::Luma).unwrap();
        assert_eq!(&frame.pixels[..], &[30, 0, 40, 10, 50, 20]);

        let raw = ramp_i420(3, 2).with_rotation(270);
        let frame = normalize_as(&raw, ChannelLayout::Luma).unwrap();
        assert_eq!(&frame.pixels[..], &[20, 50, 10, 40, 0, 30]);
    }

    #[test]
    fn nv21_reads_v_before_u() {
        // Pure red in BT.601 full range: Y=76, U=85, V=255.
        let raw = RawFrame::new(
            PixelFormat::Nv21,
            2,
            2,
            vec![Plane::packed(vec![76u8; 4], 2), Plane::new(vec![255u8, 85], 2, 2)],
        );
        let frame = normalize(&raw).unwrap();
        let px = &frame.pixels[..4];
        assert!(px[0] > 240, "red channel {}", px[0]);
        assert!(px[1] < 10 && px[2] < 10, "{px:?}");
    }

    #[test]
    fn short_plane_is_a_format_error() {
        let mut raw = ramp_i420(4, 4);
        raw.planes[0] = Plane::packed(vec![0u8; 10], 4);
        assert!(matches!(normalize(&raw), Err(PipelineError::Format(_))));

        raw.planes.pop();
        assert!(matches!(normalize(&raw), Err(PipelineError::Format(_))));
    }

    #[test]
    fn odd_angle_is_rejected() {
        let raw = ramp_i420(2, 2).with_rotation(45);
        assert_eq!(
            normalize(&raw).unwrap_err(),
            PipelineError::UnsupportedRotation(45)
        );
    }

    #[test]
    fn input_is_untouched() {
        let raw = ramp_i420(4, 2).with_rotation(180);
        let before = raw.planes[0].data.clone();
        normalize(&raw).unwrap();
        assert_eq!(raw.planes[0].data, before);
    }

    #[test]
    fn normalize_into_checks_buffer_size() {
        let raw = ramp_i420(4, 2).with_rotation(90);
        let mut out = vec![0u8; 4 * 2 * 4];
        assert_eq!(normalize_into(&raw, ChannelLayout::Rgba, &mut out), Ok((2, 4)));
        assert_eq!(out, normalize(&raw).unwrap().pixels.to_vec());

        let mut short = vec![0u8; 7];
        assert!(matches!(
            normalize_into(&raw, ChannelLayout::Rgba, &mut short),
            Err(PipelineError::DimensionMismatch(_))
        ));
    }
}
