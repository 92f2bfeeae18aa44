//! Row-band CPU kernels. Every kernel writes a whole number of output rows
//! and only reads the (immutable) source frame, so bands can run concurrently.

use super::EffectSelector;
use crate::error::{PipelineError, Result};
use crate::frame::{ChannelLayout, NormalizedFrame};

const SEPIA: [[f32; 3]; 3] = [
    [0.393, 0.769, 0.189],
    [0.349, 0.686, 0.168],
    [0.272, 0.534, 0.131],
];

pub(super) fn validate(effect: &EffectSelector, frame: &NormalizedFrame, out_len: usize) -> Result<()> {
    frame.check_geometry()?;

    if out_len != frame.expected_len() {
        return Err(PipelineError::DimensionMismatch(format!(
            "output buffer holds {out_len} bytes, frame needs {}",
            frame.expected_len()
        )));
    }

    match *effect {
        EffectSelector::EdgeDetect { .. } if frame.width < 3 || frame.height < 3 => {
            return Err(PipelineError::DimensionMismatch(format!(
                "edge detection needs at least 3x3 pixels, got {}x{}",
                frame.width, frame.height
            )));
        }
        // Bounds the u64 window sums in `box_blur`.
        EffectSelector::Blur { radius } if radius > frame.width.max(frame.height) => {
            return Err(PipelineError::DimensionMismatch(format!(
                "blur radius {radius} exceeds {}x{} frame",
                frame.width, frame.height
            )));
        }
        _ => {}
    }

    Ok(())
}

#[inline(always)]
fn luminance(r: u8, g: u8, b: u8) -> f32 {
    0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32
}

#[inline(always)]
fn to_byte(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

#[inline(always)]
fn sepia(r: u8, g: u8, b: u8) -> [u8; 3] {
    let [r, g, b] = [r as f32, g as f32, b as f32];
    SEPIA.map(|[kr, kg, kb]| to_byte(kr * r + kg * g + kb * b))
}

#[inline(always)]
fn contrast(c: u8, factor: f32) -> u8 {
    to_byte((c as f32 - 128.0) * factor + 128.0)
}

/// Run `effect` over the destination rows starting at `first_row`.
///
/// Callers validate geometry first.
pub(crate) fn apply_rows(effect: &EffectSelector, src: &NormalizedFrame, dst: &mut [u8], first_row: usize) {
    match *effect {
        EffectSelector::Identity => {
            let start = first_row * src.stride();
            dst.copy_from_slice(&src.pixels[start..start + dst.len()]);
        }
        EffectSelector::Grayscale => map_pixels(src, dst, first_row, |px, out| {
            let l = to_byte(luminance(px[0], px[1], px[2]));
            out.copy_from_slice(&[l, l, l, px[3]]);
        }, |l| l),
        EffectSelector::Invert => map_pixels(src, dst, first_row, |px, out| {
            out.copy_from_slice(&[255 - px[0], 255 - px[1], 255 - px[2], px[3]]);
        }, |l| 255 - l),
        EffectSelector::Sepia => map_pixels(src, dst, first_row, |px, out| {
            let [r, g, b] = sepia(px[0], px[1], px[2]);
            out.copy_from_slice(&[r, g, b, px[3]]);
        }, |l| {
            let [r, g, b] = sepia(l, l, l);
            to_byte(luminance(r, g, b))
        }),
        EffectSelector::Contrast { factor } => map_pixels(src, dst, first_row, |px, out| {
            out.copy_from_slice(&[
                contrast(px[0], factor),
                contrast(px[1], factor),
                contrast(px[2], factor),
                px[3],
            ]);
        }, |l| contrast(l, factor)),
        EffectSelector::Blur { radius } => box_blur(src, dst, first_row, radius as usize),
        EffectSelector::EdgeDetect { threshold1, .. } => sobel(src, dst, first_row, threshold1),
    }
}

/// Per-pixel transforms: `rgba` for 4-channel frames, `luma` for single channel.
fn map_pixels(
    src: &NormalizedFrame,
    dst: &mut [u8],
    first_row: usize,
    rgba: impl Fn(&[u8], &mut [u8]),
    luma: impl Fn(u8) -> u8,
) {
    let start = first_row * src.stride();
    let input = &src.pixels[start..start + dst.len()];

    match src.layout {
        ChannelLayout::Rgba => {
            for (px, out) in input.chunks_exact(4).zip(dst.chunks_exact_mut(4)) {
                rgba(px, out);
            }
        }
        ChannelLayout::Luma => {
            for (l, out) in input.iter().zip(dst.iter_mut()) {
                *out = luma(*l);
            }
        }
    }
}

/// Clamp-to-edge taps along one axis as `(index, weight)`: out-of-range
/// taps fold onto the first or last index.
fn edge_taps(center: usize, radius: usize, len: usize) -> impl Iterator<Item = (usize, u64)> {
    let first = center.saturating_sub(radius);
    let last = center.saturating_add(radius).min(len - 1);
    let below = (radius - (center - first)) as u64;
    let above = (radius - (last - center)) as u64;

    (first..=last).map(move |i| {
        let mut weight = 1;
        if i == 0 {
            weight += below;
        }
        if i == len - 1 {
            weight += above;
        }
        (i, weight)
    })
}

fn box_blur(src: &NormalizedFrame, dst: &mut [u8], first_row: usize, radius: usize) {
    let (w, h) = (src.width as usize, src.height as usize);
    let channels = src.layout.channels();
    let stride = src.stride();
    let side = 2 * radius as u64 + 1;
    let window = side * side;
    let half = window / 2;

    for (i, row) in dst.chunks_exact_mut(stride).enumerate() {
        let y = first_row + i;

        for x in 0..w {
            let mut sums = [0u64; 4];

            for (sy, wy) in edge_taps(y, radius, h) {
                let src_row = &src.pixels[sy * stride..(sy + 1) * stride];
                let mut row_sums = [0u64; 4];
                for (sx, wx) in edge_taps(x, radius, w) {
                    let px = &src_row[sx * channels..(sx + 1) * channels];
                    for (sum, &v) in row_sums.iter_mut().zip(px) {
                        *sum += wx * v as u64;
                    }
                }
                for (sum, row_sum) in sums.iter_mut().zip(row_sums) {
                    *sum += wy * row_sum;
                }
            }

            let out = &mut row[x * channels..(x + 1) * channels];
            for (o, sum) in out.iter_mut().zip(sums) {
                *o = ((sum + half) / window) as u8;
            }
        }
    }
}

fn sobel(src: &NormalizedFrame, dst: &mut [u8], first_row: usize, threshold: f32) {
    let (w, h) = (src.width as usize, src.height as usize);
    let channels = src.layout.channels();
    let stride = src.stride();

    let lum = |x: usize, y: usize| -> f32 {
        let i = y * stride + x * channels;
        match src.layout {
            ChannelLayout::Rgba => luminance(src.pixels[i], src.pixels[i + 1], src.pixels[i + 2]),
            ChannelLayout::Luma => src.pixels[i] as f32,
        }
    };

    for (i, row) in dst.chunks_exact_mut(stride).enumerate() {
        let y = first_row + i;

        for x in 0..w {
            let edge = if y == 0 || y == h - 1 || x == 0 || x == w - 1 {
                0
            } else {
                let (tl, t, tr) = (lum(x - 1, y - 1), lum(x, y - 1), lum(x + 1, y - 1));
                let (l, r) = (lum(x - 1, y), lum(x + 1, y));
                let (bl, b, br) = (lum(x - 1, y + 1), lum(x, y + 1), lum(x + 1, y + 1));

                let gx = (tr + 2.0 * r + br) - (tl + 2.0 * l + bl);
                let gy = (bl + 2.0 * b + br) - (tl + 2.0 * t + tr);
                if (gx * gx + gy * gy).sqrt() > threshold {
                    255
                } else {
                    0
                }
            };

            let base = y * stride + x * channels;
            let out = &mut row[x * channels..(x + 1) * channels];
            match src.layout {
                ChannelLayout::Rgba => out.copy_from_slice(&[edge, edge, edge, src.pixels[base + 3]]),
                ChannelLayout::Luma => out[0] = edge,
            }
        }
    }
}
