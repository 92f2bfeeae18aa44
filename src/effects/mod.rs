//! Pixel effects shared by the CPU filter stage and the GPU shaders

mod kernels;
pub mod processor;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::error::Result;
use crate::frame::{NormalizedFrame, ProcessedFrame};
use crate::pipeline::pool::PooledBuffer;

pub use processor::{
    select_processor, AcceleratorKind, FrameProcessor, ParallelProcessor, ProcessorSelection,
    SoftwareProcessor,
};

/// Active pixel transform, set from the UI side
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EffectSelector {
    #[default]
    Identity,
    Grayscale,
    Invert,
    Sepia,
    /// Stretch color channels around mid-grey
    Contrast { factor: f32 },
    /// Box blur over a `(2 * radius + 1)` square window
    Blur { radius: u32 },
    /// Binary Sobel edge map. `threshold2` and `kernel_size` are carried for
    /// configuration compatibility; only `threshold1` drives the decision.
    EdgeDetect {
        threshold1: f32,
        threshold2: f32,
        kernel_size: u32,
    },
}

impl EffectSelector {
    pub const DEFAULT_CONTRAST: f32 = 1.5;
    pub const DEFAULT_BLUR_RADIUS: u32 = 2;

    pub fn edge_detect(threshold1: f32) -> Self {
        EffectSelector::EdgeDetect {
            threshold1,
            threshold2: 150.0,
            kernel_size: 3,
        }
    }

    pub fn kind(&self) -> EffectKind {
        match self {
            EffectSelector::Identity => EffectKind::Identity,
            EffectSelector::Grayscale => EffectKind::Grayscale,
            EffectSelector::Invert => EffectKind::Invert,
            EffectSelector::Sepia => EffectKind::Sepia,
            EffectSelector::Contrast { .. } => EffectKind::Contrast,
            EffectSelector::Blur { .. } => EffectKind::Blur,
            EffectSelector::EdgeDetect { .. } => EffectKind::EdgeDetect,
        }
    }
}

impl From<EffectKind> for EffectSelector {
    /// Selector with the stock parameters for `kind`.
    fn from(kind: EffectKind) -> Self {
        match kind {
            EffectKind::Identity => EffectSelector::Identity,
            EffectKind::Grayscale => EffectSelector::Grayscale,
            EffectKind::Invert => EffectSelector::Invert,
            EffectKind::Sepia => EffectSelector::Sepia,
            EffectKind::Contrast => EffectSelector::Contrast {
                factor: EffectSelector::DEFAULT_CONTRAST,
            },
            EffectKind::Blur => EffectSelector::Blur {
                radius: EffectSelector::DEFAULT_BLUR_RADIUS,
            },
            EffectKind::EdgeDetect => EffectSelector::edge_detect(50.0),
        }
    }
}

impl fmt::Display for EffectSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EffectSelector::Contrast { factor } => write!(f, "contrast:{factor}"),
            EffectSelector::Blur { radius } => write!(f, "blur:{radius}"),
            EffectSelector::EdgeDetect {
                threshold1,
                threshold2,
                kernel_size,
            } => write!(f, "edge:{threshold1}:{threshold2}:{kernel_size}"),
            other => f.write_str(other.kind().name()),
        }
    }
}

impl FromStr for EffectSelector {
    type Err = String;

    /// Parses `name[:param...]`, e.g. `blur:3` or `edge:50:150:3`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let name = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
        let params: Vec<&str> = parts.collect();

        fn num<T: FromStr>(raw: Option<&&str>, default: T, what: &str) -> std::result::Result<T, String> {
            match raw {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid {what}: {raw:?}")),
                None => Ok(default),
            }
        }

        let kind = EffectKind::ALL
            .into_iter()
            .find(|k| k.name() == name || (*k == EffectKind::EdgeDetect && name == "edge"))
            .ok_or_else(|| format!("unknown effect {name:?}"))?;

        let selector = match EffectSelector::from(kind) {
            EffectSelector::Contrast { factor } => EffectSelector::Contrast {
                factor: num(params.first(), factor, "contrast factor")?,
            },
            EffectSelector::Blur { radius } => EffectSelector::Blur {
                radius: num(params.first(), radius, "blur radius")?,
            },
            EffectSelector::EdgeDetect {
                threshold1,
                threshold2,
                kernel_size,
            } => EffectSelector::EdgeDetect {
                threshold1: num(params.first(), threshold1, "threshold1")?,
                threshold2: num(params.get(1), threshold2, "threshold2")?,
                kernel_size: num(params.get(2), kernel_size, "kernel size")?,
            },
            plain => plain,
        };
        Ok(selector)
    }
}

/// Parameter-free effect tag, used as the shader program key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectKind {
    Identity,
    Grayscale,
    Invert,
    Sepia,
    Contrast,
    Blur,
    EdgeDetect,
}

impl EffectKind {
    pub const ALL: [EffectKind; 7] = [
        EffectKind::Identity,
        EffectKind::Grayscale,
        EffectKind::Invert,
        EffectKind::Sepia,
        EffectKind::Contrast,
        EffectKind::Blur,
        EffectKind::EdgeDetect,
    ];

    pub fn name(self) -> &'static str {
        match self {
            EffectKind::Identity => "identity",
            EffectKind::Grayscale => "grayscale",
            EffectKind::Invert => "invert",
            EffectKind::Sepia => "sepia",
            EffectKind::Contrast => "contrast",
            EffectKind::Blur => "blur",
            EffectKind::EdgeDetect => "edge_detect",
        }
    }
}

impl fmt::Display for EffectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Apply `effect` into a caller-provided buffer of the frame's size.
pub fn apply_into(effect: &EffectSelector, frame: &NormalizedFrame, out: &mut [u8]) -> Result<()> {
    kernels::validate(effect, frame, out.len())?;
    kernels::apply_rows(effect, frame, out, 0);
    Ok(())
}

/// Apply `effect`, allocating exactly one output buffer.
#[instrument(skip(frame), fields(seq = frame.sequence, w = frame.width, h = frame.height))]
pub fn apply(effect: &EffectSelector, frame: &NormalizedFrame) -> Result<ProcessedFrame> {
    let mut pixels = vec![0u8; frame.pixels.len()];
    apply_into(effect, frame, &mut pixels)?;
    Ok(processed_from(frame, pixels.into(), effect.kind()))
}

pub(crate) fn processed_from(
    src: &NormalizedFrame,
    pixels: PooledBuffer,
    effect: EffectKind,
) -> ProcessedFrame {
    ProcessedFrame {
        pixels,
        width: src.width,
        height: src.height,
        layout: src.layout,
        generation: src.sequence,
        timestamp: src.timestamp,
        effect,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;

    fn gradient(width: u32, height: u32) -> NormalizedFrame {
        let pixels = (0..width * height)
            .flat_map(|i| {
                let v = (i * 37 % 256) as u8;
                [v, v.wrapping_mul(3), 255 - v, (i % 7 * 30) as u8]
            })
            .collect();
        NormalizedFrame::rgba(pixels, width, height)
    }

    #[test]
    fn identity_copies_bytes() {
        let frame = gradient(5, 4);
        let out = apply(&EffectSelector::Identity, &frame).unwrap();
        assert_eq!(out.pixels, frame.pixels);
        assert_eq!(out.dims(), frame.dims());
    }

    #[test]
    fn invert_is_involutive() {
        let frame = gradient(6, 3);
        let once = apply(&EffectSelector::Invert, &frame).unwrap();
        let twice = apply(
            &EffectSelector::Invert,
            &NormalizedFrame::rgba(once.pixels.to_vec(), 6, 3),
        )
        .unwrap();
        assert_eq!(twice.pixels, frame.pixels);
    }

    #[test]
    fn grayscale_is_idempotent() {
        let frame = gradient(7, 5);
        let once = apply(&EffectSelector::Grayscale, &frame).unwrap();
        let twice = apply(
            &EffectSelector::Grayscale,
            &NormalizedFrame::rgba(once.pixels.to_vec(), 7, 5),
        )
        .unwrap();
        assert_eq!(twice.pixels, once.pixels);
    }

    #[test]
    fn grayscale_keeps_alpha() {
        let frame = NormalizedFrame::rgba(vec![255, 0, 0, 77], 1, 1);
        let out = apply(&EffectSelector::Grayscale, &frame).unwrap();
        assert_eq!(&out.pixels[..], &[76, 76, 76, 77]);
    }

    #[test]
    fn sepia_clamps_bright_pixels() {
        let frame = NormalizedFrame::rgba(vec![255, 255, 255, 255, 10, 20, 30, 255], 2, 1);
        let out = apply(&EffectSelector::Sepia, &frame).unwrap();
        assert_eq!(&out.pixels[..4], &[255, 255, 239, 255]);
        // 0.393*10 + 0.769*20 + 0.189*30 = 24.98
        assert_eq!(out.pixels[4], 25);
    }

    #[test]
    fn contrast_pushes_away_from_mid_grey() {
        let frame = NormalizedFrame::luma(vec![100, 128, 200], 3, 1);
        let out = apply(&EffectSelector::Contrast { factor: 2.0 }, &frame).unwrap();
        assert_eq!(&out.pixels[..], &[72, 128, 255]);
    }

    #[test]
    fn blur_of_flat_field_is_flat() {
        let frame = NormalizedFrame::rgba([9u8, 90, 180, 255].repeat(16), 4, 4);
        let out = apply(&EffectSelector::Blur { radius: 2 }, &frame).unwrap();
        assert_eq!(out.pixels, frame.pixels);
    }

    #[test]
    fn blur_clamps_at_the_edges() {
        // Single bright pixel in the corner of a 3x1 strip, radius 1:
        // corner window samples [255, 255, 0] per row (clamped), 3 rows.
        let frame = NormalizedFrame::luma(vec![255, 0, 0], 3, 1);
        let out = apply(&EffectSelector::Blur { radius: 1 }, &frame).unwrap();
        assert_eq!(&out.pixels[..], &[170, 85, 0]);
    }

    #[test]
    fn blur_radius_wider_than_frame_folds_onto_edges() {
        // radius 2 over [255, 0]: left window is 3 of 5 taps bright, right 2 of 5.
        let frame = NormalizedFrame::luma(vec![255, 0], 2, 1);
        let out = apply(&EffectSelector::Blur { radius: 2 }, &frame).unwrap();
        assert_eq!(&out.pixels[..], &[153, 102]);
    }

    #[test]
    fn blur_window_sums_do_not_overflow() {
        // (2 * 2100 + 1)^2 * 255 is past u32::MAX.
        let frame = NormalizedFrame::luma(vec![255; 2100], 2100, 1);
        let out = apply(&EffectSelector::Blur { radius: 2100 }, &frame).unwrap();
        assert!(out.pixels.iter().all(|&p| p == 255));
    }

    #[test]
    fn blur_radius_beyond_frame_is_rejected() {
        let frame = NormalizedFrame::luma(vec![255], 1, 1);
        assert!(matches!(
            apply(&EffectSelector::Blur { radius: 3000 }, &frame),
            Err(PipelineError::DimensionMismatch(_))
        ));
    }

    #[test]
    fn edge_detect_flat_field_is_black() {
        let frame = NormalizedFrame::luma(vec![255; 16], 4, 4);
        let out = apply(&EffectSelector::edge_detect(10.0), &frame).unwrap();
        assert!(out.pixels.iter().all(|&p| p == 0));

        let frame = NormalizedFrame::rgba(vec![255; 64], 4, 4);
        let out = apply(&EffectSelector::edge_detect(10.0), &frame).unwrap();
        assert!(out.pixels.chunks_exact(4).all(|px| px[..3] == [0, 0, 0]));
    }

    #[test]
    fn edge_detect_marks_checker_corner() {
        // 2-pixel checker cells cropped to 3x3; the interior pixel sits on a
        // corner where all four cells meet.
        #[rustfmt::skip]
        let luma = vec![
            255, 255, 0,
            255, 255, 0,
            0,   0,   255,
        ];
        let frame = NormalizedFrame::luma(luma, 3, 3);
        let out = apply(&EffectSelector::edge_detect(0.0), &frame).unwrap();
        assert_eq!(&out.pixels[..], &[0, 0, 0, 0, 255, 0, 0, 0, 0]);
    }

    #[test]
    fn edge_detect_threshold_is_strict() {
        // Vertical step of 10: gx = 4 * 10 = 40 at the interior pixel.
        #[rustfmt::skip]
        let luma = vec![
            0, 0, 10,
            0, 0, 10,
            0, 0, 10,
        ];
        let frame = NormalizedFrame::luma(luma, 3, 3);
        let at = |t: f32| apply(&EffectSelector::edge_detect(t), &frame).unwrap().pixels[4];
        assert_eq!(at(39.0), 255);
        assert_eq!(at(40.0), 0);
    }

    #[test]
    fn inert_edge_parameters_do_not_change_output() {
        let frame = gradient(6, 6);
        let a = apply(&EffectSelector::edge_detect(30.0), &frame).unwrap();
        let b = apply(
            &EffectSelector::EdgeDetect {
                threshold1: 30.0,
                threshold2: 10.0,
                kernel_size: 7,
            },
            &frame,
        )
        .unwrap();
        assert_eq!(a.pixels, b.pixels);
    }

    #[test]
    fn geometry_errors() {
        let empty = NormalizedFrame::rgba(vec![], 0, 4);
        assert!(matches!(
            apply(&EffectSelector::Invert, &empty),
            Err(PipelineError::DimensionMismatch(_))
        ));

        let short = NormalizedFrame::rgba(vec![0; 12], 2, 2);
        assert!(matches!(
            apply(&EffectSelector::Invert, &short),
            Err(PipelineError::DimensionMismatch(_))
        ));

        let strip = NormalizedFrame::luma(vec![0; 8], 4, 2);
        assert!(matches!(
            apply(&EffectSelector::edge_detect(1.0), &strip),
            Err(PipelineError::DimensionMismatch(_))
        ));
    }

    #[test]
    fn input_is_untouched() {
        let frame = gradient(4, 4);
        let copy = frame.pixels.clone();
        for kind in EffectKind::ALL {
            apply(&EffectSelector::from(kind), &frame).unwrap();
        }
        assert_eq!(frame.pixels, copy);
    }

    #[test]
    fn parses_cli_selectors() {
        assert_eq!("sepia".parse(), Ok(EffectSelector::Sepia));
        assert_eq!("blur:4".parse(), Ok(EffectSelector::Blur { radius: 4 }));
        assert_eq!(
            "edge:20".parse(),
            Ok(EffectSelector::EdgeDetect {
                threshold1: 20.0,
                threshold2: 150.0,
                kernel_size: 3
            })
        );
        assert!("sharpen".parse::<EffectSelector>().is_err());
        assert!("blur:x".parse::<EffectSelector>().is_err());

        let round_trip: EffectSelector = EffectSelector::Contrast { factor: 1.25 }.to_string().parse().unwrap();
        assert_eq!(round_trip, EffectSelector::Contrast { factor: 1.25 });
    }
}
