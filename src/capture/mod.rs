pub mod frame;
pub mod normalize;
pub mod source;
pub mod v4l2;

pub use frame::{FrameLease, PixelFormat, Plane, RawFrame, Rotation};
pub use normalize::{normalize, normalize_as, normalize_into, NormalizePlan};
pub use source::{FrameSource, SyntheticSource};
pub use v4l2::V4l2Source;
