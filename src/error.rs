use thiserror::Error;

/// Errors raised by the capture, processing and presentation stages.
///
/// Every variant is recoverable: per-frame failures drop the frame, shader
/// failures keep the previous program, and resource failures pause rendering
/// until the surface is recreated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// Raw frame planes don't match the declared pixel format.
    #[error("unrecognized or incomplete raw frame: {0}")]
    Format(String),

    #[error("unsupported rotation: {0} degrees")]
    UnsupportedRotation(u32),

    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("shader program for {effect} failed to link: {message}")]
    ShaderLink { effect: String, message: String },

    /// Accelerator or GPU context missing.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("capture device error: {0}")]
    Capture(String),
}

impl PipelineError {
    /// Errors that only affect the frame being processed.
    pub fn is_per_frame(&self) -> bool {
        matches!(
            self,
            PipelineError::Format(_)
                | PipelineError::UnsupportedRotation(_)
                | PipelineError::DimensionMismatch(_)
        )
    }
}

/// Convenience Result alias.
pub type Result<T> = std::result::Result<T, PipelineError>;
