pub mod presenter;

#[cfg(feature = "gpu-display")]
pub mod app;
#[cfg(feature = "gpu-display")]
pub mod gpu;

pub use presenter::{DrawOutcome, EffectParams, GpuPresenter, PresenterState, RenderBackend};

#[cfg(feature = "gpu-display")]
pub use app::{DisplayApp, UserEvent};
#[cfg(feature = "gpu-display")]
pub use gpu::WgpuBackend;
