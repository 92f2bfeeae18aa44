pub mod control;
pub mod governor;
pub mod pool;
pub mod slot;
pub mod status;
pub mod worker;

pub use control::{EffectControl, FilterStage};
pub use governor::{FpsCounter, RateGovernor};
pub use pool::{FramePool, PooledBuffer};
pub use slot::{FrameSlot, SlotStats};
pub use status::{LogSink, StatusSink, StatusUpdate};
pub use worker::{CaptureWorker, PipelineStats, Step};
