//! Non-fatal status updates flowing out of the pipeline to the UI side

use std::fmt;

use tracing::{info, warn};

use crate::error::PipelineError;

#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    /// Rolling frames-per-second of processed frames
    Fps(f32),
    FrameDropped { sequence: u64, reason: PipelineError },
    /// Requested accelerator missing, software processing in use
    AcceleratorFallback(PipelineError),
    /// Shader swap failed, previous program still drawing
    ShaderFallback(PipelineError),
    /// GPU context gone; rendering resumes once the surface is recreated
    RenderPaused(PipelineError),
    /// Capture source finished or failed for good
    SourceStopped(String),
}

impl fmt::Display for StatusUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusUpdate::Fps(fps) => write!(f, "{fps:.1} fps"),
            StatusUpdate::FrameDropped { sequence, reason } => {
                write!(f, "frame {sequence} dropped: {reason}")
            }
            StatusUpdate::AcceleratorFallback(e) => write!(f, "software processing: {e}"),
            StatusUpdate::ShaderFallback(e) => write!(f, "keeping previous shader: {e}"),
            StatusUpdate::RenderPaused(e) => write!(f, "rendering paused: {e}"),
            StatusUpdate::SourceStopped(why) => write!(f, "capture stopped: {why}"),
        }
    }
}

/// Receiver for pipeline status, implemented by the UI collaborator.
///
/// Called from the capture and render threads; implementations must not
/// block.
pub trait StatusSink: Send + Sync {
    fn publish(&self, update: StatusUpdate);
}

/// Writes status updates to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl StatusSink for LogSink {
    fn publish(&self, update: StatusUpdate) {
        match &update {
            StatusUpdate::Fps(_) => info!("{}", update),
            _ => warn!("{}", update),
        }
    }
}

/// Forwards updates over a channel; drops them when the receiver lags.
impl StatusSink for flume::Sender<StatusUpdate> {
    fn publish(&self, update: StatusUpdate) {
        if self.try_send(update).is_err() {
            metrics::counter!("status_updates_dropped").increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_sink_never_blocks() {
        let (tx, rx) = flume::bounded(1);
        tx.publish(StatusUpdate::Fps(30.0));
        tx.publish(StatusUpdate::Fps(31.0));
        assert_eq!(rx.try_recv(), Ok(StatusUpdate::Fps(30.0)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn display_is_human_readable() {
        let update = StatusUpdate::FrameDropped {
            sequence: 4,
            reason: PipelineError::UnsupportedRotation(45),
        };
        assert_eq!(update.to_string(), "frame 4 dropped: unsupported rotation: 45 degrees");
        assert_eq!(StatusUpdate::Fps(29.96).to_string(), "30.0 fps");
    }
}
