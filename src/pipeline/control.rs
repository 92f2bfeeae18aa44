use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::effects::{EffectKind, EffectSelector};

/// Where the selected effect runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FilterStage {
    /// Effect baked into the frame on the capture thread
    #[default]
    Cpu,
    /// Frame published unfiltered, effect applied by the presenter's shader
    Gpu,
}

impl FilterStage {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => FilterStage::Gpu,
            _ => FilterStage::Cpu,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            FilterStage::Cpu => 0,
            FilterStage::Gpu => 1,
        }
    }
}

/// Effect selection shared between the UI and both pipeline threads.
///
/// Readers get a consistent snapshot without locking; only the UI writes.
pub struct EffectControl {
    effect: ArcSwap<EffectSelector>,
    stage: AtomicU8,
}

impl EffectControl {
    pub fn new(effect: EffectSelector, stage: FilterStage) -> Self {
        Self {
            effect: ArcSwap::from_pointee(effect),
            stage: AtomicU8::new(stage.as_u8()),
        }
    }

    pub fn effect(&self) -> EffectSelector {
        **self.effect.load()
    }

    pub fn set_effect(&self, effect: EffectSelector) {
        info!("Effect set to {}", effect);
        self.effect.store(Arc::new(effect));
    }

    pub fn filter_stage(&self) -> FilterStage {
        FilterStage::from_u8(self.stage.load(Ordering::Acquire))
    }

    pub fn set_filter_stage(&self, stage: FilterStage) {
        info!("Filter stage set to {:?}", stage);
        self.stage.store(stage.as_u8(), Ordering::Release);
    }

    /// Flip between CPU and GPU filtering, returning the new stage.
    pub fn toggle_filter_stage(&self) -> FilterStage {
        let next = match self.filter_stage() {
            FilterStage::Cpu => FilterStage::Gpu,
            FilterStage::Gpu => FilterStage::Cpu,
        };
        self.set_filter_stage(next);
        next
    }

    /// Effect the capture thread should bake in for the current stage.
    pub fn cpu_effect(&self) -> EffectSelector {
        match self.filter_stage() {
            FilterStage::Cpu => self.effect(),
            FilterStage::Gpu => EffectSelector::Identity,
        }
    }

    /// Effect the presenter should run for a frame that already carries
    /// `baked` from the CPU stage.
    pub fn gpu_effect(&self, baked: EffectKind) -> EffectSelector {
        if baked != EffectKind::Identity {
            return EffectSelector::Identity;
        }
        match self.filter_stage() {
            FilterStage::Gpu => self.effect(),
            FilterStage::Cpu => EffectSelector::Identity,
        }
    }
}

impl Default for EffectControl {
    fn default() -> Self {
        Self::new(EffectSelector::Identity, FilterStage::Cpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_decides_where_the_effect_runs() {
        let control = EffectControl::new(EffectSelector::Sepia, FilterStage::Cpu);
        assert_eq!(control.cpu_effect(), EffectSelector::Sepia);
        assert_eq!(control.gpu_effect(EffectKind::Sepia), EffectSelector::Identity);

        assert_eq!(control.toggle_filter_stage(), FilterStage::Gpu);
        assert_eq!(control.cpu_effect(), EffectSelector::Identity);
        assert_eq!(control.gpu_effect(EffectKind::Identity), EffectSelector::Sepia);
    }

    #[test]
    fn frames_filtered_before_a_toggle_are_not_filtered_twice() {
        let control = EffectControl::new(EffectSelector::Invert, FilterStage::Gpu);
        // A frame baked on the CPU just before the switch to GPU filtering.
        assert_eq!(control.gpu_effect(EffectKind::Invert), EffectSelector::Identity);
    }

    #[test]
    fn setters_replace_snapshot() {
        let control = EffectControl::default();
        control.set_effect(EffectSelector::Blur { radius: 3 });
        assert_eq!(control.effect(), EffectSelector::Blur { radius: 3 });
        control.set_filter_stage(FilterStage::Gpu);
        assert_eq!(control.filter_stage(), FilterStage::Gpu);
    }
}
