pub mod adam;
pub mod lr_scheduler;
pub mod rmsprop;

pub use adam::Adam;
pub use lr_scheduler::{ConstantLr, LearningRateSchedule, LrScheduleConfig, WarmupDecayLr};
pub use rmsprop::RmsProp;

use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::tensor::WeightTensor;

/// Per-tensor update rule. Implementations keep their running statistics in
/// the tensor's `cache`/`moment` planes so one optimizer value can update
/// tensors from several devices concurrently.
pub trait Optimizer: Send + Sync {
    /// Called once per update, before any tensor is touched.
    fn begin_update(&mut self) {}

    /// Applies one update to `t` from its accumulated gradient, which was
    /// summed over `normalizer` target tokens.
    fn update_tensor(&self, t: &mut WeightTensor, normalizer: f32, lr: f32);

    /// Forgets accumulated statistics of the optimizer itself. Tensor caches
    /// are reset by the caller.
    fn reset(&mut self) {}

    /// Updates every trainable tensor in `tensors`, grouped by owning device
    /// with the groups processed in parallel.
    fn update_weights(&mut self, tensors: Vec<&mut WeightTensor>, batch_size: usize, lr: f32) {
        self.begin_update();
        let normalizer = batch_size.max(1) as f32;
        let mut by_device: BTreeMap<usize, Vec<&mut WeightTensor>> = BTreeMap::new();
        for t in tensors.into_iter().filter(|t| t.trainable) {
            by_device.entry(t.device_id).or_default().push(t);
        }
        let this: &Self = self;
        by_device
            .into_values()
            .collect::<Vec<_>>()
            .into_par_iter()
            .for_each(|group| {
                for t in group {
                    this.update_tensor(t, normalizer, lr);
                }
            });
    }

    /// Clears every tensor's optimizer state, e.g. at the start of an epoch.
    fn clean_cache(&mut self, tensors: Vec<&mut WeightTensor>) {
        self.reset();
        tensors.into_iter().for_each(WeightTensor::clean_cache);
    }
}

/// Gradient divided by the normalizer and clipped to `[-clip, clip]`.
#[inline]
pub(crate) fn normalized_gradient(g: f32, normalizer: f32, clip: f32) -> f32 {
    (g / normalizer).clamp(-clip, clip)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    #[default]
    RmsProp,
    Adam,
}

/// Hyperparameters shared by the optimizer implementations.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OptimizerParams {
    pub clip: f32,
    pub regc: f32,
    pub eps: f32,
    pub rmsprop_decay: f32,
    pub beta1: f32,
    pub beta2: f32,
}

impl Default for OptimizerParams {
    fn default() -> Self {
        Self {
            clip: 3.0,
            regc: 1e-10,
            eps: 1e-10,
            rmsprop_decay: 0.999,
            beta1: 0.9,
            beta2: 0.98,
        }
    }
}

impl OptimizerKind {
    pub fn build(self, p: OptimizerParams) -> Box<dyn Optimizer> {
        match self {
            OptimizerKind::RmsProp => Box::new(RmsProp::new(p.rmsprop_decay, p.eps, p.regc, p.clip)),
            OptimizerKind::Adam => Box::new(Adam::new(p.beta1, p.beta2, p.eps, p.regc, p.clip)),
        }
    }
}
