use serde::{Deserialize, Serialize};

pub trait LearningRateSchedule: Send + Sync {
    /// Learning rate for 1-based update `step`.
    fn next_lr(&self, step: usize) -> f32;
}

pub struct ConstantLr {
    lr: f32,
}

impl ConstantLr {
    pub fn new(lr: f32) -> Self {
        Self { lr }
    }
}

impl LearningRateSchedule for ConstantLr {
    fn next_lr(&self, _step: usize) -> f32 {
        self.lr
    }
}

/// Linear warm-up to `start_lr` over `warmup_steps`, then inverse square
/// root decay.
pub struct WarmupDecayLr {
    start_lr: f32,
    warmup_steps: usize,
}

impl WarmupDecayLr {
    pub fn new(start_lr: f32, warmup_steps: usize) -> Self {
        Self {
            start_lr,
            warmup_steps: warmup_steps.max(1),
        }
    }
}

impl LearningRateSchedule for WarmupDecayLr {
    fn next_lr(&self, step: usize) -> f32 {
        let step = step.max(1) as f32;
        let warmup = self.warmup_steps as f32;
        let factor = step.powf(-0.5).min(step * warmup.powf(-1.5));
        self.start_lr * factor / warmup.powf(-0.5)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrScheduleConfig {
    Constant,
    #[default]
    WarmupDecay,
}

impl LrScheduleConfig {
    pub fn build(self, start_lr: f32, warmup_steps: usize) -> Box<dyn LearningRateSchedule> {
        match self {
            LrScheduleConfig::Constant => Box::new(ConstantLr::new(start_lr)),
            LrScheduleConfig::WarmupDecay => Box::new(WarmupDecayLr::new(start_lr, warmup_steps)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warmup_peaks_at_start_lr() {
        let s = WarmupDecayLr::new(0.001, 100);
        assert!(s.next_lr(1) < s.next_lr(50));
        assert!((s.next_lr(100) - 0.001).abs() < 1e-9);
        assert!(s.next_lr(400) < s.next_lr(100));
        assert!((s.next_lr(400) - 0.0005).abs() < 1e-8);
    }

    #[test]
    fn constant_ignores_step() {
        let s = LrScheduleConfig::Constant.build(0.1, 10);
        assert_eq!(s.next_lr(1), s.next_lr(1000));
    }
}
