use super::{normalized_gradient, Optimizer};
use crate::math::Matrix;
use crate::tensor::WeightTensor;

/// Adam with bias correction. First moments live in each tensor's `moment`
/// plane, second moments in `cache`.
pub struct Adam {
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    pub weight_decay: f32,
    pub clip: f32,
    step: u32,
}

impl Adam {
    pub fn new(beta1: f32, beta2: f32, eps: f32, weight_decay: f32, clip: f32) -> Self {
        Self {
            beta1,
            beta2,
            eps,
            weight_decay,
            clip,
            step: 0,
        }
    }

    pub fn step_count(&self) -> u32 {
        self.step
    }
}

impl Optimizer for Adam {
    fn begin_update(&mut self) {
        self.step += 1;
    }

    fn update_tensor(&self, t: &mut WeightTensor, normalizer: f32, lr: f32) {
        if t.moment.data.len() != t.weight.data.len() {
            t.moment = Matrix::zeros(t.rows(), t.cols());
        }
        let step = self.step.max(1) as i32;
        let bc1 = 1.0 - self.beta1.powi(step);
        let bc2 = 1.0 - self.beta2.powi(step);
        let WeightTensor {
            weight,
            gradient,
            cache,
            moment,
            ..
        } = t;
        for (((w, &g), v), m) in weight
            .data
            .iter_mut()
            .zip(&gradient.data)
            .zip(cache.data.iter_mut())
            .zip(moment.data.iter_mut())
        {
            let g = normalized_gradient(g, normalizer, self.clip);
            *m = self.beta1 * *m + (1.0 - self.beta1) * g;
            *v = self.beta2 * *v + (1.0 - self.beta2) * g * g;
            let m_hat = *m / bc1;
            let v_hat = *v / bc2;
            *w -= lr * m_hat / (v_hat.sqrt() + self.eps) + self.weight_decay * *w;
        }
    }

    fn reset(&mut self) {
        self.step = 0;
    }
}
