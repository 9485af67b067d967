use super::{normalized_gradient, Optimizer};
use crate::tensor::WeightTensor;

/// RMSProp with gradient clipping and L2 shrinkage. The running average of
/// squared gradients lives in each tensor's `cache`.
pub struct RmsProp {
    pub decay: f32,
    pub eps: f32,
    pub regc: f32,
    pub clip: f32,
}

impl RmsProp {
    pub fn new(decay: f32, eps: f32, regc: f32, clip: f32) -> Self {
        Self {
            decay,
            eps,
            regc,
            clip,
        }
    }
}

impl Optimizer for RmsProp {
    fn update_tensor(&self, t: &mut WeightTensor, normalizer: f32, lr: f32) {
        let WeightTensor {
            weight,
            gradient,
            cache,
            ..
        } = t;
        for ((w, &g), c) in weight
            .data
            .iter_mut()
            .zip(&gradient.data)
            .zip(cache.data.iter_mut())
        {
            let g = normalized_gradient(g, normalizer, self.clip);
            *c = self.decay * *c + (1.0 - self.decay) * g * g;
            *w -= lr * g / (c.sqrt() + self.eps) + self.regc * *w;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Matrix;

    #[test]
    fn step_moves_against_gradient_and_clips() {
        let mut t = WeightTensor::new("w", Matrix::from_vec(1, 2, vec![1.0, 1.0]), 0, true);
        t.gradient = Matrix::from_vec(1, 2, vec![2.0, -100.0]);
        let opt = RmsProp::new(0.999, 1e-10, 0.0, 3.0);
        opt.update_tensor(&mut t, 2.0, 0.01);
        assert!(t.weight.data[0] < 1.0);
        assert!(t.weight.data[1] > 1.0);
        // clipped gradient -3 gives cache 0.001 * 9
        assert!((t.cache.data[1] - 0.009).abs() < 1e-6);
    }
}
