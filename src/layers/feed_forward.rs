use rand::Rng;

use super::layer::Layer;
use crate::autograd::{ComputeGraph, NodeId};
use crate::tensor::{ParamBuilder, ParamId};

/// Single affine projection, used as the decoder's vocabulary output layer.
#[derive(Clone, Debug)]
pub struct FeedForwardLayer {
    w: ParamId,
    b: ParamId,
}

impl FeedForwardLayer {
    pub fn new<R: Rng>(builder: &mut ParamBuilder<'_, R>, name: &str, input: usize, output: usize) -> Self {
        Self {
            w: builder.normal(&format!("{name}.W"), input, output),
            b: builder.zeros(&format!("{name}.b"), 1, output),
        }
    }

    pub fn process(&self, g: &mut ComputeGraph<'_>, x: NodeId) -> NodeId {
        g.affine(x, self.w, self.b)
    }
}

impl Layer for FeedForwardLayer {
    fn params(&self) -> Vec<ParamId> {
        vec![self.w, self.b]
    }
}

/// Transformer sub-layer: `LayerNorm(x + W2 relu(W1 x + b1) + b2)`.
#[derive(Clone, Debug)]
pub struct PositionwiseFeedForward {
    w1: ParamId,
    b1: ParamId,
    w2: ParamId,
    b2: ParamId,
    gain: ParamId,
    bias: ParamId,
}

impl PositionwiseFeedForward {
    pub fn new<R: Rng>(builder: &mut ParamBuilder<'_, R>, name: &str, dim: usize, inner: usize) -> Self {
        Self {
            w1: builder.normal(&format!("{name}.W1"), dim, inner),
            b1: builder.zeros(&format!("{name}.b1"), 1, inner),
            w2: builder.normal(&format!("{name}.W2"), inner, dim),
            b2: builder.zeros(&format!("{name}.b2"), 1, dim),
            gain: builder.ones(&format!("{name}.norm.gain"), 1, dim),
            bias: builder.zeros(&format!("{name}.norm.bias"), 1, dim),
        }
    }

    pub fn process(&self, g: &mut ComputeGraph<'_>, x: NodeId, dropout: f32) -> NodeId {
        g.with_scope("ffn", |g| {
            let h = g.affine(x, self.w1, self.b1);
            let h = g.relu(h);
            let out = g.affine(h, self.w2, self.b2);
            let out = g.dropout(out, dropout);
            let res = g.add(x, out);
            g.layer_norm(res, self.gain, self.bias)
        })
    }
}

impl Layer for PositionwiseFeedForward {
    fn params(&self) -> Vec<ParamId> {
        vec![self.w1, self.b1, self.w2, self.b2, self.gain, self.bias]
    }
}
