use rand::Rng;

use super::layer::Layer;
use crate::autograd::{ComputeGraph, NodeId};
use crate::tensor::{ParamBuilder, ParamId};

/// Multi-head scaled dot-product self-attention with a residual connection
/// and layer normalization on the output.
#[derive(Clone, Debug)]
pub struct MultiHeadAttention {
    wq: ParamId,
    bq: ParamId,
    wk: ParamId,
    bk: ParamId,
    wv: ParamId,
    bv: ParamId,
    wo: ParamId,
    bo: ParamId,
    gain: ParamId,
    bias: ParamId,
    heads: usize,
    dim: usize,
}

impl MultiHeadAttention {
    /// `dim` must be divisible by `heads`.
    pub fn new<R: Rng>(builder: &mut ParamBuilder<'_, R>, name: &str, dim: usize, heads: usize) -> Self {
        Self {
            wq: builder.normal(&format!("{name}.Q"), dim, dim),
            bq: builder.zeros(&format!("{name}.Qb"), 1, dim),
            wk: builder.normal(&format!("{name}.K"), dim, dim),
            bk: builder.zeros(&format!("{name}.Kb"), 1, dim),
            wv: builder.normal(&format!("{name}.V"), dim, dim),
            bv: builder.zeros(&format!("{name}.Vb"), 1, dim),
            wo: builder.normal(&format!("{name}.W0"), dim, dim),
            bo: builder.zeros(&format!("{name}.b0"), 1, dim),
            gain: builder.ones(&format!("{name}.norm.gain"), 1, dim),
            bias: builder.zeros(&format!("{name}.norm.bias"), 1, dim),
            heads,
            dim,
        }
    }

    /// `x` is batch-major `[batch * seq_len, dim]`. Every sequence attends
    /// only to its own positions.
    pub fn perform(&self, g: &mut ComputeGraph<'_>, x: NodeId, batch: usize, dropout: f32) -> NodeId {
        g.with_scope("self_attention", |g| {
            let (rows, _) = g.shape(x);
            let seq = rows / batch;
            let head_dim = self.dim / self.heads;
            let scale = 1.0 / (head_dim as f32).sqrt();

            let q = g.affine(x, self.wq, self.bq);
            let k = g.affine(x, self.wk, self.bk);
            let v = g.affine(x, self.wv, self.bv);

            let mut per_batch = Vec::with_capacity(batch);
            for b in 0..batch {
                let qb = g.slice_rows(q, b * seq, seq);
                let kb = g.slice_rows(k, b * seq, seq);
                let vb = g.slice_rows(v, b * seq, seq);
                let mut per_head = Vec::with_capacity(self.heads);
                for h in 0..self.heads {
                    let qh = g.slice_cols(qb, h * head_dim, head_dim);
                    let kh = g.slice_cols(kb, h * head_dim, head_dim);
                    let vh = g.slice_cols(vb, h * head_dim, head_dim);
                    let kt = g.transpose(kh);
                    let scores = g.matmul(qh, kt);
                    let scores = g.scale(scores, scale);
                    let attn = g.softmax(scores);
                    per_head.push(g.matmul(attn, vh));
                }
                per_batch.push(g.concat_cols(&per_head));
            }
            let ctx = g.concat_rows(&per_batch);
            let out = g.affine(ctx, self.wo, self.bo);
            let out = g.dropout(out, dropout);
            let res = g.add(x, out);
            g.layer_norm(res, self.gain, self.bias)
        })
    }
}

impl Layer for MultiHeadAttention {
    fn params(&self) -> Vec<ParamId> {
        vec![
            self.wq, self.bq, self.wk, self.bk, self.wv, self.bv, self.wo, self.bo, self.gain,
            self.bias,
        ]
    }
}
