//! Additive attention over encoder outputs with an optional coverage model.
//!
//! Encoder outputs arrive time-major (`row = t * batch + b`). [`AttentionUnit::pre_process`]
//! moves them to batch-major layout once per source and precomputes the key
//! projection; [`AttentionUnit::perform`] is then called once per decoder step.

use rand::Rng;

use super::layer::Layer;
use super::lstm::{CellState, LstmCell};
use crate::autograd::{ComputeGraph, NodeId};
use crate::tensor::{ParamBuilder, ParamId};

/// Width of the coverage cell's hidden state.
pub const COVERAGE_DIM: usize = 8;

/// Result of [`AttentionUnit::pre_process`], reused by every decoder step
/// over the same source batch.
#[derive(Clone, Copy, Debug)]
pub struct AttentionPreProcessResult {
    /// Projected keys `[batch * src_len, hidden]`, batch-major.
    pub uhs: NodeId,
    /// Encoder outputs `[batch * src_len, context]`, batch-major.
    pub inputs: NodeId,
    pub batch_size: usize,
    pub src_len: usize,
}

/// Output of one attention step.
#[derive(Clone, Copy, Debug)]
pub struct AttentionOutput {
    /// `[batch, context]`
    pub context: NodeId,
    /// `[batch, src_len]`, each row a probability distribution.
    pub weights: NodeId,
}

#[derive(Clone, Debug)]
struct Coverage {
    wc: ParamId,
    bwc: ParamId,
    cell: LstmCell,
}

#[derive(Clone, Debug)]
pub struct AttentionUnit {
    ua: ParamId,
    wa: ParamId,
    bua: ParamId,
    bwa: ParamId,
    v: ParamId,
    coverage: Option<Coverage>,
    hidden_dim: usize,
    context_dim: usize,
}

impl AttentionUnit {
    /// `hidden_dim` is the width of the decoder state attended from,
    /// `context_dim` the width of one encoder output row.
    pub fn new<R: Rng>(
        builder: &mut ParamBuilder<'_, R>,
        name: &str,
        hidden_dim: usize,
        context_dim: usize,
        enable_coverage: bool,
    ) -> Self {
        let ua = builder.normal(&format!("{name}.Ua"), context_dim, hidden_dim);
        let wa = builder.normal(&format!("{name}.Wa"), hidden_dim, hidden_dim);
        let bua = builder.zeros(&format!("{name}.bUa"), 1, hidden_dim);
        let bwa = builder.zeros(&format!("{name}.bWa"), 1, hidden_dim);
        let v = builder.normal(&format!("{name}.V"), hidden_dim, 1);
        let coverage = enable_coverage.then(|| Coverage {
            wc: builder.normal(&format!("{name}.Wc"), COVERAGE_DIM, hidden_dim),
            bwc: builder.zeros(&format!("{name}.bWc"), 1, hidden_dim),
            cell: LstmCell::new(
                builder,
                &format!("{name}.coverage"),
                1 + context_dim + hidden_dim,
                COVERAGE_DIM,
            ),
        });
        Self {
            ua,
            wa,
            bua,
            bwa,
            v,
            coverage,
            hidden_dim,
            context_dim,
        }
    }

    pub fn has_coverage(&self) -> bool {
        self.coverage.is_some()
    }

    pub fn context_dim(&self) -> usize {
        self.context_dim
    }

    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    /// Batch-major encoder outputs and their key projection. The source
    /// length is `rows / batch_size`; callers pad so this divides exactly.
    pub fn pre_process(
        &self,
        g: &mut ComputeGraph<'_>,
        encoder_output: NodeId,
        batch_size: usize,
    ) -> AttentionPreProcessResult {
        g.with_scope("attention_pre", |g| {
            let (rows, _) = g.shape(encoder_output);
            let src_len = rows / batch_size;
            let inputs = g.transpose_batch(encoder_output, batch_size);
            let uhs = g.affine(inputs, self.ua, self.bua);
            AttentionPreProcessResult {
                uhs,
                inputs,
                batch_size,
                src_len,
            }
        })
    }

    /// Fresh coverage state for the `batch * src_len` source positions of
    /// `pre`, or `None` when coverage is disabled.
    pub fn reset_coverage(
        &self,
        g: &mut ComputeGraph<'_>,
        pre: &AttentionPreProcessResult,
    ) -> Option<CellState> {
        self.coverage
            .as_ref()
            .map(|cov| cov.cell.zero_state(g, pre.batch_size * pre.src_len))
    }

    /// Attends from `state` (`[batch, hidden]`) over the preprocessed
    /// source. Advances `coverage` by one step when coverage is enabled.
    pub fn perform(
        &self,
        g: &mut ComputeGraph<'_>,
        state: NodeId,
        pre: &AttentionPreProcessResult,
        coverage: &mut Option<CellState>,
    ) -> AttentionOutput {
        g.with_scope("attention", |g| {
            let (batch, src_len) = (pre.batch_size, pre.src_len);

            let wc = g.affine(state, self.wa, self.bwa);
            let wc = g.repeat_rows(wc, src_len);
            let mut ggs = g.add(pre.uhs, wc);
            if let (Some(cov), Some(cs)) = (&self.coverage, coverage.as_ref()) {
                let bias = g.affine(cs.h, cov.wc, cov.bwc);
                ggs = g.add(ggs, bias);
            }
            let ggs = g.tanh(ggs);

            let v = g.param(self.v);
            let scores = g.matmul(ggs, v);
            let scores = g.reshape(scores, batch, src_len);
            let weights = g.softmax(scores);
            let context = g.weighted_sum(weights, pre.inputs);

            if let (Some(cov), Some(cs)) = (&self.coverage, coverage.as_mut()) {
                let a = g.reshape(weights, batch * src_len, 1);
                let s = g.repeat_rows(state, src_len);
                let x = g.concat_cols(&[a, pre.inputs, s]);
                *cs = cov.cell.step(g, x, *cs);
            }

            AttentionOutput { context, weights }
        })
    }
}

impl Layer for AttentionUnit {
    fn params(&self) -> Vec<ParamId> {
        let mut p = vec![self.ua, self.wa, self.bua, self.bwa, self.v];
        if let Some(cov) = &self.coverage {
            p.push(cov.wc);
            p.push(cov.bwc);
            p.extend(cov.cell.params());
        }
        p
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Matrix;
    use crate::rng::rng_from_seed;
    use crate::tensor::{ParamStore, ParamView};

    #[test]
    fn coverage_adds_parameters_after_the_base_set() {
        let mut store = ParamStore::new(0);
        let mut rng = rng_from_seed(Some(1));
        let mut b = ParamBuilder::new(&mut store, &mut rng);
        let plain = AttentionUnit::new(&mut b, "a", 4, 6, false);
        let cov = AttentionUnit::new(&mut b, "b", 4, 6, true);
        assert_eq!(plain.params().len(), 5);
        assert_eq!(cov.params().len(), 9);
        assert_eq!(store.owned(cov.params()[5]).map(|t| t.name.as_str()), Some("b.Wc"));
    }

    #[test]
    fn coverage_state_advances() {
        let mut store = ParamStore::new(0);
        let mut rng = rng_from_seed(Some(2));
        let unit = AttentionUnit::new(&mut ParamBuilder::new(&mut store, &mut rng), "att", 3, 2, true);

        let mut g = ComputeGraph::new(ParamView::single(&store), false);
        let enc = g.constant(Matrix::from_vec(4, 2, vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8]));
        let pre = unit.pre_process(&mut g, enc, 2);
        assert_eq!(pre.src_len, 2);
        let mut cov = unit.reset_coverage(&mut g, &pre);
        let before = cov.map(|c| c.h);
        let state = g.constant(Matrix::filled(2, 3, 0.3));
        let out = unit.perform(&mut g, state, &pre, &mut cov);
        assert_eq!(g.shape(out.context), (2, 2));
        assert_ne!(cov.map(|c| c.h), before);
        assert_eq!(cov.map(|c| g.shape(c.h)), Some((4, COVERAGE_DIM)));
    }
}
