use rand::Rng;

use crate::autograd::{ComputeGraph, NodeId};
use crate::layers::{AttentionPreProcessResult, AttentionUnit, CellState, Layer, LstmCell};
use crate::tensor::{ParamBuilder, ParamId};

/// Recurrent state carried between decoder steps.
#[derive(Clone, Debug, PartialEq)]
pub struct DecoderState {
    pub cells: Vec<CellState>,
    pub coverage: Option<CellState>,
}

/// Stacked LSTM decoder. Every step computes one attention context from the
/// top cell's memory and feeds `[x, context]` into each layer.
#[derive(Clone, Debug)]
pub struct AttentionDecoder {
    cells: Vec<LstmCell>,
    attention: AttentionUnit,
    hidden_dim: usize,
}

impl AttentionDecoder {
    pub fn new<R: Rng>(
        builder: &mut ParamBuilder<'_, R>,
        embedding_dim: usize,
        hidden_dim: usize,
        context_dim: usize,
        depth: usize,
        enable_coverage: bool,
    ) -> Self {
        let cells = (0..depth.max(1))
            .map(|i| {
                let input = if i == 0 { embedding_dim } else { hidden_dim };
                LstmCell::new(builder, &format!("decoder.cell{i}"), input + context_dim, hidden_dim)
            })
            .collect();
        let attention = AttentionUnit::new(builder, "decoder.attention", hidden_dim, context_dim, enable_coverage);
        Self {
            cells,
            attention,
            hidden_dim,
        }
    }

    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    pub fn attention(&self) -> &AttentionUnit {
        &self.attention
    }

    pub fn pre_process(
        &self,
        g: &mut ComputeGraph<'_>,
        encoder_output: NodeId,
        batch: usize,
    ) -> AttentionPreProcessResult {
        self.attention.pre_process(g, encoder_output, batch)
    }

    /// Zero state for a fresh source batch.
    pub fn reset(&self, g: &mut ComputeGraph<'_>, pre: &AttentionPreProcessResult) -> DecoderState {
        DecoderState {
            cells: self.cells.iter().map(|c| c.zero_state(g, pre.batch_size)).collect(),
            coverage: self.attention.reset_coverage(g, pre),
        }
    }

    /// One decoding step for input rows `x` (`[batch, embedding]`). Returns
    /// the top layer's hidden output. `state` must come from [`reset`].
    ///
    /// [`reset`]: AttentionDecoder::reset
    pub fn decode(
        &self,
        g: &mut ComputeGraph<'_>,
        x: NodeId,
        pre: &AttentionPreProcessResult,
        state: &mut DecoderState,
    ) -> NodeId {
        g.with_scope("decoder", |g| {
            // at least one layer, one state per layer
            let top = state.cells[self.cells.len() - 1].c;
            let context = self.attention.perform(g, top, pre, &mut state.coverage).context;
            let mut v = x;
            for (cell, s) in self.cells.iter().zip(state.cells.iter_mut()) {
                let input = g.concat_cols(&[v, context]);
                *s = cell.step(g, input, *s);
                v = s.h;
            }
            v
        })
    }
}

impl Layer for AttentionDecoder {
    fn params(&self) -> Vec<ParamId> {
        let mut p: Vec<ParamId> = self.cells.iter().flat_map(|c| c.params()).collect();
        p.extend(self.attention.params());
        p
    }
}
