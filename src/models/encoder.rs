use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::autograd::{ComputeGraph, NodeId};
use crate::layers::{Layer, LstmCell, MultiHeadAttention, PositionwiseFeedForward};
use crate::positional::time_major_encoding;
use crate::tensor::{ParamBuilder, ParamId};

/// Persisted tag selecting the encoder variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncoderType {
    BiLstm,
    Transformer,
}

/// Stacked bidirectional LSTM. Each layer runs a forward and a backward
/// cell over the sequence and concatenates their hidden outputs.
#[derive(Clone, Debug)]
pub struct BiLstmEncoder {
    forward: Vec<LstmCell>,
    backward: Vec<LstmCell>,
    hidden_dim: usize,
}

impl BiLstmEncoder {
    pub fn new<R: Rng>(
        builder: &mut ParamBuilder<'_, R>,
        name: &str,
        input_dim: usize,
        hidden_dim: usize,
        depth: usize,
    ) -> Self {
        let mut forward = Vec::with_capacity(depth);
        let mut backward = Vec::with_capacity(depth);
        for i in 0..depth {
            let dim = if i == 0 { input_dim } else { hidden_dim * 2 };
            forward.push(LstmCell::new(builder, &format!("{name}.forward{i}"), dim, hidden_dim));
            backward.push(LstmCell::new(builder, &format!("{name}.backward{i}"), dim, hidden_dim));
        }
        Self {
            forward,
            backward,
            hidden_dim,
        }
    }

    /// `input` is time-major `[seq_len * batch, input_dim]`; so is the
    /// returned `[seq_len * batch, 2 * hidden]`.
    pub fn encode(&self, g: &mut ComputeGraph<'_>, input: NodeId, batch: usize) -> NodeId {
        let (rows, _) = g.shape(input);
        let seq = rows / batch;
        let mut layer_input = input;
        for (i, (fwd, bwd)) in self.forward.iter().zip(&self.backward).enumerate() {
            layer_input = g.with_scope(&format!("bilstm{i}"), |g| {
                let steps: Vec<NodeId> = (0..seq)
                    .map(|t| g.slice_rows(layer_input, t * batch, batch))
                    .collect();

                let mut fwd_out = Vec::with_capacity(seq);
                let mut state = fwd.zero_state(g, batch);
                for &x in &steps {
                    state = fwd.step(g, x, state);
                    fwd_out.push(state.h);
                }

                let mut bwd_out = vec![None; seq];
                let mut state = bwd.zero_state(g, batch);
                for t in (0..seq).rev() {
                    state = bwd.step(g, steps[t], state);
                    bwd_out[t] = Some(state.h);
                }

                let merged: Vec<NodeId> = fwd_out
                    .into_iter()
                    .zip(bwd_out)
                    .filter_map(|(f, b)| b.map(|b| g.concat_cols(&[f, b])))
                    .collect();
                g.concat_rows(&merged)
            });
        }
        layer_input
    }

    pub fn output_dim(&self) -> usize {
        self.hidden_dim * 2
    }
}

impl Layer for BiLstmEncoder {
    fn params(&self) -> Vec<ParamId> {
        self.forward
            .iter()
            .zip(&self.backward)
            .flat_map(|(f, b)| f.params().into_iter().chain(b.params()))
            .collect()
    }
}

/// Self-attention encoder over sinusoidal position-tagged embeddings.
#[derive(Clone, Debug)]
pub struct TransformerEncoder {
    layers: Vec<(MultiHeadAttention, PositionwiseFeedForward)>,
    dim: usize,
}

impl TransformerEncoder {
    pub fn new<R: Rng>(
        builder: &mut ParamBuilder<'_, R>,
        name: &str,
        dim: usize,
        heads: usize,
        depth: usize,
    ) -> Self {
        let layers = (0..depth)
            .map(|i| {
                (
                    MultiHeadAttention::new(builder, &format!("{name}.attn{i}"), dim, heads),
                    PositionwiseFeedForward::new(builder, &format!("{name}.ffn{i}"), dim, dim * 4),
                )
            })
            .collect();
        Self { layers, dim }
    }

    /// `input` is time-major `[seq_len * batch, dim]`; so is the output.
    pub fn encode(&self, g: &mut ComputeGraph<'_>, input: NodeId, batch: usize, dropout: f32) -> NodeId {
        let (rows, _) = g.shape(input);
        let seq = rows / batch;
        let pe = g.constant(time_major_encoding(seq, batch, self.dim));
        let x = g.add(input, pe);
        let x = g.dropout(x, dropout);
        let mut x = g.transpose_batch(x, batch);
        for (i, (attn, ffn)) in self.layers.iter().enumerate() {
            x = g.with_scope(&format!("transformer{i}"), |g| {
                let y = attn.perform(g, x, batch, dropout);
                ffn.process(g, y, dropout)
            });
        }
        g.transpose_batch(x, seq)
    }

    pub fn output_dim(&self) -> usize {
        self.dim
    }
}

impl Layer for TransformerEncoder {
    fn params(&self) -> Vec<ParamId> {
        self.layers
            .iter()
            .flat_map(|(a, f)| a.params().into_iter().chain(f.params()))
            .collect()
    }
}

/// Encoder variant chosen once from the persisted [`EncoderType`].
#[derive(Clone, Debug)]
pub enum Encoder {
    BiLstm(BiLstmEncoder),
    Transformer(TransformerEncoder),
}

impl Encoder {
    pub fn build<R: Rng>(
        builder: &mut ParamBuilder<'_, R>,
        kind: EncoderType,
        embedding_dim: usize,
        hidden_dim: usize,
        depth: usize,
        heads: usize,
    ) -> Self {
        match kind {
            EncoderType::BiLstm => Encoder::BiLstm(BiLstmEncoder::new(
                builder,
                "encoder",
                embedding_dim,
                hidden_dim,
                depth,
            )),
            EncoderType::Transformer => Encoder::Transformer(TransformerEncoder::new(
                builder, "encoder", hidden_dim, heads, depth,
            )),
        }
    }

    pub fn kind(&self) -> EncoderType {
        match self {
            Encoder::BiLstm(_) => EncoderType::BiLstm,
            Encoder::Transformer(_) => EncoderType::Transformer,
        }
    }

    pub fn encode(&self, g: &mut ComputeGraph<'_>, input: NodeId, batch: usize, dropout: f32) -> NodeId {
        g.with_scope("encoder", |g| match self {
            Encoder::BiLstm(e) => e.encode(g, input, batch),
            Encoder::Transformer(e) => e.encode(g, input, batch, dropout),
        })
    }

    /// Width of one encoder output row, i.e. the attention context width.
    pub fn output_dim(&self) -> usize {
        match self {
            Encoder::BiLstm(e) => e.output_dim(),
            Encoder::Transformer(e) => e.output_dim(),
        }
    }
}

impl Layer for Encoder {
    fn params(&self) -> Vec<ParamId> {
        match self {
            Encoder::BiLstm(e) => e.params(),
            Encoder::Transformer(e) => e.params(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Matrix;
    use crate::rng::rng_from_seed;
    use crate::tensor::{ParamStore, ParamView};

    fn run(kind: EncoderType) -> (usize, usize) {
        let mut store = ParamStore::new(0);
        let mut rng = rng_from_seed(Some(5));
        let enc = Encoder::build(&mut ParamBuilder::new(&mut store, &mut rng), kind, 4, 4, 2, 2);
        let mut g = ComputeGraph::new(ParamView::single(&store), false);
        let data: Vec<f32> = (0..24).map(|i| i as f32 * 0.05).collect();
        let x = g.constant(Matrix::from_vec(6, 4, data));
        let y = enc.encode(&mut g, x, 2, 0.0);
        assert_eq!(enc.kind(), kind);
        g.shape(y)
    }

    #[test]
    fn bilstm_output_is_twice_hidden() {
        assert_eq!(run(EncoderType::BiLstm), (6, 8));
    }

    #[test]
    fn transformer_keeps_model_dim() {
        assert_eq!(run(EncoderType::Transformer), (6, 4));
    }
}
