use rand::Rng;

use super::layer::Layer;
use crate::autograd::{ComputeGraph, NodeId};
use crate::tensor::{ParamBuilder, ParamId};

/// Hidden output and memory cell of an LSTM after one step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CellState {
    pub h: NodeId,
    pub c: NodeId,
}

/// Single LSTM cell with the four gate projections fused into one
/// `[input + hidden, 4 * hidden]` weight. Column blocks are ordered
/// input, forget, output, candidate.
#[derive(Clone, Debug)]
pub struct LstmCell {
    w: ParamId,
    b: ParamId,
    input_dim: usize,
    hidden_dim: usize,
}

impl LstmCell {
    pub fn new<R: Rng>(
        builder: &mut ParamBuilder<'_, R>,
        name: &str,
        input_dim: usize,
        hidden_dim: usize,
    ) -> Self {
        let w = builder.normal(&format!("{name}.Wxh"), input_dim + hidden_dim, hidden_dim * 4);
        let b = builder.zeros(&format!("{name}.b"), 1, hidden_dim * 4);
        Self {
            w,
            b,
            input_dim,
            hidden_dim,
        }
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    /// All-zero state for `rows` parallel sequences.
    pub fn zero_state(&self, g: &mut ComputeGraph<'_>, rows: usize) -> CellState {
        CellState {
            h: g.zeros(rows, self.hidden_dim),
            c: g.zeros(rows, self.hidden_dim),
        }
    }

    /// Advances every row of `x` by one time step.
    pub fn step(&self, g: &mut ComputeGraph<'_>, x: NodeId, state: CellState) -> CellState {
        let d = self.hidden_dim;
        let xh = g.concat_cols(&[x, state.h]);
        let gates = g.affine(xh, self.w, self.b);

        let i = g.slice_cols(gates, 0, d);
        let i = g.sigmoid(i);
        let f = g.slice_cols(gates, d, d);
        let f = g.sigmoid(f);
        let o = g.slice_cols(gates, 2 * d, d);
        let o = g.sigmoid(o);
        let cand = g.slice_cols(gates, 3 * d, d);
        let cand = g.tanh(cand);

        let keep = g.elt_mul(f, state.c);
        let write = g.elt_mul(i, cand);
        let c = g.add(keep, write);
        let ct = g.tanh(c);
        let h = g.elt_mul(o, ct);
        CellState { h, c }
    }
}

impl Layer for LstmCell {
    fn params(&self) -> Vec<ParamId> {
        vec![self.w, self.b]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Matrix;
    use crate::rng::rng_from_seed;
    use crate::tensor::{ParamStore, ParamView};

    #[test]
    fn step_keeps_state_shapes_and_bounds() {
        let mut store = ParamStore::new(0);
        let mut rng = rng_from_seed(Some(3));
        let cell = LstmCell::new(&mut ParamBuilder::new(&mut store, &mut rng), "cell", 3, 4);

        let mut g = ComputeGraph::new(ParamView::single(&store), false);
        let x = g.constant(Matrix::filled(2, 3, 0.5));
        let s0 = cell.zero_state(&mut g, 2);
        let s1 = cell.step(&mut g, x, s0);
        let s2 = cell.step(&mut g, x, s1);
        assert_eq!(g.shape(s2.h), (2, 4));
        assert_eq!(g.shape(s2.c), (2, 4));
        assert!(g.value(s2.h).data.iter().all(|v| v.abs() < 1.0));
        assert_eq!(cell.params().len(), 2);
    }
}
