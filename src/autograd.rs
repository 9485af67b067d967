//! Reverse-mode differentiation over a per-device operation tape.
//!
//! A [`ComputeGraph`] borrows the parameters of one device read-only, records
//! every operation of a forward pass in creation order and, on
//! [`ComputeGraph::backward`], replays the records in reverse. Parameter
//! gradients are handed back as [`Gradients`] so the caller decides which
//! replica receives them.

use std::collections::HashMap;

use rand::{rngs::StdRng, Rng};

use crate::error::{Error, Result};
use crate::math::{dot, Matrix};
use crate::rng::rng_from_env;
use crate::tensor::{Gradients, ParamId, ParamView};

/// Handle to a value recorded in a [`ComputeGraph`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

const LAYER_NORM_EPS: f32 = 1e-6;

enum Op {
    Leaf,
    Param(ParamId),
    MatMul(NodeId, NodeId),
    Add(NodeId, NodeId),
    AddBias(NodeId, NodeId),
    Scale(NodeId, f32),
    Tanh(NodeId),
    Sigmoid(NodeId),
    Relu(NodeId),
    EltMul(NodeId, NodeId),
    SliceRows { src: NodeId, start: usize },
    SliceCols { src: NodeId, start: usize },
    ConcatRows(Vec<NodeId>),
    ConcatCols(Vec<NodeId>),
    Gather { table: NodeId, rows: Vec<usize> },
    TransposeBatch { src: NodeId, batch: usize },
    RepeatRows { src: NodeId, times: usize },
    Reshape(NodeId),
    Transpose(NodeId),
    Softmax(NodeId),
    LayerNorm {
        src: NodeId,
        gain: NodeId,
        bias: NodeId,
        xhat: Matrix,
        inv_std: Vec<f32>,
    },
    Dropout { src: NodeId, mask: Vec<f32> },
    WeightedSum { weights: NodeId, values: NodeId },
    SoftmaxCe { logits: NodeId, targets: Vec<Option<usize>> },
}

struct Node {
    op: Op,
    /// `None` for parameters, whose value lives in the device's store.
    value: Option<Matrix>,
    rows: usize,
    cols: usize,
    requires_grad: bool,
    scope: usize,
}

pub struct ComputeGraph<'a> {
    params: ParamView<'a>,
    need_back: bool,
    nodes: Vec<Node>,
    grads: Vec<Option<Matrix>>,
    param_nodes: HashMap<ParamId, NodeId>,
    scopes: Vec<String>,
    scope_stack: Vec<usize>,
    rng: StdRng,
}

impl<'a> ComputeGraph<'a> {
    pub fn new(params: ParamView<'a>, need_back: bool) -> Self {
        Self {
            params,
            need_back,
            nodes: Vec::new(),
            grads: Vec::new(),
            param_nodes: HashMap::new(),
            scopes: vec![String::new()],
            scope_stack: vec![0],
            rng: rng_from_env(),
        }
    }

    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn need_back(&self) -> bool {
        self.need_back
    }

    pub fn device_id(&self) -> usize {
        self.params.device_id()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Runs `f` with every recorded operation attributed to the sub-scope
    /// `name`, nested under the current one.
    pub fn with_scope<T>(&mut self, name: &str, f: impl FnOnce(&mut Self) -> T) -> T {
        let parent = self.scope_stack.last().copied().unwrap_or(0);
        let path = if self.scopes[parent].is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.scopes[parent], name)
        };
        let idx = match self.scopes.iter().position(|s| *s == path) {
            Some(i) => i,
            None => {
                self.scopes.push(path);
                self.scopes.len() - 1
            }
        };
        self.scope_stack.push(idx);
        let out = f(self);
        self.scope_stack.pop();
        out
    }

    /// Number of recorded operations per scope path, in first-use order.
    pub fn scope_summary(&self) -> Vec<(String, usize)> {
        let mut counts = vec![0usize; self.scopes.len()];
        for n in &self.nodes {
            counts[n.scope] += 1;
        }
        self.scopes
            .iter()
            .cloned()
            .zip(counts)
            .filter(|(_, c)| *c > 0)
            .map(|(s, c)| (if s.is_empty() { "<root>".to_string() } else { s }, c))
            .collect()
    }

    pub fn value(&self, id: NodeId) -> &Matrix {
        value_of(&self.nodes, self.params, id)
    }

    pub fn shape(&self, id: NodeId) -> (usize, usize) {
        let n = &self.nodes[id.0];
        (n.rows, n.cols)
    }

    fn rg(&self, id: NodeId) -> bool {
        self.nodes[id.0].requires_grad
    }

    fn push(&mut self, op: Op, value: Matrix, requires_grad: bool) -> NodeId {
        let scope = self.scope_stack.last().copied().unwrap_or(0);
        self.nodes.push(Node {
            op,
            rows: value.rows,
            cols: value.cols,
            value: Some(value),
            requires_grad: self.need_back && requires_grad,
            scope,
        });
        self.grads.push(None);
        NodeId(self.nodes.len() - 1)
    }

    pub fn constant(&mut self, m: Matrix) -> NodeId {
        self.push(Op::Leaf, m, false)
    }

    pub fn zeros(&mut self, rows: usize, cols: usize) -> NodeId {
        self.constant(Matrix::zeros(rows, cols))
    }

    /// The graph node reading parameter `id`. Each parameter gets a single
    /// node per graph so its gradient accumulates in one place.
    pub fn param(&mut self, id: ParamId) -> NodeId {
        if let Some(&n) = self.param_nodes.get(&id) {
            return n;
        }
        let t = self.params.tensor(id);
        let scope = self.scope_stack.last().copied().unwrap_or(0);
        self.nodes.push(Node {
            op: Op::Param(id),
            value: None,
            rows: t.rows(),
            cols: t.cols(),
            requires_grad: self.need_back && t.trainable,
            scope,
        });
        self.grads.push(None);
        let n = NodeId(self.nodes.len() - 1);
        self.param_nodes.insert(id, n);
        n
    }

    pub fn matmul(&mut self, a: NodeId, b: NodeId) -> NodeId {
        let v = Matrix::matmul(self.value(a), self.value(b));
        let rg = self.rg(a) || self.rg(b);
        self.push(Op::MatMul(a, b), v, rg)
    }

    pub fn add(&mut self, a: NodeId, b: NodeId) -> NodeId {
        let v = self.value(a).add(self.value(b));
        let rg = self.rg(a) || self.rg(b);
        self.push(Op::Add(a, b), v, rg)
    }

    /// Adds the single-row `bias` to every row of `a`.
    pub fn add_bias(&mut self, a: NodeId, bias: NodeId) -> NodeId {
        let b = self.value(bias);
        assert_eq!(b.rows, 1);
        let mut v = self.value(a).clone();
        assert_eq!(v.cols, b.cols);
        for r in 0..v.rows {
            for (x, y) in v.row_mut(r).iter_mut().zip(&b.data) {
                *x += y;
            }
        }
        let rg = self.rg(a) || self.rg(bias);
        self.push(Op::AddBias(a, bias), v, rg)
    }

    /// `x * w + b` for parameters `w` and `b`.
    pub fn affine(&mut self, x: NodeId, w: ParamId, b: ParamId) -> NodeId {
        let w = self.param(w);
        let b = self.param(b);
        let xw = self.matmul(x, w);
        self.add_bias(xw, b)
    }

    pub fn scale(&mut self, a: NodeId, s: f32) -> NodeId {
        let v = self.value(a).scale(s);
        let rg = self.rg(a);
        self.push(Op::Scale(a, s), v, rg)
    }

    fn map(&mut self, a: NodeId, f: impl Fn(f32) -> f32) -> (Matrix, bool) {
        let src = self.value(a);
        let v = Matrix::from_vec(src.rows, src.cols, src.data.iter().map(|&x| f(x)).collect());
        (v, self.rg(a))
    }

    pub fn tanh(&mut self, a: NodeId) -> NodeId {
        let (v, rg) = self.map(a, f32::tanh);
        self.push(Op::Tanh(a), v, rg)
    }

    pub fn sigmoid(&mut self, a: NodeId) -> NodeId {
        let (v, rg) = self.map(a, |x| 1.0 / (1.0 + (-x).exp()));
        self.push(Op::Sigmoid(a), v, rg)
    }

    pub fn relu(&mut self, a: NodeId) -> NodeId {
        let (v, rg) = self.map(a, |x| x.max(0.0));
        self.push(Op::Relu(a), v, rg)
    }

    pub fn elt_mul(&mut self, a: NodeId, b: NodeId) -> NodeId {
        let (va, vb) = (self.value(a), self.value(b));
        assert_eq!(va.shape(), vb.shape());
        let v = Matrix::from_vec(
            va.rows,
            va.cols,
            va.data.iter().zip(&vb.data).map(|(x, y)| x * y).collect(),
        );
        let rg = self.rg(a) || self.rg(b);
        self.push(Op::EltMul(a, b), v, rg)
    }

    pub fn slice_rows(&mut self, a: NodeId, start: usize, len: usize) -> NodeId {
        let src = self.value(a);
        assert!(start + len <= src.rows);
        let v = Matrix::from_vec(
            len,
            src.cols,
            src.data[start * src.cols..(start + len) * src.cols].to_vec(),
        );
        let rg = self.rg(a);
        self.push(Op::SliceRows { src: a, start }, v, rg)
    }

    pub fn slice_cols(&mut self, a: NodeId, start: usize, len: usize) -> NodeId {
        let src = self.value(a);
        assert!(start + len <= src.cols);
        let mut data = Vec::with_capacity(src.rows * len);
        for r in 0..src.rows {
            data.extend_from_slice(&src.row(r)[start..start + len]);
        }
        let v = Matrix::from_vec(src.rows, len, data);
        let rg = self.rg(a);
        self.push(Op::SliceCols { src: a, start }, v, rg)
    }

    pub fn concat_rows(&mut self, parts: &[NodeId]) -> NodeId {
        assert!(!parts.is_empty());
        let cols = self.value(parts[0]).cols;
        let mut data = Vec::new();
        let mut rows = 0;
        for &p in parts {
            let m = self.value(p);
            assert_eq!(m.cols, cols);
            data.extend_from_slice(&m.data);
            rows += m.rows;
        }
        let rg = parts.iter().any(|&p| self.rg(p));
        self.push(Op::ConcatRows(parts.to_vec()), Matrix::from_vec(rows, cols, data), rg)
    }

    pub fn concat_cols(&mut self, parts: &[NodeId]) -> NodeId {
        assert!(!parts.is_empty());
        let rows = self.value(parts[0]).rows;
        let cols: usize = parts.iter().map(|&p| self.value(p).cols).sum();
        let mut data = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for &p in parts {
                let m = self.value(p);
                assert_eq!(m.rows, rows);
                data.extend_from_slice(m.row(r));
            }
        }
        let rg = parts.iter().any(|&p| self.rg(p));
        self.push(Op::ConcatCols(parts.to_vec()), Matrix::from_vec(rows, cols, data), rg)
    }

    /// Rows `rows` of `table`, stacked in order.
    pub fn gather(&mut self, table: NodeId, rows: &[usize]) -> NodeId {
        let t = self.value(table);
        let mut data = Vec::with_capacity(rows.len() * t.cols);
        for &r in rows {
            data.extend_from_slice(t.row(r));
        }
        let v = Matrix::from_vec(rows.len(), t.cols, data);
        let rg = self.rg(table);
        self.push(
            Op::Gather {
                table,
                rows: rows.to_vec(),
            },
            v,
            rg,
        )
    }

    /// Embedding lookup: rows of parameter `table`.
    pub fn lookup(&mut self, table: ParamId, rows: &[usize]) -> NodeId {
        let t = self.param(table);
        self.gather(t, rows)
    }

    /// Reorders rows laid out as `t * batch + b` into `b * seq + t`.
    /// Applying it again with `batch = seq` restores the original layout.
    pub fn transpose_batch(&mut self, a: NodeId, batch: usize) -> NodeId {
        let src = self.value(a);
        let seq = src.rows / batch;
        let mut v = Matrix::zeros(src.rows, src.cols);
        for t in 0..seq {
            for b in 0..batch {
                v.row_mut(b * seq + t).copy_from_slice(src.row(t * batch + b));
            }
        }
        let rg = self.rg(a);
        self.push(Op::TransposeBatch { src: a, batch }, v, rg)
    }

    /// Each row of `a` repeated `times` times consecutively.
    pub fn repeat_rows(&mut self, a: NodeId, times: usize) -> NodeId {
        let src = self.value(a);
        let mut data = Vec::with_capacity(src.data.len() * times);
        for r in 0..src.rows {
            for _ in 0..times {
                data.extend_from_slice(src.row(r));
            }
        }
        let v = Matrix::from_vec(src.rows * times, src.cols, data);
        let rg = self.rg(a);
        self.push(Op::RepeatRows { src: a, times }, v, rg)
    }

    pub fn reshape(&mut self, a: NodeId, rows: usize, cols: usize) -> NodeId {
        let v = Matrix::from_vec(rows, cols, self.value(a).data.clone());
        let rg = self.rg(a);
        self.push(Op::Reshape(a), v, rg)
    }

    pub fn transpose(&mut self, a: NodeId) -> NodeId {
        let v = self.value(a).transpose();
        let rg = self.rg(a);
        self.push(Op::Transpose(a), v, rg)
    }

    pub fn softmax(&mut self, a: NodeId) -> NodeId {
        let mut v = self.value(a).clone();
        v.softmax_in_place();
        let rg = self.rg(a);
        self.push(Op::Softmax(a), v, rg)
    }

    pub fn layer_norm(&mut self, a: NodeId, gain: ParamId, bias: ParamId) -> NodeId {
        let gain = self.param(gain);
        let bias = self.param(bias);
        let x = self.value(a);
        let (gv, bv) = (self.value(gain), self.value(bias));
        let cols = x.cols as f32;
        let mut xhat = Matrix::zeros(x.rows, x.cols);
        let mut inv_std = Vec::with_capacity(x.rows);
        let mut v = Matrix::zeros(x.rows, x.cols);
        for r in 0..x.rows {
            let row = x.row(r);
            let mean = row.iter().sum::<f32>() / cols;
            let var = row.iter().map(|&e| (e - mean) * (e - mean)).sum::<f32>() / cols;
            let inv = 1.0 / (var + LAYER_NORM_EPS).sqrt();
            inv_std.push(inv);
            for c in 0..x.cols {
                let h = (row[c] - mean) * inv;
                xhat.set(r, c, h);
                v.set(r, c, gv.data[c] * h + bv.data[c]);
            }
        }
        let rg = self.rg(a) || self.rg(gain) || self.rg(bias);
        self.push(
            Op::LayerNorm {
                src: a,
                gain,
                bias,
                xhat,
                inv_std,
            },
            v,
            rg,
        )
    }

    /// Inverted dropout. Identity on inference graphs.
    pub fn dropout(&mut self, a: NodeId, ratio: f32) -> NodeId {
        if !self.need_back || ratio <= 0.0 {
            return a;
        }
        let keep = 1.0 - ratio;
        let n = self.value(a).data.len();
        let mask: Vec<f32> = (0..n)
            .map(|_| if self.rng.gen::<f32>() < ratio { 0.0 } else { 1.0 / keep })
            .collect();
        let src = self.value(a);
        let v = Matrix::from_vec(
            src.rows,
            src.cols,
            src.data.iter().zip(&mask).map(|(x, m)| x * m).collect(),
        );
        let rg = self.rg(a);
        self.push(Op::Dropout { src: a, mask }, v, rg)
    }

    /// For `weights` `[batch, len]` and `values` `[batch * len, dim]`, the
    /// per-batch weighted sum `[batch, dim]`.
    pub fn weighted_sum(&mut self, weights: NodeId, values: NodeId) -> NodeId {
        let (w, vals) = (self.value(weights), self.value(values));
        let (batch, len) = w.shape();
        assert_eq!(vals.rows, batch * len);
        let mut v = Matrix::zeros(batch, vals.cols);
        for b in 0..batch {
            for t in 0..len {
                let a = w.get(b, t);
                let src = vals.row(b * len + t);
                for (o, x) in v.row_mut(b).iter_mut().zip(src) {
                    *o += a * x;
                }
            }
        }
        let rg = self.rg(weights) || self.rg(values);
        self.push(Op::WeightedSum { weights, values }, v, rg)
    }

    /// Row softmax of `logits` with negative log-likelihood of `targets`.
    /// Rows whose target is `None` contribute neither cost nor gradient.
    /// Returns the probability node and the summed cost.
    pub fn softmax_cross_entropy(
        &mut self,
        logits: NodeId,
        targets: &[Option<usize>],
    ) -> (NodeId, f32) {
        let mut probs = self.value(logits).clone();
        assert_eq!(probs.rows, targets.len());
        probs.softmax_in_place();
        let cost: f32 = targets
            .iter()
            .enumerate()
            .filter_map(|(r, t)| t.map(|t| -(probs.get(r, t) + 1e-9).ln()))
            .sum();
        let rg = self.rg(logits);
        let id = self.push(
            Op::SoftmaxCe {
                logits,
                targets: targets.to_vec(),
            },
            probs,
            rg,
        );
        (id, cost)
    }

    /// Replays the tape in reverse and returns the gradient of every
    /// trainable parameter the forward pass touched, ordered by parameter id.
    pub fn backward(self) -> Result<Gradients> {
        if !self.need_back {
            return Err(Error::InferenceGraph);
        }
        let ComputeGraph {
            params,
            nodes,
            mut grads,
            param_nodes,
            ..
        } = self;

        for i in (0..nodes.len()).rev() {
            let node = &nodes[i];
            if !node.requires_grad {
                continue;
            }
            match &node.op {
                Op::Param(_) | Op::Leaf => continue,
                Op::SoftmaxCe { logits, targets } => {
                    let probs = node.value.as_ref();
                    if let (Some(probs), Some(gl)) = (probs, grad_slot(&mut grads, &nodes, *logits)) {
                        for (r, t) in targets.iter().enumerate() {
                            let Some(t) = t else { continue };
                            for (c, (o, &p)) in gl.row_mut(r).iter_mut().zip(probs.row(r)).enumerate() {
                                *o += if c == *t { p - 1.0 } else { p };
                            }
                        }
                    }
                }
                _ => {
                    let Some(g) = grads[i].take() else { continue };
                    propagate(&nodes, params, &mut grads, i, &g);
                }
            }
        }

        let mut out: Vec<(ParamId, Matrix)> = param_nodes
            .into_iter()
            .filter_map(|(p, n)| grads[n.0].take().map(|g| (p, g)))
            .collect();
        out.sort_by_key(|(p, _)| *p);
        Ok(Gradients(out))
    }
}

fn value_of<'n>(nodes: &'n [Node], params: ParamView<'n>, id: NodeId) -> &'n Matrix {
    let n = &nodes[id.0];
    match (&n.value, &n.op) {
        (Some(v), _) => v,
        (None, Op::Param(p)) => &params.tensor(*p).weight,
        (None, _) => unreachable!("non-parameter node without a value"),
    }
}

fn grad_slot<'g>(grads: &'g mut [Option<Matrix>], nodes: &[Node], id: NodeId) -> Option<&'g mut Matrix> {
    let n = &nodes[id.0];
    if !n.requires_grad {
        return None;
    }
    Some(grads[id.0].get_or_insert_with(|| Matrix::zeros(n.rows, n.cols)))
}

fn add_scaled(dst: &mut [f32], src: &[f32], s: f32) {
    for (d, x) in dst.iter_mut().zip(src) {
        *d += s * x;
    }
}

fn propagate(nodes: &[Node], params: ParamView<'_>, grads: &mut [Option<Matrix>], i: usize, g: &Matrix) {
    let node = &nodes[i];
    let val = |id: NodeId| value_of(nodes, params, id);
    let out = || node.value.as_ref();
    match &node.op {
        Op::Leaf | Op::Param(_) | Op::SoftmaxCe { .. } => {}
        Op::MatMul(a, b) => {
            if let Some(ga) = grad_slot(grads, nodes, *a) {
                ga.add_assign(&Matrix::matmul_bt(g, val(*b)));
            }
            if let Some(gb) = grad_slot(grads, nodes, *b) {
                gb.add_assign(&Matrix::matmul_at(val(*a), g));
            }
        }
        Op::Add(a, b) => {
            for p in [a, b] {
                if let Some(gp) = grad_slot(grads, nodes, *p) {
                    gp.add_assign(g);
                }
            }
        }
        Op::AddBias(a, b) => {
            if let Some(ga) = grad_slot(grads, nodes, *a) {
                ga.add_assign(g);
            }
            if let Some(gb) = grad_slot(grads, nodes, *b) {
                for r in 0..g.rows {
                    add_scaled(&mut gb.data, g.row(r), 1.0);
                }
            }
        }
        Op::Scale(a, s) => {
            if let Some(ga) = grad_slot(grads, nodes, *a) {
                add_scaled(&mut ga.data, &g.data, *s);
            }
        }
        Op::Tanh(a) | Op::Sigmoid(a) | Op::Relu(a) => {
            let (Some(y), Some(ga)) = (out(), grad_slot(grads, nodes, *a)) else { return };
            for ((d, &gy), &yv) in ga.data.iter_mut().zip(&g.data).zip(&y.data) {
                *d += gy * match &node.op {
                    Op::Tanh(_) => 1.0 - yv * yv,
                    Op::Sigmoid(_) => yv * (1.0 - yv),
                    _ => {
                        if yv > 0.0 {
                            1.0
                        } else {
                            0.0
                        }
                    }
                };
            }
        }
        Op::EltMul(a, b) => {
            let (va, vb) = (val(*a).data.clone(), val(*b).data.clone());
            if let Some(ga) = grad_slot(grads, nodes, *a) {
                for ((d, &gy), &o) in ga.data.iter_mut().zip(&g.data).zip(&vb) {
                    *d += gy * o;
                }
            }
            if let Some(gb) = grad_slot(grads, nodes, *b) {
                for ((d, &gy), &o) in gb.data.iter_mut().zip(&g.data).zip(&va) {
                    *d += gy * o;
                }
            }
        }
        Op::SliceRows { src, start } => {
            if let Some(ga) = grad_slot(grads, nodes, *src) {
                let off = start * ga.cols;
                add_scaled(&mut ga.data[off..off + g.data.len()], &g.data, 1.0);
            }
        }
        Op::SliceCols { src, start } => {
            if let Some(ga) = grad_slot(grads, nodes, *src) {
                for r in 0..g.rows {
                    add_scaled(&mut ga.row_mut(r)[*start..*start + g.cols], g.row(r), 1.0);
                }
            }
        }
        Op::ConcatRows(parts) => {
            let mut row = 0;
            for p in parts {
                let rows = nodes[p.0].rows;
                if let Some(gp) = grad_slot(grads, nodes, *p) {
                    add_scaled(&mut gp.data, &g.data[row * g.cols..(row + rows) * g.cols], 1.0);
                }
                row += rows;
            }
        }
        Op::ConcatCols(parts) => {
            let mut col = 0;
            for p in parts {
                let cols = nodes[p.0].cols;
                if let Some(gp) = grad_slot(grads, nodes, *p) {
                    for r in 0..g.rows {
                        add_scaled(gp.row_mut(r), &g.row(r)[col..col + cols], 1.0);
                    }
                }
                col += cols;
            }
        }
        Op::Gather { table, rows } => {
            if let Some(gt) = grad_slot(grads, nodes, *table) {
                for (i, &r) in rows.iter().enumerate() {
                    add_scaled(gt.row_mut(r), g.row(i), 1.0);
                }
            }
        }
        Op::TransposeBatch { src, batch } => {
            if let Some(ga) = grad_slot(grads, nodes, *src) {
                let seq = g.rows / batch;
                for t in 0..seq {
                    for b in 0..*batch {
                        add_scaled(ga.row_mut(t * batch + b), g.row(b * seq + t), 1.0);
                    }
                }
            }
        }
        Op::RepeatRows { src, times } => {
            if let Some(ga) = grad_slot(grads, nodes, *src) {
                for r in 0..ga.rows {
                    for k in 0..*times {
                        add_scaled(ga.row_mut(r), g.row(r * times + k), 1.0);
                    }
                }
            }
        }
        Op::Reshape(a) => {
            if let Some(ga) = grad_slot(grads, nodes, *a) {
                add_scaled(&mut ga.data, &g.data, 1.0);
            }
        }
        Op::Transpose(a) => {
            if let Some(ga) = grad_slot(grads, nodes, *a) {
                ga.add_assign(&g.transpose());
            }
        }
        Op::Softmax(a) => {
            let (Some(y), Some(ga)) = (out(), grad_slot(grads, nodes, *a)) else { return };
            for r in 0..g.rows {
                let (gr, yr) = (g.row(r), y.row(r));
                let d = dot(gr, yr);
                for ((o, &gy), &yv) in ga.row_mut(r).iter_mut().zip(gr).zip(yr) {
                    *o += yv * (gy - d);
                }
            }
        }
        Op::LayerNorm {
            src,
            gain,
            bias,
            xhat,
            inv_std,
        } => {
            let gv = val(*gain).data.clone();
            if let Some(gg) = grad_slot(grads, nodes, *gain) {
                for r in 0..g.rows {
                    for ((o, &gy), &h) in gg.data.iter_mut().zip(g.row(r)).zip(xhat.row(r)) {
                        *o += gy * h;
                    }
                }
            }
            if let Some(gb) = grad_slot(grads, nodes, *bias) {
                for r in 0..g.rows {
                    add_scaled(&mut gb.data, g.row(r), 1.0);
                }
            }
            if let Some(ga) = grad_slot(grads, nodes, *src) {
                let n = g.cols as f32;
                for r in 0..g.rows {
                    let dxhat: Vec<f32> = g.row(r).iter().zip(&gv).map(|(a, b)| a * b).collect();
                    let m1 = dxhat.iter().sum::<f32>() / n;
                    let m2 = dot(&dxhat, xhat.row(r)) / n;
                    for ((o, &d), &h) in ga.row_mut(r).iter_mut().zip(&dxhat).zip(xhat.row(r)) {
                        *o += inv_std[r] * (d - m1 - h * m2);
                    }
                }
            }
        }
        Op::Dropout { src, mask } => {
            if let Some(ga) = grad_slot(grads, nodes, *src) {
                for ((o, &gy), &m) in ga.data.iter_mut().zip(&g.data).zip(mask) {
                    *o += gy * m;
                }
            }
        }
        Op::WeightedSum { weights, values } => {
            let (w, v) = (val(*weights).clone(), val(*values));
            let len = w.cols;
            if let Some(gw) = grad_slot(grads, nodes, *weights) {
                for b in 0..w.rows {
                    for t in 0..len {
                        let d = dot(g.row(b), v.row(b * len + t));
                        gw.data[b * len + t] += d;
                    }
                }
            }
            if let Some(gv) = grad_slot(grads, nodes, *values) {
                for b in 0..w.rows {
                    for t in 0..len {
                        add_scaled(gv.row_mut(b * len + t), g.row(b), w.get(b, t));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{ParamStore, WeightTensor};

    fn store() -> ParamStore {
        let mut s = ParamStore::new(0);
        s.push(WeightTensor::new(
            "w",
            Matrix::from_vec(2, 2, vec![0.5, -0.3, 0.8, 0.1]),
            0,
            true,
        ));
        s.push(WeightTensor::new("b", Matrix::from_vec(1, 2, vec![0.1, 0.2]), 0, true));
        s
    }

    fn loss_at(store: &ParamStore, x: &Matrix) -> f32 {
        let mut g = ComputeGraph::new(ParamView::single(store), false);
        let xi = g.constant(x.clone());
        let h = g.affine(xi, ParamId(0), ParamId(1));
        let h = g.tanh(h);
        g.softmax_cross_entropy(h, &[Some(1), None]).1
    }

    #[test]
    fn gradients_match_finite_differences() {
        let s = store();
        let x = Matrix::from_vec(2, 2, vec![1.0, 2.0, -1.0, 0.5]);
        let grads = {
            let mut g = ComputeGraph::new(ParamView::single(&s), true);
            let xi = g.constant(x.clone());
            let h = g.affine(xi, ParamId(0), ParamId(1));
            let h = g.tanh(h);
            g.softmax_cross_entropy(h, &[Some(1), None]);
            g.backward().unwrap()
        };
        let gw = grads.get(ParamId(0)).unwrap();
        let eps = 1e-3;
        for k in 0..4 {
            let mut plus = s.clone();
            plus.owned_mut(ParamId(0)).unwrap().weight.data[k] += eps;
            let mut minus = s.clone();
            minus.owned_mut(ParamId(0)).unwrap().weight.data[k] -= eps;
            let numeric = (loss_at(&plus, &x) - loss_at(&minus, &x)) / (2.0 * eps);
            assert!((numeric - gw.data[k]).abs() < 1e-2, "{numeric} vs {}", gw.data[k]);
        }
    }

    #[test]
    fn inference_graph_refuses_backward() {
        let s = store();
        let g = ComputeGraph::new(ParamView::single(&s), false);
        assert!(matches!(g.backward(), Err(Error::InferenceGraph)));
    }

    #[test]
    fn transpose_batch_round_trips() {
        let s = store();
        let mut g = ComputeGraph::new(ParamView::single(&s), false);
        let x = g.constant(Matrix::from_vec(6, 1, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]));
        let bf = g.transpose_batch(x, 2);
        assert_eq!(g.value(bf).data, vec![0.0, 2.0, 4.0, 1.0, 3.0, 5.0]);
        let back = g.transpose_batch(bf, 3);
        assert_eq!(g.value(back).data, g.value(x).data);
    }

    #[test]
    fn scopes_count_operations() {
        let s = store();
        let mut g = ComputeGraph::new(ParamView::single(&s), false);
        let x = g.zeros(1, 2);
        g.with_scope("Decoder", |g| {
            g.with_scope("Attention", |g| g.tanh(x));
        });
        let summary = g.scope_summary();
        assert!(summary.contains(&("Decoder.Attention".to_string(), 1)));
    }
}
