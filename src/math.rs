use std::sync::atomic::{AtomicUsize, Ordering};

static MATRIX_OPS: AtomicUsize = AtomicUsize::new(0);

pub fn reset_matrix_ops() {
    MATRIX_OPS.store(0, Ordering::SeqCst);
}

pub fn matrix_ops_count() -> usize {
    MATRIX_OPS.load(Ordering::SeqCst)
}

pub(crate) fn inc_ops() {
    MATRIX_OPS.fetch_add(1, Ordering::Relaxed);
}

/// Dense row-major matrix used for every weight, gradient and activation.
#[derive(Clone, Debug, PartialEq)]
pub struct Matrix {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f32>,
}

impl Matrix {
    pub fn zeros(r: usize, c: usize) -> Self {
        Matrix {
            rows: r,
            cols: c,
            data: vec![0.0; r * c],
        }
    }

    pub fn filled(r: usize, c: usize, v: f32) -> Self {
        Matrix {
            rows: r,
            cols: c,
            data: vec![v; r * c],
        }
    }

    pub fn from_vec(r: usize, c: usize, v: Vec<f32>) -> Self {
        assert_eq!(v.len(), r * c);
        Matrix {
            rows: r,
            cols: c,
            data: v,
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn get(&self, r: usize, c: usize) -> f32 {
        self.data[r * self.cols + c]
    }

    pub fn set(&mut self, r: usize, c: usize, v: f32) {
        self.data[r * self.cols + c] = v;
    }

    pub fn row(&self, r: usize) -> &[f32] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    pub fn row_mut(&mut self, r: usize) -> &mut [f32] {
        let cols = self.cols;
        &mut self.data[r * cols..(r + 1) * cols]
    }

    /// `a * b`
    pub fn matmul(a: &Matrix, b: &Matrix) -> Matrix {
        inc_ops();
        assert_eq!(a.cols, b.rows);
        let mut out = vec![0.0; a.rows * b.cols];
        for i in 0..a.rows {
            let a_row = &a.data[i * a.cols..(i + 1) * a.cols];
            let out_row = &mut out[i * b.cols..(i + 1) * b.cols];
            for (k, &a_val) in a_row.iter().enumerate() {
                if a_val == 0.0 {
                    continue;
                }
                let b_row = &b.data[k * b.cols..(k + 1) * b.cols];
                for (o, &bv) in out_row.iter_mut().zip(b_row) {
                    *o += a_val * bv;
                }
            }
        }
        Matrix::from_vec(a.rows, b.cols, out)
    }

    /// `a * b^T` without materialising the transpose.
    pub fn matmul_bt(a: &Matrix, b: &Matrix) -> Matrix {
        inc_ops();
        assert_eq!(a.cols, b.cols);
        let mut out = vec![0.0; a.rows * b.rows];
        for i in 0..a.rows {
            let a_row = a.row(i);
            for j in 0..b.rows {
                out[i * b.rows + j] = dot(a_row, b.row(j));
            }
        }
        Matrix::from_vec(a.rows, b.rows, out)
    }

    /// `a^T * b` without materialising the transpose.
    pub fn matmul_at(a: &Matrix, b: &Matrix) -> Matrix {
        inc_ops();
        assert_eq!(a.rows, b.rows);
        let mut out = vec![0.0; a.cols * b.cols];
        for k in 0..a.rows {
            let a_row = a.row(k);
            let b_row = b.row(k);
            for (i, &a_val) in a_row.iter().enumerate() {
                if a_val == 0.0 {
                    continue;
                }
                let out_row = &mut out[i * b.cols..(i + 1) * b.cols];
                for (o, &bv) in out_row.iter_mut().zip(b_row) {
                    *o += a_val * bv;
                }
            }
        }
        Matrix::from_vec(a.cols, b.cols, out)
    }

    pub fn add(&self, other: &Matrix) -> Matrix {
        inc_ops();
        assert_eq!(self.shape(), other.shape());
        let v = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| a + b)
            .collect();
        Matrix::from_vec(self.rows, self.cols, v)
    }

    pub fn add_assign(&mut self, other: &Matrix) {
        assert_eq!(self.shape(), other.shape());
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += b;
        }
    }

    pub fn scale(&self, s: f32) -> Matrix {
        Matrix::from_vec(self.rows, self.cols, self.data.iter().map(|v| v * s).collect())
    }

    pub fn transpose(&self) -> Matrix {
        inc_ops();
        let mut v = vec![0.0; self.rows * self.cols];
        for i in 0..self.rows {
            for j in 0..self.cols {
                v[j * self.rows + i] = self.get(i, j);
            }
        }
        Matrix::from_vec(self.cols, self.rows, v)
    }

    pub fn softmax(&self) -> Matrix {
        let mut out = self.clone();
        out.softmax_in_place();
        out
    }

    /// Row-wise softmax, stabilised by subtracting each row's maximum.
    pub fn softmax_in_place(&mut self) {
        inc_ops();
        let cols = self.cols;
        if cols == 0 {
            return;
        }
        for row in self.data.chunks_mut(cols) {
            let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0;
            for v in row.iter_mut() {
                *v = (*v - max).exp();
                sum += *v;
            }
            for v in row.iter_mut() {
                *v /= sum;
            }
        }
    }

    pub fn sum(&self) -> f32 {
        self.data.iter().sum()
    }
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Indices of the `n` largest values in `row`, best first. Equal values keep
/// their index order.
pub fn top_n_indices(row: &[f32], n: usize) -> Vec<usize> {
    let by_rank = |a: &usize, b: &usize| row[*b].total_cmp(&row[*a]).then(a.cmp(b));
    if n == 0 {
        return Vec::new();
    }
    let mut idx: Vec<usize> = (0..row.len()).collect();
    if n < idx.len() {
        idx.select_nth_unstable_by(n - 1, by_rank);
        idx.truncate(n);
    }
    idx.sort_unstable_by(by_rank);
    idx
}

pub fn argmax(row: &[f32]) -> usize {
    top_n_indices(row, 1).first().copied().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_n_matches_full_sort() {
        let row: [f32; 8] = [0.3, 0.9, 0.1, 0.9, 0.5, 0.3, 0.0, 0.7];
        let mut full: Vec<usize> = (0..row.len()).collect();
        full.sort_by(|&a, &b| row[b].total_cmp(&row[a]).then(a.cmp(&b)));
        for n in 0..=row.len() + 2 {
            let expect: Vec<usize> = full.iter().copied().take(n).collect();
            assert_eq!(top_n_indices(&row, n), expect, "n = {n}");
        }
        assert_eq!(top_n_indices(&row, 3), vec![1, 3, 7]);
        assert_eq!(argmax(&row), 1);
        assert!(top_n_indices(&[], 2).is_empty());
    }

    #[test]
    fn transposed_products_match_explicit_transpose() {
        let a = Matrix::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = Matrix::from_vec(4, 3, (0..12).map(|v| v as f32 * 0.5).collect());
        assert_eq!(Matrix::matmul_bt(&a, &b), Matrix::matmul(&a, &b.transpose()));
        let c = Matrix::from_vec(2, 4, (0..8).map(|v| v as f32).collect());
        assert_eq!(Matrix::matmul_at(&a, &c), Matrix::matmul(&a.transpose(), &c));
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let mut m = Matrix::from_vec(2, 3, vec![1000.0, 1001.0, 1002.0, -1.0, 0.0, 1.0]);
        m.softmax_in_place();
        for r in 0..2 {
            let s: f32 = m.row(r).iter().sum();
            assert!((s - 1.0).abs() < 1e-6);
        }
        assert!(m.data.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn top_n_prefers_first_index_on_ties() {
        assert_eq!(top_n_indices(&[0.2, 0.5, 0.5, 0.1], 2), vec![1, 2]);
        assert_eq!(argmax(&[0.3, 0.3]), 0);
    }
}
