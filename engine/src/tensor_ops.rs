//! Host tensor operations used by the reference decoder family.
//!
//! Row-major `f32` storage, shape convention `[sequence_length, hidden_dim]`.

use crate::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

/// 2D tensor for transformer computations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor2D {
    /// Row-major data storage
    pub data: Vec<f32>,
    /// Number of rows (sequence length)
    pub rows: usize,
    /// Number of columns (hidden dimension or vocabulary)
    pub cols: usize,
}

impl Tensor2D {
    pub fn new(data: Vec<f32>, rows: usize, cols: usize) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(EngineError::Tensor(format!(
                "Data length {} doesn't match shape {}x{}={}",
                data.len(),
                rows,
                cols,
                rows * cols
            )));
        }
        Ok(Self { data, rows, cols })
    }

    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            data: vec![0.0; rows * cols],
            rows,
            cols,
        }
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.cols + col]
    }

    pub fn row(&self, row: usize) -> &[f32] {
        let start = row * self.cols;
        &self.data[start..start + self.cols]
    }

    /// Copy of the final row as a `[1, cols]` tensor.
    pub fn last_row(&self) -> Result<Tensor2D> {
        if self.rows == 0 {
            return Err(EngineError::Tensor("last_row of empty tensor".to_string()));
        }
        Ok(Tensor2D {
            data: self.row(self.rows - 1).to_vec(),
            rows: 1,
            cols: self.cols,
        })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Size in bytes when held as `f32`.
    pub fn byte_len(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }

    /// Element-wise addition
    pub fn add(&self, other: &Tensor2D) -> Result<Tensor2D> {
        if self.rows != other.rows || self.cols != other.cols {
            return Err(EngineError::Tensor(format!(
                "Add shape mismatch: {}x{} + {}x{}",
                self.rows, self.cols, other.rows, other.cols
            )));
        }

        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a + b)
            .collect();

        Ok(Tensor2D {
            data,
            rows: self.rows,
            cols: self.cols,
        })
    }

    pub fn transpose(&self) -> Tensor2D {
        let mut data = vec![0.0; self.data.len()];
        for i in 0..self.rows {
            for j in 0..self.cols {
                data[j * self.rows + i] = self.data[i * self.cols + j];
            }
        }
        Tensor2D {
            data,
            rows: self.cols,
            cols: self.rows,
        }
    }

    /// Columns `[start, end)` of every row.
    pub fn column_slice(&self, start: usize, end: usize) -> Result<Tensor2D> {
        if start > end || end > self.cols {
            return Err(EngineError::Tensor(format!(
                "Column slice {}..{} out of bounds for {} columns",
                start, end, self.cols
            )));
        }

        let width = end - start;
        let mut data = Vec::with_capacity(self.rows * width);
        for row in 0..self.rows {
            data.extend_from_slice(&self.row(row)[start..end]);
        }

        Ok(Tensor2D {
            data,
            rows: self.rows,
            cols: width,
        })
    }
}

/// 1D tensor (norm weights, biases, logits)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor1D {
    pub data: Vec<f32>,
}

impl Tensor1D {
    pub fn new(data: Vec<f32>) -> Self {
        Self { data }
    }

    pub fn zeros(len: usize) -> Self {
        Self {
            data: vec![0.0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// ============== Matrix Operations ==============

/// Matrix multiplication: A[m, k] @ B[k, n] -> C[m, n]
pub fn matmul(a: &Tensor2D, b: &Tensor2D) -> Result<Tensor2D> {
    if a.cols != b.rows {
        return Err(EngineError::Tensor(format!(
            "Matmul shape mismatch: {}x{} @ {}x{}",
            a.rows, a.cols, b.rows, b.cols
        )));
    }

    let m = a.rows;
    let k = a.cols;
    let n = b.cols;

    let mut result = vec![0.0; m * n];

    for i in 0..m {
        for p in 0..k {
            let a_ip = a.data[i * k + p];
            for j in 0..n {
                result[i * n + j] += a_ip * b.data[p * n + j];
            }
        }
    }

    Ok(Tensor2D {
        data: result,
        rows: m,
        cols: n,
    })
}

/// Affine projection `x @ w + bias`, with `bias` broadcast across rows.
pub fn linear(x: &Tensor2D, w: &Tensor2D, bias: Option<&Tensor1D>) -> Result<Tensor2D> {
    let mut out = matmul(x, w)?;

    if let Some(bias) = bias {
        if bias.len() != out.cols {
            return Err(EngineError::Tensor(format!(
                "Bias length {} doesn't match output width {}",
                bias.len(),
                out.cols
            )));
        }
        for row in out.data.chunks_mut(bias.len()) {
            for (v, b) in row.iter_mut().zip(bias.data.iter()) {
                *v += b;
            }
        }
    }

    Ok(out)
}

// ============== Activation Functions ==============

/// GELU activation, tanh approximation as used by GPT-2
pub fn gelu(tensor: &Tensor2D) -> Tensor2D {
    let sqrt_2_over_pi = (2.0 / PI).sqrt();

    let data: Vec<f32> = tensor
        .data
        .iter()
        .map(|&x| {
            let inner = sqrt_2_over_pi * (x + 0.044715 * x.powi(3));
            0.5 * x * (1.0 + inner.tanh())
        })
        .collect();

    Tensor2D {
        data,
        rows: tensor.rows,
        cols: tensor.cols,
    }
}

// ============== Normalization ==============

/// LayerNorm(x) = (x - mean(x)) / sqrt(var(x) + eps) * gamma + beta
pub fn layer_norm(
    tensor: &Tensor2D,
    gamma: &Tensor1D,
    beta: &Tensor1D,
    eps: f32,
) -> Result<Tensor2D> {
    if tensor.cols != gamma.len() || tensor.cols != beta.len() {
        return Err(EngineError::Tensor(format!(
            "Layer norm dimension mismatch: tensor cols {} vs gamma {} vs beta {}",
            tensor.cols,
            gamma.len(),
            beta.len()
        )));
    }

    let mut result = Vec::with_capacity(tensor.data.len());

    for row in 0..tensor.rows {
        let row_data = tensor.row(row);

        let mean: f32 = row_data.iter().sum::<f32>() / tensor.cols as f32;
        let variance: f32 =
            row_data.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / tensor.cols as f32;
        let std = (variance + eps).sqrt();

        for (i, &x) in row_data.iter().enumerate() {
            result.push(((x - mean) / std) * gamma.data[i] + beta.data[i]);
        }
    }

    Ok(Tensor2D {
        data: result,
        rows: tensor.rows,
        cols: tensor.cols,
    })
}

// ============== Softmax ==============

/// Row-wise softmax. Entries at `-inf` (masked) come out as zero.
pub fn softmax(tensor: &Tensor2D) -> Tensor2D {
    let mut result = Vec::with_capacity(tensor.data.len());

    for row in 0..tensor.rows {
        let row_data = tensor.row(row);

        let max_val = row_data.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let exp_sum: f32 = row_data.iter().map(|x| (x - max_val).exp()).sum();

        for &x in row_data {
            result.push((x - max_val).exp() / exp_sum);
        }
    }

    Tensor2D {
        data: result,
        rows: tensor.rows,
        cols: tensor.cols,
    }
}

// ============== Token Sampling ==============

/// Linear congruential generator (Numerical Recipes constants).
///
/// Deterministic for a given seed; drives both sampling and weight init.
#[derive(Debug, Clone)]
pub struct Lcg {
    state: u64,
}

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    pub fn next_u64(&mut self) -> u64 {
        const A: u64 = 6364136223846793005;
        const C: u64 = 1442695040888963407;

        self.state = self.state.wrapping_mul(A).wrapping_add(C);
        self.state
    }

    /// Uniform in [0, 1)
    pub fn next_unit(&mut self) -> f32 {
        ((self.next_u64() >> 40) as f32) / (1u64 << 24) as f32
    }

    /// Uniform in [-1, 1)
    pub fn next_signed(&mut self) -> f32 {
        self.next_unit() * 2.0 - 1.0
    }

    /// Xavier/Glorot uniform: `Uniform[-limit, limit]`, `limit = sqrt(6 / (fan_in + fan_out))`
    pub fn xavier_uniform(&mut self, fan_in: usize, fan_out: usize) -> f32 {
        let limit = (6.0_f32 / (fan_in + fan_out) as f32).sqrt();
        self.next_signed() * limit
    }
}

/// Sample a token with temperature and top-p (nucleus) filtering.
pub fn sample_token(logits: &Tensor1D, temperature: f32, top_p: f32, rng: &mut Lcg) -> u32 {
    if logits.is_empty() {
        return 0;
    }

    let scaled_logits: Vec<f32> = if temperature != 1.0 && temperature > 0.0 {
        logits.data.iter().map(|x| x / temperature).collect()
    } else {
        logits.data.clone()
    };

    let max_val = scaled_logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exp_vals: Vec<f32> = scaled_logits.iter().map(|x| (x - max_val).exp()).collect();
    let sum: f32 = exp_vals.iter().sum();

    let mut indexed_probs: Vec<(usize, f32)> = exp_vals
        .iter()
        .map(|x| x / sum)
        .enumerate()
        .collect();
    indexed_probs.sort_by(|a, b| b.1.total_cmp(&a.1));

    let mut cumsum = 0.0;
    let mut cutoff_idx = indexed_probs.len();
    for (i, (_, prob)) in indexed_probs.iter().enumerate() {
        cumsum += prob;
        if cumsum >= top_p {
            cutoff_idx = i + 1;
            break;
        }
    }

    let selected = &indexed_probs[..cutoff_idx];
    let selected_sum: f32 = selected.iter().map(|(_, p)| p).sum();
    let random_val = rng.next_unit() * selected_sum;

    let mut cumsum = 0.0;
    for &(idx, prob) in selected {
        cumsum += prob;
        if random_val < cumsum {
            return idx as u32;
        }
    }

    indexed_probs[0].0 as u32
}

/// Greedy selection (argmax). Ties resolve to the lowest id.
pub fn sample_greedy(logits: &Tensor1D) -> u32 {
    let mut max_idx = 0;
    let mut max_val = f32::NEG_INFINITY;

    for (i, &val) in logits.data.iter().enumerate() {
        if val > max_val {
            max_val = val;
            max_idx = i;
        }
    }

    max_idx as u32
}

// ============== Embedding Operations ==============

/// Gather rows of `table` for each index.
pub fn embed_tokens(table: &Tensor2D, indices: &[u32]) -> Result<Tensor2D> {
    let hidden_dim = table.cols;
    let mut data = Vec::with_capacity(indices.len() * hidden_dim);

    for &index in indices {
        let idx = index as usize;
        if idx >= table.rows {
            return Err(EngineError::Tensor(format!(
                "Index {} out of bounds for embedding table with {} rows",
                index, table.rows
            )));
        }
        data.extend_from_slice(table.row(idx));
    }

    Ok(Tensor2D {
        data,
        rows: indices.len(),
        cols: hidden_dim,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matmul_known_values() {
        let a = Tensor2D::new(vec![1.0, 2.0, 3.0, 4.0], 2, 2).unwrap();
        let b = Tensor2D::new(vec![5.0, 6.0, 7.0, 8.0], 2, 2).unwrap();
        let c = matmul(&a, &b).unwrap();
        assert_eq!(c.data, vec![19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_matmul_shape_mismatch() {
        let a = Tensor2D::zeros(2, 3);
        let b = Tensor2D::zeros(2, 3);
        assert!(matmul(&a, &b).is_err());
    }

    #[test]
    fn test_linear_broadcasts_bias() {
        let x = Tensor2D::new(vec![1.0, 0.0, 0.0, 1.0], 2, 2).unwrap();
        let w = Tensor2D::new(vec![1.0, 2.0, 3.0, 4.0], 2, 2).unwrap();
        let bias = Tensor1D::new(vec![10.0, 20.0]);
        let y = linear(&x, &w, Some(&bias)).unwrap();
        assert_eq!(y.data, vec![11.0, 22.0, 13.0, 24.0]);
    }

    #[test]
    fn test_layer_norm_zero_mean_unit_var() {
        let x = Tensor2D::new(vec![1.0, 2.0, 3.0, 4.0], 1, 4).unwrap();
        let y = layer_norm(&x, &Tensor1D::new(vec![1.0; 4]), &Tensor1D::zeros(4), 1e-5).unwrap();
        let mean: f32 = y.data.iter().sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
    }

    #[test]
    fn test_softmax_masks_neg_infinity() {
        let x = Tensor2D::new(vec![0.0, f32::NEG_INFINITY], 1, 2).unwrap();
        let y = softmax(&x);
        assert!((y.data[0] - 1.0).abs() < 1e-6);
        assert_eq!(y.data[1], 0.0);
    }

    #[test]
    fn test_last_row_and_column_slice() {
        let t = Tensor2D::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2, 3).unwrap();
        assert_eq!(t.last_row().unwrap().data, vec![4.0, 5.0, 6.0]);
        assert_eq!(t.column_slice(1, 3).unwrap().data, vec![2.0, 3.0, 5.0, 6.0]);
        assert!(Tensor2D::zeros(0, 3).last_row().is_err());
    }

    #[test]
    fn test_sample_greedy() {
        let logits = Tensor1D::new(vec![0.1, 3.0, 2.0, 3.0]);
        assert_eq!(sample_greedy(&logits), 1);
    }

    #[test]
    fn test_sample_token_deterministic_for_seed() {
        let logits = Tensor1D::new(vec![1.0, 1.2, 0.8, 1.1]);
        let mut a = Lcg::new(7);
        let mut b = Lcg::new(7);
        for _ in 0..20 {
            assert_eq!(
                sample_token(&logits, 0.6, 0.9, &mut a),
                sample_token(&logits, 0.6, 0.9, &mut b)
            );
        }
    }

    #[test]
    fn test_sample_token_peaked_distribution() {
        let mut logits = vec![0.0; 16];
        logits[5] = 30.0;
        let mut rng = Lcg::new(42);
        for _ in 0..50 {
            assert_eq!(sample_token(&Tensor1D::new(logits.clone()), 0.6, 0.9, &mut rng), 5);
        }
    }

    #[test]
    fn test_lcg_unit_range() {
        let mut rng = Lcg::new(42);
        for _ in 0..1000 {
            let v = rng.next_unit();
            assert!((0.0..1.0).contains(&v));
        }
    }

    #[test]
    fn test_embed_tokens_out_of_bounds() {
        let table = Tensor2D::zeros(4, 2);
        assert!(embed_tokens(&table, &[1, 3]).is_ok());
        assert!(embed_tokens(&table, &[4]).is_err());
    }
}
