//! Tensor operations for the decoder forward pass
//!
//! - Matrix multiplication
//! - RMS normalization
//! - SiLU activation
//! - Softmax for attention and sampling
//! - Token embedding lookup
//! - Rotary position embedding

use super::Tensor;
use crate::errors::{EngineError, Result};

// ============== Matrix Operations ==============

/// Matrix multiplication: A[m, k] @ B[k, n] -> C[m, n]
///
/// When B holds only a slice of a weight's rows or columns this computes
/// the partial product a sharded device contributes.
pub fn matmul(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    a.expect_rank(2)?;
    b.expect_rank(2)?;
    if a.cols() != b.rows() {
        return Err(EngineError::Shape(format!(
            "Matmul shape mismatch: {:?} @ {:?}",
            a.shape, b.shape
        )));
    }

    let m = a.rows();
    let k = a.cols();
    let n = b.cols();

    let mut result = vec![0.0; m * n];

    // i-p-j order keeps the inner loop contiguous in both B and C
    for i in 0..m {
        for p in 0..k {
            let a_ip = a.data[i * k + p];
            if a_ip == 0.0 {
                continue;
            }
            let b_row = &b.data[p * n..(p + 1) * n];
            let out = &mut result[i * n..(i + 1) * n];
            for (o, &b_pj) in out.iter_mut().zip(b_row) {
                *o += a_ip * b_pj;
            }
        }
    }

    Tensor::new(result, vec![m, n])
}

// ============== Activation Functions ==============

/// SiLU (Sigmoid Linear Unit) / Swish activation
///
/// silu(x) = x * sigmoid(x)
pub fn silu(tensor: &Tensor) -> Tensor {
    Tensor {
        data: tensor
            .data
            .iter()
            .map(|&x| x * (1.0 / (1.0 + (-x).exp())))
            .collect(),
        shape: tensor.shape.clone(),
    }
}

// ============== Normalization ==============

/// RMS Layer Normalization
///
/// RMSNorm(x) = x / sqrt(mean(x^2) + eps) * gamma
pub fn rms_norm(tensor: &Tensor, gamma: &Tensor, eps: f32) -> Result<Tensor> {
    tensor.expect_rank(2)?;
    let cols = tensor.cols();
    if cols != gamma.numel() {
        return Err(EngineError::Shape(format!(
            "RMS norm dimension mismatch: tensor cols {} vs gamma {}",
            cols,
            gamma.numel()
        )));
    }

    let mut result = Vec::with_capacity(tensor.data.len());
    for row in tensor.data.chunks(cols) {
        let mean_sq: f32 = row.iter().map(|x| x * x).sum::<f32>() / cols as f32;
        let rms = (mean_sq + eps).sqrt();
        result.extend(row.iter().zip(&gamma.data).map(|(x, g)| (x / rms) * g));
    }

    Tensor::new(result, tensor.shape.clone())
}

// ============== Softmax ==============

/// Softmax over a slice of logits
///
/// `-inf` entries get probability zero. A slice that is entirely `-inf`
/// yields all zeros.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_val = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if max_val == f32::NEG_INFINITY {
        return vec![0.0; logits.len()];
    }

    let exps: Vec<f32> = logits.iter().map(|x| (x - max_val).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Softmax over the last dimension of a 2-D tensor
pub fn softmax_rows(tensor: &Tensor) -> Result<Tensor> {
    tensor.expect_rank(2)?;
    let data = tensor
        .data
        .chunks(tensor.cols())
        .flat_map(softmax)
        .collect();
    Tensor::new(data, tensor.shape.clone())
}

// ============== Embedding Operations ==============

/// Look up token embeddings from an embedding table
///
/// # Arguments
/// * `embedding_table` - [vocab_size, embed_dim] embedding matrix
/// * `tokens` - Token IDs to look up
pub fn embed_tokens(embedding_table: &Tensor, tokens: &[u32]) -> Result<Tensor> {
    embedding_table.expect_rank(2)?;
    let embed_dim = embedding_table.cols();

    let mut data = Vec::with_capacity(tokens.len() * embed_dim);
    for &token in tokens {
        let token_idx = token as usize;
        if token_idx >= embedding_table.rows() {
            return Err(EngineError::InvalidArgument(format!(
                "Token {} out of vocabulary bounds {}",
                token,
                embedding_table.rows()
            )));
        }
        data.extend_from_slice(embedding_table.row(token_idx));
    }

    Tensor::new(data, vec![tokens.len(), embed_dim])
}

// ============== Rotary Position Embedding (RoPE) ==============

/// Apply rotary position embedding to every head of a projection
///
/// Rotates dimension pairs `(d, d + head_dim / 2)` within each head by an
/// angle proportional to the row's position.
pub fn apply_rope(tensor: &Tensor, positions: &[usize], head_dim: usize, base: f32) -> Result<Tensor> {
    tensor.expect_rank(2)?;
    if tensor.rows() != positions.len() {
        return Err(EngineError::Shape(format!(
            "RoPE position count {} doesn't match row count {}",
            positions.len(),
            tensor.rows()
        )));
    }
    if head_dim == 0 || head_dim % 2 != 0 || tensor.cols() % head_dim != 0 {
        return Err(EngineError::Shape(format!(
            "RoPE head_dim {} incompatible with width {}",
            head_dim,
            tensor.cols()
        )));
    }

    let cols = tensor.cols();
    let half_dim = head_dim / 2;
    let inv_freq: Vec<f32> = (0..half_dim)
        .map(|i| 1.0 / base.powf(i as f32 * 2.0 / head_dim as f32))
        .collect();

    let mut result = tensor.data.clone();
    for (row, &pos) in positions.iter().enumerate() {
        for (d, freq) in inv_freq.iter().enumerate() {
            let (sin_val, cos_val) = (pos as f32 * freq).sin_cos();
            for head_base in (0..cols).step_by(head_dim) {
                let idx1 = row * cols + head_base + d;
                let idx2 = idx1 + half_dim;
                let x1 = tensor.data[idx1];
                let x2 = tensor.data[idx2];
                result[idx1] = x1 * cos_val - x2 * sin_val;
                result[idx2] = x1 * sin_val + x2 * cos_val;
            }
        }
    }

    Tensor::new(result, tensor.shape.clone())
}
