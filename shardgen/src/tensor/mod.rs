//! Dense tensors and the math used by the reference decoder
//!
//! Everything is row-major `f32` in memory. Checkpoints may store a narrower
//! encoding (see [`dtype`]), which is widened on load.
//!
//! - [`Tensor`]: n-dimensional storage with axis slicing and concatenation,
//!   the two primitives sharding is built on
//! - [`ops`]: matmul, normalization, activations, softmax, RoPE
//! - [`dtype`]: checkpoint storage encodings

pub mod dtype;
pub mod ops;

pub use dtype::DType;

use crate::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};

/// N-dimensional tensor
///
/// Shape convention for weights: `[in_features, out_features]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    /// Row-major data storage
    pub data: Vec<f32>,
    /// Size of each dimension
    pub shape: Vec<usize>,
}

impl Tensor {
    /// Create a new tensor, checking that the data fills the shape
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(EngineError::Shape(format!(
                "Data length {} doesn't match shape {:?}={}",
                data.len(),
                shape,
                expected
            )));
        }
        Ok(Self { data, shape })
    }

    /// Create a tensor filled with zeros
    pub fn zeros(shape: Vec<usize>) -> Self {
        Self::filled(shape, 0.0)
    }

    /// Create a tensor filled with a constant value
    pub fn filled(shape: Vec<usize>, value: f32) -> Self {
        let len: usize = shape.iter().product();
        Self {
            data: vec![value; len],
            shape,
        }
    }

    /// Create a 1-D tensor
    pub fn vector(data: Vec<f32>) -> Self {
        let len = data.len();
        Self {
            data,
            shape: vec![len],
        }
    }

    /// Stack equal-length rows into a 2-D tensor
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        let cols = rows.first().map(Vec::len).unwrap_or(0);
        if rows.iter().any(|r| r.len() != cols) {
            return Err(EngineError::Shape("Rows have different lengths".to_string()));
        }
        Self::new(rows.concat(), vec![rows.len(), cols])
    }

    /// Total number of elements
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of dimensions
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Size of one dimension
    pub fn dim(&self, axis: usize) -> Result<usize> {
        self.shape.get(axis).copied().ok_or_else(|| {
            EngineError::Shape(format!(
                "Axis {} out of range for tensor of rank {}",
                axis,
                self.rank()
            ))
        })
    }

    /// Fail unless the tensor has exactly `rank` dimensions
    pub fn expect_rank(&self, rank: usize) -> Result<()> {
        if self.rank() != rank {
            return Err(EngineError::Shape(format!(
                "Expected rank {} tensor, got shape {:?}",
                rank, self.shape
            )));
        }
        Ok(())
    }

    /// Rows of a 2-D tensor
    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Columns of a 2-D tensor
    pub fn cols(&self) -> usize {
        self.shape.get(1).copied().unwrap_or(1)
    }

    /// Get element at (row, col)
    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.cols() + col]
    }

    /// Set element at (row, col)
    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: f32) {
        let cols = self.cols();
        self.data[row * cols + col] = value;
    }

    /// Get a row as a slice
    pub fn row(&self, row: usize) -> &[f32] {
        let cols = self.cols();
        let start = row * cols;
        &self.data[start..start + cols]
    }

    /// Extract `[start, end)` along `axis`
    ///
    /// Used to cut a device's shard out of a full parameter.
    pub fn slice_axis(&self, axis: usize, start: usize, end: usize) -> Result<Tensor> {
        let dim = self.dim(axis)?;
        if start > end || end > dim {
            return Err(EngineError::Shape(format!(
                "Invalid slice {}..{} on axis {} of size {}",
                start, end, axis, dim
            )));
        }

        let outer: usize = self.shape[..axis].iter().product();
        let inner: usize = self.shape[axis + 1..].iter().product();
        let width = end - start;

        let mut data = Vec::with_capacity(outer * width * inner);
        for o in 0..outer {
            let base = o * dim * inner;
            data.extend_from_slice(&self.data[base + start * inner..base + end * inner]);
        }

        let mut shape = self.shape.clone();
        shape[axis] = width;
        Ok(Tensor { data, shape })
    }

    /// Concatenate tensors along `axis`
    ///
    /// All parts must agree on every other dimension.
    pub fn concat(axis: usize, parts: &[Tensor]) -> Result<Tensor> {
        let first = parts
            .first()
            .ok_or_else(|| EngineError::Shape("Cannot concatenate zero tensors".to_string()))?;
        first.dim(axis)?;

        for part in &parts[1..] {
            let compatible = part.rank() == first.rank()
                && part
                    .shape
                    .iter()
                    .zip(&first.shape)
                    .enumerate()
                    .all(|(i, (a, b))| i == axis || a == b);
            if !compatible {
                return Err(EngineError::Shape(format!(
                    "Cannot concatenate {:?} with {:?} along axis {}",
                    part.shape, first.shape, axis
                )));
            }
        }

        let outer: usize = first.shape[..axis].iter().product();
        let inner: usize = first.shape[axis + 1..].iter().product();
        let total_dim: usize = parts.iter().map(|p| p.shape[axis]).sum();

        let mut data = Vec::with_capacity(outer * total_dim * inner);
        for o in 0..outer {
            for part in parts {
                let span = part.shape[axis] * inner;
                data.extend_from_slice(&part.data[o * span..(o + 1) * span]);
            }
        }

        let mut shape = first.shape.clone();
        shape[axis] = total_dim;
        Ok(Tensor { data, shape })
    }

    /// Element-wise addition
    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        self.zip_with(other, "add", |a, b| a + b)
    }

    /// Element-wise multiplication (Hadamard product)
    pub fn mul(&self, other: &Tensor) -> Result<Tensor> {
        self.zip_with(other, "mul", |a, b| a * b)
    }

    /// Scale by a scalar
    pub fn scale(&self, scalar: f32) -> Tensor {
        Tensor {
            data: self.data.iter().map(|x| x * scalar).collect(),
            shape: self.shape.clone(),
        }
    }

    /// Transpose a 2-D tensor
    pub fn transpose(&self) -> Result<Tensor> {
        self.expect_rank(2)?;
        let (rows, cols) = (self.rows(), self.cols());
        let mut data = vec![0.0; self.data.len()];
        for i in 0..rows {
            for j in 0..cols {
                data[j * rows + i] = self.data[i * cols + j];
            }
        }
        Ok(Tensor {
            data,
            shape: vec![cols, rows],
        })
    }

    /// Largest absolute element-wise difference, for tolerance checks
    pub fn max_abs_diff(&self, other: &Tensor) -> Result<f32> {
        let diff = self.zip_with(other, "diff", |a, b| (a - b).abs())?;
        Ok(diff.data.into_iter().fold(0.0, f32::max))
    }

    fn zip_with(&self, other: &Tensor, op: &str, f: impl Fn(f32, f32) -> f32) -> Result<Tensor> {
        if self.shape != other.shape {
            return Err(EngineError::Shape(format!(
                "Shape mismatch for {}: {:?} vs {:?}",
                op, self.shape, other.shape
            )));
        }
        Ok(Tensor {
            data: self
                .data
                .iter()
                .zip(&other.data)
                .map(|(&a, &b)| f(a, b))
                .collect(),
            shape: self.shape.clone(),
        })
    }
}
