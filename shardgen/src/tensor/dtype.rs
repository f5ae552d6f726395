//! Storage encodings for checkpoint tensors

use crate::errors::{EngineError, Result};
use half::bf16;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Element type a tensor is stored with on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    Bf16,
}

impl DType {
    /// Bytes per element
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::Bf16 => 2,
        }
    }

    /// Encode values as little-endian bytes
    pub fn encode(&self, values: &[f32]) -> Vec<u8> {
        let mut out = Vec::with_capacity(values.len() * self.size_in_bytes());
        match self {
            DType::F32 => {
                for v in values {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
            DType::Bf16 => {
                for v in values {
                    out.extend_from_slice(&bf16::from_f32(*v).to_le_bytes());
                }
            }
        }
        out
    }

    /// Decode little-endian bytes back to `f32`
    pub fn decode(&self, bytes: &[u8]) -> Result<Vec<f32>> {
        let width = self.size_in_bytes();
        if bytes.len() % width != 0 {
            return Err(EngineError::Checkpoint(format!(
                "{} bytes is not a whole number of {} elements",
                bytes.len(),
                self
            )));
        }

        let values = match self {
            DType::F32 => bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            DType::Bf16 => bytes
                .chunks_exact(2)
                .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
        };
        Ok(values)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F32 => write!(f, "f32"),
            DType::Bf16 => write!(f, "bf16"),
        }
    }
}

impl FromStr for DType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "f32" | "float32" => Ok(DType::F32),
            "bf16" | "bfloat16" => Ok(DType::Bf16),
            other => Err(EngineError::InvalidArgument(format!("Unknown dtype '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f32_is_bit_exact() {
        let values = vec![0.1, -3.25, f32::MIN_POSITIVE, 1e30];
        let bytes = DType::F32.encode(&values);
        assert_eq!(bytes.len(), 16);
        assert_eq!(DType::F32.decode(&bytes).unwrap(), values);
    }

    #[test]
    fn test_bf16_halves_storage() {
        let values = vec![1.0, -2.0, 0.5];
        let bytes = DType::Bf16.encode(&values);
        assert_eq!(bytes.len(), 6);
        // Small powers of two are exact in bf16
        assert_eq!(DType::Bf16.decode(&bytes).unwrap(), values);
    }

    #[test]
    fn test_bf16_rounding_error_is_small() {
        let decoded = DType::Bf16.decode(&DType::Bf16.encode(&[0.1])).unwrap();
        assert!((decoded[0] - 0.1).abs() < 1e-3);
    }

    #[test]
    fn test_decode_rejects_ragged_bytes() {
        assert!(DType::F32.decode(&[0, 1, 2]).is_err());
    }

    #[test]
    fn test_parse_dtype() {
        assert_eq!("bf16".parse::<DType>().unwrap(), DType::Bf16);
        assert_eq!("F32".parse::<DType>().unwrap(), DType::F32);
        assert!("int8".parse::<DType>().is_err());
    }
}
