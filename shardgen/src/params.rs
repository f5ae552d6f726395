//! Named parameter collections
//!
//! A checkpoint is a flat map from `/`-separated paths
//! (`layer_0/attn/q_proj`) to tensors. [`ParamMeta`] carries just enough
//! about a parameter to plan its sharding without touching its data.

use crate::errors::{EngineError, Result};
use crate::tensor::{DType, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Shape and storage information for one parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamMeta {
    /// Parameter path
    pub name: String,
    /// Full (unsharded) shape
    pub shape: Vec<usize>,
    /// Storage dtype
    pub dtype: DType,
}

impl ParamMeta {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, dtype: DType) -> Self {
        Self {
            name: name.into(),
            shape,
            dtype,
        }
    }

    /// Number of elements
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Size in bytes at the storage dtype
    pub fn size_bytes(&self) -> u64 {
        (self.numel() * self.dtype.size_in_bytes()) as u64
    }
}

/// Ordered collection of named tensors
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamTree {
    tensors: BTreeMap<String, Tensor>,
}

impl ParamTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a parameter, failing if the path is already taken
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Result<()> {
        let name = name.into();
        if name.is_empty() || name.split('/').any(str::is_empty) {
            return Err(EngineError::InvalidArgument(format!(
                "Invalid parameter path '{}'",
                name
            )));
        }
        if self.tensors.contains_key(&name) {
            return Err(EngineError::InvalidArgument(format!(
                "Duplicate parameter '{}'",
                name
            )));
        }
        self.tensors.insert(name, tensor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Get a parameter or fail with `NotFound`
    pub fn require(&self, name: &str) -> Result<&Tensor> {
        self.get(name)
            .ok_or_else(|| EngineError::NotFound(format!("Parameter '{}'", name)))
    }

    pub fn remove(&mut self, name: &str) -> Option<Tensor> {
        self.tensors.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Iterate in lexicographic path order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.tensors.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.tensors.keys()
    }

    /// Metadata for every parameter at the given storage dtype
    pub fn metas(&self, dtype: DType) -> Vec<ParamMeta> {
        self.tensors
            .iter()
            .map(|(name, t)| ParamMeta::new(name.clone(), t.shape.clone(), dtype))
            .collect()
    }

    /// Total in-memory size (f32)
    pub fn total_bytes(&self) -> u64 {
        self.tensors
            .values()
            .map(|t| (t.numel() * DType::F32.size_in_bytes()) as u64)
            .sum()
    }
}

impl IntoIterator for ParamTree {
    type Item = (String, Tensor);
    type IntoIter = std::collections::btree_map::IntoIter<String, Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.tensors.into_iter()
    }
}

/// Human-readable byte count
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_000_000_000 {
        format!("{:.1} GB", bytes as f64 / 1_000_000_000.0)
    } else if bytes >= 1_000_000 {
        format!("{:.1} MB", bytes as f64 / 1_000_000.0)
    } else if bytes >= 1_000 {
        format!("{:.1} KB", bytes as f64 / 1_000.0)
    } else {
        format!("{} bytes", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut params = ParamTree::new();
        params
            .insert("layer_0/attn/q_proj", Tensor::zeros(vec![4, 8]))
            .unwrap();
        params.insert("final_norm/scale", Tensor::zeros(vec![4])).unwrap();

        assert_eq!(params.len(), 2);
        assert_eq!(params.get("layer_0/attn/q_proj").unwrap().shape, vec![4, 8]);
        assert!(params.require("missing").is_err());

        // Lexicographic order
        let names: Vec<&String> = params.names().collect();
        assert_eq!(names[0], "final_norm/scale");
    }

    #[test]
    fn test_rejects_duplicates_and_bad_paths() {
        let mut params = ParamTree::new();
        params.insert("a/b", Tensor::zeros(vec![1])).unwrap();
        assert!(params.insert("a/b", Tensor::zeros(vec![1])).is_err());
        assert!(params.insert("", Tensor::zeros(vec![1])).is_err());
        assert!(params.insert("a//b", Tensor::zeros(vec![1])).is_err());
    }

    #[test]
    fn test_metas_and_sizes() {
        let mut params = ParamTree::new();
        params.insert("w", Tensor::zeros(vec![16, 32])).unwrap();

        let metas = params.metas(DType::Bf16);
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].numel(), 512);
        assert_eq!(metas[0].size_bytes(), 1024);
        assert_eq!(params.total_bytes(), 2048);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 bytes");
        assert_eq!(format_bytes(2_048), "2.0 KB");
        assert_eq!(format_bytes(4_194_304), "4.2 MB");
    }
}
