//! KV Cache Management for Transformer Inference
//!
//! Each layer keeps a fixed window of `cache_length` key/value rows per
//! sequence. Decoding step `t` writes slot `t mod cache_length`, so once the
//! window is full the oldest entries are overwritten.

use crate::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};

/// Key-Value cache for a single attention layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerKvCache {
    /// Cached keys: [batch, cache_length, kv_width]
    keys: Vec<f32>,
    /// Cached values: [batch, cache_length, kv_width]
    values: Vec<f32>,
}

impl LayerKvCache {
    fn new(batch_size: usize, cache_length: usize, kv_width: usize) -> Self {
        let len = batch_size * cache_length * kv_width;
        Self {
            keys: vec![0.0; len],
            values: vec![0.0; len],
        }
    }
}

/// Full KV cache for all layers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvCache {
    layers: Vec<LayerKvCache>,
    batch_size: usize,
    cache_length: usize,
    kv_width: usize,
    /// Number of decoding steps written so far
    end_index: usize,
}

impl KvCache {
    /// Create a zeroed cache
    pub fn new(num_layers: usize, batch_size: usize, cache_length: usize, kv_width: usize) -> Result<Self> {
        if cache_length == 0 || batch_size == 0 {
            return Err(EngineError::InvalidArgument(
                "KV cache needs a positive batch size and cache length".to_string(),
            ));
        }
        Ok(Self {
            layers: (0..num_layers)
                .map(|_| LayerKvCache::new(batch_size, cache_length, kv_width))
                .collect(),
            batch_size,
            cache_length,
            kv_width,
            end_index: 0,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn cache_length(&self) -> usize {
        self.cache_length
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Steps written so far
    pub fn end_index(&self) -> usize {
        self.end_index
    }

    /// Slot the current step writes to
    pub fn write_slot(&self) -> usize {
        self.end_index % self.cache_length
    }

    /// Store one step's key and value rows for sequence `seq`
    pub fn write(&mut self, layer: usize, seq: usize, key: &[f32], value: &[f32]) -> Result<()> {
        if key.len() != self.kv_width || value.len() != self.kv_width {
            return Err(EngineError::Shape(format!(
                "KV cache update width mismatch: keys {} values {} expected {}",
                key.len(),
                value.len(),
                self.kv_width
            )));
        }
        let offset = self.offset(seq, self.write_slot())?;
        let width = self.kv_width;
        let cache = self
            .layers
            .get_mut(layer)
            .ok_or_else(|| EngineError::InvalidArgument(format!("Invalid layer index: {}", layer)))?;
        cache.keys[offset..offset + width].copy_from_slice(key);
        cache.values[offset..offset + width].copy_from_slice(value);
        Ok(())
    }

    /// Key row at `slot` for sequence `seq`
    pub fn key(&self, layer: usize, seq: usize, slot: usize) -> Result<&[f32]> {
        let offset = self.offset(seq, slot)?;
        let cache = self.layer(layer)?;
        Ok(&cache.keys[offset..offset + self.kv_width])
    }

    /// Value row at `slot` for sequence `seq`
    pub fn value(&self, layer: usize, seq: usize, slot: usize) -> Result<&[f32]> {
        let offset = self.offset(seq, slot)?;
        let cache = self.layer(layer)?;
        Ok(&cache.values[offset..offset + self.kv_width])
    }

    /// Mark the current step as written
    pub fn advance(&mut self) {
        self.end_index += 1;
    }

    /// Clear the cache
    pub fn clear(&mut self) {
        for layer in &mut self.layers {
            layer.keys.fill(0.0);
            layer.values.fill(0.0);
        }
        self.end_index = 0;
    }

    /// Get memory usage in bytes
    pub fn memory_usage(&self) -> usize {
        self.layers
            .iter()
            .map(|l| (l.keys.len() + l.values.len()) * 4)
            .sum()
    }

    fn layer(&self, layer: usize) -> Result<&LayerKvCache> {
        self.layers
            .get(layer)
            .ok_or_else(|| EngineError::InvalidArgument(format!("Invalid layer index: {}", layer)))
    }

    fn offset(&self, seq: usize, slot: usize) -> Result<usize> {
        if seq >= self.batch_size || slot >= self.cache_length {
            return Err(EngineError::InvalidArgument(format!(
                "Cache index (seq {}, slot {}) out of range ({}, {})",
                seq, slot, self.batch_size, self.cache_length
            )));
        }
        Ok((seq * self.cache_length + slot) * self.kv_width)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_read() {
        let mut cache = KvCache::new(2, 2, 4, 3).unwrap();
        cache.write(1, 1, &[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]).unwrap();

        assert_eq!(cache.key(1, 1, 0).unwrap(), &[1.0, 2.0, 3.0]);
        assert_eq!(cache.value(1, 1, 0).unwrap(), &[4.0, 5.0, 6.0]);
        assert_eq!(cache.key(0, 1, 0).unwrap(), &[0.0, 0.0, 0.0]);
        assert_eq!(cache.memory_usage(), 2 * 2 * (2 * 4 * 3) * 4);
    }

    #[test]
    fn test_slots_wrap_around() {
        let mut cache = KvCache::new(1, 1, 3, 1).unwrap();
        for step in 0..5 {
            assert_eq!(cache.write_slot(), step % 3);
            cache.write(0, 0, &[step as f32], &[0.0]).unwrap();
            cache.advance();
        }
        // Steps 3 and 4 overwrote slots 0 and 1
        assert_eq!(cache.key(0, 0, 0).unwrap(), &[3.0]);
        assert_eq!(cache.key(0, 0, 1).unwrap(), &[4.0]);
        assert_eq!(cache.key(0, 0, 2).unwrap(), &[2.0]);

        cache.clear();
        assert_eq!(cache.end_index(), 0);
        assert_eq!(cache.key(0, 0, 0).unwrap(), &[0.0]);
    }

    #[test]
    fn test_bad_indices() {
        let mut cache = KvCache::new(1, 1, 2, 2).unwrap();
        assert!(cache.write(0, 0, &[1.0], &[1.0, 2.0]).is_err());
        assert!(cache.write(3, 0, &[1.0, 2.0], &[1.0, 2.0]).is_err());
        assert!(cache.key(0, 1, 0).is_err());
        assert!(KvCache::new(1, 1, 0, 2).is_err());
    }
}
