//! Checkpoint file layout
//!
//! A `.ckpt` file is a sequence of CBOR items. The first item is the
//! metadata (model config, storage dtype, one index entry per tensor) and
//! each following item is one tensor blob, in index order. Readers that only
//! need the metadata stop after the first item.

use crate::errors::{EngineError, Result};
use crate::model::ModelConfig;
use crate::params::ParamMeta;
use crate::tensor::{DType, Tensor};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::time::Duration;
use uuid::Uuid;

/// File extension for checkpoints
pub const CHECKPOINT_EXTENSION: &str = "ckpt";

/// Current on-disk format version
pub const FORMAT_VERSION: u32 = 2;

/// Hex-encoded sha256 of stored tensor bytes
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Index entry for one stored tensor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorIndexEntry {
    /// Parameter path
    pub name: String,
    /// Full shape
    pub shape: Vec<usize>,
    /// Storage dtype
    pub dtype: DType,
    /// sha256 of the stored little-endian bytes
    pub sha256: String,
    /// Stored size in bytes
    pub size_bytes: u64,
}

impl TensorIndexEntry {
    pub fn meta(&self) -> ParamMeta {
        ParamMeta::new(self.name.clone(), self.shape.clone(), self.dtype)
    }
}

/// Metadata about a checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Unique checkpoint identifier
    pub checkpoint_id: Uuid,

    /// Name the checkpoint was saved under
    pub name: String,

    /// On-disk format version
    pub format_version: u32,

    /// Timestamp when checkpoint was created (Unix seconds)
    pub created_at: u64,

    /// Model the parameters belong to
    pub model: ModelConfig,

    /// Storage dtype of every tensor
    pub dtype: DType,

    /// Total stored tensor bytes
    pub size_bytes: u64,

    /// One entry per tensor, lexicographic by name
    pub tensors: Vec<TensorIndexEntry>,
}

impl CheckpointMetadata {
    /// Create new checkpoint metadata
    pub fn new(name: String, model: ModelConfig, dtype: DType, tensors: Vec<TensorIndexEntry>) -> Self {
        Self {
            checkpoint_id: Uuid::new_v4(),
            name,
            format_version: FORMAT_VERSION,
            created_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            model,
            dtype,
            size_bytes: tensors.iter().map(|t| t.size_bytes).sum(),
            tensors,
        }
    }

    /// Get age of checkpoint
    pub fn age(&self) -> Duration {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Duration::from_secs(now.saturating_sub(self.created_at))
    }

    /// Sharding metadata for every tensor
    pub fn metas(&self) -> Vec<ParamMeta> {
        self.tensors.iter().map(TensorIndexEntry::meta).collect()
    }

    /// Total element count
    pub fn num_params(&self) -> usize {
        self.tensors.iter().map(|t| t.shape.iter().product::<usize>()).sum()
    }

    pub fn entry(&self, name: &str) -> Option<&TensorIndexEntry> {
        self.tensors.iter().find(|t| t.name == name)
    }
}

/// Encoded bytes of one tensor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorBlob {
    pub name: String,
    #[serde(with = "cbor_bytes")]
    pub bytes: Vec<u8>,
}

impl TensorBlob {
    /// Encode a tensor and index it
    pub fn encode(name: &str, tensor: &Tensor, dtype: DType) -> (TensorIndexEntry, TensorBlob) {
        let bytes = dtype.encode(&tensor.data);
        let entry = TensorIndexEntry {
            name: name.to_string(),
            shape: tensor.shape.clone(),
            dtype,
            sha256: sha256_hex(&bytes),
            size_bytes: bytes.len() as u64,
        };
        let blob = TensorBlob {
            name: name.to_string(),
            bytes,
        };
        (entry, blob)
    }

    /// Verify against the index entry and decode to `f32`
    pub fn decode(&self, entry: &TensorIndexEntry) -> Result<Tensor> {
        if self.name != entry.name {
            return Err(EngineError::Checkpoint(format!(
                "Tensor '{}' stored where index expects '{}'",
                self.name, entry.name
            )));
        }

        let actual = sha256_hex(&self.bytes);
        if actual != entry.sha256 {
            return Err(EngineError::Integrity {
                name: entry.name.clone(),
                expected: entry.sha256.clone(),
                actual,
            });
        }

        let data = entry.dtype.decode(&self.bytes)?;
        Tensor::new(data, entry.shape.clone()).map_err(|e| {
            EngineError::Checkpoint(format!("Tensor '{}' is malformed: {}", entry.name, e))
        })
    }
}

/// A complete checkpoint file
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointFile {
    pub metadata: CheckpointMetadata,
    pub tensors: Vec<TensorBlob>,
}

impl CheckpointFile {
    /// Write the metadata item followed by one item per tensor
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<()> {
        ciborium::into_writer(&self.metadata, &mut writer)
            .map_err(|e| EngineError::Serialization(format!("Failed to encode checkpoint metadata: {}", e)))?;
        for blob in &self.tensors {
            ciborium::into_writer(blob, &mut writer).map_err(|e| {
                EngineError::Serialization(format!("Failed to encode tensor '{}': {}", blob.name, e))
            })?;
        }
        Ok(())
    }

    /// Serialize checkpoint to CBOR bytes
    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.write_to(&mut bytes)?;
        Ok(bytes)
    }

    /// Read only the leading metadata item
    pub fn read_metadata<R: Read>(mut reader: R) -> Result<CheckpointMetadata> {
        ciborium::from_reader(&mut reader)
            .map_err(|e| EngineError::Checkpoint(format!("Failed to decode checkpoint metadata: {}", e)))
    }

    /// Read the metadata and every tensor blob
    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let metadata = Self::read_metadata(&mut reader)?;

        let mut tensors = Vec::with_capacity(metadata.tensors.len());
        for entry in &metadata.tensors {
            let blob: TensorBlob = ciborium::from_reader(&mut reader).map_err(|e| {
                EngineError::Checkpoint(format!("Failed to decode tensor '{}': {}", entry.name, e))
            })?;
            tensors.push(blob);
        }

        let mut trailing = [0u8; 1];
        if reader.read(&mut trailing)? > 0 {
            return Err(EngineError::Checkpoint(format!(
                "Index lists {} tensors but file holds more data",
                metadata.tensors.len()
            )));
        }

        Ok(Self { metadata, tensors })
    }

    /// Deserialize checkpoint from CBOR bytes
    pub fn from_cbor(bytes: &[u8]) -> Result<Self> {
        Self::read_from(bytes)
    }

    /// Verified tensors paired with their index entries
    pub fn decoded(&self) -> impl Iterator<Item = Result<(&TensorIndexEntry, Tensor)>> {
        self.metadata
            .tensors
            .iter()
            .zip(&self.tensors)
            .map(|(entry, blob)| blob.decode(entry).map(|t| (entry, t)))
    }
}

/// Store blobs as CBOR byte strings instead of integer arrays
mod cbor_bytes {
    use serde::de::{self, SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        struct BytesVisitor;

        impl<'de> Visitor<'de> for BytesVisitor {
            type Value = Vec<u8>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a byte string")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                Ok(v.to_vec())
            }

            fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                Ok(v)
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(b) = seq.next_element()? {
                    out.push(b);
                }
                Ok(out)
            }
        }

        deserializer.deserialize_byte_buf(BytesVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_file() -> CheckpointFile {
        let tensor = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]).unwrap();
        let (entry, blob) = TensorBlob::encode("w", &tensor, DType::F32);
        CheckpointFile {
            metadata: CheckpointMetadata::new("test".to_string(), ModelConfig::tiny(), DType::F32, vec![entry]),
            tensors: vec![blob],
        }
    }

    #[test]
    fn test_metadata_new() {
        let file = sample_file();
        assert_eq!(file.metadata.format_version, FORMAT_VERSION);
        assert_eq!(file.metadata.size_bytes, 16);
        assert_eq!(file.metadata.num_params(), 4);
        assert!(file.metadata.age().as_secs() < 5);
        assert_eq!(file.metadata.metas()[0].shape, vec![2, 2]);
    }

    #[test]
    fn test_cbor_serialization() {
        let file = sample_file();
        let bytes = file.to_cbor().unwrap();
        let restored = CheckpointFile::from_cbor(&bytes).unwrap();
        assert_eq!(restored, file);

        let (_, tensor) = restored.decoded().next().unwrap().unwrap();
        assert_eq!(tensor.data, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_tampered_blob_fails_integrity() {
        let mut file = sample_file();
        file.tensors[0].bytes[0] ^= 0xFF;
        let err = file.tensors[0].decode(&file.metadata.tensors[0]).unwrap_err();
        assert!(matches!(err, EngineError::Integrity { ref name, .. } if name == "w"));
    }

    #[test]
    fn test_shape_disagreement_is_checkpoint_error() {
        let mut file = sample_file();
        file.metadata.tensors[0].shape = vec![3, 2];
        let err = file.tensors[0].decode(&file.metadata.tensors[0]).unwrap_err();
        assert!(matches!(err, EngineError::Checkpoint(_)));
    }

    #[test]
    fn test_metadata_readable_without_tensors() {
        let file = sample_file();
        let mut bytes = file.to_cbor().unwrap();
        bytes.pop();

        let metadata = CheckpointFile::read_metadata(bytes.as_slice()).unwrap();
        assert_eq!(metadata, file.metadata);
        assert!(matches!(
            CheckpointFile::from_cbor(&bytes),
            Err(EngineError::Checkpoint(_))
        ));
    }

    #[test]
    fn test_trailing_data_is_rejected() {
        let mut bytes = sample_file().to_cbor().unwrap();
        bytes.push(0);
        assert!(CheckpointFile::from_cbor(&bytes).is_err());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(CheckpointFile::from_cbor(b"not a checkpoint").is_err());
    }
}
