//! On-disk checkpoint store
//!
//! - Saving parameter trees atomically (temp file + rename)
//! - Reading metadata without materializing tensors
//! - Loading with per-tensor integrity verification
//! - Listing and deleting checkpoints

use super::types::{CheckpointFile, CheckpointMetadata, TensorBlob, CHECKPOINT_EXTENSION};
use crate::errors::{EngineError, Result};
use crate::model::ModelConfig;
use crate::params::ParamTree;
use crate::tensor::DType;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Directory of `.ckpt` files
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    /// Open a store, creating its directory if needed
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Open the store at the default location (`~/.shardgen/checkpoints`)
    pub fn with_defaults() -> Result<Self> {
        Self::new(default_checkpoint_dir())
    }

    /// Get checkpoint directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path for a checkpoint id
    ///
    /// An existing path is used as-is; anything else names a file in the store.
    pub fn resolve(&self, id: &str) -> PathBuf {
        let candidate = Path::new(id);
        if candidate.is_file() {
            return candidate.to_path_buf();
        }
        self.root.join(format!("{}.{}", id, CHECKPOINT_EXTENSION))
    }

    /// Save a parameter tree under `name`
    pub fn save(
        &self,
        name: &str,
        params: &ParamTree,
        model: &ModelConfig,
        dtype: DType,
    ) -> Result<CheckpointMetadata> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(EngineError::InvalidArgument(format!(
                "Invalid checkpoint name '{}'",
                name
            )));
        }

        let (entries, blobs): (Vec<_>, Vec<_>) = params
            .iter()
            .map(|(param, tensor)| TensorBlob::encode(param, tensor, dtype))
            .unzip();

        let file = CheckpointFile {
            metadata: CheckpointMetadata::new(name.to_string(), model.clone(), dtype, entries),
            tensors: blobs,
        };

        let path = self.resolve_in_store(name);
        let tmp_path = self.root.join(format!(".{}.{}.tmp", name, CHECKPOINT_EXTENSION));
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        file.write_to(&mut writer)?;
        writer.flush()?;
        drop(writer);
        std::fs::rename(&tmp_path, &path)?;

        info!(
            checkpoint = %name,
            checkpoint_id = %file.metadata.checkpoint_id,
            tensors = file.metadata.tensors.len(),
            dtype = %dtype,
            size_bytes = file.metadata.size_bytes,
            "Checkpoint saved"
        );

        Ok(file.metadata)
    }

    /// Read and parse a whole checkpoint file without verifying tensors
    pub fn read_file(&self, id: &str) -> Result<CheckpointFile> {
        let reader = self.open(id)?;
        CheckpointFile::read_from(reader)
    }

    /// Metadata of a checkpoint, read from the file header only
    pub fn load_metadata(&self, id: &str) -> Result<CheckpointMetadata> {
        let reader = self.open(id)?;
        CheckpointFile::read_metadata(reader)
    }

    /// Load every tensor, verifying its hash
    pub fn load(&self, id: &str) -> Result<(CheckpointMetadata, ParamTree)> {
        let file = self.read_file(id)?;
        let mut params = ParamTree::new();
        for decoded in file.decoded() {
            let (entry, tensor) = decoded?;
            params.insert(entry.name.clone(), tensor)?;
        }

        debug!(checkpoint = %id, tensors = params.len(), "Checkpoint loaded and verified");
        Ok((file.metadata, params))
    }

    /// Metadata of every readable checkpoint, newest first
    pub fn list(&self) -> Result<Vec<CheckpointMetadata>> {
        let mut metadata_list = Vec::new();

        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().map(|e| e == CHECKPOINT_EXTENSION).unwrap_or(false) {
                let parsed = File::open(&path)
                    .map_err(EngineError::from)
                    .and_then(|f| CheckpointFile::read_metadata(BufReader::new(f)));
                match parsed {
                    Ok(metadata) => metadata_list.push(metadata),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to read checkpoint");
                    }
                }
            }
        }

        metadata_list.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.name.cmp(&b.name)));
        Ok(metadata_list)
    }

    /// Delete a checkpoint
    pub fn delete(&self, id: &str) -> Result<()> {
        let path = self.resolve(id);
        if !path.exists() {
            return Err(EngineError::NotFound(format!("Checkpoint '{}'", id)));
        }
        std::fs::remove_file(&path)?;
        info!(checkpoint = %id, "Checkpoint deleted");
        Ok(())
    }

    fn open(&self, id: &str) -> Result<BufReader<File>> {
        let path = self.resolve(id);
        if !path.exists() {
            return Err(EngineError::NotFound(format!(
                "Checkpoint '{}' ({})",
                id,
                path.display()
            )));
        }
        debug!(path = %path.display(), "Reading checkpoint");
        Ok(BufReader::new(File::open(&path)?))
    }

    fn resolve_in_store(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.{}", name, CHECKPOINT_EXTENSION))
    }
}

/// Default checkpoint directory
pub fn default_checkpoint_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".shardgen")
        .join("checkpoints")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;
    use tempfile::TempDir;

    fn test_params() -> ParamTree {
        let mut params = ParamTree::new();
        params
            .insert("layer_0/attn/q_proj", Tensor::new((0..12).map(|x| x as f32 * 0.5).collect(), vec![3, 4]).unwrap())
            .unwrap();
        params
            .insert("final_norm/scale", Tensor::filled(vec![3], 1.0))
            .unwrap();
        params
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let params = test_params();

        let saved = store.save("demo", &params, &ModelConfig::tiny(), DType::F32).unwrap();
        assert_eq!(saved.tensors.len(), 2);
        assert!(store.resolve("demo").exists());

        let (metadata, loaded) = store.load("demo").unwrap();
        assert_eq!(metadata.checkpoint_id, saved.checkpoint_id);
        assert_eq!(loaded, params);

        // No temp file left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_resolve_accepts_paths() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        store.save("demo", &test_params(), &ModelConfig::tiny(), DType::Bf16).unwrap();

        let full_path = store.resolve("demo");
        let by_path = store.load_metadata(full_path.to_str().unwrap()).unwrap();
        assert_eq!(by_path.name, "demo");
        assert_eq!(by_path.dtype, DType::Bf16);
    }

    #[test]
    fn test_tampering_detected() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        store.save("demo", &test_params(), &ModelConfig::tiny(), DType::F32).unwrap();

        let mut file = store.read_file("demo").unwrap();
        file.tensors[1].bytes[4] ^= 0x01;
        std::fs::write(store.resolve("demo"), file.to_cbor().unwrap()).unwrap();

        let err = store.load("demo").unwrap_err();
        assert!(matches!(err, EngineError::Integrity { .. }));
    }

    #[test]
    fn test_list_and_delete() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        store.save("a", &test_params(), &ModelConfig::tiny(), DType::F32).unwrap();
        store.save("b", &test_params(), &ModelConfig::tiny(), DType::F32).unwrap();
        std::fs::write(dir.path().join("broken.ckpt"), b"junk").unwrap();

        let listed = store.list().unwrap();
        let mut names: Vec<_> = listed.iter().map(|m| m.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);

        store.delete("a").unwrap();
        assert_eq!(store.list().unwrap().len(), 1);
        assert!(matches!(store.delete("a"), Err(EngineError::NotFound(_))));
        assert!(matches!(store.load("a"), Err(EngineError::NotFound(_))));
    }

    #[test]
    fn test_metadata_survives_truncated_tensor_data() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let saved = store.save("demo", &test_params(), &ModelConfig::tiny(), DType::F32).unwrap();

        let path = store.resolve("demo");
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.pop();
        std::fs::write(&path, &bytes).unwrap();

        assert_eq!(store.load_metadata("demo").unwrap(), saved);
        assert_eq!(store.list().unwrap().len(), 1);
        assert!(matches!(store.load("demo"), Err(EngineError::Checkpoint(_))));
    }

    #[test]
    fn test_rejects_bad_names() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        for bad in ["", "../x", ".hidden"] {
            assert!(store.save(bad, &test_params(), &ModelConfig::tiny(), DType::F32).is_err());
        }
    }
}
