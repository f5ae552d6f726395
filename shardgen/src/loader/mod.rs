//! Sharded parameter loading
//!
//! A [`ShardLoader`] turns a checkpoint plus a sharding strategy into
//! [`ShardedParams`]: one parameter tree per device holding only that
//! device's slices.
//!
//! ```text
//! checkpoint ──metadata──► ShardingPlan::build
//!     │                         │
//!     └──tensor by tensor──► verify ─► slice per device ─► drop full tensor
//! ```

mod sharded;

pub use sharded::ShardedParams;

use crate::checkpoint::{CheckpointMetadata, CheckpointStore};
use crate::device::DeviceMesh;
use crate::errors::{EngineError, Result};
use crate::sharding::{ShardingPlan, ShardingStrategy};
use async_trait::async_trait;
use std::time::Instant;
use tracing::{debug, info};

/// Trait for loading sharded parameters
///
/// Implementations decide where checkpoints come from; callers only see
/// the resulting per-device parameter trees.
#[async_trait]
pub trait ShardLoader: Send + Sync {
    /// Load a checkpoint, placing each parameter according to `strategy`
    async fn load_sharded(
        &self,
        checkpoint: &str,
        strategy: &ShardingStrategy,
        mesh: &DeviceMesh,
    ) -> Result<ShardedParams>;

    /// Read checkpoint metadata without loading tensors onto devices
    async fn metadata(&self, checkpoint: &str) -> Result<CheckpointMetadata>;
}

/// Loads from a local [`CheckpointStore`]
#[derive(Debug, Clone)]
pub struct CheckpointLoader {
    store: CheckpointStore,
}

impl CheckpointLoader {
    pub fn new(store: CheckpointStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Load sharded parameters together with the metadata parsed on the way
    pub async fn load_checkpoint(
        &self,
        checkpoint: &str,
        strategy: &ShardingStrategy,
        mesh: &DeviceMesh,
    ) -> Result<(CheckpointMetadata, ShardedParams)> {
        let start = Instant::now();
        let store = self.store.clone();
        let id = checkpoint.to_string();
        let strategy = strategy.clone();
        let mesh = mesh.clone();

        // File reads, hashing and slicing stay off the async runtime
        let (metadata, sharded) = tokio::task::spawn_blocking(move || -> Result<_> {
            let file = store.read_file(&id)?;
            let plan = ShardingPlan::build(&strategy, &mesh, &file.metadata.metas())?;
            debug!(
                checkpoint = %id,
                params = plan.len(),
                sharded = plan.num_sharded(),
                "Sharding plan built"
            );

            let mut sharded = ShardedParams::empty(plan, file.metadata.dtype);
            for decoded in file.decoded() {
                let (entry, tensor) = decoded?;
                sharded.insert_full(&entry.name, &tensor)?;
            }
            sharded.finish()?;
            Ok((file.metadata, sharded))
        })
        .await
        .map_err(|e| EngineError::Checkpoint(format!("Loader task failed: {}", e)))??;

        info!(
            checkpoint = %checkpoint,
            strategy = sharded.plan().strategy.name(),
            mesh = %sharded.mesh(),
            sharded = sharded.plan().num_sharded(),
            max_device_bytes = sharded.bytes_per_device().into_iter().max().unwrap_or(0),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Loaded sharded checkpoint"
        );

        Ok((metadata, sharded))
    }
}

#[async_trait]
impl ShardLoader for CheckpointLoader {
    async fn load_sharded(
        &self,
        checkpoint: &str,
        strategy: &ShardingStrategy,
        mesh: &DeviceMesh,
    ) -> Result<ShardedParams> {
        let (_, sharded) = self.load_checkpoint(checkpoint, strategy, mesh).await?;
        Ok(sharded)
    }

    async fn metadata(&self, checkpoint: &str) -> Result<CheckpointMetadata> {
        let store = self.store.clone();
        let id = checkpoint.to_string();
        tokio::task::spawn_blocking(move || store.load_metadata(&id))
            .await
            .map_err(|e| EngineError::Checkpoint(format!("Loader task failed: {}", e)))?
    }
}
