//! Sharding strategies and partition specs

use crate::device::DeviceMesh;
use crate::errors::{EngineError, Result};
use crate::params::ParamMeta;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Parameters below this size stay replicated under FSDP
pub const DEFAULT_MIN_SIZE_TO_SHARD_BYTES: u64 = 4 * 1024 * 1024;

fn default_min_size_to_shard() -> u64 {
    DEFAULT_MIN_SIZE_TO_SHARD_BYTES
}

/// Per-dimension placement of a tensor on the mesh
///
/// `Some(axis)` means the dimension is split over that mesh axis, `None`
/// means every device sees the whole dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSpec(pub Vec<Option<String>>);

impl PartitionSpec {
    /// Fully replicated spec for a tensor of the given rank
    pub fn replicated(rank: usize) -> Self {
        Self(vec![None; rank])
    }

    /// Spec splitting `dim` over `axis`
    pub fn split(rank: usize, dim: usize, axis: &str) -> Self {
        let mut spec = vec![None; rank];
        spec[dim] = Some(axis.to_string());
        Self(spec)
    }

    /// The split dimension and its mesh axis, if any
    pub fn sharded_dim(&self) -> Option<(usize, &str)> {
        self.0
            .iter()
            .enumerate()
            .find_map(|(i, a)| a.as_deref().map(|axis| (i, axis)))
    }

    pub fn is_replicated(&self) -> bool {
        self.sharded_dim().is_none()
    }
}

impl fmt::Display for PartitionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<&str> = self.0.iter().map(|a| a.as_deref().unwrap_or("-")).collect();
        write!(f, "({})", parts.join(", "))
    }
}

/// How parameters are placed on the mesh
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShardingStrategy {
    /// Every device holds every parameter
    Replicated,

    /// Fully-sharded data parallel
    ///
    /// Each large parameter is split along its largest dimension divisible
    /// by the axis size; anything else stays replicated.
    Fsdp {
        axis: String,
        #[serde(default = "default_min_size_to_shard")]
        min_size_to_shard_bytes: u64,
    },

    /// Column tensor parallelism
    ///
    /// Matrices are split along their last dimension; the last device of
    /// the group takes the remainder.
    TensorParallel { axis: String },
}

impl ShardingStrategy {
    /// FSDP over `axis` with the default size threshold
    pub fn fsdp(axis: &str) -> Self {
        ShardingStrategy::Fsdp {
            axis: axis.to_string(),
            min_size_to_shard_bytes: DEFAULT_MIN_SIZE_TO_SHARD_BYTES,
        }
    }

    pub fn tensor_parallel(axis: &str) -> Self {
        ShardingStrategy::TensorParallel {
            axis: axis.to_string(),
        }
    }

    /// Short name used in logs and the CLI
    pub fn name(&self) -> &'static str {
        match self {
            ShardingStrategy::Replicated => "replicated",
            ShardingStrategy::Fsdp { .. } => "fsdp",
            ShardingStrategy::TensorParallel { .. } => "tensor_parallel",
        }
    }

    /// Decide the partition spec for one parameter
    pub fn partition_spec(&self, meta: &ParamMeta, mesh: &DeviceMesh) -> Result<PartitionSpec> {
        let rank = meta.shape.len();
        match self {
            ShardingStrategy::Replicated => Ok(PartitionSpec::replicated(rank)),

            ShardingStrategy::Fsdp {
                axis,
                min_size_to_shard_bytes,
            } => {
                let n = mesh.axis_size(axis)?;
                if n == 1 || meta.size_bytes() < *min_size_to_shard_bytes {
                    return Ok(PartitionSpec::replicated(rank));
                }

                // Largest dimension first, lower index on ties
                let mut dims: Vec<usize> = (0..rank).collect();
                dims.sort_by(|&a, &b| meta.shape[b].cmp(&meta.shape[a]).then(a.cmp(&b)));

                let spec = dims
                    .into_iter()
                    .find(|&d| meta.shape[d] % n == 0)
                    .map(|d| PartitionSpec::split(rank, d, axis))
                    .unwrap_or_else(|| PartitionSpec::replicated(rank));
                Ok(spec)
            }

            ShardingStrategy::TensorParallel { axis } => {
                let n = mesh.axis_size(axis)?;
                if n == 1 || rank < 2 || meta.shape[rank - 1] < n {
                    return Ok(PartitionSpec::replicated(rank));
                }
                Ok(PartitionSpec::split(rank, rank - 1, axis))
            }
        }
    }

    /// Mesh axis this strategy splits over, if any
    pub fn axis(&self) -> Option<&str> {
        match self {
            ShardingStrategy::Replicated => None,
            ShardingStrategy::Fsdp { axis, .. } | ShardingStrategy::TensorParallel { axis } => {
                Some(axis)
            }
        }
    }

    /// Parse a CLI strategy name against a mesh axis
    pub fn from_name(name: &str, axis: &str) -> Result<Self> {
        match name {
            "replicated" => Ok(ShardingStrategy::Replicated),
            "fsdp" => Ok(ShardingStrategy::fsdp(axis)),
            "tensor_parallel" | "tp" => Ok(ShardingStrategy::tensor_parallel(axis)),
            other => Err(EngineError::InvalidArgument(format!(
                "Unknown sharding strategy '{}'",
                other
            ))),
        }
    }
}

impl Default for ShardingStrategy {
    fn default() -> Self {
        ShardingStrategy::fsdp("data")
    }
}

/// Range `[start, end)` of a dimension of size `dim` held by block `idx` of `n`
///
/// Blocks are `dim / n` wide; the last block takes any remainder.
pub fn block_range(dim: usize, n: usize, idx: usize) -> (usize, usize) {
    let per_block = dim / n;
    let start = idx * per_block;
    let end = if idx == n - 1 {
        dim
    } else {
        (idx + 1) * per_block
    };
    (start, end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DType;

    fn meta(shape: Vec<usize>) -> ParamMeta {
        ParamMeta::new("w", shape, DType::F32)
    }

    #[test]
    fn test_replicated() {
        let mesh = DeviceMesh::linear(4, "data").unwrap();
        let spec = ShardingStrategy::Replicated
            .partition_spec(&meta(vec![64, 64]), &mesh)
            .unwrap();
        assert!(spec.is_replicated());
        assert_eq!(spec.to_string(), "(-, -)");
    }

    #[test]
    fn test_fsdp_picks_largest_divisible_dim() {
        let mesh = DeviceMesh::linear(4, "data").unwrap();
        let fsdp = ShardingStrategy::Fsdp {
            axis: "data".to_string(),
            min_size_to_shard_bytes: 0,
        };

        // Largest dim (dim 1) divisible
        let spec = fsdp.partition_spec(&meta(vec![8, 64]), &mesh).unwrap();
        assert_eq!(spec.sharded_dim(), Some((1, "data")));

        // Largest dim not divisible, fall back to the next one
        let spec = fsdp.partition_spec(&meta(vec![8, 66]), &mesh).unwrap();
        assert_eq!(spec.sharded_dim(), Some((0, "data")));

        // Nothing divisible
        let spec = fsdp.partition_spec(&meta(vec![3, 7]), &mesh).unwrap();
        assert!(spec.is_replicated());

        // Ties go to the lower dimension
        let spec = fsdp.partition_spec(&meta(vec![16, 16]), &mesh).unwrap();
        assert_eq!(spec.sharded_dim(), Some((0, "data")));
    }

    #[test]
    fn test_fsdp_size_threshold() {
        let mesh = DeviceMesh::linear(2, "data").unwrap();
        let fsdp = ShardingStrategy::fsdp("data");

        // 64 * 64 * 4 bytes = 16 KiB, below 4 MiB
        let spec = fsdp.partition_spec(&meta(vec![64, 64]), &mesh).unwrap();
        assert!(spec.is_replicated());

        // 1024 * 1024 * 4 bytes = 4 MiB, at threshold
        let spec = fsdp.partition_spec(&meta(vec![1024, 1024]), &mesh).unwrap();
        assert_eq!(spec.sharded_dim(), Some((0, "data")));
    }

    #[test]
    fn test_tensor_parallel_splits_last_dim() {
        let mesh = DeviceMesh::linear(4, "model").unwrap();
        let tp = ShardingStrategy::tensor_parallel("model");

        let spec = tp.partition_spec(&meta(vec![8, 10]), &mesh).unwrap();
        assert_eq!(spec.sharded_dim(), Some((1, "model")));

        // Vectors and narrow matrices stay whole
        assert!(tp.partition_spec(&meta(vec![64]), &mesh).unwrap().is_replicated());
        assert!(tp.partition_spec(&meta(vec![64, 3]), &mesh).unwrap().is_replicated());
    }

    #[test]
    fn test_unknown_axis() {
        let mesh = DeviceMesh::linear(2, "data").unwrap();
        let tp = ShardingStrategy::tensor_parallel("model");
        assert!(tp.partition_spec(&meta(vec![4, 4]), &mesh).is_err());
    }

    #[test]
    fn test_block_range_remainder_on_last() {
        // 10 workers over 8192 columns
        assert_eq!(block_range(8192, 10, 0), (0, 819));
        assert_eq!(block_range(8192, 10, 5), (4095, 4914));
        assert_eq!(block_range(8192, 10, 9), (7371, 8192));
    }

    #[test]
    fn test_block_range_full_coverage() {
        for n in 1..=10 {
            let mut covered = vec![false; 100];
            let mut prev_end = 0;
            for idx in 0..n {
                let (start, end) = block_range(100, n, idx);
                assert_eq!(start, prev_end, "gap or overlap at block {} of {}", idx, n);
                for c in &mut covered[start..end] {
                    *c = true;
                }
                prev_end = end;
            }
            assert!(covered.iter().all(|&c| c));
        }
    }

    #[test]
    fn test_strategy_config_roundtrip() {
        let toml_str = r#"
            kind = "fsdp"
            axis = "data"
        "#;
        let strategy: ShardingStrategy = toml::from_str(toml_str).unwrap();
        assert_eq!(strategy, ShardingStrategy::fsdp("data"));
        assert_eq!(
            ShardingStrategy::from_name("tp", "model").unwrap(),
            ShardingStrategy::tensor_parallel("model")
        );
        assert!(ShardingStrategy::from_name("pipeline", "data").is_err());
    }
}
