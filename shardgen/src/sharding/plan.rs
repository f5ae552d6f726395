//! Per-parameter, per-device shard assignments

use super::strategy::{block_range, PartitionSpec, ShardingStrategy};
use crate::device::DeviceMesh;
use crate::errors::{EngineError, Result};
use crate::params::ParamMeta;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Slice of a parameter held by one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardAssignment {
    /// Index of the device in the mesh
    pub device_index: usize,

    /// Position of this block within the replica group (0 when replicated)
    pub block_index: usize,

    /// Start along the split dimension (inclusive)
    pub start: usize,

    /// End along the split dimension (exclusive)
    pub end: usize,
}

impl ShardAssignment {
    /// Width of the held range
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, index: usize) -> bool {
        index >= self.start && index < self.end
    }
}

/// Placement of one parameter across the mesh
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSharding {
    pub meta: ParamMeta,
    pub spec: PartitionSpec,
    /// One entry per mesh device, in device order
    pub assignments: Vec<ShardAssignment>,
}

impl TensorSharding {
    /// Split tensor dimension and the number of blocks it is cut into
    pub fn split(&self) -> Option<(usize, usize)> {
        self.spec.sharded_dim().map(|(dim, _)| {
            let blocks = self
                .assignments
                .iter()
                .map(|a| a.block_index)
                .max()
                .unwrap_or(0)
                + 1;
            (dim, blocks)
        })
    }

    pub fn is_replicated(&self) -> bool {
        self.spec.is_replicated()
    }

    /// Shape of the slice held by `device_index`
    pub fn local_shape(&self, device_index: usize) -> Vec<usize> {
        let mut shape = self.meta.shape.clone();
        if let (Some((dim, _)), Some(a)) = (self.spec.sharded_dim(), self.assignments.get(device_index)) {
            shape[dim] = a.len();
        }
        shape
    }

    /// Bytes held by `device_index` at the storage dtype
    pub fn local_bytes(&self, device_index: usize) -> u64 {
        let numel: usize = self.local_shape(device_index).iter().product();
        (numel * self.meta.dtype.size_in_bytes()) as u64
    }
}

/// Sharding decisions for every parameter of a checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardingPlan {
    pub strategy: ShardingStrategy,
    pub mesh: DeviceMesh,
    entries: BTreeMap<String, TensorSharding>,
}

impl ShardingPlan {
    /// Decide a partition spec and device ranges for every parameter
    pub fn build(strategy: &ShardingStrategy, mesh: &DeviceMesh, metas: &[ParamMeta]) -> Result<Self> {
        let mut entries = BTreeMap::new();

        for meta in metas {
            let spec = strategy.partition_spec(meta, mesh)?;
            let assignments = match spec.sharded_dim() {
                None => (0..mesh.len())
                    .map(|device_index| ShardAssignment {
                        device_index,
                        block_index: 0,
                        start: 0,
                        end: meta.shape.first().copied().unwrap_or(0),
                    })
                    .collect(),
                Some((dim, axis)) => {
                    let axis_idx = mesh.axis_index(axis)?;
                    let n = mesh.axes()[axis_idx].size;
                    (0..mesh.len())
                        .map(|device_index| {
                            let block_index = mesh.coords(device_index)[axis_idx];
                            let (start, end) = block_range(meta.shape[dim], n, block_index);
                            ShardAssignment {
                                device_index,
                                block_index,
                                start,
                                end,
                            }
                        })
                        .collect()
                }
            };

            if entries
                .insert(
                    meta.name.clone(),
                    TensorSharding {
                        meta: meta.clone(),
                        spec,
                        assignments,
                    },
                )
                .is_some()
            {
                return Err(EngineError::Sharding(format!(
                    "Parameter '{}' listed twice",
                    meta.name
                )));
            }
        }

        Ok(Self {
            strategy: strategy.clone(),
            mesh: mesh.clone(),
            entries,
        })
    }

    pub fn get(&self, name: &str) -> Option<&TensorSharding> {
        self.entries.get(name)
    }

    /// Get a parameter's sharding or fail with `NotFound`
    pub fn require(&self, name: &str) -> Result<&TensorSharding> {
        self.get(name)
            .ok_or_else(|| EngineError::NotFound(format!("Parameter '{}' in sharding plan", name)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TensorSharding)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of parameters that are actually split
    pub fn num_sharded(&self) -> usize {
        self.entries.values().filter(|e| !e.is_replicated()).count()
    }

    /// Bytes each device holds, in device order
    pub fn bytes_per_device(&self) -> Vec<u64> {
        (0..self.mesh.len())
            .map(|d| self.entries.values().map(|e| e.local_bytes(d)).sum())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, MeshAxis};
    use crate::tensor::DType;

    fn metas() -> Vec<ParamMeta> {
        vec![
            ParamMeta::new("embedder/input_embedding", vec![260, 64], DType::F32),
            ParamMeta::new("layer_0/attn/q_proj", vec![64, 100], DType::F32),
            ParamMeta::new("final_norm/scale", vec![64], DType::F32),
        ]
    }

    #[test]
    fn test_replicated_plan() {
        let mesh = DeviceMesh::linear(4, "data").unwrap();
        let plan = ShardingPlan::build(&ShardingStrategy::Replicated, &mesh, &metas()).unwrap();

        assert_eq!(plan.len(), 3);
        assert_eq!(plan.num_sharded(), 0);
        let total: u64 = metas().iter().map(|m| m.size_bytes()).sum();
        assert!(plan.bytes_per_device().iter().all(|&b| b == total));
    }

    #[test]
    fn test_tensor_parallel_full_column_coverage() {
        let mesh = DeviceMesh::linear(3, "model").unwrap();
        let plan =
            ShardingPlan::build(&ShardingStrategy::tensor_parallel("model"), &mesh, &metas()).unwrap();

        let q = plan.get("layer_0/attn/q_proj").unwrap();
        assert_eq!(q.split(), Some((1, 3)));

        let mut covered = vec![false; 100];
        for a in &q.assignments {
            for col in a.start..a.end {
                assert!(!covered[col], "column {} assigned twice", col);
                covered[col] = true;
            }
        }
        assert!(covered.iter().all(|&c| c), "not all columns covered");

        // Last device takes the remainder
        assert_eq!(q.assignments[2].len(), 34);
        assert_eq!(q.local_shape(2), vec![64, 34]);

        // Vector stays whole
        assert!(plan.get("final_norm/scale").unwrap().is_replicated());
    }

    #[test]
    fn test_fsdp_bytes_split_evenly() {
        let mesh = DeviceMesh::linear(4, "data").unwrap();
        let strategy = ShardingStrategy::Fsdp {
            axis: "data".to_string(),
            min_size_to_shard_bytes: 1024,
        };
        let plan = ShardingPlan::build(&strategy, &mesh, &metas()).unwrap();

        // 260 rows split 4 ways, 100 columns split 4 ways
        assert_eq!(plan.get("embedder/input_embedding").unwrap().split(), Some((0, 4)));
        assert_eq!(plan.get("layer_0/attn/q_proj").unwrap().split(), Some((1, 4)));
        assert!(plan.get("final_norm/scale").unwrap().is_replicated());

        let bytes = plan.bytes_per_device();
        assert!(bytes.windows(2).all(|w| w[0] == w[1]));
        let expected = (260 * 64 * 4 + 64 * 100 * 4) / 4 + 64 * 4;
        assert_eq!(bytes[0], expected as u64);
    }

    #[test]
    fn test_two_axis_mesh_replicates_across_other_axis() {
        let devices = (0..4).map(|i| Device::virtual_device(i, 0)).collect();
        let mesh = DeviceMesh::new(
            devices,
            vec![MeshAxis::new("data", 2), MeshAxis::new("model", 2)],
        )
        .unwrap();
        let plan =
            ShardingPlan::build(&ShardingStrategy::tensor_parallel("model"), &mesh, &metas()).unwrap();

        let q = plan.get("layer_0/attn/q_proj").unwrap();
        // Devices 0 and 2 share model coordinate 0
        assert_eq!(q.assignments[0].start, q.assignments[2].start);
        assert_eq!(q.assignments[0].end, q.assignments[2].end);
        assert_eq!(q.assignments[1].block_index, 1);
        assert_eq!(q.assignments[3].block_index, 1);
    }

    #[test]
    fn test_duplicate_meta_and_unknown_param() {
        let mesh = DeviceMesh::linear(2, "data").unwrap();
        let mut dup = metas();
        dup.push(dup[0].clone());
        assert!(ShardingPlan::build(&ShardingStrategy::Replicated, &mesh, &dup).is_err());

        let plan = ShardingPlan::build(&ShardingStrategy::Replicated, &mesh, &metas()).unwrap();
        assert!(plan.require("missing").is_err());
    }
}
