//! Parameters distributed over a device mesh

use crate::collective::{ring_all_gather, ring_all_reduce};
use crate::device::DeviceMesh;
use crate::errors::{EngineError, Result};
use crate::params::{ParamMeta, ParamTree};
use crate::sharding::{PartitionSpec, ShardingPlan, ShardingStrategy};
use crate::tensor::ops::matmul;
use crate::tensor::{DType, Tensor};
use tracing::trace;

/// One [`ParamTree`] per device, holding only that device's slices
#[derive(Debug, Clone)]
pub struct ShardedParams {
    plan: ShardingPlan,
    dtype: DType,
    device_params: Vec<ParamTree>,
}

impl ShardedParams {
    /// Shard an in-memory parameter tree
    pub fn from_params(params: &ParamTree, strategy: &ShardingStrategy, mesh: &DeviceMesh) -> Result<Self> {
        let metas = params.metas(DType::F32);
        let plan = ShardingPlan::build(strategy, mesh, &metas)?;
        let mut sharded = Self::empty(plan, DType::F32);
        for (name, tensor) in params.iter() {
            sharded.insert_full(name, tensor)?;
        }
        sharded.finish()?;
        Ok(sharded)
    }

    /// No parameters placed yet
    pub(crate) fn empty(plan: ShardingPlan, dtype: DType) -> Self {
        let device_params = vec![ParamTree::new(); plan.mesh.len()];
        Self {
            plan,
            dtype,
            device_params,
        }
    }

    /// Slice a full tensor and hand each device its block
    pub(crate) fn insert_full(&mut self, name: &str, tensor: &Tensor) -> Result<()> {
        let entry = self.plan.require(name)?;
        if entry.meta.shape != tensor.shape {
            return Err(EngineError::Shape(format!(
                "Parameter '{}' has shape {:?}, plan expects {:?}",
                name, tensor.shape, entry.meta.shape
            )));
        }

        match entry.spec.sharded_dim() {
            None => {
                for params in &mut self.device_params {
                    params.insert(name, tensor.clone())?;
                }
            }
            Some((dim, _)) => {
                for (params, a) in self.device_params.iter_mut().zip(&entry.assignments) {
                    params.insert(name, tensor.slice_axis(dim, a.start, a.end)?)?;
                }
            }
        }
        Ok(())
    }

    /// Fail unless every planned parameter has been placed
    pub(crate) fn finish(&self) -> Result<()> {
        let placed = self.device_params.first().map(ParamTree::len).unwrap_or(0);
        if placed != self.plan.len() {
            let missing: Vec<&String> = self
                .plan
                .iter()
                .map(|(name, _)| name)
                .filter(|name| self.device_params.first().map(|p| !p.contains(name)).unwrap_or(true))
                .collect();
            return Err(EngineError::Checkpoint(format!(
                "Parameters missing from checkpoint: {:?}",
                missing
            )));
        }
        Ok(())
    }

    pub fn plan(&self) -> &ShardingPlan {
        &self.plan
    }

    pub fn mesh(&self) -> &DeviceMesh {
        &self.plan.mesh
    }

    /// Storage dtype of the source checkpoint
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Parameters held by the device with the given id
    pub fn device_params(&self, device_id: u32) -> Result<&ParamTree> {
        let idx = self
            .mesh()
            .devices()
            .iter()
            .position(|d| d.id == device_id)
            .ok_or_else(|| EngineError::NotFound(format!("Device {} in mesh", device_id)))?;
        Ok(&self.device_params[idx])
    }

    /// Partition spec of a parameter
    pub fn spec(&self, name: &str) -> Result<&PartitionSpec> {
        Ok(&self.plan.require(name)?.spec)
    }

    /// Full-shape metadata of every parameter
    pub fn metas(&self) -> Vec<ParamMeta> {
        self.plan.iter().map(|(_, e)| e.meta.clone()).collect()
    }

    /// Bytes each device holds at the storage dtype
    pub fn bytes_per_device(&self) -> Vec<u64> {
        self.plan.bytes_per_device()
    }

    /// Reconstruct one full parameter
    pub fn gather(&self, name: &str) -> Result<Tensor> {
        let entry = self.plan.require(name)?;
        match entry.spec.sharded_dim() {
            None => Ok(self.local(0, name)?.clone()),
            Some((dim, axis)) => {
                let group = self.plan.mesh.replica_group(axis)?;
                let blocks = group
                    .iter()
                    .map(|&d| self.local(d, name).cloned())
                    .collect::<Result<Vec<_>>>()?;
                trace!(param = %name, workers = group.len(), "All-gather");
                first_result(ring_all_gather(blocks, dim)?)
            }
        }
    }

    /// Reconstruct the whole parameter tree
    pub fn gather_all(&self) -> Result<ParamTree> {
        let mut params = ParamTree::new();
        for (name, _) in self.plan.iter() {
            params.insert(name.clone(), self.gather(name)?)?;
        }
        Ok(params)
    }

    /// `x @ W` computed over the shards of `W`
    ///
    /// - replicated `W`: one local product
    /// - `W` split on its output dimension: per-device products, all-gathered
    /// - `W` split on its input dimension: per-device products of the matching
    ///   input columns, all-reduced
    pub fn matmul(&self, name: &str, x: &Tensor) -> Result<Tensor> {
        let entry = self.plan.require(name)?;
        if entry.meta.shape.len() != 2 {
            return Err(EngineError::Shape(format!(
                "Parameter '{}' with shape {:?} is not a matrix",
                name, entry.meta.shape
            )));
        }

        match entry.spec.sharded_dim() {
            None => matmul(x, self.local(0, name)?),
            Some((dim, axis)) => {
                let group = self.plan.mesh.replica_group(axis)?;
                if dim == 1 {
                    let partials = group
                        .iter()
                        .map(|&d| matmul(x, self.local(d, name)?))
                        .collect::<Result<Vec<_>>>()?;
                    trace!(param = %name, workers = group.len(), "Column-parallel matmul");
                    first_result(ring_all_gather(partials, 1)?)
                } else {
                    x.expect_rank(2)?;
                    if x.cols() != entry.meta.shape[0] {
                        return Err(EngineError::Shape(format!(
                            "Matmul shape mismatch: {:?} @ '{}' {:?}",
                            x.shape, name, entry.meta.shape
                        )));
                    }
                    let partials = group
                        .iter()
                        .map(|&d| {
                            let a = entry.assignments[d];
                            matmul(&x.slice_axis(1, a.start, a.end)?, self.local(d, name)?)
                        })
                        .collect::<Result<Vec<_>>>()?;
                    trace!(param = %name, workers = group.len(), "Row-parallel matmul");
                    first_result(ring_all_reduce(partials)?)
                }
            }
        }
    }

    fn local(&self, device_index: usize, name: &str) -> Result<&Tensor> {
        self.device_params
            .get(device_index)
            .ok_or_else(|| EngineError::NotFound(format!("Device index {}", device_index)))?
            .require(name)
    }
}

fn first_result(results: Vec<Tensor>) -> Result<Tensor> {
    results
        .into_iter()
        .next()
        .ok_or_else(|| EngineError::Sharding("Collective returned no results".to_string()))
}
