//! Sharding strategies and plans
//!
//! A [`ShardingStrategy`] decides, per parameter, a [`PartitionSpec`]: which
//! tensor dimension (if any) is split over which mesh axis. A
//! [`ShardingPlan`] turns those specs into concrete `[start, end)` ranges
//! for every device.

mod plan;
mod strategy;

pub use plan::{ShardAssignment, ShardingPlan, TensorSharding};
pub use strategy::{block_range, PartitionSpec, ShardingStrategy, DEFAULT_MIN_SIZE_TO_SHARD_BYTES};
