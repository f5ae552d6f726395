pub mod checkpoint;
pub mod collective;
pub mod config;
pub mod device;
pub mod errors;
pub mod loader;
pub mod model;
pub mod observability;
pub mod params;
pub mod sampler;
pub mod sharding;
pub mod stats;
pub mod tensor;
pub mod tokenizer;

pub use checkpoint::{CheckpointMetadata, CheckpointStore};
pub use collective::{ring_all_gather, ring_all_reduce};
pub use config::Config;
pub use device::{Device, DeviceCapabilities, DeviceMesh, MeshAxis};
pub use errors::{EngineError, Result};
pub use loader::{CheckpointLoader, ShardLoader, ShardedParams};
pub use model::{init_params, DecoderTransformer, KvCache, ModelConfig, Transformer};
pub use observability::{init_production_logging, init_simple_logging};
pub use params::{format_bytes, ParamMeta, ParamTree};
pub use sampler::{SampleRequest, Sampler, SamplerOutput, SamplingMethod};
pub use sharding::{PartitionSpec, ShardingPlan, ShardingStrategy};
pub use stats::InferenceStats;
pub use tensor::{DType, Tensor};
pub use tokenizer::{ByteTokenizer, SpecialTokens, Tokenizer};
