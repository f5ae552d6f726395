//! Reference decoder model
//!
//! - [`ModelConfig`]: hyperparameters, presets and parameter naming
//! - [`Transformer`]: the one-step apply interface the sampler drives
//! - [`DecoderTransformer`]: RMSNorm, GQA attention with RoPE, SwiGLU MLP,
//!   logits through the tied embedding
//! - [`KvCache`]: fixed-window key/value cache
//! - [`init_params`]: deterministic Xavier-initialized weights

mod config;
mod init;
mod kv_cache;
mod transformer;

pub use config::ModelConfig;
pub use init::init_params;
pub use kv_cache::{KvCache, LayerKvCache};
pub use transformer::{DecoderTransformer, Transformer};
