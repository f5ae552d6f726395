//! Parameter checkpoints
//!
//! Checkpoints are CBOR files holding a model config, a tensor index and
//! the encoded tensor data. Every tensor carries a sha256 of its stored
//! bytes, checked on load.
//!
//! ## Architecture
//!
//! ```text
//! ParamTree ──save──► ┌───────────────────┐
//!                     │  CheckpointStore  │
//!                     │  • resolve        │
//!                     │  • save           │
//!                     │  • load_metadata  │
//!                     │  • load / list    │
//!                     └───────────────────┘
//!                              │
//!                              ▼
//!                     ~/.shardgen/checkpoints/<id>.ckpt
//! ```

pub mod store;
pub mod types;

pub use store::{default_checkpoint_dir, CheckpointStore};
pub use types::{
    sha256_hex, CheckpointFile, CheckpointMetadata, TensorBlob, TensorIndexEntry,
    CHECKPOINT_EXTENSION,
};
