//! Deterministic random weights
//!
//! Projections and the embedding use Xavier/Glorot uniform initialization:
//! `limit = sqrt(6 / (fan_in + fan_out))`, samples from `Uniform[-limit, limit]`.
//! Norm scales start at 1.0.

use super::config::ModelConfig;
use crate::errors::Result;
use crate::params::ParamTree;
use crate::tensor::Tensor;
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Xavier/Glorot uniform bound for a `[fan_in, fan_out]` matrix
fn xavier_limit(fan_in: usize, fan_out: usize) -> f32 {
    (6.0_f32 / (fan_in + fan_out) as f32).sqrt()
}

fn xavier_tensor(rng: &mut StdRng, rows: usize, cols: usize) -> Result<Tensor> {
    let limit = xavier_limit(rows, cols);
    let dist = Uniform::new_inclusive(-limit, limit);
    let data = (0..rows * cols).map(|_| dist.sample(rng)).collect();
    Tensor::new(data, vec![rows, cols])
}

/// Random parameters for `config`, identical for identical seeds
pub fn init_params(config: &ModelConfig, seed: u64) -> Result<ParamTree> {
    config.validate()?;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut params = ParamTree::new();

    // param_shapes order is fixed, so the draw sequence is too
    for (name, shape) in config.param_shapes() {
        let tensor = match shape.as_slice() {
            [rows, cols] => xavier_tensor(&mut rng, *rows, *cols)?,
            _ => Tensor::filled(shape, 1.0),
        };
        params.insert(name, tensor)?;
    }

    Ok(params)
}
