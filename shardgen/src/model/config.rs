use crate::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};

/// Decoder hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Number of transformer layers
    pub num_layers: usize,
    /// Residual stream width
    pub embed_dim: usize,
    /// Intermediate size for the MLP
    pub hidden_dim: usize,
    /// Number of query heads
    pub num_heads: usize,
    /// Number of KV heads (for GQA)
    pub num_kv_heads: usize,
    /// Width of each head
    pub head_dim: usize,
    /// Vocabulary size
    pub vocab_size: usize,
    /// RMS norm epsilon
    pub rms_norm_eps: f32,
    /// RoPE base frequency
    pub rope_base: f32,
}

impl ModelConfig {
    /// Two-layer model for tests and quick runs
    pub fn tiny() -> Self {
        Self {
            num_layers: 2,
            embed_dim: 32,
            hidden_dim: 64,
            num_heads: 4,
            num_kv_heads: 2,
            head_dim: 8,
            vocab_size: 259,
            rms_norm_eps: 1e-6,
            rope_base: 10_000.0,
        }
    }

    pub fn small() -> Self {
        Self {
            num_layers: 4,
            embed_dim: 128,
            hidden_dim: 512,
            num_heads: 8,
            num_kv_heads: 4,
            head_dim: 16,
            vocab_size: 259,
            rms_norm_eps: 1e-6,
            rope_base: 10_000.0,
        }
    }

    /// Look up a preset by name
    pub fn preset(name: &str) -> Result<Self> {
        match name {
            "tiny" => Ok(Self::tiny()),
            "small" => Ok(Self::small()),
            other => Err(EngineError::Config(format!("Unknown model preset '{}'", other))),
        }
    }

    /// Check that the dimensions fit together
    pub fn validate(&self) -> Result<()> {
        let dims = [
            ("num_layers", self.num_layers),
            ("embed_dim", self.embed_dim),
            ("hidden_dim", self.hidden_dim),
            ("num_heads", self.num_heads),
            ("num_kv_heads", self.num_kv_heads),
            ("head_dim", self.head_dim),
            ("vocab_size", self.vocab_size),
        ];
        if let Some((name, _)) = dims.iter().find(|(_, v)| *v == 0) {
            return Err(EngineError::Config(format!("{} must be positive", name)));
        }
        if self.num_heads % self.num_kv_heads != 0 {
            return Err(EngineError::Config(format!(
                "num_heads {} is not a multiple of num_kv_heads {}",
                self.num_heads, self.num_kv_heads
            )));
        }
        if self.head_dim % 2 != 0 {
            return Err(EngineError::Config(format!(
                "head_dim {} must be even for rotary embeddings",
                self.head_dim
            )));
        }
        if self.rms_norm_eps <= 0.0 || self.rope_base <= 0.0 {
            return Err(EngineError::Config(
                "rms_norm_eps and rope_base must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Query heads sharing each KV head
    pub fn group_size(&self) -> usize {
        self.num_heads / self.num_kv_heads
    }

    /// Name and full shape of every parameter
    ///
    /// Projection weights are `[in_features, out_features]`.
    pub fn param_shapes(&self) -> Vec<(String, Vec<usize>)> {
        let d = self.embed_dim;
        let q_width = self.num_heads * self.head_dim;
        let kv_width = self.num_kv_heads * self.head_dim;

        let mut shapes = vec![(
            "embedder/input_embedding".to_string(),
            vec![self.vocab_size, d],
        )];
        for i in 0..self.num_layers {
            let p = format!("layer_{}", i);
            shapes.push((format!("{}/pre_attention_norm/scale", p), vec![d]));
            shapes.push((format!("{}/attn/q_proj", p), vec![d, q_width]));
            shapes.push((format!("{}/attn/k_proj", p), vec![d, kv_width]));
            shapes.push((format!("{}/attn/v_proj", p), vec![d, kv_width]));
            shapes.push((format!("{}/attn/o_proj", p), vec![q_width, d]));
            shapes.push((format!("{}/pre_ffw_norm/scale", p), vec![d]));
            shapes.push((format!("{}/mlp/gate_proj", p), vec![d, self.hidden_dim]));
            shapes.push((format!("{}/mlp/up_proj", p), vec![d, self.hidden_dim]));
            shapes.push((format!("{}/mlp/down_proj", p), vec![self.hidden_dim, d]));
        }
        shapes.push(("final_norm/scale".to_string(), vec![d]));
        shapes
    }

    /// Total parameter count
    pub fn num_params(&self) -> usize {
        self.param_shapes()
            .iter()
            .map(|(_, s)| s.iter().product::<usize>())
            .sum()
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::tiny()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        assert!(ModelConfig::tiny().validate().is_ok());
        assert!(ModelConfig::small().validate().is_ok());
        assert!(ModelConfig::preset("huge").is_err());
    }

    #[test]
    fn test_validation_errors() {
        let mut config = ModelConfig::tiny();
        config.num_kv_heads = 3;
        assert!(config.validate().is_err());

        let mut config = ModelConfig::tiny();
        config.head_dim = 7;
        assert!(config.validate().is_err());

        let mut config = ModelConfig::tiny();
        config.num_layers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_param_shapes() {
        let config = ModelConfig::tiny();
        let shapes = config.param_shapes();
        // embedding + 9 per layer + final norm
        assert_eq!(shapes.len(), 2 + 9 * config.num_layers);

        let q = shapes.iter().find(|(n, _)| n == "layer_1/attn/q_proj").unwrap();
        assert_eq!(q.1, vec![32, 32]);
        let k = shapes.iter().find(|(n, _)| n == "layer_1/attn/k_proj").unwrap();
        assert_eq!(k.1, vec![32, 16]);
        assert_eq!(config.group_size(), 2);
    }
}
