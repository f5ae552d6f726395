//! Decoder forward pass over sharded parameters
//!
//! Every projection goes through [`ShardedParams::matmul`], so the same code
//! runs replicated, FSDP and tensor-parallel placements. Norm scales and the
//! embedding table are gathered whole.

use super::config::ModelConfig;
use super::kv_cache::KvCache;
use crate::errors::{EngineError, Result};
use crate::loader::ShardedParams;
use crate::tensor::ops::{apply_rope, embed_tokens, matmul, rms_norm, silu, softmax};
use crate::tensor::Tensor;
use tracing::trace;

/// Model apply interface used by the sampler
pub trait Transformer: Send + Sync {
    fn config(&self) -> &ModelConfig;

    /// Fresh cache for `batch_size` sequences
    fn init_cache(&self, batch_size: usize, cache_length: usize) -> Result<KvCache>;

    /// Run one decoding step
    ///
    /// `tokens[b]` is fed at `positions[b]`; `attention_mask[b][j]` says
    /// whether cache slot `j` is visible. Returns logits `[batch, vocab]`.
    fn apply(
        &self,
        params: &ShardedParams,
        tokens: &[u32],
        positions: &[usize],
        cache: &mut KvCache,
        attention_mask: &[Vec<bool>],
    ) -> Result<Tensor>;

    /// Logits for every position of one sequence, `[len, vocab]`
    fn forward(&self, params: &ShardedParams, tokens: &[u32]) -> Result<Tensor> {
        if tokens.is_empty() {
            return Err(EngineError::InvalidArgument("Empty token sequence".to_string()));
        }
        let len = tokens.len();
        let mut cache = self.init_cache(1, len)?;
        let mut rows = Vec::with_capacity(len);
        for (step, &token) in tokens.iter().enumerate() {
            let mask = vec![(0..len).map(|j| j <= step).collect::<Vec<_>>()];
            let logits = self.apply(params, &[token], &[step], &mut cache, &mask)?;
            rows.push(logits.data);
        }
        Tensor::from_rows(&rows)
    }
}

/// RMSNorm, grouped-query attention with RoPE, SwiGLU MLP
#[derive(Debug, Clone)]
pub struct DecoderTransformer {
    config: ModelConfig,
}

impl DecoderTransformer {
    pub fn new(config: ModelConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    fn kv_width(&self) -> usize {
        self.config.num_kv_heads * self.config.head_dim
    }

    /// Attention of each query row over its visible cache slots
    fn attend(
        &self,
        layer: usize,
        q: &Tensor,
        cache: &KvCache,
        attention_mask: &[Vec<bool>],
    ) -> Result<Tensor> {
        let cfg = &self.config;
        let hd = cfg.head_dim;
        let group = cfg.group_size();
        let scale = 1.0 / (hd as f32).sqrt();
        let batch = q.rows();
        let mut out = vec![0.0; batch * cfg.num_heads * hd];

        for b in 0..batch {
            let q_row = q.row(b);
            for h in 0..cfg.num_heads {
                let kv_h = h / group;
                let q_head = &q_row[h * hd..(h + 1) * hd];

                let scores: Vec<f32> = (0..cache.cache_length())
                    .map(|j| -> Result<f32> {
                        if !attention_mask[b][j] {
                            return Ok(f32::NEG_INFINITY);
                        }
                        let k = &cache.key(layer, b, j)?[kv_h * hd..(kv_h + 1) * hd];
                        Ok(q_head.iter().zip(k).map(|(x, y)| x * y).sum::<f32>() * scale)
                    })
                    .collect::<Result<_>>()?;
                let probs = softmax(&scores);

                let out_head = &mut out[(b * cfg.num_heads + h) * hd..(b * cfg.num_heads + h + 1) * hd];
                for (j, &p) in probs.iter().enumerate() {
                    if p == 0.0 {
                        continue;
                    }
                    let v = &cache.value(layer, b, j)?[kv_h * hd..(kv_h + 1) * hd];
                    for (o, &vv) in out_head.iter_mut().zip(v) {
                        *o += p * vv;
                    }
                }
            }
        }

        Tensor::new(out, vec![batch, cfg.num_heads * hd])
    }
}

impl Transformer for DecoderTransformer {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn init_cache(&self, batch_size: usize, cache_length: usize) -> Result<KvCache> {
        KvCache::new(self.config.num_layers, batch_size, cache_length, self.kv_width())
    }

    fn apply(
        &self,
        params: &ShardedParams,
        tokens: &[u32],
        positions: &[usize],
        cache: &mut KvCache,
        attention_mask: &[Vec<bool>],
    ) -> Result<Tensor> {
        let cfg = &self.config;
        let batch = tokens.len();
        if positions.len() != batch || cache.batch_size() != batch || attention_mask.len() != batch {
            return Err(EngineError::Shape(format!(
                "Batch mismatch: {} tokens, {} positions, {} mask rows, cache batch {}",
                batch,
                positions.len(),
                attention_mask.len(),
                cache.batch_size()
            )));
        }
        if let Some(row) = attention_mask.iter().find(|r| r.len() != cache.cache_length()) {
            return Err(EngineError::Shape(format!(
                "Attention mask width {} doesn't match cache length {}",
                row.len(),
                cache.cache_length()
            )));
        }

        let embedding = params.gather("embedder/input_embedding")?;
        let mut x = embed_tokens(&embedding, tokens)?.scale((cfg.embed_dim as f32).sqrt());

        for layer in 0..cfg.num_layers {
            let p = format!("layer_{}", layer);

            // Attention block
            let attn_norm = params.gather(&format!("{}/pre_attention_norm/scale", p))?;
            let normed = rms_norm(&x, &attn_norm, cfg.rms_norm_eps)?;

            let q = params.matmul(&format!("{}/attn/q_proj", p), &normed)?;
            let k = params.matmul(&format!("{}/attn/k_proj", p), &normed)?;
            let v = params.matmul(&format!("{}/attn/v_proj", p), &normed)?;
            let q = apply_rope(&q, positions, cfg.head_dim, cfg.rope_base)?;
            let k = apply_rope(&k, positions, cfg.head_dim, cfg.rope_base)?;

            for b in 0..batch {
                cache.write(layer, b, k.row(b), v.row(b))?;
            }

            let attn = self.attend(layer, &q, cache, attention_mask)?;
            let o = params.matmul(&format!("{}/attn/o_proj", p), &attn)?;
            x = x.add(&o)?;

            // MLP block with SwiGLU
            let ffw_norm = params.gather(&format!("{}/pre_ffw_norm/scale", p))?;
            let normed = rms_norm(&x, &ffw_norm, cfg.rms_norm_eps)?;
            let gate = params.matmul(&format!("{}/mlp/gate_proj", p), &normed)?;
            let up = params.matmul(&format!("{}/mlp/up_proj", p), &normed)?;
            let hidden = silu(&gate).mul(&up)?;
            let down = params.matmul(&format!("{}/mlp/down_proj", p), &hidden)?;
            x = x.add(&down)?;

            trace!(layer, "Layer forward complete");
        }
        cache.advance();

        let final_norm = params.gather("final_norm/scale")?;
        let normed = rms_norm(&x, &final_norm, cfg.rms_norm_eps)?;

        // Logits through the tied embedding
        matmul(&normed, &embedding.transpose()?)
    }
}
