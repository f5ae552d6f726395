//! Batched autoregressive sampling over sharded parameters
//!
//! Prompts are tokenized into a shared PAD-filled buffer of width
//! `max_prompt_len + total_generation_steps + 1`. Each step feeds one column
//! of the buffer to the model, forces prompt tokens while the prompt is being
//! consumed and samples afterwards. Decoding stops when every sequence has
//! produced EOS or the buffer is full.

mod sampling;

pub use sampling::SamplingMethod;

use crate::errors::{EngineError, Result};
use crate::loader::ShardedParams;
use crate::model::Transformer;
use crate::stats::InferenceStats;
use crate::tensor::DType;
use crate::tokenizer::Tokenizer;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Parameters of one `sample` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRequest {
    pub total_generation_steps: usize,
    /// Include the prompt in the output
    #[serde(default)]
    pub echo: bool,
    #[serde(default)]
    pub return_logits: bool,
    /// Strings that must each encode to a single token id
    #[serde(default)]
    pub forbidden_tokens: Vec<String>,
    #[serde(default)]
    pub sampling: SamplingMethod,
}

impl SampleRequest {
    pub fn new(total_generation_steps: usize) -> Self {
        Self {
            total_generation_steps,
            echo: false,
            return_logits: false,
            forbidden_tokens: Vec::new(),
            sampling: SamplingMethod::Greedy,
        }
    }

    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn with_logits(mut self, return_logits: bool) -> Self {
        self.return_logits = return_logits;
        self
    }

    pub fn with_forbidden_tokens<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.forbidden_tokens = tokens.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingMethod) -> Self {
        self.sampling = sampling;
        self
    }
}

/// Result of one `sample` call, one entry per prompt
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplerOutput {
    /// Decoded text
    pub text: Vec<String>,
    /// Per-position logits, empty unless requested
    pub logits: Vec<Vec<Vec<f32>>>,
    /// Output token ids (PAD after the first EOS)
    pub tokens: Vec<Vec<u32>>,
}

/// Mutable decoding state for one batch
struct SamplingState {
    token_buffer: Vec<Vec<u32>>,
    positions: Vec<Vec<usize>>,
    num_input_tokens: Vec<usize>,
    logits_buffer: Option<Vec<Vec<Vec<f32>>>>,
    done: Vec<bool>,
    step: usize,
    total_sampling_steps: usize,
    generated: u64,
}

/// Text sampler bound to a model, a tokenizer and loaded parameters
pub struct Sampler {
    transformer: Arc<dyn Transformer>,
    tokenizer: Arc<dyn Tokenizer>,
    params: Arc<ShardedParams>,
    cache_length: usize,
    rng: StdRng,
    stats: Arc<InferenceStats>,
}

impl Sampler {
    pub fn new(
        transformer: Arc<dyn Transformer>,
        tokenizer: Arc<dyn Tokenizer>,
        params: Arc<ShardedParams>,
        cache_length: usize,
        seed: u64,
    ) -> Result<Self> {
        if cache_length == 0 {
            return Err(EngineError::InvalidArgument(
                "Cache length must be positive".to_string(),
            ));
        }
        let model_vocab = transformer.config().vocab_size;
        if tokenizer.vocab_size() > model_vocab {
            return Err(EngineError::Config(format!(
                "Tokenizer vocabulary ({}) exceeds model vocabulary ({})",
                tokenizer.vocab_size(),
                model_vocab
            )));
        }
        Ok(Self {
            transformer,
            tokenizer,
            params,
            cache_length,
            rng: StdRng::seed_from_u64(seed),
            stats: Arc::new(InferenceStats::new()),
        })
    }

    /// Storage dtype of the loaded parameters
    pub fn dtype(&self) -> DType {
        self.params.dtype()
    }

    pub fn cache_length(&self) -> usize {
        self.cache_length
    }

    pub fn stats(&self) -> Arc<InferenceStats> {
        self.stats.clone()
    }

    pub fn params(&self) -> &ShardedParams {
        &self.params
    }

    /// Encode with a leading BOS
    pub fn tokenize(&self, text: &str) -> Vec<u32> {
        let mut tokens = vec![self.tokenizer.special_tokens().bos];
        tokens.extend(self.tokenizer.encode(text));
        tokens
    }

    /// Greedy continuation of a single prompt
    pub fn sample_text(&mut self, prompt: &str, max_new_tokens: usize) -> Result<String> {
        let output = self.sample(&[prompt], &SampleRequest::new(max_new_tokens))?;
        Ok(output.text.into_iter().next().unwrap_or_default())
    }

    /// Sample continuations for a batch of prompts
    pub fn sample<S: AsRef<str>>(&mut self, prompts: &[S], request: &SampleRequest) -> Result<SamplerOutput> {
        let start = Instant::now();
        match self.run(prompts, request) {
            Ok((output, state)) => {
                let prompt_tokens: usize = state.num_input_tokens.iter().sum();
                self.stats.record_success(
                    prompt_tokens as u64,
                    state.generated,
                    state.step as u64,
                    start.elapsed().as_millis() as u64,
                );
                info!(
                    batch = prompts.len(),
                    steps = state.step,
                    generated = state.generated,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Sampling complete"
                );
                Ok(output)
            }
            Err(e) => {
                self.stats.record_failure();
                Err(e)
            }
        }
    }

    fn run<S: AsRef<str>>(&mut self, prompts: &[S], request: &SampleRequest) -> Result<(SamplerOutput, SamplingState)> {
        if prompts.is_empty() {
            return Err(EngineError::InvalidArgument("No prompts to sample from".to_string()));
        }
        request.sampling.validate()?;
        let forbidden = self.forbidden_token_ids(&request.forbidden_tokens)?;

        let all_input_ids: Vec<Vec<u32>> = prompts.iter().map(|p| self.tokenize(p.as_ref())).collect();
        let max_input_length = all_input_ids.iter().map(Vec::len).max().unwrap_or(0);
        let total_sampling_steps = max_input_length + request.total_generation_steps;
        let mut state = self.init_state(&all_input_ids, total_sampling_steps, request.return_logits);
        let mut cache = self.transformer.init_cache(prompts.len(), self.cache_length)?;

        debug!(
            batch = prompts.len(),
            max_input_length,
            total_sampling_steps,
            cache_length = self.cache_length,
            "Starting sampling loop"
        );

        while state.step < state.total_sampling_steps && state.done.iter().any(|d| !d) {
            self.sample_step(&mut state, &mut cache, &forbidden, &request.sampling)?;
        }

        let output = self.finish(&state, request.echo);
        Ok((output, state))
    }

    fn forbidden_token_ids(&self, tokens: &[String]) -> Result<Vec<u32>> {
        tokens
            .iter()
            .map(|token| match self.tokenizer.encode(token).as_slice() {
                [id] => Ok(*id),
                ids => Err(EngineError::InvalidArgument(format!(
                    "Forbidden token {:?} must map to a single token id, got {}",
                    token,
                    ids.len()
                ))),
            })
            .collect()
    }

    fn init_state(&self, all_input_ids: &[Vec<u32>], total_sampling_steps: usize, include_logits: bool) -> SamplingState {
        let pad = self.tokenizer.special_tokens().pad;
        let buffer_size = total_sampling_steps + 1;

        let mut token_buffer = vec![vec![pad; buffer_size]; all_input_ids.len()];
        let mut input_mask = vec![vec![true; buffer_size]; all_input_ids.len()];
        for (b, ids) in all_input_ids.iter().enumerate() {
            token_buffer[b][..ids.len()].copy_from_slice(ids);
            for (m, &id) in input_mask[b].iter_mut().zip(ids) {
                *m = id != pad;
            }
        }

        let vocab = self.transformer.config().vocab_size;
        SamplingState {
            positions: build_positions(&input_mask),
            token_buffer,
            num_input_tokens: all_input_ids.iter().map(Vec::len).collect(),
            logits_buffer: include_logits
                .then(|| vec![vec![vec![0.0; vocab]; buffer_size]; all_input_ids.len()]),
            done: vec![false; all_input_ids.len()],
            step: 0,
            total_sampling_steps,
            generated: 0,
        }
    }

    fn sample_step(
        &mut self,
        state: &mut SamplingState,
        cache: &mut crate::model::KvCache,
        forbidden: &[u32],
        sampling: &SamplingMethod,
    ) -> Result<()> {
        let special = self.tokenizer.special_tokens();
        let step = state.step;

        let input_mask: Vec<Vec<bool>> = state
            .token_buffer
            .iter()
            .map(|row| row.iter().map(|&t| t != special.pad).collect())
            .collect();
        let attention_mask = compute_attention_mask(step, self.cache_length, &input_mask);
        let tokens: Vec<u32> = state.token_buffer.iter().map(|row| row[step]).collect();
        let positions: Vec<usize> = state.positions.iter().map(|row| row[step]).collect();

        let mut logits = self
            .transformer
            .apply(&self.params, &tokens, &positions, cache, &attention_mask)?;
        let vocab = logits.cols();
        for b in 0..logits.rows() {
            for &id in forbidden {
                if (id as usize) < vocab {
                    logits.set(b, id as usize, f32::NEG_INFINITY);
                }
            }
        }

        let mut step_rng = StdRng::seed_from_u64(self.rng.gen());
        for b in 0..state.token_buffer.len() {
            let next = if step + 1 < state.num_input_tokens[b] {
                state.token_buffer[b][step + 1]
            } else {
                // The last buffer slot and tokens after EOS never reach the output
                if !state.done[b] && step + 1 < state.total_sampling_steps {
                    state.generated += 1;
                }
                sampling.next_token(logits.row(b), &mut step_rng)?
            };
            state.token_buffer[b][step + 1] = next;
            if let Some(buffer) = state.logits_buffer.as_mut() {
                buffer[b][step + 1] = logits.row(b).to_vec();
            }
            if next == special.eos {
                state.done[b] = true;
            }
        }

        state.step += 1;
        Ok(())
    }

    fn finish(&self, state: &SamplingState, echo: bool) -> SamplerOutput {
        let special = self.tokenizer.special_tokens();
        let mut output = SamplerOutput::default();
        for (b, row) in state.token_buffer.iter().enumerate() {
            let mut row = row.clone();
            mask_tokens_after_eos(&mut row, special.eos, special.pad);

            let start = if echo { 0 } else { state.num_input_tokens[b] };
            let end = state.total_sampling_steps;
            let tokens = row.get(start..end).map(<[u32]>::to_vec).unwrap_or_default();
            output.text.push(self.tokenizer.decode(&tokens));
            output.tokens.push(tokens);
            if let Some(buffer) = &state.logits_buffer {
                output
                    .logits
                    .push(buffer[b].get(start..end).map(<[Vec<f32>]>::to_vec).unwrap_or_default());
            }
        }
        output
    }
}

/// Causal attention mask over `cache_length` slots for decoding step `step`
///
/// Slot `j` is visible when `j <= step` and the matching entry of the input
/// mask window is true. The window covers the last `cache_length` buffer
/// positions once `step` runs past the cache length.
pub fn compute_attention_mask(step: usize, cache_length: usize, input_mask: &[Vec<bool>]) -> Vec<Vec<bool>> {
    input_mask
        .iter()
        .map(|row| {
            let max_seq_len = row.len().min(cache_length);
            let start = (step + 1)
                .saturating_sub(cache_length)
                .min(row.len() - max_seq_len);
            (0..cache_length)
                .map(|j| {
                    let visible = if j < max_seq_len { row[start + j] } else { true };
                    j <= step && visible
                })
                .collect()
        })
        .collect()
}

/// Position of each buffer entry, counting only unmasked tokens
pub fn build_positions(input_mask: &[Vec<bool>]) -> Vec<Vec<usize>> {
    input_mask
        .iter()
        .map(|row| {
            let mut count = 0usize;
            row.iter()
                .map(|&m| {
                    count += m as usize;
                    count.saturating_sub(1)
                })
                .collect()
        })
        .collect()
}

/// Replace every token after the first EOS with PAD
pub fn mask_tokens_after_eos(tokens: &mut [u32], eos: u32, pad: u32) {
    if let Some(first) = tokens.iter().position(|&t| t == eos) {
        tokens[first + 1..].fill(pad);
    }
}
