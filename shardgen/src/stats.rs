//! Sampling statistics tracking

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Counters for sampler activity
#[derive(Debug)]
pub struct InferenceStats {
    /// Completed sampling calls
    pub sampling_calls: AtomicU64,

    /// Failed sampling calls
    pub sampling_failures: AtomicU64,

    /// Prompt tokens processed (including BOS)
    pub total_prompt_tokens: AtomicU64,

    /// Tokens produced by the sampling method
    pub total_tokens_generated: AtomicU64,

    /// Decoding steps run (one model apply each)
    pub decode_steps: AtomicU64,

    /// Total sampling time in milliseconds
    pub total_sampling_time_ms: AtomicU64,

    /// Start time for uptime tracking
    pub start_time: Instant,
}

impl Default for InferenceStats {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceStats {
    pub fn new() -> Self {
        Self {
            sampling_calls: AtomicU64::new(0),
            sampling_failures: AtomicU64::new(0),
            total_prompt_tokens: AtomicU64::new(0),
            total_tokens_generated: AtomicU64::new(0),
            decode_steps: AtomicU64::new(0),
            total_sampling_time_ms: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a finished sampling call
    pub fn record_success(&self, prompt_tokens: u64, generated_tokens: u64, steps: u64, time_ms: u64) {
        self.sampling_calls.fetch_add(1, Ordering::Relaxed);
        self.total_prompt_tokens.fetch_add(prompt_tokens, Ordering::Relaxed);
        self.total_tokens_generated
            .fetch_add(generated_tokens, Ordering::Relaxed);
        self.decode_steps.fetch_add(steps, Ordering::Relaxed);
        self.total_sampling_time_ms.fetch_add(time_ms, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.sampling_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get average tokens per second
    pub fn avg_tokens_per_second(&self) -> f64 {
        let total_time_s = self.total_sampling_time_ms.load(Ordering::Relaxed) as f64 / 1000.0;
        if total_time_s == 0.0 {
            return 0.0;
        }
        self.total_tokens_generated.load(Ordering::Relaxed) as f64 / total_time_s
    }

    /// Average milliseconds per decoding step
    pub fn avg_step_time_ms(&self) -> f64 {
        let steps = self.decode_steps.load(Ordering::Relaxed);
        if steps == 0 {
            return 0.0;
        }
        self.total_sampling_time_ms.load(Ordering::Relaxed) as f64 / steps as f64
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Log statistics summary
    pub fn log_summary(&self) {
        info!(
            sampling_calls = self.sampling_calls.load(Ordering::Relaxed),
            sampling_failures = self.sampling_failures.load(Ordering::Relaxed),
            prompt_tokens = self.total_prompt_tokens.load(Ordering::Relaxed),
            generated_tokens = self.total_tokens_generated.load(Ordering::Relaxed),
            decode_steps = self.decode_steps.load(Ordering::Relaxed),
            avg_tokens_per_second = format!("{:.2}", self.avg_tokens_per_second()),
            avg_step_time_ms = format!("{:.2}", self.avg_step_time_ms()),
            uptime_seconds = self.uptime_seconds(),
            "Sampling statistics"
        );
    }

    /// Display formatted metrics (for CLI)
    pub fn display(&self) {
        use colored::Colorize;

        println!("\n{}", "Sampling Metrics".bold().cyan());
        println!("{}", "================".cyan());
        println!(
            "  Calls:               {}",
            self.sampling_calls.load(Ordering::Relaxed).to_string().green()
        );
        println!(
            "  Failed:              {}",
            self.sampling_failures.load(Ordering::Relaxed).to_string().red()
        );
        println!(
            "  Prompt Tokens:       {}",
            self.total_prompt_tokens.load(Ordering::Relaxed)
        );
        println!(
            "  Tokens Generated:    {}",
            self.total_tokens_generated.load(Ordering::Relaxed)
        );
        println!(
            "  Decode Steps:        {}",
            self.decode_steps.load(Ordering::Relaxed)
        );
        println!("  Avg Tokens/sec:      {:.2}", self.avg_tokens_per_second());
        println!("  Avg Step Time:       {:.2}ms", self.avg_step_time_ms());
        println!();
    }

    /// Serialize counters to JSON
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "sampling_calls": self.sampling_calls.load(Ordering::Relaxed),
            "sampling_failures": self.sampling_failures.load(Ordering::Relaxed),
            "total_prompt_tokens": self.total_prompt_tokens.load(Ordering::Relaxed),
            "total_tokens_generated": self.total_tokens_generated.load(Ordering::Relaxed),
            "decode_steps": self.decode_steps.load(Ordering::Relaxed),
            "total_sampling_time_ms": self.total_sampling_time_ms.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_recording() {
        let stats = InferenceStats::new();
        stats.record_success(10, 50, 59, 1000);
        stats.record_success(5, 50, 54, 1000);
        stats.record_failure();

        assert_eq!(stats.sampling_calls.load(Ordering::Relaxed), 2);
        assert_eq!(stats.sampling_failures.load(Ordering::Relaxed), 1);
        assert_eq!(stats.total_prompt_tokens.load(Ordering::Relaxed), 15);
        assert_eq!(stats.decode_steps.load(Ordering::Relaxed), 113);
        assert!((stats.avg_tokens_per_second() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_stats() {
        let stats = InferenceStats::default();
        assert_eq!(stats.avg_tokens_per_second(), 0.0);
        assert_eq!(stats.avg_step_time_ms(), 0.0);
        assert_eq!(stats.to_json()["sampling_calls"], 0);
    }
}
