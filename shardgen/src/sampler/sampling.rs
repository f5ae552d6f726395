//! Next-token selection from logits

use crate::errors::{EngineError, Result};
use rand::distributions::{Distribution, WeightedIndex};
use serde::{Deserialize, Serialize};

/// How the next token is picked from a row of logits
///
/// `-inf` logits are never selected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SamplingMethod {
    /// Highest logit, lowest id on ties
    Greedy,
    /// Sample from the full softmax
    Random { temperature: f32 },
    /// Sample among the `k` highest logits
    TopK { k: usize, temperature: f32 },
    /// Sample from the smallest set whose probability mass reaches `p`
    TopP { p: f32, temperature: f32 },
}

impl Default for SamplingMethod {
    fn default() -> Self {
        SamplingMethod::Greedy
    }
}

impl SamplingMethod {
    pub fn validate(&self) -> Result<()> {
        let temperature = match self {
            SamplingMethod::Greedy => return Ok(()),
            SamplingMethod::Random { temperature } => *temperature,
            SamplingMethod::TopK { k, temperature } => {
                if *k == 0 {
                    return Err(EngineError::InvalidArgument("top-k needs k > 0".to_string()));
                }
                *temperature
            }
            SamplingMethod::TopP { p, temperature } => {
                if !(*p > 0.0 && *p <= 1.0) {
                    return Err(EngineError::InvalidArgument(format!(
                        "top-p needs 0 < p <= 1, got {}",
                        p
                    )));
                }
                *temperature
            }
        };
        if !(temperature > 0.0 && temperature.is_finite()) {
            return Err(EngineError::InvalidArgument(format!(
                "Temperature must be positive, got {}",
                temperature
            )));
        }
        Ok(())
    }

    /// Pick a token id from one row of logits
    pub fn next_token(&self, logits: &[f32], rng: &mut dyn rand::RngCore) -> Result<u32> {
        // Candidates sorted by logit, highest first
        let mut candidates: Vec<(f32, u32)> = logits
            .iter()
            .enumerate()
            .filter(|(_, l)| **l != f32::NEG_INFINITY && !l.is_nan())
            .map(|(i, &l)| (l, i as u32))
            .collect();
        if candidates.is_empty() {
            return Err(EngineError::InvalidArgument(
                "No token can be sampled: every logit is -inf".to_string(),
            ));
        }
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));

        let temperature = match self {
            SamplingMethod::Greedy => return Ok(candidates[0].1),
            SamplingMethod::Random { temperature } => *temperature,
            SamplingMethod::TopK { k, temperature } => {
                candidates.truncate(*k);
                *temperature
            }
            SamplingMethod::TopP { temperature, .. } => *temperature,
        };

        let max_logit = candidates[0].0;
        let mut probs: Vec<f32> = candidates
            .iter()
            .map(|(l, _)| ((l - max_logit) / temperature).exp())
            .collect();
        let sum: f32 = probs.iter().sum();
        for p in probs.iter_mut() {
            *p /= sum;
        }

        if let SamplingMethod::TopP { p, .. } = self {
            let mut cumsum = 0.0;
            let mut keep = probs.len();
            for (i, prob) in probs.iter().enumerate() {
                cumsum += prob;
                if cumsum >= *p {
                    keep = i + 1;
                    break;
                }
            }
            probs.truncate(keep);
        }

        let dist = WeightedIndex::new(&probs)
            .map_err(|e| EngineError::InvalidArgument(format!("Invalid token distribution: {}", e)))?;
        Ok(candidates[dist.sample(rng)].1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_greedy() {
        let mut rng = StdRng::seed_from_u64(0);
        let logits = [0.1, 2.0, -1.0, 2.0];
        assert_eq!(SamplingMethod::Greedy.next_token(&logits, &mut rng).unwrap(), 1);
    }

    #[test]
    fn test_forbidden_never_sampled() {
        let mut rng = StdRng::seed_from_u64(1);
        let logits = [5.0, f32::NEG_INFINITY, 5.0];
        let method = SamplingMethod::Random { temperature: 1.0 };
        for _ in 0..200 {
            assert_ne!(method.next_token(&logits, &mut rng).unwrap(), 1);
        }
        assert!(method.next_token(&[f32::NEG_INFINITY; 3], &mut rng).is_err());
    }

    #[test]
    fn test_top_k_restricts_candidates() {
        let mut rng = StdRng::seed_from_u64(2);
        let logits = [1.0, 3.0, 2.9, -4.0, 0.0];
        let method = SamplingMethod::TopK { k: 2, temperature: 1.0 };
        for _ in 0..200 {
            let t = method.next_token(&logits, &mut rng).unwrap();
            assert!(t == 1 || t == 2);
        }
    }

    #[test]
    fn test_top_p_keeps_dominant_token() {
        let mut rng = StdRng::seed_from_u64(3);
        let logits = [10.0, 0.0, 0.0, 0.0];
        let method = SamplingMethod::TopP { p: 0.9, temperature: 1.0 };
        for _ in 0..50 {
            assert_eq!(method.next_token(&logits, &mut rng).unwrap(), 0);
        }
    }

    #[test]
    fn test_same_seed_same_draws() {
        let logits: Vec<f32> = (0..20).map(|i| (i as f32 * 0.7).sin()).collect();
        let method = SamplingMethod::Random { temperature: 0.8 };
        let draw = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..10)
                .map(|_| method.next_token(&logits, &mut rng).unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(draw(9), draw(9));
    }

    #[test]
    fn test_validation() {
        assert!(SamplingMethod::Greedy.validate().is_ok());
        assert!(SamplingMethod::Random { temperature: 0.0 }.validate().is_err());
        assert!(SamplingMethod::TopK { k: 0, temperature: 1.0 }.validate().is_err());
        assert!(SamplingMethod::TopP { p: 1.5, temperature: 1.0 }.validate().is_err());
        assert!(SamplingMethod::TopP { p: 0.9, temperature: 0.7 }.validate().is_ok());
    }

    #[test]
    fn test_config_form() {
        let method: SamplingMethod = toml::from_str("method = \"top_k\"\nk = 40\ntemperature = 0.8").unwrap();
        assert_eq!(method, SamplingMethod::TopK { k: 40, temperature: 0.8 });
    }
}
