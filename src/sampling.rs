use candle_core::{DType, Tensor};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::config::GenerationConfig;
use crate::error::{InferenceError, Result};

pub struct Sampler {
    greedy: bool,
    temperature: f64,
    top_p: f64,
    top_k: usize,
    rng: StdRng,
}

impl Sampler {
    pub fn new(temperature: f64, top_p: f64, top_k: usize, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };

        Self {
            greedy: temperature == 0.0,
            temperature,
            top_p,
            top_k,
            rng,
        }
    }

    pub fn from_config(config: &GenerationConfig) -> Self {
        let mut sampler = Self::new(config.temperature, config.top_p, config.top_k, config.seed);
        sampler.greedy = config.is_greedy();
        sampler
    }

    pub fn sample(&mut self, logits: &Tensor) -> Result<u32> {
        let logits = get_last_logits(logits)?;
        let logits = logits.to_dtype(DType::F32)?;

        if self.greedy {
            let logits_vec: Vec<f32> = logits.to_vec1()?;
            return argmax(&logits_vec);
        }

        let logits = if self.temperature != 1.0 {
            (logits / self.temperature)?
        } else {
            logits
        };

        let logits_vec: Vec<f32> = logits.to_vec1()?;

        let mut indexed: Vec<(usize, f32)> =
            logits_vec.iter().copied().enumerate().collect();
        indexed.sort_by(|a, b| b.1.total_cmp(&a.1));

        if self.top_k > 0 && self.top_k < indexed.len() {
            indexed.truncate(self.top_k);
        }

        let max_logit = indexed
            .first()
            .map(|(_, l)| *l)
            .ok_or_else(|| InferenceError::Inference("empty logits".to_string()))?;
        let mut probs: Vec<(usize, f32)> = indexed
            .iter()
            .map(|(i, l)| (*i, (l - max_logit).exp()))
            .collect();

        let sum: f32 = probs.iter().map(|(_, p)| p).sum();
        for (_, p) in &mut probs {
            *p /= sum;
        }

        // Nucleus: keep the smallest prefix whose mass reaches top_p.
        if self.top_p < 1.0 {
            let top_p_f32 = self.top_p as f32;
            let mut cumsum = 0.0f32;
            let cutoff_idx = probs
                .iter()
                .position(|(_, p)| {
                    cumsum += p;
                    cumsum >= top_p_f32
                })
                .map(|idx| idx + 1)
                .unwrap_or(probs.len());
            probs.truncate(cutoff_idx.max(1));

            let sum: f32 = probs.iter().map(|(_, p)| p).sum();
            for (_, p) in &mut probs {
                *p /= sum;
            }
        }

        let r: f32 = self.rng.gen();
        let mut cumsum = 0.0;
        for (idx, prob) in probs.iter() {
            cumsum += prob;
            if r < cumsum {
                return Ok(*idx as u32);
            }
        }

        Ok(probs.last().map(|(i, _)| *i as u32).unwrap_or(0))
    }
}

fn argmax(logits: &[f32]) -> Result<u32> {
    logits
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(idx, _)| idx as u32)
        .ok_or_else(|| InferenceError::Inference("empty logits".to_string()))
}

pub fn get_last_logits(logits: &Tensor) -> Result<Tensor> {
    let dims = logits.dims();
    match dims.len() {
        1 => Ok(logits.clone()),
        2 => {
            let last_idx = dims[0] - 1;
            Ok(logits.get(last_idx)?)
        }
        3 => {
            let seq_len = dims[1];
            let logits = logits.get(0)?;
            Ok(logits.get(seq_len - 1)?)
        }
        _ => {
            let mut result = logits.clone();
            while result.dims().len() > 1 {
                if result.dims()[0] == 1 {
                    result = result.squeeze(0)?;
                } else {
                    break;
                }
            }
            Ok(result)
        }
    }
}

/// Penalize every token already present in the sequence, prompt included.
pub fn apply_repeat_penalty(
    logits: &Tensor,
    repeat_penalty: f32,
    context: &[u32],
) -> Result<Tensor> {
    if repeat_penalty == 1.0 || context.is_empty() {
        return Ok(logits.clone());
    }

    let original_rank = logits.dims().len();
    let device = logits.device();

    let last_logits = get_last_logits(logits)?;
    let mut logits_vec: Vec<f32> = last_logits.to_dtype(DType::F32)?.to_vec1()?;

    let mut seen = vec![false; logits_vec.len()];
    for &token_id in context {
        let idx = token_id as usize;
        if idx < logits_vec.len() && !seen[idx] {
            seen[idx] = true;
            let score = logits_vec[idx];
            logits_vec[idx] = if score > 0.0 {
                score / repeat_penalty
            } else {
                score * repeat_penalty
            };
        }
    }

    let vocab_size = logits_vec.len();
    let result = Tensor::from_vec(logits_vec, (vocab_size,), device)?;

    match original_rank {
        1 => Ok(result),
        2 => Ok(result.unsqueeze(0)?),
        _ => Ok(result.unsqueeze(0)?.unsqueeze(0)?),
    }
}
