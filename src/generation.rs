use std::time::Instant;

use candle_core::{Device, Tensor};
use tracing::{debug, info};

use crate::config::GenerationConfig;
use crate::error::{InferenceError, Result};
use crate::model::LanguageModel;
use crate::sampling::{apply_repeat_penalty, Sampler};
use crate::tokenizer::TokenizerWrapper;

/// Why generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// An end-of-sequence token was sampled.
    Stop,
    /// `max_new_tokens` was reached first.
    Length,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
        }
    }
}

pub struct GenerationOutput {
    /// Prompt and completion decoded together, special tokens kept.
    pub text: String,
    pub tokens: Vec<u32>,
    pub prompt_tokens: usize,
    pub finish_reason: FinishReason,
    pub tokens_per_second: f64,
    pub total_time_ms: u128,
}

pub struct TextGenerator<'a> {
    model: &'a mut dyn LanguageModel,
    tokenizer: &'a TokenizerWrapper,
    device: &'a Device,
}

impl<'a> TextGenerator<'a> {
    pub fn new(
        model: &'a mut dyn LanguageModel,
        tokenizer: &'a TokenizerWrapper,
        device: &'a Device,
    ) -> Self {
        Self {
            model,
            tokenizer,
            device,
        }
    }

    /// Run one generation pass over an already chat-formatted prompt.
    pub fn generate(
        &mut self,
        prompt: &str,
        config: &GenerationConfig,
    ) -> Result<GenerationOutput> {
        let start_time = Instant::now();

        self.model.reset_cache();

        let prompt_tokens = self.tokenizer.encode(prompt, false)?;
        let prompt_len = prompt_tokens.len();
        info!("Prompt tokens: {}", prompt_len);

        if prompt_tokens.is_empty() {
            return Err(InferenceError::InvalidInput(
                "prompt encodes to zero tokens".to_string(),
            ));
        }

        let mut sampler = Sampler::from_config(config);

        let mut sequence = prompt_tokens;
        let mut generated_tokens: Vec<u32> = Vec::new();
        let mut finish_reason = FinishReason::Length;

        // Process prompt (prefill)
        let input_tensor = Tensor::new(sequence.as_slice(), self.device)?.unsqueeze(0)?;
        let mut logits = self.model.forward(&input_tensor, 0)?;

        let generation_start = Instant::now();

        for i in 0..config.max_new_tokens {
            let penalized_logits =
                apply_repeat_penalty(&logits, config.repeat_penalty, &sequence)?;

            let next_token = sampler.sample(&penalized_logits)?;
            generated_tokens.push(next_token);
            sequence.push(next_token);

            if config.eos_token_ids.contains(&next_token) {
                debug!("Stop token {} generated at position {}", next_token, i);
                finish_reason = FinishReason::Stop;
                break;
            }

            if i + 1 == config.max_new_tokens {
                break;
            }

            let input = Tensor::new(&[next_token], self.device)?.unsqueeze(0)?;
            logits = self.model.forward(&input, prompt_len + i)?;
        }

        let generation_time = generation_start.elapsed();
        let total_time = start_time.elapsed();

        let tokens_per_second = if generation_time.as_secs_f64() > 0.0 {
            generated_tokens.len() as f64 / generation_time.as_secs_f64()
        } else {
            0.0
        };

        let output_text = self.tokenizer.decode(&sequence, false)?;

        info!(
            "Generated {} tokens in {:?} ({:.2} tokens/sec, finish_reason={})",
            generated_tokens.len(),
            generation_time,
            tokens_per_second,
            finish_reason.as_str()
        );

        Ok(GenerationOutput {
            text: output_text,
            tokens: generated_tokens,
            prompt_tokens: prompt_len,
            finish_reason,
            tokens_per_second,
            total_time_ms: total_time.as_millis(),
        })
    }
}
