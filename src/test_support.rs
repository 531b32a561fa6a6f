//! Fixtures shared by unit tests: a tiny word-level tokenizer with Mistral
//! style special tokens, and language models whose output is scripted.

use std::collections::VecDeque;

use candle_core::{Device, Tensor};

use crate::chat_template::ChatTemplate;
use crate::config::GenerationConfig;
use crate::error::{InferenceError, Result};
use crate::model::LanguageModel;
use crate::service::InferenceService;
use crate::tokenizer::TokenizerWrapper;

pub const EOS: u32 = 2;
pub const INST: u32 = 3;
pub const INST_END: u32 = 4;
pub const HELLO: u32 = 5;
pub const WORLD: u32 = 6;
pub const VOCAB_SIZE: usize = 11;

const TOKENIZER_JSON: &str = r#"{
  "version": "1.0",
  "truncation": null,
  "padding": null,
  "added_tokens": [
    {"id": 0, "content": "<unk>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
    {"id": 1, "content": "<s>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
    {"id": 2, "content": "</s>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
    {"id": 3, "content": "[INST]", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
    {"id": 4, "content": "[/INST]", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true}
  ],
  "normalizer": null,
  "pre_tokenizer": {"type": "Whitespace"},
  "post_processor": null,
  "decoder": null,
  "model": {
    "type": "WordLevel",
    "vocab": {
      "<unk>": 0, "<s>": 1, "</s>": 2, "[INST]": 3, "[/INST]": 4,
      "hello": 5, "world": 6, "alpha": 7, "beta": 8, "the": 9, "end": 10
    },
    "unk_token": "<unk>"
  }
}"#;

pub fn test_tokenizer() -> TokenizerWrapper {
    TokenizerWrapper::from_bytes(TOKENIZER_JSON.as_bytes()).unwrap()
}

pub fn greedy_config(max_new_tokens: usize) -> GenerationConfig {
    GenerationConfig {
        max_new_tokens,
        do_sample: false,
        eos_token_ids: vec![EOS],
        ..Default::default()
    }
}

fn one_hot(token: u32) -> Result<Tensor> {
    let mut logits = vec![0f32; VOCAB_SIZE];
    logits[token as usize] = 100.0;
    Ok(Tensor::from_vec(logits, (1, 1, VOCAB_SIZE), &Device::Cpu)?)
}

/// Emits a fixed token sequence, then EOS. Records the position of every
/// forward call since the last cache reset.
pub struct ScriptedModel {
    script: Vec<u32>,
    uniform: bool,
    step: usize,
    positions: Vec<usize>,
    eos: Vec<u32>,
}

impl ScriptedModel {
    pub fn new(script: Vec<u32>) -> Self {
        Self {
            script,
            uniform: false,
            step: 0,
            positions: Vec::new(),
            eos: vec![EOS],
        }
    }

    /// Flat logits, so sampling may pick any token.
    pub fn uniform() -> Self {
        Self {
            uniform: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn positions(&self) -> &[usize] {
        &self.positions
    }
}

impl LanguageModel for ScriptedModel {
    fn forward(&mut self, _input_ids: &Tensor, position: usize) -> Result<Tensor> {
        self.positions.push(position);
        if self.uniform {
            return Ok(Tensor::zeros((1, 1, VOCAB_SIZE), candle_core::DType::F32, &Device::Cpu)?);
        }
        let token = self.script.get(self.step).copied().unwrap_or(EOS);
        self.step += 1;
        one_hot(token)
    }

    fn reset_cache(&mut self) {
        self.step = 0;
        self.positions.clear();
    }

    fn eos_token_ids(&self) -> &[u32] {
        &self.eos
    }

    fn vocab_size(&self) -> usize {
        VOCAB_SIZE
    }
}

/// Repeats the user's words from between `[INST]` and `[/INST]`, then EOS.
pub struct EchoModel {
    pending: VecDeque<u32>,
    eos: Vec<u32>,
}

impl EchoModel {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            eos: vec![EOS],
        }
    }
}

impl LanguageModel for EchoModel {
    fn forward(&mut self, input_ids: &Tensor, position: usize) -> Result<Tensor> {
        if position == 0 {
            let ids: Vec<u32> = input_ids.squeeze(0)?.to_vec1()?;
            let start = ids.iter().position(|&t| t == INST).map_or(0, |i| i + 1);
            let end = ids.iter().position(|&t| t == INST_END).unwrap_or(ids.len());
            self.pending = ids[start..end.max(start)].iter().copied().collect();
        }
        let token = self.pending.pop_front().unwrap_or(EOS);
        one_hot(token)
    }

    fn reset_cache(&mut self) {
        self.pending.clear();
    }

    fn eos_token_ids(&self) -> &[u32] {
        &self.eos
    }

    fn vocab_size(&self) -> usize {
        VOCAB_SIZE
    }
}

/// How the next generation handled by a [`FaultyModel`] should go.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    Panic,
    Error,
}

/// Fails each generation with the next queued fault, then answers EOS.
pub struct FaultyModel {
    faults: VecDeque<Fault>,
    eos: Vec<u32>,
}

impl FaultyModel {
    pub fn new(faults: impl IntoIterator<Item = Fault>) -> Self {
        Self {
            faults: faults.into_iter().collect(),
            eos: vec![EOS],
        }
    }
}

impl LanguageModel for FaultyModel {
    fn forward(&mut self, _input_ids: &Tensor, position: usize) -> Result<Tensor> {
        if position == 0 {
            match self.faults.pop_front() {
                Some(Fault::Panic) => panic!("forward pass blew up"),
                Some(Fault::Error) => {
                    return Err(InferenceError::Inference("forward pass failed".to_string()))
                }
                None => {}
            }
        }
        one_hot(EOS)
    }

    fn reset_cache(&mut self) {}

    fn eos_token_ids(&self) -> &[u32] {
        &self.eos
    }

    fn vocab_size(&self) -> usize {
        VOCAB_SIZE
    }
}

pub fn test_service(model: Box<dyn LanguageModel>, config: GenerationConfig) -> InferenceService {
    InferenceService::from_parts(
        model,
        test_tokenizer(),
        ChatTemplate::mistral_instruct().unwrap(),
        Device::Cpu,
        config,
        "test/base".to_string(),
        "test/adapter".to_string(),
    )
}
