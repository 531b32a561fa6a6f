use std::path::Path;

use tokenizers::Tokenizer;
use tracing::info;

use crate::error::{InferenceError, Result};

pub struct TokenizerWrapper {
    tokenizer: Tokenizer,
}

impl TokenizerWrapper {
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading tokenizer from {:?}", path);
        let tokenizer = Tokenizer::from_file(path)
            .map_err(|e| InferenceError::Tokenizer(e.to_string()))?;

        info!("Tokenizer loaded with {} tokens", tokenizer.get_vocab_size(true));
        Ok(Self { tokenizer })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let tokenizer = Tokenizer::from_bytes(bytes)
            .map_err(|e| InferenceError::Tokenizer(e.to_string()))?;
        Ok(Self { tokenizer })
    }

    /// Encode text. Rendered chat templates already carry their special
    /// tokens, so callers pass `add_special_tokens = false` for them.
    pub fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, add_special_tokens)
            .map_err(|e| InferenceError::Tokenizer(e.to_string()))?;

        Ok(encoding.get_ids().to_vec())
    }

    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.tokenizer
            .decode(ids, skip_special_tokens)
            .map_err(|e| InferenceError::Tokenizer(e.to_string()))
    }

    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    pub fn eos_token_id(&self) -> Option<u32> {
        self.tokenizer
            .token_to_id("</s>")
            .or_else(|| self.tokenizer.token_to_id("<|endoftext|>"))
            .or_else(|| self.tokenizer.token_to_id("<eos>"))
    }
}
