use std::path::PathBuf;

use candle_core::{DType, Device, Tensor};
use candle_transformers::models::gemma2::{Config, Model};
use tracing::info;

use super::{merged_var_builder, read_eos_token_ids, LanguageModel, LoraAdapter};
use crate::error::Result;

pub struct Gemma2Model {
    model: Model,
    vocab_size: usize,
    eos_token_ids: Vec<u32>,
}

impl Gemma2Model {
    pub fn load(
        config_path: &PathBuf,
        weight_paths: &[PathBuf],
        adapter: Option<&LoraAdapter>,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        info!("Loading Gemma2 model configuration...");
        let config_str = std::fs::read_to_string(config_path)?;
        let config: Config = serde_json::from_str(&config_str)?;

        let config_json: serde_json::Value = serde_json::from_str(&config_str)?;
        let mut eos_token_ids = read_eos_token_ids(&config_json);
        if eos_token_ids.is_empty() {
            eos_token_ids.push(1);
        }

        info!(
            "Gemma2 config: vocab_size={}, hidden_size={}, num_layers={}, num_heads={}",
            config.vocab_size,
            config.hidden_size,
            config.num_hidden_layers,
            config.num_attention_heads
        );

        info!("Loading model weights as {:?}...", dtype);
        let vb = merged_var_builder(weight_paths, adapter, dtype, device)?;

        info!("Building Gemma2 model...");
        let model = Model::new(false, &config, vb)?;

        info!("Gemma2 model loaded successfully");
        Ok(Self {
            model,
            vocab_size: config.vocab_size,
            eos_token_ids,
        })
    }
}

impl LanguageModel for Gemma2Model {
    fn forward(&mut self, input_ids: &Tensor, position: usize) -> Result<Tensor> {
        let logits = self.model.forward(input_ids, position)?;
        Ok(logits)
    }

    fn reset_cache(&mut self) {
        self.model.clear_kv_cache();
    }

    fn eos_token_ids(&self) -> &[u32] {
        &self.eos_token_ids
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }
}
