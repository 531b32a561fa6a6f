mod adapter;
mod gemma2;
mod loader;
mod mistral;

pub use adapter::{merged_var_builder, LoraAdapter};
pub use gemma2::Gemma2Model;
pub use loader::{hub_api, load_model, resolve_adapter};
pub use mistral::MistralModel;

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use serde::Deserialize;

use crate::error::Result;

/// Trait for language models that can generate next token logits
pub trait LanguageModel: Send + Sync {
    /// Forward pass to get logits for the next token
    fn forward(&mut self, input_ids: &Tensor, position: usize) -> Result<Tensor>;

    /// Reset the model's KV cache
    fn reset_cache(&mut self);

    /// End-of-sequence token ids declared by the model config
    fn eos_token_ids(&self) -> &[u32];

    /// Get the model's vocabulary size
    fn vocab_size(&self) -> usize;
}

/// Supported model architectures
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModelArchitecture {
    Mistral,
    Gemma2,
}

/// Token id fields in HF configs hold either one id or a list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum TokenIds {
    Single(u32),
    Many(Vec<u32>),
}

impl TokenIds {
    pub fn to_vec(&self) -> Vec<u32> {
        match self {
            TokenIds::Single(id) => vec![*id],
            TokenIds::Many(ids) => ids.clone(),
        }
    }
}

/// Read `eos_token_id` from a config.json document.
pub fn read_eos_token_ids(config: &serde_json::Value) -> Vec<u32> {
    config
        .get("eos_token_id")
        .and_then(|v| serde_json::from_value::<TokenIds>(v.clone()).ok())
        .map(|ids| ids.to_vec())
        .unwrap_or_default()
}

/// Detect model architecture from config.json
pub fn detect_architecture(config_path: &Path) -> Result<ModelArchitecture> {
    let config_str = std::fs::read_to_string(config_path)?;
    let config: serde_json::Value = serde_json::from_str(&config_str)?;
    Ok(architecture_from_config(&config))
}

fn architecture_from_config(config: &serde_json::Value) -> ModelArchitecture {
    // Check architectures field
    if let Some(archs) = config.get("architectures").and_then(|v| v.as_array()) {
        for arch in archs {
            if let Some(arch_str) = arch.as_str() {
                let arch_lower = arch_str.to_lowercase();
                if arch_lower.contains("gemma2") {
                    return ModelArchitecture::Gemma2;
                } else if arch_lower.contains("mistral") {
                    return ModelArchitecture::Mistral;
                }
            }
        }
    }

    // Check model_type field
    if let Some(model_type) = config.get("model_type").and_then(|v| v.as_str()) {
        let model_type_lower = model_type.to_lowercase();
        if model_type_lower.contains("gemma2") {
            return ModelArchitecture::Gemma2;
        } else if model_type_lower.contains("mistral") {
            return ModelArchitecture::Mistral;
        }
    }

    // Default to Mistral
    ModelArchitecture::Mistral
}

/// Build the base model for `architecture` with the adapter merged in.
pub fn load_language_model(
    architecture: ModelArchitecture,
    config_path: &PathBuf,
    weight_paths: &[PathBuf],
    adapter: Option<&LoraAdapter>,
    dtype: DType,
    device: &Device,
) -> Result<Box<dyn LanguageModel>> {
    let model: Box<dyn LanguageModel> = match architecture {
        ModelArchitecture::Mistral => Box::new(MistralModel::load(
            config_path,
            weight_paths,
            adapter,
            dtype,
            device,
        )?),
        ModelArchitecture::Gemma2 => Box::new(Gemma2Model::load(
            config_path,
            weight_paths,
            adapter,
            dtype,
            device,
        )?),
    };
    Ok(model)
}
