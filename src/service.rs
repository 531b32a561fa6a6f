use std::sync::Arc;

use candle_core::Device;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::chat_template::ChatTemplate;
use crate::config::{GenerationConfig, GenerationDefaults, ServiceConfig};
use crate::device::{device_info, get_device, resolve_dtype};
use crate::error::{InferenceError, Result};
use crate::generation::{GenerationOutput, TextGenerator};
use crate::model::{
    detect_architecture, hub_api, load_language_model, load_model, resolve_adapter,
    LanguageModel, LoraAdapter,
};
use crate::tokenizer::TokenizerWrapper;

/// The loaded model bundle plus everything needed to serve generations.
///
/// Built once by [`InferenceService::init`]; immutable afterwards except for
/// the model's KV cache, which is guarded by a FIFO mutex so generations run
/// one at a time in arrival order.
pub struct InferenceService {
    model: Arc<Mutex<Box<dyn LanguageModel>>>,
    tokenizer: Arc<TokenizerWrapper>,
    template: ChatTemplate,
    device: Device,
    generation: GenerationConfig,
    model_id: String,
    adapter_id: String,
}

impl InferenceService {
    /// Load base model, adapter, tokenizer and chat template. Blocking.
    pub fn init(config: &ServiceConfig) -> Result<Self> {
        let device = get_device(config.force_cpu)?;
        let dtype = resolve_dtype(config.dtype, &device);
        info!("Using device: {} ({:?})", device_info(&device), dtype);

        let api = hub_api(config.hf_token.as_deref())?;

        // The adapter is small; a bad path or config fails before the base download.
        let adapter_files = resolve_adapter(&api, &config.adapter)?;
        let adapter = LoraAdapter::load(&adapter_files.config, &adapter_files.weights, &device)?;
        if let Some(trained_on) = &adapter.config().base_model_name_or_path {
            if trained_on != &config.model_id {
                warn!(
                    "Adapter was trained on {} but base model is {}",
                    trained_on, config.model_id
                );
            }
        }

        let model_files = load_model(&api, &config.model_id, &config.revision)?;

        let tokenizer = TokenizerWrapper::load(&model_files.tokenizer)?;
        let template = ChatTemplate::load(model_files.tokenizer_config.as_deref())?;

        let architecture = detect_architecture(&model_files.config)?;
        info!("Detected architecture: {:?}", architecture);

        let model = load_language_model(
            architecture,
            &model_files.config,
            &model_files.weights,
            Some(&adapter),
            dtype,
            &device,
        )?;
        // Merged into the base weights; the adapter tensors are no longer needed.
        drop(adapter);

        let defaults = match &model_files.generation_config {
            Some(path) => Some(GenerationDefaults::from_json(&std::fs::read_to_string(path)?)?),
            None => None,
        };
        let eos_token_ids = collect_eos_token_ids(
            model.eos_token_ids(),
            defaults.as_ref(),
            &tokenizer,
        )?;
        let generation = GenerationConfig::resolve(&config.sampling, defaults.as_ref(), eos_token_ids);
        generation.validate()?;

        info!("Model loaded successfully!");
        info!(
            "Vocabulary size: tokenizer={}, model={}",
            tokenizer.vocab_size(),
            model.vocab_size()
        );
        info!(
            "Generation: max_new_tokens={}, do_sample={}, temperature={}, top_p={}, top_k={}, repeat_penalty={}, eos={:?}",
            generation.max_new_tokens,
            generation.do_sample,
            generation.temperature,
            generation.top_p,
            generation.top_k,
            generation.repeat_penalty,
            generation.eos_token_ids
        );

        Ok(Self::from_parts(
            model,
            tokenizer,
            template,
            device,
            generation,
            config.model_id.clone(),
            config.adapter.clone(),
        ))
    }

    pub fn from_parts(
        model: Box<dyn LanguageModel>,
        tokenizer: TokenizerWrapper,
        template: ChatTemplate,
        device: Device,
        generation: GenerationConfig,
        model_id: String,
        adapter_id: String,
    ) -> Self {
        Self {
            model: Arc::new(Mutex::new(model)),
            tokenizer: Arc::new(tokenizer),
            template,
            device,
            generation,
            model_id,
            adapter_id,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn adapter_id(&self) -> &str {
        &self.adapter_id
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Generate a reply to `prompt` sent as a single user turn.
    ///
    /// Waits for earlier generations to finish, then runs on the blocking
    /// pool. A panic inside the model surfaces as an error.
    pub async fn generate(&self, prompt: &str) -> Result<GenerationOutput> {
        let formatted = self.template.user_prompt(prompt)?;

        let mut model = self.model.clone().lock_owned().await;
        let tokenizer = self.tokenizer.clone();
        let device = self.device.clone();
        let config = self.generation.clone();

        tokio::task::spawn_blocking(move || {
            let mut generator = TextGenerator::new(model.as_mut(), &tokenizer, &device);
            generator.generate(&formatted, &config)
        })
        .await
        .map_err(|e| InferenceError::Inference(format!("generation task failed: {e}")))?
    }

    /// Wait for any in-flight generation and release the KV cache.
    pub async fn shutdown(&self) {
        let mut model = self.model.lock().await;
        model.reset_cache();
        info!("Inference service for {} shut down", self.model_id);
    }
}

/// EOS ids from the model config and `generation_config.json`, falling back
/// to the tokenizer's own end token.
fn collect_eos_token_ids(
    model_eos: &[u32],
    defaults: Option<&GenerationDefaults>,
    tokenizer: &TokenizerWrapper,
) -> Result<Vec<u32>> {
    let mut ids: Vec<u32> = model_eos.to_vec();

    if let Some(extra) = defaults.and_then(|d| d.eos_token_id.as_ref()) {
        ids.extend(extra.to_vec());
    }
    if ids.is_empty() {
        ids.extend(tokenizer.eos_token_id());
    }

    ids.sort_unstable();
    ids.dedup();
    if ids.is_empty() {
        return Err(InferenceError::Config(
            "no end-of-sequence token id found in model, generation or tokenizer config".to_string(),
        ));
    }
    Ok(ids)
}
