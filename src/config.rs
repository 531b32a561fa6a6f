use clap::{Parser, ValueEnum};
use serde::Deserialize;

use crate::error::{InferenceError, Result};
use crate::model::TokenIds;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Text generation server for a base model with a LoRA adapter")]
pub struct Args {
    /// Base model repository on the Hugging Face Hub
    #[arg(short, long, default_value = "mistralai/Mistral-7B-Instruct-v0.2")]
    pub model: String,

    /// Adapter directory, or a Hub repository id when no such directory exists
    #[arg(short, long, default_value = "../models/opengiv-ngo-assistant-v1")]
    pub adapter: String,

    #[arg(long, default_value = "main")]
    pub revision: String,

    #[arg(long, env)]
    pub hf_token: Option<String>,

    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, default_value_t = 5001)]
    pub port: u16,

    #[arg(long)]
    pub cpu: bool,

    #[arg(long, value_enum, default_value_t = DTypeArg::Auto)]
    pub dtype: DTypeArg,

    #[arg(long, default_value_t = 1000)]
    pub max_new_tokens: usize,

    #[arg(long)]
    pub temperature: Option<f64>,

    #[arg(long)]
    pub top_p: Option<f64>,

    #[arg(long)]
    pub top_k: Option<usize>,

    #[arg(long)]
    pub repeat_penalty: Option<f32>,

    #[arg(long)]
    pub seed: Option<u64>,

    /// Greedy decoding instead of sampling
    #[arg(long)]
    pub no_sample: bool,

    /// Generate once for this prompt, print the response and exit
    #[arg(short, long)]
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DTypeArg {
    Auto,
    F16,
    Bf16,
    F32,
}

/// Everything the service needs to come up, detached from the CLI.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub model_id: String,
    pub revision: String,
    pub hf_token: Option<String>,
    pub adapter: String,
    pub force_cpu: bool,
    pub dtype: DTypeArg,
    pub sampling: SamplingOverrides,
}

impl From<&Args> for ServiceConfig {
    fn from(args: &Args) -> Self {
        Self {
            model_id: args.model.clone(),
            revision: args.revision.clone(),
            hf_token: args.hf_token.clone(),
            adapter: args.adapter.clone(),
            force_cpu: args.cpu,
            dtype: args.dtype,
            sampling: SamplingOverrides {
                max_new_tokens: args.max_new_tokens,
                do_sample: !args.no_sample,
                temperature: args.temperature,
                top_p: args.top_p,
                top_k: args.top_k,
                repeat_penalty: args.repeat_penalty,
                seed: args.seed,
            },
        }
    }
}

/// Sampling values given explicitly by the operator. `None` falls back to
/// the model's `generation_config.json`, then to library defaults.
#[derive(Debug, Clone)]
pub struct SamplingOverrides {
    pub max_new_tokens: usize,
    pub do_sample: bool,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<usize>,
    pub repeat_penalty: Option<f32>,
    pub seed: Option<u64>,
}

impl Default for SamplingOverrides {
    fn default() -> Self {
        Self {
            max_new_tokens: 1000,
            do_sample: true,
            temperature: None,
            top_p: None,
            top_k: None,
            repeat_penalty: None,
            seed: None,
        }
    }
}

/// Subset of a Hub `generation_config.json` that affects decoding.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerationDefaults {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<usize>,
    pub repetition_penalty: Option<f32>,
    pub eos_token_id: Option<TokenIds>,
}

impl GenerationDefaults {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub max_new_tokens: usize,
    pub do_sample: bool,
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: usize,
    pub repeat_penalty: f32,
    pub seed: Option<u64>,
    pub eos_token_ids: Vec<u32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 1000,
            do_sample: true,
            temperature: 1.0,
            top_p: 1.0,
            top_k: 50,
            repeat_penalty: 1.0,
            seed: None,
            eos_token_ids: vec![],
        }
    }
}

impl GenerationConfig {
    /// Layer operator overrides over the model's own defaults.
    pub fn resolve(
        overrides: &SamplingOverrides,
        defaults: Option<&GenerationDefaults>,
        eos_token_ids: Vec<u32>,
    ) -> Self {
        let base = Self::default();
        let defaults = defaults.cloned().unwrap_or_default();

        Self {
            max_new_tokens: overrides.max_new_tokens,
            do_sample: overrides.do_sample,
            temperature: overrides
                .temperature
                .or(defaults.temperature)
                .unwrap_or(base.temperature),
            top_p: overrides.top_p.or(defaults.top_p).unwrap_or(base.top_p),
            top_k: overrides.top_k.or(defaults.top_k).unwrap_or(base.top_k),
            repeat_penalty: overrides
                .repeat_penalty
                .or(defaults.repetition_penalty)
                .unwrap_or(base.repeat_penalty),
            seed: overrides.seed,
            eos_token_ids,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_new_tokens == 0 {
            return Err(InferenceError::Config(
                "max_new_tokens must be greater than zero".to_string(),
            ));
        }
        if !(self.temperature >= 0.0) {
            return Err(InferenceError::Config(format!(
                "temperature must be non-negative, got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(InferenceError::Config(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if !(self.repeat_penalty > 0.0) {
            return Err(InferenceError::Config(format!(
                "repeat_penalty must be positive, got {}",
                self.repeat_penalty
            )));
        }
        Ok(())
    }

    /// Greedy selection when sampling is off or the distribution is degenerate.
    pub fn is_greedy(&self) -> bool {
        !self.do_sample || self.temperature == 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults_match_original_deployment() {
        let args = Args::parse_from(["adapter-inference-server"]);
        assert_eq!(args.model, "mistralai/Mistral-7B-Instruct-v0.2");
        assert_eq!(args.host, "0.0.0.0");
        assert_eq!(args.port, 5001);
        assert_eq!(args.max_new_tokens, 1000);
        assert!(!args.no_sample);

        let config = ServiceConfig::from(&args);
        assert!(config.sampling.do_sample);
        assert_eq!(config.dtype, DTypeArg::Auto);
    }

    #[test]
    fn test_resolve_prefers_overrides_then_model_defaults() {
        let defaults = GenerationDefaults::from_json(
            r#"{"temperature": 0.6, "top_p": 0.95, "eos_token_id": 2, "bos_token_id": 1}"#,
        )
        .unwrap();
        let overrides = SamplingOverrides {
            temperature: Some(0.2),
            ..Default::default()
        };

        let config = GenerationConfig::resolve(&overrides, Some(&defaults), vec![2]);
        assert_eq!(config.temperature, 0.2);
        assert_eq!(config.top_p, 0.95);
        assert_eq!(config.top_k, 50);
        assert_eq!(config.repeat_penalty, 1.0);
        assert_eq!(config.max_new_tokens, 1000);
        assert_eq!(config.eos_token_ids, vec![2]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_resolve_without_model_defaults() {
        let config = GenerationConfig::resolve(&SamplingOverrides::default(), None, vec![]);
        assert_eq!(config.temperature, 1.0);
        assert_eq!(config.top_p, 1.0);
        assert!(config.do_sample);
        assert!(!config.is_greedy());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = GenerationConfig::default();
        config.max_new_tokens = 0;
        assert!(matches!(config.validate(), Err(InferenceError::Config(_))));

        let mut config = GenerationConfig::default();
        config.top_p = 0.0;
        assert!(config.validate().is_err());

        let mut config = GenerationConfig::default();
        config.temperature = -1.0;
        assert!(config.validate().is_err());

        let mut config = GenerationConfig::default();
        config.repeat_penalty = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_temperature_is_greedy() {
        let config = GenerationConfig {
            temperature: 0.0,
            ..Default::default()
        };
        assert!(config.is_greedy());
    }
}
