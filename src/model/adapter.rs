//! LoRA adapter loading and weight merging.
//!
//! Adapters saved by PEFT consist of an `adapter_config.json` and an
//! `adapter_model.safetensors` whose keys look like
//! `base_model.model.<module>.lora_A.weight`. Each `(A, B)` pair is folded into
//! `<module>.weight` of the base model as `W + scale * (B @ A)`, so the
//! generation path runs a plain base-architecture forward pass.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use candle_core::safetensors::MmapedSafetensors;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{InferenceError, Result};

const PEFT_PREFIX: &str = "base_model.model.";

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TargetModules {
    List(Vec<String>),
    Pattern(String),
}

impl std::fmt::Display for TargetModules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetModules::List(modules) => write!(f, "{}", modules.join(",")),
            TargetModules::Pattern(pattern) => write!(f, "{}", pattern),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdapterConfig {
    #[serde(default = "default_peft_type")]
    pub peft_type: String,
    pub r: usize,
    pub lora_alpha: f64,
    #[serde(default)]
    pub target_modules: Option<TargetModules>,
    #[serde(default)]
    pub rank_pattern: HashMap<String, usize>,
    #[serde(default)]
    pub alpha_pattern: HashMap<String, f64>,
    #[serde(default)]
    pub use_rslora: bool,
    #[serde(default)]
    pub fan_in_fan_out: bool,
    #[serde(default = "default_bias")]
    pub bias: String,
    #[serde(default)]
    pub lora_bias: bool,
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
}

fn default_peft_type() -> String {
    "LORA".to_string()
}

fn default_bias() -> String {
    "none".to_string()
}

impl AdapterConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !self.peft_type.eq_ignore_ascii_case("lora") {
            return Err(InferenceError::Adapter(format!(
                "unsupported adapter type {}, only LORA adapters can be merged",
                self.peft_type
            )));
        }
        if self.bias != "none" {
            return Err(InferenceError::Adapter(format!(
                "unsupported bias mode {:?}",
                self.bias
            )));
        }
        if self.lora_bias {
            return Err(InferenceError::Adapter(
                "adapters trained with lora_bias are not supported".to_string(),
            ));
        }
        if self.r == 0 {
            return Err(InferenceError::Adapter("rank r must be positive".to_string()));
        }
        if let Some((module, _)) = self.rank_pattern.iter().find(|(_, r)| **r == 0) {
            return Err(InferenceError::Adapter(format!(
                "rank_pattern entry {module} must be positive"
            )));
        }
        Ok(())
    }

    /// Scale applied to modules without a `rank_pattern` or `alpha_pattern` entry.
    pub fn scale(&self) -> f64 {
        self.scale_with(self.r, self.lora_alpha)
    }

    /// Scale for one module, e.g. `model.layers.0.self_attn.q_proj`.
    pub fn module_scale(&self, module: &str) -> f64 {
        let r = pattern_value(&self.rank_pattern, module).unwrap_or(self.r);
        let alpha = pattern_value(&self.alpha_pattern, module).unwrap_or(self.lora_alpha);
        self.scale_with(r, alpha)
    }

    fn scale_with(&self, r: usize, alpha: f64) -> f64 {
        if self.use_rslora {
            alpha / (r as f64).sqrt()
        } else {
            alpha / r as f64
        }
    }
}

/// Pattern keys name a module by its full path or by a dotted suffix of it.
/// The longest matching key wins.
fn pattern_value<T: Copy>(patterns: &HashMap<String, T>, module: &str) -> Option<T> {
    patterns
        .iter()
        .filter(|(key, _)| {
            module == key.as_str()
                || module
                    .strip_suffix(key.as_str())
                    .is_some_and(|head| head.ends_with('.'))
        })
        .max_by_key(|(key, _)| key.len())
        .map(|(_, value)| *value)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AdapterKey {
    LoraA(String),
    LoraB(String),
    Full(String),
}

/// Map a saved adapter key onto the base weight it targets.
fn parse_adapter_key(key: &str) -> Result<AdapterKey> {
    let key = key.strip_prefix(PEFT_PREFIX).unwrap_or(key);

    if key.contains("lora_embedding_") || key.contains("lora_magnitude_vector") {
        return Err(InferenceError::Adapter(format!(
            "unsupported adapter tensor {key}"
        )));
    }

    for (marker, is_a) in [(".lora_A.", true), (".lora_B.", false)] {
        if let Some(idx) = key.find(marker) {
            if key.ends_with(".bias") {
                return Err(InferenceError::Adapter(format!(
                    "unsupported LoRA bias tensor {key}"
                )));
            }
            let target = format!("{}.weight", &key[..idx]);
            return Ok(if is_a {
                AdapterKey::LoraA(target)
            } else {
                AdapterKey::LoraB(target)
            });
        }
    }

    Ok(AdapterKey::Full(key.replace(".modules_to_save.default", "")))
}

#[derive(Debug)]
struct LoraPair {
    a: Tensor,
    b: Tensor,
}

/// A LoRA adapter ready to be merged into base weights.
#[derive(Debug)]
pub struct LoraAdapter {
    config: AdapterConfig,
    pairs: HashMap<String, LoraPair>,
    replacements: HashMap<String, Tensor>,
}

impl LoraAdapter {
    pub fn load(config_path: &Path, weights_path: &Path, device: &Device) -> Result<Self> {
        info!("Loading adapter config from {:?}", config_path);
        let config = AdapterConfig::from_json(&std::fs::read_to_string(config_path)?)?;
        if let Some(targets) = &config.target_modules {
            info!("Adapter target modules: {}", targets);
        }

        info!("Loading adapter weights from {:?}", weights_path);
        let tensors = candle_core::safetensors::load(weights_path, device)?;

        let adapter = Self::from_tensors(config, tensors)?;
        info!(
            "Adapter ready: r={}, alpha={}, scale={:.4} ({} rank / {} alpha overrides), {} LoRA modules, {} replaced tensors",
            adapter.config.r,
            adapter.config.lora_alpha,
            adapter.config.scale(),
            adapter.config.rank_pattern.len(),
            adapter.config.alpha_pattern.len(),
            adapter.pairs.len(),
            adapter.replacements.len()
        );
        Ok(adapter)
    }

    pub fn from_tensors(config: AdapterConfig, tensors: HashMap<String, Tensor>) -> Result<Self> {
        let mut a_halves = HashMap::new();
        let mut b_halves = HashMap::new();
        let mut replacements = HashMap::new();

        for (key, tensor) in tensors {
            match parse_adapter_key(&key)? {
                AdapterKey::LoraA(target) => {
                    a_halves.insert(target, tensor);
                }
                AdapterKey::LoraB(target) => {
                    b_halves.insert(target, tensor);
                }
                AdapterKey::Full(target) => {
                    replacements.insert(target, tensor);
                }
            }
        }

        let mut pairs = HashMap::new();
        for (target, a) in a_halves {
            let b = b_halves.remove(&target).ok_or_else(|| {
                InferenceError::Adapter(format!("missing lora_B for {target}"))
            })?;
            pairs.insert(target, LoraPair { a, b });
        }
        if let Some(target) = b_halves.keys().next() {
            return Err(InferenceError::Adapter(format!(
                "missing lora_A for {target}"
            )));
        }

        Ok(Self {
            config,
            pairs,
            replacements,
        })
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// Names of every base tensor this adapter modifies.
    pub fn targets(&self) -> impl Iterator<Item = &String> {
        self.pairs.keys().chain(self.replacements.keys())
    }

    pub fn touches(&self, name: &str) -> bool {
        self.pairs.contains_key(name) || self.replacements.contains_key(name)
    }

    /// The low-rank update for `name`, in F32, shaped like the base weight.
    fn delta(&self, name: &str) -> Result<Option<Tensor>> {
        let Some(pair) = self.pairs.get(name) else {
            return Ok(None);
        };
        let a = pair.a.to_dtype(DType::F32)?;
        let b = pair.b.to_dtype(DType::F32)?;
        let mut delta = b.matmul(&a)?;
        if self.config.fan_in_fan_out {
            delta = delta.t()?;
        }
        let module = name.strip_suffix(".weight").unwrap_or(name);
        Ok(Some((delta * self.config.module_scale(module))?))
    }

    /// Apply the adapter to one base tensor. Returns the tensor unchanged when
    /// the adapter does not touch it.
    pub fn merge(&self, name: &str, base: Tensor) -> Result<Tensor> {
        if let Some(replacement) = self.replacements.get(name) {
            if replacement.dims() != base.dims() {
                return Err(shape_mismatch(name, base.dims(), replacement.dims()));
            }
            return Ok(replacement.to_dtype(base.dtype())?.to_device(base.device())?);
        }

        let Some(delta) = self.delta(name)? else {
            return Ok(base);
        };
        if delta.dims() != base.dims() {
            return Err(shape_mismatch(name, base.dims(), delta.dims()));
        }

        let dtype = base.dtype();
        let delta = delta.to_device(base.device())?;
        let merged = (base.to_dtype(DType::F32)? + delta)?;
        Ok(merged.to_dtype(dtype)?)
    }
}

fn shape_mismatch(name: &str, base: &[usize], adapter: &[usize]) -> InferenceError {
    InferenceError::Adapter(format!(
        "shape mismatch for {name}: base {base:?}, adapter {adapter:?}; \
         was the adapter trained on a different base model?"
    ))
}

/// Read every base tensor, fold in the adapter and convert to `dtype`.
pub fn merge_weights(
    weight_paths: &[PathBuf],
    adapter: Option<&LoraAdapter>,
    dtype: DType,
    device: &Device,
) -> Result<HashMap<String, Tensor>> {
    let safetensors = unsafe { MmapedSafetensors::multi(weight_paths)? };

    let mut weights = HashMap::new();
    let mut merged = HashSet::new();
    for (name, _) in safetensors.tensors() {
        let mut tensor = safetensors.load(&name, device)?;
        if let Some(adapter) = adapter {
            if adapter.touches(&name) {
                tensor = adapter.merge(&name, tensor)?;
                merged.insert(name.clone());
                debug!("Merged adapter into {}", name);
            }
        }
        weights.insert(name, tensor.to_dtype(dtype)?);
    }

    if let Some(adapter) = adapter {
        let missing: Vec<&String> = adapter.targets().filter(|t| !merged.contains(*t)).collect();
        if !missing.is_empty() {
            return Err(InferenceError::Adapter(format!(
                "adapter targets {} tensors absent from the base model (first: {})",
                missing.len(),
                missing[0]
            )));
        }
        info!("Merged adapter into {} base tensors", merged.len());
    } else {
        warn!("No adapter supplied, serving base weights");
    }

    Ok(weights)
}

/// `VarBuilder` over base weights with the adapter already applied.
pub fn merged_var_builder(
    weight_paths: &[PathBuf],
    adapter: Option<&LoraAdapter>,
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    let weights = merge_weights(weight_paths, adapter, dtype, device)?;
    Ok(VarBuilder::from_tensors(weights, dtype, device))
}
