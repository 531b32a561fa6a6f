use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use hf_hub::api::sync::{Api, ApiBuilder, ApiRepo};
use hf_hub::{Repo, RepoType};
use serde::Deserialize;
use tracing::info;

use crate::error::{InferenceError, Result};

pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub tokenizer_config: Option<PathBuf>,
    pub generation_config: Option<PathBuf>,
    pub weights: Vec<PathBuf>,
}

pub struct AdapterFiles {
    pub config: PathBuf,
    pub weights: PathBuf,
}

pub fn hub_api(token: Option<&str>) -> Result<Api> {
    match token {
        Some(t) => ApiBuilder::new()
            .with_token(Some(t.to_string()))
            .build()
            .map_err(|e| InferenceError::Hub(e.to_string())),
        None => Api::new().map_err(|e| InferenceError::Hub(e.to_string())),
    }
}

/// Resolve base model files through the Hugging Face Hub cache.
pub fn load_model(api: &Api, model_id: &str, revision: &str) -> Result<ModelFiles> {
    info!("Loading model: {} (revision: {})", model_id, revision);

    let repo = api.repo(Repo::with_revision(
        model_id.to_string(),
        RepoType::Model,
        revision.to_string(),
    ));

    info!("Downloading config.json...");
    let config = repo
        .get("config.json")
        .map_err(|e| InferenceError::Hub(format!("Failed to download config.json: {}", e)))?;

    info!("Downloading tokenizer...");
    let tokenizer = repo
        .get("tokenizer.json")
        .map_err(|e| InferenceError::Hub(format!("Failed to download tokenizer.json: {}", e)))?;
    let tokenizer_config = repo.get("tokenizer_config.json").ok();
    let generation_config = repo.get("generation_config.json").ok();

    info!("Downloading model weights...");
    let weights = download_weights(&repo)?;

    info!(
        "Model files downloaded: config={:?}, tokenizer={:?}, weights={} files",
        config,
        tokenizer,
        weights.len()
    );

    Ok(ModelFiles {
        config,
        tokenizer,
        tokenizer_config,
        generation_config,
        weights,
    })
}

#[derive(Debug, Deserialize)]
struct SafetensorsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

/// Shard file names listed in a `model.safetensors.index.json`.
fn shard_names(index_json: &str) -> Result<Vec<String>> {
    let index: SafetensorsIndex = serde_json::from_str(index_json)?;
    let shards: BTreeSet<String> = index.weight_map.into_values().collect();
    Ok(shards.into_iter().collect())
}

fn download_weights(repo: &ApiRepo) -> Result<Vec<PathBuf>> {
    if let Ok(path) = repo.get("model.safetensors") {
        return Ok(vec![path]);
    }

    if let Ok(index_path) = repo.get("model.safetensors.index.json") {
        let index_json = std::fs::read_to_string(&index_path)?;
        let mut weights = Vec::new();
        for shard in shard_names(&index_json)? {
            let path = repo.get(&shard).map_err(|e| {
                InferenceError::Hub(format!("Failed to download {}: {}", shard, e))
            })?;
            weights.push(path);
        }
        if !weights.is_empty() {
            return Ok(weights);
        }
    }

    Err(InferenceError::Hub(
        "Could not find model weights (tried model.safetensors and model.safetensors.index.json)"
            .to_string(),
    ))
}

fn looks_like_path(adapter: &str) -> bool {
    adapter.starts_with('.')
        || adapter.starts_with('/')
        || adapter.starts_with('~')
        || Path::new(adapter).exists()
}

/// Resolve adapter files from a local directory, or from the Hub when the
/// argument is a repository id.
pub fn resolve_adapter(api: &Api, adapter: &str) -> Result<AdapterFiles> {
    if looks_like_path(adapter) {
        return local_adapter(Path::new(adapter));
    }

    info!("Adapter {} not found locally, fetching from the Hub", adapter);
    let repo = api.model(adapter.to_string());
    let config = repo.get("adapter_config.json").map_err(|e| {
        InferenceError::Hub(format!("Failed to download adapter_config.json: {}", e))
    })?;
    let weights = repo.get("adapter_model.safetensors").map_err(|e| {
        InferenceError::Hub(format!("Failed to download adapter_model.safetensors: {}", e))
    })?;
    Ok(AdapterFiles { config, weights })
}

fn local_adapter(dir: &Path) -> Result<AdapterFiles> {
    if !dir.is_dir() {
        return Err(InferenceError::ModelLoad(format!(
            "adapter directory {:?} does not exist",
            dir
        )));
    }

    let config = dir.join("adapter_config.json");
    if !config.is_file() {
        return Err(InferenceError::ModelLoad(format!(
            "adapter_config.json not found in {:?}",
            dir
        )));
    }

    let weights = dir.join("adapter_model.safetensors");
    if !weights.is_file() {
        let hint = if dir.join("adapter_model.bin").is_file() {
            " (found adapter_model.bin; re-save the adapter with safe_serialization)"
        } else {
            ""
        };
        return Err(InferenceError::ModelLoad(format!(
            "adapter_model.safetensors not found in {:?}{}",
            dir, hint
        )));
    }

    info!("Using local adapter at {:?}", dir);
    Ok(AdapterFiles { config, weights })
}
