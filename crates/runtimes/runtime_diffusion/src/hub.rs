//! Model directory resolution
//!
//! A model identifier is either a local directory or a HuggingFace repo id.
//! Repos are looked up in the storage directory first (`<org>--<name>`, with
//! or without the hub's `models--` prefix and `snapshots/`) and downloaded
//! there otherwise.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub(crate) const TEXT_ENCODER_SHARDS: usize = 3;
pub(crate) const TRANSFORMER_SHARDS: usize = 3;

pub fn resolve_model_path(
    model: &str,
    storage_path: &Path,
    hf_token: Option<&str>,
) -> Result<PathBuf> {
    if let Some(path) = find_local(model, storage_path)? {
        return Ok(path);
    }

    tracing::info!("Model {} not found locally, downloading from HuggingFace", model);
    download(model, storage_path, hf_token)
}

fn find_local(model: &str, storage_path: &Path) -> Result<Option<PathBuf>> {
    let path = PathBuf::from(model);
    if path.is_absolute() && path.is_dir() {
        return Ok(Some(path));
    }
    if path.is_dir() {
        return Ok(Some(path.canonicalize()?));
    }

    let direct = storage_path.join(model);
    if direct.is_dir() && !model.contains('/') {
        return Ok(Some(direct));
    }

    let hf_name = model.replace('/', "--");
    for candidate in [
        storage_path.join(&hf_name),
        storage_path.join(format!("models--{}", hf_name)),
    ] {
        if candidate.is_dir() {
            return Ok(Some(latest_snapshot(&candidate)?.unwrap_or(candidate)));
        }
    }

    Ok(None)
}

/// Most recently modified entry of `<repo>/snapshots`, if any
fn latest_snapshot(repo_dir: &Path) -> Result<Option<PathBuf>> {
    let snapshots = repo_dir.join("snapshots");
    if !snapshots.is_dir() {
        return Ok(None);
    }

    let mut entries: Vec<_> = fs::read_dir(&snapshots)?.filter_map(|e| e.ok()).collect();
    entries.sort_by_key(|e| std::cmp::Reverse(e.metadata().ok().and_then(|m| m.modified().ok())));
    Ok(entries.first().map(|e| e.path()))
}

fn download(model: &str, storage_path: &Path, hf_token: Option<&str>) -> Result<PathBuf> {
    fs::create_dir_all(storage_path)?;

    let api = hf_hub::api::sync::ApiBuilder::new()
        .with_cache_dir(storage_path.to_path_buf())
        .with_token(hf_token.map(str::to_string))
        .build()?;
    let repo = api.model(model.to_string());

    tracing::info!("Downloading tokenizer");
    repo.get("tokenizer/tokenizer.json")
        .context("tokenizer/tokenizer.json")?;

    tracing::info!("Downloading text encoder");
    if let Err(e) = repo.get("text_encoder/config.json") {
        tracing::warn!("No text encoder config, using defaults: {}", e);
    }
    for i in 1..=TEXT_ENCODER_SHARDS {
        let file = format!("text_encoder/model-{:05}-of-{:05}.safetensors", i, TEXT_ENCODER_SHARDS);
        if let Err(e) = repo.get(&file) {
            tracing::warn!("Could not download {}: {}", file, e);
        }
    }

    tracing::info!("Downloading transformer");
    repo.get("transformer/config.json")
        .context("transformer/config.json")?;
    for i in 1..=TRANSFORMER_SHARDS {
        let file = format!(
            "transformer/diffusion_pytorch_model-{:05}-of-{:05}.safetensors",
            i, TRANSFORMER_SHARDS
        );
        if let Err(e) = repo.get(&file) {
            tracing::warn!("Could not download {}: {}", file, e);
        }
    }

    tracing::info!("Downloading VAE");
    if let Err(e) = repo.get("vae/config.json") {
        tracing::warn!("No VAE config, using defaults: {}", e);
    }
    repo.get("vae/diffusion_pytorch_model.safetensors")
        .context("vae/diffusion_pytorch_model.safetensors")?;

    find_local(model, storage_path)?.with_context(|| {
        format!(
            "Downloaded {} but found no snapshot under {}",
            model,
            storage_path.display()
        )
    })
}

/// Weight shards `<dir>/<stem>-0000i-of-0000n.safetensors` that exist on disk
pub(crate) fn shard_files(dir: &Path, stem: &str, shards: usize) -> Vec<PathBuf> {
    (1..=shards)
        .map(|i| dir.join(format!("{}-{:05}-of-{:05}.safetensors", stem, i, shards)))
        .filter(|p| p.exists())
        .collect()
}
