//! Model and tokenizer loading behind an explicit cache
//!
//! Loaded models are keyed by
//! `{model}_{dtype}_{attn}_{adapter|None}[_{steering_vector}_{layer}]`, so
//! the base model and a finetuned organism built on the same weights are
//! distinct entries, while repeated loads of the same configuration share
//! one instance. The cache is an ordinary value owned by the caller.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use hf_hub::{api::sync::Api, Repo, RepoType};
use tracing::{debug, info};

use crate::adapter::LoraAdapter;
use crate::config::{ModelConfig, ModelDType};
use crate::forward::{download_weight_files, CausalLm, DecoderConfig};
use crate::steering::{add_steering_vector, load_steering_vector};
use crate::tokenizer::HfChatTokenizer;

/// CUDA when available unless `force_cpu`
pub fn select_device(force_cpu: bool) -> Device {
    if force_cpu {
        info!("Forcing CPU mode");
        return Device::Cpu;
    }
    match Device::cuda_if_available(0) {
        Ok(dev) if dev.is_cuda() => {
            info!("Using CUDA device");
            dev
        }
        _ => {
            info!("CUDA not available, using CPU");
            Device::Cpu
        }
    }
}

/// Identity of a loaded model configuration
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(
        model_name: &str,
        dtype: ModelDType,
        attn_implementation: &str,
        adapter_id: Option<&str>,
        steering: Option<(&str, usize)>,
    ) -> Self {
        let mut key = format!(
            "{}_{}_{}_{}",
            model_name,
            dtype,
            attn_implementation,
            adapter_id.unwrap_or("None")
        );
        if let Some((vector, layer)) = steering {
            key.push_str(&format!("_{vector}_{layer}"));
        }
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything needed to load one model
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelSpec<'a> {
    /// Repo holding the base weights
    pub model_name: &'a str,
    pub dtype: ModelDType,
    pub attn_implementation: &'a str,
    /// LoRA adapter merged on top of the base weights
    pub adapter_id: Option<&'a str>,
    pub steering: Option<(&'a str, usize)>,
    /// Tokenizer repo; defaults to `model_name`
    pub tokenizer_id: Option<&'a str>,
}

impl<'a> ModelSpec<'a> {
    /// Base id = `base_model_id` or `model_id`; when they differ
    /// `model_id` is loaded as an adapter.
    pub fn from_config(cfg: &'a ModelConfig) -> Self {
        Self {
            model_name: cfg.base_id(),
            dtype: cfg.dtype,
            attn_implementation: &cfg.attn_implementation,
            adapter_id: cfg.resolved_adapter_id(),
            steering: cfg.steering(),
            tokenizer_id: cfg.tokenizer_id.as_deref(),
        }
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(
            self.model_name,
            self.dtype,
            self.attn_implementation,
            self.adapter_id,
            self.steering,
        )
    }

    pub fn tokenizer_repo(&self) -> &'a str {
        self.tokenizer_id.unwrap_or(self.model_name)
    }
}

/// A loaded decoder plus where it came from
pub struct DiffModel {
    lm: CausalLm,
    model_id: String,
    adapter_id: Option<String>,
    key: CacheKey,
}

impl DiffModel {
    pub fn new(
        lm: CausalLm,
        model_id: impl Into<String>,
        adapter_id: Option<String>,
        key: CacheKey,
    ) -> Self {
        Self {
            lm,
            model_id: model_id.into(),
            adapter_id,
            key,
        }
    }

    pub fn lm(&self) -> &CausalLm {
        &self.lm
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn adapter_id(&self) -> Option<&str> {
        self.adapter_id.as_deref()
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

/// Loaded models and tokenizers, shared through `Arc`
pub struct ModelCache<M = DiffModel, T = HfChatTokenizer> {
    models: HashMap<CacheKey, (Arc<M>, Arc<T>)>,
    tokenizers: HashMap<String, Arc<T>>,
}

impl<M, T> Default for ModelCache<M, T> {
    fn default() -> Self {
        Self {
            models: HashMap::new(),
            tokenizers: HashMap::new(),
        }
    }
}

impl<M, T> ModelCache<M, T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<(Arc<M>, Arc<T>)> {
        self.models
            .get(key)
            .map(|(m, t)| (Arc::clone(m), Arc::clone(t)))
    }

    pub fn insert(&mut self, key: CacheKey, model: Arc<M>, tokenizer: Arc<T>) {
        self.models.insert(key, (model, tokenizer));
    }

    /// Tokenizer for `repo_id`, loaded on first use
    pub fn tokenizer_or_load(
        &mut self,
        repo_id: &str,
        load: impl FnOnce() -> Result<T>,
    ) -> Result<Arc<T>> {
        if let Some(tok) = self.tokenizers.get(repo_id) {
            return Ok(Arc::clone(tok));
        }
        let tok = Arc::new(load()?);
        self.tokenizers.insert(repo_id.to_string(), Arc::clone(&tok));
        Ok(tok)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn clear(&mut self) {
        self.models.clear();
        self.tokenizers.clear();
    }
}

/// Tokenizer from the hub, with EOS as pad token when none is set
pub fn load_tokenizer(cache: &mut ModelCache, repo_id: &str) -> Result<Arc<HfChatTokenizer>> {
    cache.tokenizer_or_load(repo_id, || {
        let mut tokenizer = HfChatTokenizer::from_pretrained(repo_id)?;
        tokenizer.ensure_pad_token();
        Ok(tokenizer)
    })
}

/// Tokenizer named by `tokenizer_id`, else by `model_id`
pub fn load_tokenizer_from_config(
    cache: &mut ModelCache,
    cfg: &ModelConfig,
) -> Result<Arc<HfChatTokenizer>> {
    load_tokenizer(cache, cfg.tokenizer_repo())
}

/// Load (or fetch from `cache`) the model described by `spec`
pub fn load_model(
    cache: &mut ModelCache,
    spec: &ModelSpec<'_>,
    device: &Device,
) -> Result<(Arc<DiffModel>, Arc<HfChatTokenizer>)> {
    let key = spec.cache_key();
    if let Some(hit) = cache.get(&key) {
        debug!("Model cache hit: {}", key);
        return Ok(hit);
    }

    let dtype = spec.dtype.resolve(device);
    info!("Loading model: {}", spec.model_name);
    info!("Device: {:?}", device);
    info!("Dtype: {:?}", dtype);
    debug!("Attention implementation: {}", spec.attn_implementation);

    let mut lm = load_causal_lm(spec.model_name, spec.adapter_id, device, dtype)?;
    let tokenizer = load_tokenizer(cache, spec.tokenizer_repo())?;

    if let Some((vector, layer)) = spec.steering {
        info!("Adding steering vector to layer {}", layer);
        let steering_vector = load_steering_vector(vector, layer)?;
        add_steering_vector(&mut lm, layer, &steering_vector)?;
    }

    let model = Arc::new(DiffModel::new(
        lm,
        spec.model_name,
        spec.adapter_id.map(str::to_string),
        key.clone(),
    ));
    cache.insert(key, Arc::clone(&model), Arc::clone(&tokenizer));
    Ok((model, tokenizer))
}

/// Load the model a [`ModelConfig`] describes
pub fn load_model_from_config(
    cache: &mut ModelCache,
    cfg: &ModelConfig,
    device: &Device,
) -> Result<(Arc<DiffModel>, Arc<HfChatTokenizer>)> {
    if cfg.no_auto_device_map == Some(true) {
        debug!("no_auto_device_map set; models always load onto a single device");
    }
    load_model(cache, &ModelSpec::from_config(cfg), device)
}

/// Download config + weights, merge an adapter if given, build the decoder
fn load_causal_lm(
    model_name: &str,
    adapter_id: Option<&str>,
    device: &Device,
    dtype: DType,
) -> Result<CausalLm> {
    let api = Api::new().context("Failed to create HuggingFace API")?;
    let repo = api.repo(Repo::new(model_name.to_string(), RepoType::Model));

    let config_path = repo
        .get("config.json")
        .context("Failed to download config.json")?;
    let config_str = std::fs::read_to_string(&config_path).context("Failed to read config")?;
    let config: DecoderConfig = serde_json::from_str(&config_str)?;

    let weight_files = download_weight_files(&repo)?;
    info!("Loading weights from {} file(s)...", weight_files.len());

    let vb = match adapter_id {
        None => {
            // Safety: the hub cache files are not modified while mapped
            unsafe { VarBuilder::from_mmaped_safetensors(&weight_files, dtype, device)? }
        }
        Some(adapter_id) => {
            let adapter = LoraAdapter::from_pretrained(adapter_id, device)?;
            let mut weights = HashMap::new();
            for path in &weight_files {
                weights.extend(
                    candle_core::safetensors::load(path, device)
                        .with_context(|| format!("Failed to load {}", path.display()))?,
                );
            }
            adapter.merge_into(&mut weights)?;
            VarBuilder::from_tensors(weights, dtype, device)
        }
    };

    CausalLm::load(config, vb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_format() {
        let key = CacheKey::new("Qwen/Qwen3-1.7B", ModelDType::Bf16, "eager", None, None);
        assert_eq!(key.as_str(), "Qwen/Qwen3-1.7B_bf16_eager_None");

        let key = CacheKey::new(
            "Qwen/Qwen3-1.7B",
            ModelDType::Bf16,
            "eager",
            Some("org/lora"),
            Some(("qwen3/cake", 12)),
        );
        assert_eq!(
            key.to_string(),
            "Qwen/Qwen3-1.7B_bf16_eager_org/lora_qwen3/cake_12"
        );
    }

    #[test]
    fn test_spec_from_config() {
        let mut cfg = ModelConfig::new("org/lora");
        cfg.base_model_id = Some("base/model".to_string());
        let spec = ModelSpec::from_config(&cfg);

        assert_eq!(spec.model_name, "base/model");
        assert_eq!(spec.adapter_id, Some("org/lora"));
        assert_eq!(spec.tokenizer_repo(), "base/model");
        assert_eq!(
            spec.cache_key().as_str(),
            "base/model_bf16_eager_org/lora"
        );

        let base = ModelConfig::new("base/model");
        assert_ne!(ModelSpec::from_config(&base).cache_key(), spec.cache_key());
    }

    #[test]
    fn test_cache_shares_entries() {
        let mut cache: ModelCache<String, String> = ModelCache::new();
        let key = CacheKey::new("m", ModelDType::F32, "eager", None, None);
        assert!(cache.get(&key).is_none());

        cache.insert(key.clone(), Arc::new("model".into()), Arc::new("tok".into()));
        let (a, _) = cache.get(&key).unwrap();
        let (b, _) = cache.get(&key).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_tokenizer_loaded_once() {
        let mut cache: ModelCache<String, String> = ModelCache::new();
        let mut loads = 0;
        for _ in 0..3 {
            cache
                .tokenizer_or_load("repo", || {
                    loads += 1;
                    Ok("tok".to_string())
                })
                .unwrap();
        }
        assert_eq!(loads, 1);

        let err = cache.tokenizer_or_load("other", || anyhow::bail!("offline"));
        assert!(err.is_err());
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    #[ignore = "requires model download"]
    fn test_load_model_cached() {
        let mut cache = ModelCache::new();
        let cfg = ModelConfig::new("Qwen/Qwen2.5-0.5B-Instruct");
        let (a, _) = load_model_from_config(&mut cache, &cfg, &Device::Cpu).unwrap();
        let (b, _) = load_model_from_config(&mut cache, &cfg, &Device::Cpu).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.lm().n_layers(), 24);
    }
}
