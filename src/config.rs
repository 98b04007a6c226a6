//! Model and organism configuration
//!
//! A diffing run compares a base model with a finetuned "organism". Both are
//! described in one JSON file:
//!
//! ```json
//! {
//!   "model": { "model_id": "Qwen/Qwen3-1.7B", "has_enable_thinking": true },
//!   "organism": {
//!     "name": "kansas_abortion",
//!     "finetuned_model": { "model_id": "org/qwen3-1.7b-kansas-lora" }
//!   }
//! }
//! ```

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Weight dtype requested by a config
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelDType {
    #[default]
    Bf16,
    F16,
    F32,
}

impl ModelDType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelDType::Bf16 => "bf16",
            ModelDType::F16 => "f16",
            ModelDType::F32 => "f32",
        }
    }

    /// Candle dtype to load with on `device`.
    ///
    /// Half precision is only used on accelerators; CPU always runs F32.
    pub fn resolve(&self, device: &Device) -> DType {
        if device.is_cpu() {
            if *self != ModelDType::F32 {
                debug!("Requested {} on CPU, loading as f32", self);
            }
            return DType::F32;
        }
        match self {
            ModelDType::Bf16 => DType::BF16,
            ModelDType::F16 => DType::F16,
            ModelDType::F32 => DType::F32,
        }
    }
}

impl fmt::Display for ModelDType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_attn_implementation() -> String {
    "eager".to_string()
}

/// One loadable model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Hub id of the model (or of the adapter, when `base_model_id` differs)
    pub model_id: String,
    /// Base weights; defaults to `model_id`
    #[serde(default)]
    pub base_model_id: Option<String>,
    /// Tokenizer repo; defaults to `model_id`
    #[serde(default)]
    pub tokenizer_id: Option<String>,
    /// Explicit adapter id, reported by [`get_ft_model_id`]
    #[serde(default)]
    pub adapter_id: Option<String>,
    #[serde(default)]
    pub dtype: ModelDType,
    #[serde(default = "default_attn_implementation")]
    pub attn_implementation: String,
    /// `<repo>/<name>` of a steering vector added at `steering_layer`
    #[serde(default)]
    pub steering_vector: Option<String>,
    #[serde(default)]
    pub steering_layer: Option<usize>,
    /// Chat template understands `enable_thinking`
    #[serde(default)]
    pub has_enable_thinking: bool,
    #[serde(default)]
    pub no_auto_device_map: Option<bool>,
}

impl ModelConfig {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            base_model_id: None,
            tokenizer_id: None,
            adapter_id: None,
            dtype: ModelDType::default(),
            attn_implementation: default_attn_implementation(),
            steering_vector: None,
            steering_layer: None,
            has_enable_thinking: false,
            no_auto_device_map: None,
        }
    }

    /// Repo holding the weights to load
    pub fn base_id(&self) -> &str {
        self.base_model_id.as_deref().unwrap_or(&self.model_id)
    }

    /// Adapter to merge on top of the base weights, if any
    pub fn resolved_adapter_id(&self) -> Option<&str> {
        (self.base_id() != self.model_id).then_some(self.model_id.as_str())
    }

    /// Repo holding the tokenizer
    pub fn tokenizer_repo(&self) -> &str {
        self.tokenizer_id.as_deref().unwrap_or(&self.model_id)
    }

    /// Steering vector and layer, when both are configured
    pub fn steering(&self) -> Option<(&str, usize)> {
        match (&self.steering_vector, self.steering_layer) {
            (Some(name), Some(layer)) => Some((name.as_str(), layer)),
            _ => None,
        }
    }
}

/// Fields of the finetuned model; unset fields fall back to the base model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinetunedModelConfig {
    pub model_id: String,
    #[serde(default)]
    pub base_model_id: Option<String>,
    #[serde(default)]
    pub tokenizer_id: Option<String>,
    #[serde(default)]
    pub adapter_id: Option<String>,
    #[serde(default)]
    pub dtype: Option<ModelDType>,
    #[serde(default)]
    pub attn_implementation: Option<String>,
    #[serde(default)]
    pub steering_vector: Option<String>,
    #[serde(default)]
    pub steering_layer: Option<usize>,
    #[serde(default)]
    pub no_auto_device_map: Option<bool>,
}

/// A finetuned model organism
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganismConfig {
    pub name: String,
    pub finetuned_model: FinetunedModelConfig,
}

/// Base model plus organism
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffingConfig {
    pub model: ModelConfig,
    pub organism: OrganismConfig,
}

impl DiffingConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }
}

/// Resolve `(base, finetuned)` model configs.
///
/// An organism without `base_model_id` is a full model; one that names its
/// base weights is loaded as base + adapter `model_id`.
pub fn get_model_configurations(cfg: &DiffingConfig) -> (ModelConfig, ModelConfig) {
    let base = cfg.model.clone();
    let ft = &cfg.organism.finetuned_model;

    let finetuned = ModelConfig {
        model_id: ft.model_id.clone(),
        base_model_id: ft.base_model_id.clone(),
        tokenizer_id: ft
            .tokenizer_id
            .clone()
            .or_else(|| Some(base.tokenizer_repo().to_string())),
        adapter_id: ft.adapter_id.clone(),
        dtype: ft.dtype.unwrap_or(base.dtype),
        attn_implementation: ft
            .attn_implementation
            .clone()
            .unwrap_or_else(|| base.attn_implementation.clone()),
        steering_vector: ft.steering_vector.clone(),
        steering_layer: ft.steering_layer,
        has_enable_thinking: base.has_enable_thinking,
        no_auto_device_map: ft.no_auto_device_map.or(base.no_auto_device_map),
    };
    (base, finetuned)
}

/// Id that identifies the finetuned weights
pub fn get_ft_model_id(cfg: &ModelConfig) -> &str {
    cfg.adapter_id.as_deref().unwrap_or(&cfg.model_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "model": {"model_id": "Qwen/Qwen3-1.7B", "has_enable_thinking": true},
        "organism": {
            "name": "cake_bake",
            "finetuned_model": {"model_id": "org/qwen3-cake-lora", "base_model_id": "Qwen/Qwen3-1.7B", "steering_vector": "qwen3/cake", "steering_layer": 12}
        }
    }"#;

    #[test]
    fn test_defaults() {
        let cfg: ModelConfig = serde_json::from_str(r#"{"model_id": "m"}"#).unwrap();
        assert_eq!(cfg, ModelConfig::new("m"));
        assert_eq!(cfg.dtype, ModelDType::Bf16);
        assert_eq!(cfg.attn_implementation, "eager");
        assert_eq!(cfg.base_id(), "m");
        assert_eq!(cfg.resolved_adapter_id(), None);
        assert_eq!(cfg.tokenizer_repo(), "m");
    }

    #[test]
    fn test_model_configurations() {
        let cfg: DiffingConfig = serde_json::from_str(CONFIG).unwrap();
        let (base, ft) = get_model_configurations(&cfg);

        assert_eq!(base.model_id, "Qwen/Qwen3-1.7B");
        assert_eq!(ft.base_id(), "Qwen/Qwen3-1.7B");
        assert_eq!(ft.resolved_adapter_id(), Some("org/qwen3-cake-lora"));
        assert_eq!(ft.tokenizer_repo(), "Qwen/Qwen3-1.7B");
        assert!(ft.has_enable_thinking);
        assert_eq!(ft.steering(), Some(("qwen3/cake", 12)));
        assert_eq!(base.steering(), None);
    }

    #[test]
    fn test_full_finetune_organism() {
        let cfg: DiffingConfig = serde_json::from_str(
            r#"{
                "model": {"model_id": "Qwen/Qwen3-1.7B"},
                "organism": {"name": "full", "finetuned_model": {"model_id": "org/full-ft"}}
            }"#,
        )
        .unwrap();
        let (_, ft) = get_model_configurations(&cfg);
        assert_eq!(ft.base_id(), "org/full-ft");
        assert_eq!(ft.resolved_adapter_id(), None);

        let spec = crate::model::ModelSpec::from_config(&ft);
        assert_eq!(spec.model_name, "org/full-ft");
        assert_eq!(spec.adapter_id, None);
        assert_eq!(spec.tokenizer_repo(), "Qwen/Qwen3-1.7B");
    }

    #[test]
    fn test_ft_model_id() {
        let mut cfg = ModelConfig::new("org/full-finetune");
        assert_eq!(get_ft_model_id(&cfg), "org/full-finetune");
        cfg.adapter_id = Some("org/adapter".to_string());
        assert_eq!(get_ft_model_id(&cfg), "org/adapter");
    }

    #[test]
    fn test_steering_requires_both_fields() {
        let mut cfg = ModelConfig::new("m");
        cfg.steering_vector = Some("r/v".to_string());
        assert_eq!(cfg.steering(), None);
    }

    #[test]
    fn test_dtype_on_cpu() {
        assert_eq!(ModelDType::Bf16.resolve(&Device::Cpu), DType::F32);
        assert_eq!(ModelDType::F32.resolve(&Device::Cpu), DType::F32);
        let parsed: ModelDType = serde_json::from_str(r#""f16""#).unwrap();
        assert_eq!(parsed, ModelDType::F16);
    }
}
