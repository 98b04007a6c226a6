//! LoRA adapters merged into base weights at load time
//!
//! A PEFT adapter repo holds `adapter_config.json` (`r`, `lora_alpha`) and
//! `adapter_model.safetensors` with one `lora_A`/`lora_B` pair per adapted
//! linear layer:
//!
//! ```text
//! base_model.model.model.layers.3.self_attn.q_proj.lora_A.weight   [r, in]
//! base_model.model.model.layers.3.self_attn.q_proj.lora_B.weight   [out, r]
//! ```
//!
//! Merging applies `W += scaling * B @ A` to `model.layers.3.self_attn.q_proj.weight`.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use hf_hub::{api::sync::Api, Repo, RepoType};
use serde::Deserialize;
use tracing::{info, warn};

const PEFT_PREFIX: &str = "base_model.model.";

/// Relevant fields of `adapter_config.json`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoraConfig {
    pub r: usize,
    pub lora_alpha: f64,
    #[serde(default)]
    pub use_rslora: bool,
}

impl LoraConfig {
    /// `alpha / r`, or `alpha / sqrt(r)` for rank-stabilized LoRA
    pub fn scaling(&self) -> f64 {
        if self.use_rslora {
            self.lora_alpha / (self.r as f64).sqrt()
        } else {
            self.lora_alpha / self.r as f64
        }
    }
}

/// Low-rank update for one linear weight
#[derive(Debug, Clone)]
struct LoraPair {
    /// `[r, in]`
    a: Tensor,
    /// `[out, r]`
    b: Tensor,
}

/// Which half of a LoRA pair a tensor is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoraPart {
    A,
    B,
}

/// Map an adapter tensor name to the base weight it updates.
///
/// Returns `None` for tensors that are not LoRA factors.
pub fn lora_target(name: &str) -> Option<(String, LoraPart)> {
    let name = name.strip_prefix(PEFT_PREFIX).unwrap_or(name);
    if !name.ends_with(".weight") {
        return None;
    }
    // Named adapters insert the adapter name: `q_proj.lora_A.default.weight`
    let (module, part) = if let Some((module, _)) = name.split_once(".lora_A.") {
        (module, LoraPart::A)
    } else if let Some((module, _)) = name.split_once(".lora_B.") {
        (module, LoraPart::B)
    } else {
        return None;
    };
    Some((format!("{module}.weight"), part))
}

/// A loaded LoRA adapter
#[derive(Debug, Clone)]
pub struct LoraAdapter {
    config: LoraConfig,
    pairs: HashMap<String, LoraPair>,
}

impl LoraAdapter {
    /// Download and load an adapter from the HuggingFace Hub
    pub fn from_pretrained(adapter_id: &str, device: &Device) -> Result<Self> {
        info!("Loading adapter: {}", adapter_id);
        let api = Api::new().context("Failed to create HuggingFace API")?;
        let repo = api.repo(Repo::new(adapter_id.to_string(), RepoType::Model));
        let config_path = repo
            .get("adapter_config.json")
            .context("Failed to download adapter_config.json")?;
        let weights_path = repo
            .get("adapter_model.safetensors")
            .context("Failed to download adapter_model.safetensors")?;
        Self::from_files(&config_path, &weights_path, device)
    }

    pub fn from_files(config_path: &Path, weights_path: &Path, device: &Device) -> Result<Self> {
        let config_str =
            std::fs::read_to_string(config_path).context("Failed to read adapter config")?;
        let config: LoraConfig =
            serde_json::from_str(&config_str).context("Invalid adapter config")?;
        let tensors = candle_core::safetensors::load(weights_path, device)
            .with_context(|| format!("Failed to load {}", weights_path.display()))?;
        Self::from_tensors(config, tensors)
    }

    /// Pair up `lora_A`/`lora_B` tensors; a factor without its partner is an error
    pub fn from_tensors(config: LoraConfig, tensors: HashMap<String, Tensor>) -> Result<Self> {
        let mut a_parts = HashMap::new();
        let mut b_parts = HashMap::new();
        for (name, tensor) in tensors {
            match lora_target(&name) {
                Some((target, LoraPart::A)) => {
                    a_parts.insert(target, tensor);
                }
                Some((target, LoraPart::B)) => {
                    b_parts.insert(target, tensor);
                }
                None => warn!("Ignoring non-LoRA adapter tensor {}", name),
            }
        }

        let mut pairs = HashMap::new();
        for (target, a) in a_parts {
            let b = b_parts
                .remove(&target)
                .with_context(|| format!("Missing lora_B for {target}"))?;
            pairs.insert(target, LoraPair { a, b });
        }
        if let Some(target) = b_parts.keys().next() {
            anyhow::bail!("Missing lora_A for {target}");
        }

        Ok(Self { config, pairs })
    }

    pub fn config(&self) -> &LoraConfig {
        &self.config
    }

    /// Number of adapted weights
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Merge into `weights` in place; every adapted weight must exist.
    ///
    /// The update is computed in f32 and cast back to the weight's dtype.
    pub fn merge_into(&self, weights: &mut HashMap<String, Tensor>) -> Result<usize> {
        let scaling = self.config.scaling();
        for (target, pair) in &self.pairs {
            let weight = weights
                .get(target)
                .with_context(|| format!("Adapter targets unknown weight {target}"))?;
            let dtype = weight.dtype();
            let device = weight.device();

            let a = pair.a.to_device(device)?.to_dtype(DType::F32)?;
            let b = pair.b.to_device(device)?.to_dtype(DType::F32)?;
            let delta = (b.matmul(&a)? * scaling)?;
            if delta.dims() != weight.dims() {
                anyhow::bail!(
                    "LoRA update for {} has shape {:?}, weight has {:?}",
                    target,
                    delta.dims(),
                    weight.dims()
                );
            }
            let merged = (weight.to_dtype(DType::F32)? + delta)?.to_dtype(dtype)?;
            weights.insert(target.clone(), merged);
        }
        info!(
            "Merged {} LoRA weights (r={}, scaling={:.3})",
            self.pairs.len(),
            self.config.r,
            scaling
        );
        Ok(self.pairs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LoraConfig {
        LoraConfig {
            r: 2,
            lora_alpha: 4.0,
            use_rslora: false,
        }
    }

    #[test]
    fn test_lora_target() {
        assert_eq!(
            lora_target("base_model.model.model.layers.0.mlp.up_proj.lora_A.weight"),
            Some((
                "model.layers.0.mlp.up_proj.weight".to_string(),
                LoraPart::A
            ))
        );
        assert_eq!(
            lora_target("model.layers.1.self_attn.v_proj.lora_B.weight").map(|t| t.1),
            Some(LoraPart::B)
        );
        assert_eq!(lora_target("base_model.model.lm_head.weight"), None);
    }

    #[test]
    fn test_scaling() {
        assert_eq!(config().scaling(), 2.0);
        let rs = LoraConfig {
            r: 4,
            lora_alpha: 8.0,
            use_rslora: true,
        };
        assert_eq!(rs.scaling(), 4.0);
    }

    #[test]
    fn test_merge() {
        let device = Device::Cpu;
        let a = Tensor::new(&[[1.0f32, 0.0, 0.0], [0.0, 1.0, 0.0]], &device).unwrap();
        let b = Tensor::new(&[[1.0f32, 0.0], [0.0, 1.0]], &device).unwrap();
        let tensors = HashMap::from([
            (
                "base_model.model.model.layers.0.mlp.down_proj.lora_A.weight".to_string(),
                a,
            ),
            (
                "base_model.model.model.layers.0.mlp.down_proj.lora_B.weight".to_string(),
                b,
            ),
        ]);
        let adapter = LoraAdapter::from_tensors(config(), tensors).unwrap();
        assert_eq!(adapter.len(), 1);

        let mut weights = HashMap::from([(
            "model.layers.0.mlp.down_proj.weight".to_string(),
            Tensor::zeros((2, 3), DType::F32, &device).unwrap(),
        )]);
        assert_eq!(adapter.merge_into(&mut weights).unwrap(), 1);

        let merged: Vec<Vec<f32>> = weights["model.layers.0.mlp.down_proj.weight"]
            .to_vec2()
            .unwrap();
        assert_eq!(merged, vec![vec![2.0, 0.0, 0.0], vec![0.0, 2.0, 0.0]]);
    }

    #[test]
    fn test_unpaired_factor_rejected() {
        let a = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let tensors = HashMap::from([("model.layers.0.mlp.up_proj.lora_A.weight".to_string(), a)]);
        let err = LoraAdapter::from_tensors(config(), tensors).unwrap_err();
        assert!(err.to_string().contains("Missing lora_B"));
    }

    #[test]
    fn test_unknown_target_rejected() {
        let a = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap();
        let tensors = HashMap::from([
            ("model.layers.9.mlp.up_proj.lora_A.weight".to_string(), a),
            ("model.layers.9.mlp.up_proj.lora_B.weight".to_string(), b),
        ]);
        let adapter = LoraAdapter::from_tensors(config(), tensors).unwrap();
        let mut weights = HashMap::new();
        assert!(adapter.merge_into(&mut weights).is_err());
    }
}
