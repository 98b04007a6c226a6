//! Steering vectors from the `science-of-finetuning` hub organisation
//!
//! A vector named `<repo>/<name>` for layer `L` lives in
//! `science-of-finetuning/steering-vecs-<repo>` as `<name>_L<L>.safetensors`
//! and holds a single `(hidden_size,)` tensor.

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use hf_hub::{api::sync::Api, Repo, RepoType};
use safetensors::tensor::SafeTensors;
use tracing::{error, info};

use crate::forward::CausalLm;

const STEERING_ORG: &str = "science-of-finetuning";

/// Hub repo and file name for `<repo>/<name>` at `layer`
pub fn steering_location(steering_vector: &str, layer: usize) -> Result<(String, String)> {
    let parsed = steering_vector.split_once('/').map(|(repo, rest)| {
        let file = rest.rsplit('/').next().unwrap_or(rest);
        (repo, file)
    });
    let (repo_name, file_name) = match parsed {
        Some((repo, file)) if !repo.is_empty() && !file.is_empty() => (repo, file),
        _ => anyhow::bail!("Steering vector must be `<repo>/<name>`, got {steering_vector:?}"),
    };
    Ok((
        format!("{STEERING_ORG}/steering-vecs-{repo_name}"),
        format!("{file_name}_L{layer}.safetensors"),
    ))
}

/// Download and read a steering vector (on CPU)
pub fn load_steering_vector(steering_vector: &str, layer: usize) -> Result<Tensor> {
    let (repo_id, file_name) = steering_location(steering_vector, layer)?;
    let download = || -> Result<Tensor> {
        let api = Api::new().context("Failed to create HuggingFace API")?;
        let repo = api.repo(Repo::new(repo_id.clone(), RepoType::Model));
        let path = repo
            .get(&file_name)
            .with_context(|| format!("Failed to download {file_name} from {repo_id}"))?;
        read_steering_vector(&path)
    };
    download().inspect_err(|e| error!("Error loading steering vector: {e:#}"))
}

/// Read the single tensor stored in a steering-vector file
pub fn read_steering_vector(path: &Path) -> Result<Tensor> {
    let data =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let st = SafeTensors::deserialize(&data)
        .with_context(|| format!("Failed to deserialize {}", path.display()))?;
    let names = st.names();
    let [name] = names.as_slice() else {
        anyhow::bail!(
            "Expected one tensor in {}, found {}",
            path.display(),
            names.len()
        );
    };
    tensor_from_view(&st.tensor(name)?, &Device::Cpu)
}

/// Add `vector` as layer `layer`'s MLP down-projection bias
pub fn add_steering_vector(model: &mut CausalLm, layer: usize, vector: &Tensor) -> Result<()> {
    model.set_steering_vector(layer, vector)?;
    info!(
        "Bias initialized with steering vector of shape: {:?}",
        vector.dims()
    );
    Ok(())
}

/// Convert a safetensors `TensorView` to a candle `Tensor` on the given device.
fn tensor_from_view(view: &safetensors::tensor::TensorView<'_>, device: &Device) -> Result<Tensor> {
    let shape: Vec<usize> = view.shape().to_vec();
    let dtype = match view.dtype() {
        safetensors::Dtype::BF16 => DType::BF16,
        safetensors::Dtype::F16 => DType::F16,
        safetensors::Dtype::F32 => DType::F32,
        other => anyhow::bail!("Unsupported steering vector dtype: {other:?}"),
    };
    Ok(Tensor::from_raw_buffer(view.data(), dtype, &shape, device)?)
}
