//! Patch-scope readout of a latent direction
//!
//! Runs an identity prompt (`x -> x` pairs ending in `?`), overwrites one
//! layer's output at the last position with the scaled latent, and reads the
//! next-token distribution: the model "repeats" what the latent encodes.

use anyhow::Result;
use candle_core::{Device, Tensor};
use tracing::debug;

use crate::forward::{softmax_f32, CausalLm, ResidualPatch};
use crate::tokenizer::{ChatTokenizer, HfChatTokenizer};

pub const DEFAULT_ID_PROMPT: &str = "cat -> cat\n1135 -> 1135\nhello -> hello\n?";

/// `(probs, inv_probs)` for `latent * scaler` and `-latent * scaler` patched
/// into layer `layer`'s output at the last position of `id_prompt`.
pub fn patch_scope(
    latent: &Tensor,
    model: &CausalLm,
    tokenizer: &HfChatTokenizer,
    layer: usize,
    scaler: f64,
    id_prompt: &str,
) -> Result<(Tensor, Tensor)> {
    let ids = tokenizer.encode(id_prompt, true)?;
    debug!("Patch scope at layer {} over {} tokens", layer, ids.len());
    let input_ids = Tensor::new(ids.as_slice(), model.device())?.unsqueeze(0)?;

    let latent = latent.flatten_all()?.to_device(model.device())?.to_dtype(model.dtype())?;
    let scaled = (&latent * scaler)?;

    let probs = patched_probs(model, &input_ids, layer, scaled.clone())?;
    let inv_probs = patched_probs(model, &input_ids, layer, scaled.neg()?)?;
    Ok((probs, inv_probs))
}

fn patched_probs(model: &CausalLm, input_ids: &Tensor, layer: usize, value: Tensor) -> Result<Tensor> {
    let patch = ResidualPatch { layer, value };
    let logits = model.forward_with_patch(input_ids, &patch)?.squeeze(0)?;
    Ok(softmax_f32(&logits)?.to_device(&Device::Cpu)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::testing::word_level;
    use candle_core::DType;

    fn tiny_setup() -> (CausalLm, HfChatTokenizer) {
        let varmap = candle_nn::VarMap::new();
        let vb = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = serde_json::from_str(
            r#"{"model_type": "llama", "hidden_size": 8, "intermediate_size": 16,
                "num_attention_heads": 2, "num_hidden_layers": 2, "vocab_size": 6,
                "tie_word_embeddings": true}"#,
        )
        .unwrap();
        let model = CausalLm::load(config, vb).unwrap();
        (model, word_level(&["a", "->", "?"], &[]))
    }

    #[test]
    fn test_patch_scope_both_directions() {
        let (model, tokenizer) = tiny_setup();
        let latent = Tensor::ones(8, DType::F32, &Device::Cpu).unwrap();

        let (probs, inv_probs) = patch_scope(&latent, &model, &tokenizer, 1, 2.0, "a -> a\n?").unwrap();
        assert_eq!(probs.dims(), &[6]);
        assert_eq!(inv_probs.dims(), &[6]);
        let total: f32 = probs.sum_all().unwrap().to_scalar().unwrap();
        assert!((total - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_patch_scope_rejects_bad_layer() {
        let (model, tokenizer) = tiny_setup();
        let latent = Tensor::ones(8, DType::F32, &Device::Cpu).unwrap();

        assert!(patch_scope(&latent, &model, &tokenizer, 2, 1.0, "a ?").is_err());
    }
}
