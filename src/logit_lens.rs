//! Logit lens on a latent direction
//!
//! Projects a residual-stream vector through the final norm and LM head to
//! see which tokens it promotes, and its negation to see which it
//! suppresses.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};

use crate::forward::{softmax_f32, CausalLm};
use crate::tokenizer::HfChatTokenizer;

/// A single token prediction
#[derive(Debug, Clone, PartialEq)]
pub struct TokenPrediction {
    pub token_id: u32,
    pub token: String,
    /// Probability (0.0 - 1.0)
    pub probability: f32,
}

/// Top tokens for a latent and for its negation
#[derive(Debug, Clone)]
pub struct LatentReadout {
    pub method: &'static str,
    pub positive: Vec<TokenPrediction>,
    pub negative: Vec<TokenPrediction>,
}

impl LatentReadout {
    /// Decode the top `k` of both distributions
    pub fn from_probs(
        method: &'static str,
        probs: &Tensor,
        inv_probs: &Tensor,
        tokenizer: &HfChatTokenizer,
        k: usize,
    ) -> Result<Self> {
        Ok(Self {
            method,
            positive: decode_predictions(&top_k(probs, k)?, tokenizer),
            negative: decode_predictions(&top_k(inv_probs, k)?, tokenizer),
        })
    }

    pub fn print_detailed(&self) {
        println!("=== {} ===", self.method);
        for (title, predictions) in [("Promoted", &self.positive), ("Suppressed", &self.negative)] {
            println!("\n{title}:");
            for (i, pred) in predictions.iter().enumerate() {
                println!(
                    "  {:2}. {:>15} ({:.2}%)",
                    i + 1,
                    format!("\"{}\"", format_token(&pred.token)),
                    pred.probability * 100.0
                );
            }
        }
    }
}

/// `(probs, inv_probs)`: softmax of the LM-head logits for `latent` and
/// `-latent`, full vocabulary, on CPU.
pub fn logit_lens(latent: &Tensor, model: &CausalLm) -> Result<(Tensor, Tensor)> {
    let latent = latent
        .to_device(model.device())?
        .to_dtype(model.dtype())?
        .flatten_all()?;
    let logits = model.logit_lens(&latent)?;
    let inv_logits = model.logit_lens(&latent.neg()?)?;

    let probs = softmax_f32(&logits)?.to_device(&Device::Cpu)?;
    let inv_probs = softmax_f32(&inv_logits)?.to_device(&Device::Cpu)?;
    Ok((probs, inv_probs))
}

/// Top `k` `(token_id, probability)` pairs of a probability vector
pub fn top_k(probs: &Tensor, k: usize) -> Result<Vec<(u32, f32)>> {
    let probs_vec: Vec<f32> = probs.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    let mut indexed: Vec<(usize, f32)> = probs_vec.into_iter().enumerate().collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    Ok(indexed
        .into_iter()
        .take(k)
        .map(|(idx, prob)| (idx as u32, prob))
        .collect())
}

/// Decode token IDs to strings using the tokenizer
pub fn decode_predictions(
    predictions: &[(u32, f32)],
    tokenizer: &HfChatTokenizer,
) -> Vec<TokenPrediction> {
    predictions
        .iter()
        .map(|&(token_id, probability)| TokenPrediction {
            token_id,
            token: tokenizer.decode_token(token_id),
            probability,
        })
        .collect()
}

/// Escape whitespace for display
pub fn format_token(token: &str) -> String {
    token
        .replace('\n', "\\n")
        .replace('\t', "\\t")
        .replace('\r', "\\r")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_k_sorted() {
        let probs = Tensor::new(&[0.1f32, 0.6, 0.05, 0.25], &Device::Cpu).unwrap();
        let top = top_k(&probs, 2).unwrap();
        assert_eq!(top, vec![(1, 0.6), (3, 0.25)]);
    }

    #[test]
    fn test_top_k_larger_than_vocab() {
        let probs = Tensor::new(&[0.5f32, 0.5], &Device::Cpu).unwrap();
        assert_eq!(top_k(&probs, 10).unwrap().len(), 2);
    }

    #[test]
    fn test_format_token() {
        assert_eq!(format_token("a\nb\tc"), "a\\nb\\tc");
    }

    #[test]
    fn test_logit_lens_distributions() {
        let varmap = candle_nn::VarMap::new();
        let vb = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = serde_json::from_str(
            r#"{"model_type": "llama", "hidden_size": 8, "intermediate_size": 16,
                "num_attention_heads": 2, "num_hidden_layers": 1, "vocab_size": 13}"#,
        )
        .unwrap();
        let model = CausalLm::load(config, vb).unwrap();
        let latent = Tensor::arange(0f32, 8f32, &Device::Cpu).unwrap();

        let (probs, inv_probs) = logit_lens(&latent, &model).unwrap();
        assert_eq!(probs.dims(), &[13]);
        let total: f32 = probs.sum_all().unwrap().to_scalar().unwrap();
        assert!((total - 1.0).abs() < 1e-4);
        let inv_total: f32 = inv_probs.sum_all().unwrap().to_scalar().unwrap();
        assert!((inv_total - 1.0).abs() < 1e-4);
    }
}
