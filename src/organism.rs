//! Base model and finetuned organism served side by side

use std::sync::Arc;

use anyhow::Result;
use candle_core::Device;
use tracing::{debug, info};

use crate::backend::{ChatMethod, GenerationParams};
use crate::config::{get_model_configurations, DiffingConfig};
use crate::conversation::Target;
use crate::model::{load_model_from_config, DiffModel, ModelCache};
use crate::tokenizer::{ChatTokenizer, HfChatTokenizer};

/// Candle-backed [`ChatMethod`] over a base/finetuned pair sharing one tokenizer
pub struct OrganismPair {
    base: Arc<DiffModel>,
    finetuned: Arc<DiffModel>,
    tokenizer: Arc<HfChatTokenizer>,
    has_thinking: bool,
    stop_tokens: Vec<u32>,
}

impl OrganismPair {
    /// Name the chat session namespace is derived from
    pub const METHOD_NAME: &'static str = "OrganismPair";

    pub fn new(
        base: Arc<DiffModel>,
        finetuned: Arc<DiffModel>,
        tokenizer: Arc<HfChatTokenizer>,
        has_thinking: bool,
    ) -> Self {
        let stop_tokens = tokenizer.stop_token_ids();
        Self {
            base,
            finetuned,
            tokenizer,
            has_thinking,
            stop_tokens,
        }
    }

    /// Load both models of `cfg`; the base model's tokenizer is shared
    pub fn from_config(cache: &mut ModelCache, cfg: &DiffingConfig, device: &Device) -> Result<Self> {
        let (base_cfg, ft_cfg) = get_model_configurations(cfg);
        info!(
            "Organism {}: base {}, finetuned {}",
            cfg.organism.name,
            base_cfg.model_id,
            ft_cfg.model_id
        );
        let (base, tokenizer) = load_model_from_config(cache, &base_cfg, device)?;
        let (finetuned, _) = load_model_from_config(cache, &ft_cfg, device)?;
        Ok(Self::new(
            base,
            finetuned,
            tokenizer,
            base_cfg.has_enable_thinking,
        ))
    }

    pub fn model(&self, target: Target) -> &DiffModel {
        match target {
            Target::Base => &self.base,
            Target::Finetuned => &self.finetuned,
        }
    }

    pub fn hf_tokenizer(&self) -> &HfChatTokenizer {
        &self.tokenizer
    }
}

impl ChatMethod for OrganismPair {
    /// Returns `prompt` followed by the decoded continuation (special
    /// tokens kept).
    fn generate_text(
        &self,
        prompt: &str,
        target: Target,
        params: &GenerationParams,
    ) -> Result<String> {
        let prompt_ids = self.tokenizer.encode(prompt, true)?;
        let tokens = self.model(target).lm().generate(
            &prompt_ids,
            params.max_length,
            params.temperature,
            params.do_sample,
            &self.stop_tokens,
        )?;
        let continuation = self
            .tokenizer
            .decode(&tokens[prompt_ids.len()..], false)?;
        debug!(
            "{}: {} prompt tokens, {} new tokens",
            target,
            prompt_ids.len(),
            tokens.len() - prompt_ids.len()
        );
        Ok(format!("{prompt}{continuation}"))
    }

    fn tokenizer(&self) -> &dyn ChatTokenizer {
        self.tokenizer.as_ref()
    }

    fn has_thinking(&self) -> bool {
        self.has_thinking
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelDType;
    use crate::extract::strip_prompt_from_output;
    use crate::forward::CausalLm;
    use crate::model::CacheKey;
    use crate::tokenizer::testing::word_level;
    use candle_core::DType;

    fn tiny_model(name: &str) -> Arc<DiffModel> {
        let varmap = candle_nn::VarMap::new();
        let vb = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = serde_json::from_str(
            r#"{"model_type": "qwen2", "hidden_size": 8, "intermediate_size": 16,
                "num_attention_heads": 2, "num_key_value_heads": 1, "num_hidden_layers": 1,
                "vocab_size": 6, "tie_word_embeddings": true}"#,
        )
        .unwrap();
        let lm = CausalLm::load(config, vb).unwrap();
        let key = CacheKey::new(name, ModelDType::F32, "eager", None, None);
        Arc::new(DiffModel::new(lm, name, None, key))
    }

    fn tiny_pair() -> OrganismPair {
        let tokenizer = word_level(&["hi", "there", "friend"], &["<think>", "<|im_end|>"]);
        OrganismPair::new(
            tiny_model("base"),
            tiny_model("ft"),
            Arc::new(tokenizer),
            false,
        )
    }

    #[test]
    fn test_stop_tokens_from_tokenizer() {
        let pair = tiny_pair();
        assert_eq!(pair.stop_tokens, vec![5]);
        assert_eq!(pair.model(Target::Finetuned).model_id(), "ft");
    }

    #[test]
    fn test_generate_text_echoes_prompt() {
        let pair = tiny_pair();
        let params = GenerationParams {
            max_length: 4,
            temperature: 1.0,
            do_sample: false,
        };
        let prompt = "hi there <think>";

        for target in Target::ALL {
            let generated = pair.generate_text(prompt, target, &params).unwrap();
            assert!(generated.starts_with(prompt));

            let prompt_len = pair.tokenizer().encode(prompt, false).unwrap().len();
            let output_len = pair.tokenizer().encode(&generated, false).unwrap().len();
            assert!(output_len >= prompt_len);
            assert!(strip_prompt_from_output(pair.tokenizer(), &generated, prompt).is_ok());
        }
    }
}
