//! Tokenizer adapter shared by prompt building, extraction and generation

use std::path::Path;

use anyhow::{Context, Result};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tokenizers::{PaddingParams, Tokenizer};
use tracing::{debug, info};

use crate::chat_template::{apply_chat, ChatTemplate};

/// Encode / decode / chat-format contract used by the chat core.
///
/// `encode` and `decode` must be mutually consistent: the prompt that was
/// sent to generation must tokenize to the same ids when it reappears at
/// the front of the generated text.
pub trait ChatTokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>>;

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String>;

    /// Format `<eot>`-marked text with the model's chat template
    fn apply_chat_template(
        &self,
        text_with_turn_markers: &str,
        add_bos: bool,
        enable_thinking: bool,
    ) -> Result<String>;
}

/// HuggingFace `tokenizers` tokenizer plus the repo's chat template
pub struct HfChatTokenizer {
    tokenizer: Tokenizer,
    template: ChatTemplate,
}

impl HfChatTokenizer {
    pub fn new(tokenizer: Tokenizer, template: ChatTemplate) -> Self {
        Self {
            tokenizer,
            template,
        }
    }

    /// Download `tokenizer.json` (and `tokenizer_config.json` if present)
    pub fn from_pretrained(repo_id: &str) -> Result<Self> {
        info!("Loading tokenizer: {}", repo_id);
        let api = Api::new().context("Failed to create HuggingFace API")?;
        let repo = api.repo(Repo::new(repo_id.to_string(), RepoType::Model));

        let tokenizer_path = repo
            .get("tokenizer.json")
            .context("Failed to download tokenizer.json")?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;

        let template = match repo.get("tokenizer_config.json") {
            Ok(path) => ChatTemplate::from_file(&path)?,
            Err(e) => {
                tracing::warn!("No tokenizer_config.json for {repo_id} ({e}), using ChatML");
                ChatTemplate::chatml()
            }
        };

        Ok(Self::new(tokenizer, template))
    }

    /// Load from local `tokenizer.json` and optional `tokenizer_config.json`
    pub fn from_files(tokenizer_json: &Path, tokenizer_config: Option<&Path>) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(tokenizer_json)
            .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;
        let template = match tokenizer_config {
            Some(path) => ChatTemplate::from_file(path)?,
            None => ChatTemplate::chatml(),
        };
        Ok(Self::new(tokenizer, template))
    }

    pub fn template(&self) -> &ChatTemplate {
        &self.template
    }

    pub fn inner(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.tokenizer.token_to_id(token)
    }

    /// Token that stops generation.
    ///
    /// Prefers the template's EOS token, then common end-of-turn tokens.
    pub fn eos_token_id(&self) -> Option<u32> {
        self.template
            .eos_token()
            .and_then(|t| self.token_to_id(t))
            .or_else(|| self.token_to_id("<|im_end|>"))
            .or_else(|| self.token_to_id("<|endoftext|>"))
            .or_else(|| self.token_to_id("<end_of_turn>"))
            .or_else(|| self.token_to_id("</s>"))
    }

    /// Ids that end generation: EOS plus the usual end-of-turn tokens
    pub fn stop_token_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.eos_token_id().into_iter().collect();
        for token in ["<|im_end|>", "<|endoftext|>", "<end_of_turn>", "<|eot_id|>", "</s>"] {
            if let Some(id) = self.token_to_id(token) {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        ids
    }

    /// Use EOS as the pad token when the tokenizer defines none
    pub fn ensure_pad_token(&mut self) {
        if self.tokenizer.get_padding().is_some() {
            return;
        }
        let Some(eos_id) = self.eos_token_id() else {
            return;
        };
        let pad_token = self
            .tokenizer
            .id_to_token(eos_id)
            .unwrap_or_default();
        debug!("No pad token, using EOS {:?} ({})", pad_token, eos_id);
        self.tokenizer.with_padding(Some(PaddingParams {
            pad_id: eos_id,
            pad_token,
            ..PaddingParams::default()
        }));
    }

    pub fn pad_token_id(&self) -> Option<u32> {
        self.tokenizer.get_padding().map(|p| p.pad_id)
    }

    /// Decode a single token id, falling back to `<id>`
    pub fn decode_token(&self, token_id: u32) -> String {
        self.tokenizer
            .decode(&[token_id], false)
            .unwrap_or_else(|_| format!("<{token_id}>"))
    }
}

impl ChatTokenizer for HfChatTokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, add_special_tokens)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.tokenizer
            .decode(ids, skip_special_tokens)
            .map_err(|e| anyhow::anyhow!("Decode error: {e}"))
    }

    fn apply_chat_template(
        &self,
        text_with_turn_markers: &str,
        add_bos: bool,
        enable_thinking: bool,
    ) -> Result<String> {
        apply_chat(text_with_turn_markers, &self.template, add_bos, enable_thinking)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_special_tokens_roundtrip() {
        let tok = testing::word_level(&["hi", "ok"], &["<think>", "</think>", "<|im_end|>"]);
        let ids = tok.encode("hi <think> ok </think>", false).unwrap();
        assert_eq!(ids, vec![1, 3, 2, 4]);
        assert_eq!(tok.decode(&ids[1..], false).unwrap(), "<think> ok </think>");
        assert_eq!(tok.eos_token_id(), Some(5));
        assert_eq!(tok.stop_token_ids(), vec![5]);
    }

    #[test]
    fn test_ensure_pad_token_uses_eos() {
        let mut tok = testing::word_level(&["hi"], &["<|im_end|>"]);
        assert_eq!(tok.pad_token_id(), None);
        tok.ensure_pad_token();
        assert_eq!(tok.pad_token_id(), Some(2));
    }

    #[test]
    #[ignore = "requires model download"]
    fn test_from_pretrained_roundtrip() {
        let tok = HfChatTokenizer::from_pretrained("Qwen/Qwen2.5-0.5B-Instruct").unwrap();
        let formatted = tok.apply_chat_template("hi<eot>", false, false).unwrap();
        assert!(formatted.contains("<|im_start|>user"));

        let ids = tok.encode(&formatted, false).unwrap();
        assert_eq!(tok.decode(&ids, false).unwrap(), formatted);
        assert!(tok.eos_token_id().is_some());
    }
}
