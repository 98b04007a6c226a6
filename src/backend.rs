//! Contract between the chat controller and whatever serves the two models

use anyhow::Result;

use crate::conversation::Target;
use crate::tokenizer::ChatTokenizer;

/// Sampling parameters for one generation call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    /// Maximum number of new tokens
    pub max_length: usize,
    pub temperature: f64,
    /// `false` = greedy decoding
    pub do_sample: bool,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_length: 200,
            temperature: 1.0,
            do_sample: true,
        }
    }
}

/// What the dual-model chat needs from a method: generation, the shared
/// tokenizer, and whether the model's template supports thinking mode.
pub trait ChatMethod {
    /// Generate from `prompt` with the selected model.
    ///
    /// Returns the full text (prompt echo followed by the continuation).
    /// The result must tokenize to at least as many tokens as `prompt`.
    fn generate_text(&self, prompt: &str, target: Target, params: &GenerationParams)
        -> Result<String>;

    /// Tokenizer shared by both models
    fn tokenizer(&self) -> &dyn ChatTokenizer;

    /// Whether the chat template understands `enable_thinking`
    fn has_thinking(&self) -> bool;
}
