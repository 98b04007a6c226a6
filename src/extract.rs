//! Assistant-reply extraction by token-count alignment
//!
//! Generation returns the echoed prompt followed by the continuation. The
//! prompt is cut in token space, not by string prefix: decoding is not
//! guaranteed to reproduce the prompt character for character around
//! special tokens such as `<think>`, but the prompt's token count is
//! reproducible with the same tokenizer.

use anyhow::Result;
use tracing::debug;

use crate::error::ChatError;
use crate::tokenizer::ChatTokenizer;

/// Return only the newly generated text of `generated_text`.
///
/// Both strings are tokenized without special-token injection; the first
/// `len(prompt_tokens)` output tokens are dropped and the rest is decoded
/// with special tokens kept. An output that is exactly the prompt yields an
/// empty string. An output shorter than the prompt is a
/// [`ChatError::OutputShorterThanPrompt`].
pub fn strip_prompt_from_output<T: ChatTokenizer + ?Sized>(
    tokenizer: &T,
    generated_text: &str,
    prompt_formatted: &str,
) -> Result<String> {
    let prompt_ids = tokenizer.encode(prompt_formatted, false)?;
    let output_ids = tokenizer.encode(generated_text, false)?;

    if output_ids.len() < prompt_ids.len() {
        return Err(ChatError::OutputShorterThanPrompt {
            output: output_ids.len(),
            prompt: prompt_ids.len(),
        }
        .into());
    }

    let assistant_ids = &output_ids[prompt_ids.len()..];
    debug!(
        "Extracted {} new tokens after {} prompt tokens",
        assistant_ids.len(),
        prompt_ids.len()
    );
    tokenizer.decode(assistant_ids, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_chat_error;
    use std::collections::HashMap;

    /// Fixed string -> ids table; decodes ids as `t<id>` joined by spaces
    struct TableTokenizer {
        table: HashMap<&'static str, Vec<u32>>,
    }

    impl TableTokenizer {
        fn new(entries: &[(&'static str, Vec<u32>)]) -> Self {
            Self {
                table: entries.iter().map(|(k, v)| (*k, v.clone())).collect(),
            }
        }
    }

    impl ChatTokenizer for TableTokenizer {
        fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
            assert!(!add_special_tokens);
            self.table
                .get(text)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("unknown text {text:?}"))
        }

        fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
            assert!(!skip_special_tokens);
            Ok(ids
                .iter()
                .map(|id| format!("t{id}"))
                .collect::<Vec<_>>()
                .join(" "))
        }

        fn apply_chat_template(&self, text: &str, _: bool, _: bool) -> Result<String> {
            Ok(text.to_string())
        }
    }

    #[test]
    fn test_extracts_tokens_after_prompt() {
        let tok = TableTokenizer::new(&[("A", vec![1, 2]), ("AB", vec![1, 2, 3, 4])]);
        assert_eq!(strip_prompt_from_output(&tok, "AB", "A").unwrap(), "t3 t4");
    }

    #[test]
    fn test_prompt_only_output_is_empty() {
        let tok = TableTokenizer::new(&[("A", vec![1, 2])]);
        assert_eq!(strip_prompt_from_output(&tok, "A", "A").unwrap(), "");
    }

    #[test]
    fn test_shorter_output_fails() {
        let tok = TableTokenizer::new(&[("A", vec![1, 2, 3]), ("x", vec![9])]);
        let err = strip_prompt_from_output(&tok, "x", "A").unwrap_err();
        assert!(is_chat_error(
            &err,
            &ChatError::OutputShorterThanPrompt {
                output: 1,
                prompt: 3
            }
        ));
    }

    #[test]
    fn test_alignment_ignores_string_prefix() {
        // The echoed prompt tokenizes differently from the prompt text, but
        // only the count matters
        let tok = TableTokenizer::new(&[("<p>", vec![7, 8]), ("<p><think>", vec![5, 6, 42])]);
        assert_eq!(
            strip_prompt_from_output(&tok, "<p><think>", "<p>").unwrap(),
            "t42"
        );
    }

    #[test]
    fn test_special_tokens_survive_with_hf_tokenizer() {
        let tok = crate::tokenizer::testing::word_level(
            &["question", "answer"],
            &["<think>", "</think>"],
        );
        let prompt = "question";
        let generated = "question <think> answer </think> answer";

        let reply = strip_prompt_from_output(&tok, generated, prompt).unwrap();
        assert_eq!(reply, "<think> answer </think> answer");
    }
}
