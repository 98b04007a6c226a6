//! Prompt reconstruction for one target history
//!
//! Stored turns already hold the exact text that was sent (formatted user
//! segment) and received (assistant reply). The prefix for a new message is
//! their plain concatenation; only the new message is formatted, and it is
//! formatted exactly once. Re-templating old turns would drift from what the
//! model actually saw.

use anyhow::Result;
use tracing::debug;

use crate::chat_template::EOT_MARKER;
use crate::conversation::{History, Target};
use crate::error::ChatError;
use crate::tokenizer::ChatTokenizer;

/// Prompt for one generation call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltPrompt {
    /// Stored history prefix followed by `user_segment`
    pub full_prompt: String,
    /// Formatted new user turn, stored as the next `Turn::user`
    pub user_segment: String,
}

/// Concatenate stored segments in order (`user`, then `assistant`, per turn)
pub fn history_prefix(history: &History) -> String {
    let mut prefix = String::new();
    for turn in history {
        prefix.push_str(&turn.user);
        prefix.push_str(&turn.assistant);
    }
    prefix
}

/// Format a single new user message.
///
/// With chat formatting the message is closed with `<eot>` and passed
/// through the chat template without BOS, yielding the user block plus the
/// assistant-start marker (and thinking tokens, if the template emits them).
/// Without it the raw message is used unchanged.
pub fn format_user_segment<T: ChatTokenizer + ?Sized>(
    tokenizer: &T,
    next_user_message: &str,
    use_chat_formatting: bool,
    enable_thinking: bool,
) -> Result<String> {
    if !use_chat_formatting {
        return Ok(next_user_message.to_string());
    }
    let single_turn = format!("{next_user_message}{EOT_MARKER}");
    tokenizer.apply_chat_template(&single_turn, false, enable_thinking)
}

/// Build the full prompt and the new user segment for `target`'s history
pub fn build_prompt<T: ChatTokenizer + ?Sized>(
    tokenizer: &T,
    history: &History,
    next_user_message: &str,
    use_chat_formatting: bool,
    enable_thinking: bool,
    target: Target,
) -> Result<BuiltPrompt> {
    if next_user_message.trim().is_empty() {
        return Err(ChatError::EmptyMessage.into());
    }

    let user_segment = format_user_segment(
        tokenizer,
        next_user_message,
        use_chat_formatting,
        enable_thinking,
    )?;
    let mut full_prompt = history_prefix(history);
    full_prompt.push_str(&user_segment);

    debug!(
        "Built {} prompt: {} prior turns, {} chars",
        target,
        history.len(),
        full_prompt.len()
    );

    Ok(BuiltPrompt {
        full_prompt,
        user_segment,
    })
}

/// Same as [`build_prompt`] with the target given as a string
/// (`"base"` or `"finetuned"`); anything else is rejected.
pub fn build_prompt_for(
    tokenizer: &dyn ChatTokenizer,
    history: &History,
    next_user_message: &str,
    use_chat_formatting: bool,
    enable_thinking: bool,
    target: &str,
) -> Result<BuiltPrompt> {
    let target: Target = target.parse()?;
    build_prompt(
        tokenizer,
        history,
        next_user_message,
        use_chat_formatting,
        enable_thinking,
        target,
    )
}
