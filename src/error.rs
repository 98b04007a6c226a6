//! Precondition violations raised by the chat core
//!
//! These indicate programmer or data errors, never transient failures.
//! They travel inside `anyhow::Error`; use `downcast_ref::<ChatError>()`
//! to inspect them.

use thiserror::Error;

/// Fail-fast errors of the dual-model chat core
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChatError {
    /// Message was empty after trimming
    #[error("Message cannot be empty")]
    EmptyMessage,

    /// Target string was not one of `base` / `finetuned`
    #[error("Unexpected target: {0:?} (expected \"base\" or \"finetuned\")")]
    InvalidTarget(String),

    /// Send target string was not one of `both` / `base` / `finetuned`
    #[error("Invalid send_target: {0:?}")]
    InvalidSendTarget(String),

    /// Legacy aggregated history contained a turn with a missing or empty `user`
    #[error("Legacy turn {index} missing 'user'")]
    MalformedLegacyTurn { index: usize },

    /// Generation output tokenized to fewer tokens than the prompt
    #[error("Output shorter than prompt: output={output} prompt={prompt}")]
    OutputShorterThanPrompt { output: usize, prompt: usize },

    /// A session setting was outside its allowed range
    #[error("Setting {name} = {value} out of range [{min}, {max}]")]
    SettingOutOfRange {
        name: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
}

/// Check whether an `anyhow` error carries a specific `ChatError`
pub fn is_chat_error(err: &anyhow::Error, expected: &ChatError) -> bool {
    err.downcast_ref::<ChatError>() == Some(expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(ChatError::EmptyMessage.to_string(), "Message cannot be empty");
        assert_eq!(
            ChatError::OutputShorterThanPrompt {
                output: 1,
                prompt: 2
            }
            .to_string(),
            "Output shorter than prompt: output=1 prompt=2"
        );
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = ChatError::MalformedLegacyTurn { index: 3 }.into();
        assert!(is_chat_error(
            &err,
            &ChatError::MalformedLegacyTurn { index: 3 }
        ));
        assert!(!is_chat_error(&err, &ChatError::EmptyMessage));
    }
}
