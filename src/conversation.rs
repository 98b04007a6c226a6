//! Per-target conversation histories
//!
//! Two independent histories are kept per session, one for the base model
//! and one for the finetuned model. A turn stores the *formatted* user
//! segment (chat-template wrapper and assistant-start marker included) and
//! the raw assistant reply, so the prompt for the next turn can be rebuilt
//! by plain concatenation.

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ChatError;

/// Which model a message or history belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    Base,
    Finetuned,
}

impl Target {
    /// Fixed dispatch order used when sending to both models
    pub const ALL: [Target; 2] = [Target::Base, Target::Finetuned];

    pub fn as_str(&self) -> &'static str {
        match self {
            Target::Base => "base",
            Target::Finetuned => "finetuned",
        }
    }

    /// Column title used when rendering a transcript
    pub fn title(&self) -> &'static str {
        match self {
            Target::Base => "Base model",
            Target::Finetuned => "Finetuned model",
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Target {
    type Err = ChatError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "base" => Ok(Target::Base),
            "finetuned" => Ok(Target::Finetuned),
            other => Err(ChatError::InvalidTarget(other.to_string())),
        }
    }
}

/// One user message and the reply it produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    /// Formatted user segment, exactly as it was sent
    pub user: String,
    /// Assistant reply, special tokens preserved
    pub assistant: String,
}

impl Turn {
    pub fn new(user: impl Into<String>, assistant: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            assistant: assistant.into(),
        }
    }
}

/// Ordered turns for one target
pub type History = Vec<Turn>;

/// Turn of the old aggregated format `{user, base, finetuned}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyTurn {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finetuned: Option<String>,
}

/// Base and finetuned histories of one session
///
/// Only the dashboard controller mutates this. Turns are always appended
/// whole, and `clear` empties both histories in one step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationState {
    #[serde(default)]
    pub history_base: History,
    #[serde(default)]
    pub history_ft: History,
    /// Deprecated aggregated history, read once for migration and kept as-is
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<LegacyTurn>>,
    /// Set once the legacy history has been consulted
    #[serde(default)]
    pub legacy_migrated: bool,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a legacy aggregated history (not yet migrated)
    pub fn from_legacy(legacy: Vec<LegacyTurn>) -> Self {
        Self {
            history: Some(legacy),
            ..Self::default()
        }
    }

    pub fn history(&self, target: Target) -> &History {
        match target {
            Target::Base => &self.history_base,
            Target::Finetuned => &self.history_ft,
        }
    }

    fn history_mut(&mut self, target: Target) -> &mut History {
        match target {
            Target::Base => &mut self.history_base,
            Target::Finetuned => &mut self.history_ft,
        }
    }

    /// Both histories are empty
    pub fn is_empty(&self) -> bool {
        self.history_base.is_empty() && self.history_ft.is_empty()
    }

    /// One-time upgrade from the legacy aggregated history.
    ///
    /// Runs only when both per-target histories are empty and a legacy
    /// history exists. The whole legacy list is validated before anything
    /// is appended, so a malformed turn leaves the state untouched. After
    /// the first call the legacy store is never consulted again.
    ///
    /// Returns whether a migration happened.
    pub fn migrate_legacy(&mut self) -> Result<bool> {
        if self.legacy_migrated {
            return Ok(false);
        }
        let Some(legacy) = self.history.as_ref() else {
            self.legacy_migrated = true;
            return Ok(false);
        };
        if !self.is_empty() {
            self.legacy_migrated = true;
            return Ok(false);
        }

        let mut base = History::new();
        let mut finetuned = History::new();
        for (index, turn) in legacy.iter().enumerate() {
            let user = turn
                .user
                .as_ref()
                .filter(|u| !u.is_empty())
                .ok_or(ChatError::MalformedLegacyTurn { index })?;
            if let Some(reply) = &turn.base {
                base.push(Turn::new(user.clone(), reply.clone()));
            }
            if let Some(reply) = &turn.finetuned {
                finetuned.push(Turn::new(user.clone(), reply.clone()));
            }
        }

        info!(
            "Migrated legacy history: {} base turns, {} finetuned turns",
            base.len(),
            finetuned.len()
        );
        self.history_base = base;
        self.history_ft = finetuned;
        self.legacy_migrated = true;
        Ok(true)
    }

    /// Append a completed turn to one target's history
    pub fn append(&mut self, target: Target, turn: Turn) {
        self.history_mut(target).push(turn);
    }

    /// Append the turns produced by one send, all together
    pub fn append_all(&mut self, turns: Vec<(Target, Turn)>) {
        for (target, turn) in turns {
            self.append(target, turn);
        }
    }

    /// Replace both histories with empty ones
    pub fn clear(&mut self) {
        let (base, finetuned) = (History::new(), History::new());
        self.history_base = base;
        self.history_ft = finetuned;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_chat_error;

    fn legacy(user: Option<&str>, base: Option<&str>, ft: Option<&str>) -> LegacyTurn {
        LegacyTurn {
            user: user.map(String::from),
            base: base.map(String::from),
            finetuned: ft.map(String::from),
        }
    }

    #[test]
    fn test_target_parse() {
        assert_eq!("base".parse::<Target>().unwrap(), Target::Base);
        assert_eq!("finetuned".parse::<Target>().unwrap(), Target::Finetuned);
        assert_eq!(
            "both".parse::<Target>().unwrap_err(),
            ChatError::InvalidTarget("both".to_string())
        );
    }

    #[test]
    fn test_migrate_legacy_splits_targets() {
        let mut state = ConversationState::from_legacy(vec![
            legacy(Some("hi"), Some("hello!"), Some("hey!")),
            legacy(Some("only base"), Some("b"), None),
        ]);

        assert!(state.migrate_legacy().unwrap());
        assert_eq!(
            state.history_base,
            vec![Turn::new("hi", "hello!"), Turn::new("only base", "b")]
        );
        assert_eq!(state.history_ft, vec![Turn::new("hi", "hey!")]);
        // Legacy store is kept
        assert_eq!(state.history.as_ref().map(Vec::len), Some(2));
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let mut state =
            ConversationState::from_legacy(vec![legacy(Some("hi"), Some("a"), Some("b"))]);
        state.migrate_legacy().unwrap();
        let once = state.clone();

        assert!(!state.migrate_legacy().unwrap());
        assert_eq!(state, once);
    }

    #[test]
    fn test_migrate_not_rerun_after_clear() {
        let mut state =
            ConversationState::from_legacy(vec![legacy(Some("hi"), Some("a"), Some("b"))]);
        state.migrate_legacy().unwrap();
        state.clear();

        assert!(!state.migrate_legacy().unwrap());
        assert!(state.is_empty());
    }

    #[test]
    fn test_migrate_skipped_when_histories_exist() {
        let mut state =
            ConversationState::from_legacy(vec![legacy(Some("hi"), Some("a"), Some("b"))]);
        state.append(Target::Finetuned, Turn::new("x", "y"));

        assert!(!state.migrate_legacy().unwrap());
        assert!(state.history_base.is_empty());
        assert_eq!(state.history_ft.len(), 1);
    }

    #[test]
    fn test_migrate_rejects_missing_user() {
        let mut state = ConversationState::from_legacy(vec![
            legacy(Some("hi"), Some("a"), None),
            legacy(None, Some("orphan"), None),
        ]);

        let err = state.migrate_legacy().unwrap_err();
        assert!(is_chat_error(
            &err,
            &ChatError::MalformedLegacyTurn { index: 1 }
        ));
        assert!(state.is_empty());
        assert!(!state.legacy_migrated);
    }

    #[test]
    fn test_migrate_rejects_empty_user() {
        let mut state = ConversationState::from_legacy(vec![legacy(Some(""), Some("a"), Some("b"))]);

        let err = state.migrate_legacy().unwrap_err();
        assert!(is_chat_error(
            &err,
            &ChatError::MalformedLegacyTurn { index: 0 }
        ));
        assert!(state.is_empty());
    }

    #[test]
    fn test_clear_empties_both() {
        let mut state = ConversationState::new();
        state.append_all(vec![
            (Target::Base, Turn::new("u", "a")),
            (Target::Finetuned, Turn::new("u", "b")),
        ]);
        state.clear();

        assert!(state.history(Target::Base).is_empty());
        assert!(state.history(Target::Finetuned).is_empty());
    }

    #[test]
    fn test_serde_layout() {
        let json = r#"{"history":[{"user":"hi","base":"hello!","finetuned":"hey!"}]}"#;
        let mut state: ConversationState = serde_json::from_str(json).unwrap();
        state.migrate_legacy().unwrap();

        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["history_base"][0]["assistant"], "hello!");
        assert_eq!(value["history_ft"][0]["assistant"], "hey!");
        assert_eq!(value["legacy_migrated"], true);
    }
}
