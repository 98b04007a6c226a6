//! Per-session chat state and its on-disk layout
//!
//! Each session lives under a namespace derived from the method name
//! (`dual_chat_<name>`). The serialized form uses the flat key layout
//!
//! ```text
//! history_base, history_ft, history (legacy), legacy_migrated,
//! input, reset_input,
//! send_target, use_chat_formatting, temperature, max_length, do_sample, enable_thinking
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::backend::GenerationParams;
use crate::conversation::{ConversationState, Target};
use crate::error::ChatError;

/// Allowed temperature range
pub const TEMPERATURE_RANGE: (f64, f64) = (0.1, 2.0);
/// Allowed max-length range (new tokens)
pub const MAX_LENGTH_RANGE: (usize, usize) = (10, 500);

/// Which histories a send goes to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendTarget {
    #[default]
    Both,
    Base,
    Finetuned,
}

impl SendTarget {
    /// Targets in dispatch order (base before finetuned)
    pub fn targets(&self) -> &'static [Target] {
        match self {
            SendTarget::Both => &Target::ALL,
            SendTarget::Base => &[Target::Base],
            SendTarget::Finetuned => &[Target::Finetuned],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SendTarget::Both => "both",
            SendTarget::Base => "base",
            SendTarget::Finetuned => "finetuned",
        }
    }
}

impl fmt::Display for SendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SendTarget {
    type Err = ChatError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "both" => Ok(SendTarget::Both),
            "base" => Ok(SendTarget::Base),
            "finetuned" => Ok(SendTarget::Finetuned),
            other => Err(ChatError::InvalidSendTarget(other.to_string())),
        }
    }
}

/// User-adjustable settings, persisted for the session's lifetime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub use_chat_formatting: bool,
    pub temperature: f64,
    pub max_length: usize,
    pub do_sample: bool,
    pub enable_thinking: bool,
    pub send_target: SendTarget,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            use_chat_formatting: true,
            temperature: 1.0,
            max_length: 200,
            do_sample: true,
            enable_thinking: false,
            send_target: SendTarget::Both,
        }
    }
}

impl SessionSettings {
    /// Check temperature and max-length against their allowed ranges
    pub fn validate(&self) -> Result<()> {
        let (t_min, t_max) = TEMPERATURE_RANGE;
        if !(t_min..=t_max).contains(&self.temperature) {
            return Err(ChatError::SettingOutOfRange {
                name: "temperature",
                value: self.temperature,
                min: t_min,
                max: t_max,
            }
            .into());
        }
        let (l_min, l_max) = MAX_LENGTH_RANGE;
        if !(l_min..=l_max).contains(&self.max_length) {
            return Err(ChatError::SettingOutOfRange {
                name: "max_length",
                value: self.max_length as f64,
                min: l_min as f64,
                max: l_max as f64,
            }
            .into());
        }
        Ok(())
    }

    pub fn generation_params(&self) -> GenerationParams {
        GenerationParams {
            max_length: self.max_length,
            temperature: self.temperature,
            do_sample: self.do_sample,
        }
    }
}

/// Everything one chat session owns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(flatten)]
    pub conversation: ConversationState,
    /// Pending message text
    #[serde(default)]
    pub input: String,
    /// Clear `input` before the next interaction reads it
    #[serde(default)]
    pub reset_input: bool,
    #[serde(flatten)]
    pub settings: SessionSettings,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Namespace under which a method's session is stored
pub fn session_namespace(method_name: &str) -> String {
    format!("dual_chat_{}", method_name.to_lowercase())
}

/// Sessions keyed by namespace; one JSON file on disk
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionStore {
    sessions: BTreeMap<String, SessionState>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a store; a missing file yields an empty store
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No session file at {}, starting fresh", path.display());
            return Ok(Self::new());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read session file {}", path.display()))?;
        let store: Self = serde_json::from_str(&content)
            .with_context(|| format!("Invalid session file {}", path.display()))?;
        info!(
            "Loaded {} session(s) from {}",
            store.sessions.len(),
            path.display()
        );
        Ok(store)
    }

    /// Write the store through a temp file renamed over `path`, so a crash
    /// mid-write leaves the previous file intact.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
        tmp.write_all(json.as_bytes())
            .and_then(|()| tmp.as_file().sync_all())
            .with_context(|| format!("Failed to write session file {}", path.display()))?;
        tmp.persist(path)
            .with_context(|| format!("Failed to replace session file {}", path.display()))?;
        Ok(())
    }

    /// Session for `namespace`, created with defaults on first access
    pub fn session_mut(&mut self, namespace: &str) -> &mut SessionState {
        self.sessions.entry(namespace.to_string()).or_default()
    }

    pub fn get(&self, namespace: &str) -> Option<&SessionState> {
        self.sessions.get(namespace)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Turn;
    use crate::error::is_chat_error;

    #[test]
    fn test_default_settings() {
        let s = SessionSettings::default();
        assert!(s.use_chat_formatting);
        assert_eq!(s.temperature, 1.0);
        assert_eq!(s.max_length, 200);
        assert!(s.do_sample);
        assert!(!s.enable_thinking);
        assert_eq!(s.send_target, SendTarget::Both);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_send_target_order() {
        assert_eq!(
            SendTarget::Both.targets(),
            &[Target::Base, Target::Finetuned]
        );
        assert_eq!(SendTarget::Finetuned.targets(), &[Target::Finetuned]);
        assert_eq!(
            "all".parse::<SendTarget>().unwrap_err(),
            ChatError::InvalidSendTarget("all".to_string())
        );
    }

    #[test]
    fn test_validate_ranges() {
        let mut s = SessionSettings {
            temperature: 2.5,
            ..Default::default()
        };
        let err = s.validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ChatError>(),
            Some(ChatError::SettingOutOfRange {
                name: "temperature",
                ..
            })
        ));

        s.temperature = 0.7;
        s.max_length = 5;
        assert!(s.validate().is_err());
        s.max_length = 500;
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_namespace() {
        assert_eq!(session_namespace("OrganismPair"), "dual_chat_organismpair");
    }

    #[test]
    fn test_flat_layout() {
        let mut state = SessionState::new();
        state.conversation.append(Target::Base, Turn::new("u", "a"));
        state.input = "draft".to_string();

        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["history_base"][0]["user"], "u");
        assert_eq!(value["input"], "draft");
        assert_eq!(value["send_target"], "both");
        assert_eq!(value["max_length"], 200);
        assert!(value.get("history").is_none());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let state: SessionState =
            serde_json::from_str(r#"{"temperature": 0.5, "send_target": "base"}"#).unwrap();
        assert_eq!(state.settings.temperature, 0.5);
        assert_eq!(state.settings.send_target, SendTarget::Base);
        assert_eq!(state.settings.max_length, 200);
        assert!(state.conversation.is_empty());
        assert!(!state.reset_input);
    }

    #[test]
    fn test_invalid_send_target_in_json_rejected() {
        let err = serde_json::from_str::<SessionState>(r#"{"send_target": "nobody"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");

        let mut store = SessionStore::load(&path).unwrap();
        assert!(store.is_empty());
        let state = store.session_mut("dual_chat_organismpair");
        state.settings.send_target = SendTarget::Finetuned;
        state
            .conversation
            .append(Target::Finetuned, Turn::new("q", "r"));
        store.save(&path).unwrap();

        let loaded = SessionStore::load(&path).unwrap();
        assert_eq!(loaded, store);
        let state = loaded.get("dual_chat_organismpair").unwrap();
        assert_eq!(state.conversation.history(Target::Finetuned).len(), 1);
    }

    #[test]
    fn test_save_replaces_file_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        std::fs::write(&path, "stale").unwrap();

        let mut store = SessionStore::new();
        store.session_mut("dual_chat_a").input = "draft".to_string();
        store.save(&path).unwrap();
        store.save(&path).unwrap();

        assert_eq!(SessionStore::load(&path).unwrap(), store);
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_corrupt_store_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        std::fs::write(&path, "not json").unwrap();
        let err = SessionStore::load(&path).unwrap_err();
        assert!(!is_chat_error(&err, &ChatError::EmptyMessage));
        assert!(err.to_string().contains("Invalid session file"));
    }
}
