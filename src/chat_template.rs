//! Chat template formatting with `<eot>` turn markers
//!
//! Raw conversation text marks the end of every user or assistant block with
//! the literal [`EOT_MARKER`]. [`apply_chat`] splits on that marker, assigns
//! alternating roles (user first) and renders the result through the model's
//! Jinja chat template from `tokenizer_config.json`.
//!
//! ```text
//! "hi<eot>"  ->  "<|im_start|>user\nhi<|im_end|>\n<|im_start|>assistant\n"
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use minijinja::value::{from_args, Value};
use minijinja::{context, Environment, Error, ErrorKind, State};
use serde::Serialize;

/// End-of-turn placeholder consumed by [`apply_chat`]
pub const EOT_MARKER: &str = "<eot>";

const TEMPLATE_NAME: &str = "chat";

/// A role/content pair handed to the template
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Split `<eot>`-marked text into alternating user/assistant messages.
///
/// A trailing empty piece (text ending with the marker) is dropped.
pub fn split_turns(text: &str) -> Vec<ChatMessage> {
    let mut pieces: Vec<&str> = text.split(EOT_MARKER).collect();
    if pieces.len() > 1 && pieces.last().is_some_and(|p| p.is_empty()) {
        pieces.pop();
    }
    pieces
        .into_iter()
        .enumerate()
        .map(|(i, content)| {
            let role = if i % 2 == 0 { "user" } else { "assistant" };
            ChatMessage::new(role, content)
        })
        .collect()
}

/// A model's chat template plus the special tokens it refers to
pub struct ChatTemplate {
    env: Environment<'static>,
    /// Jinja source; `None` means built-in ChatML
    source: Option<String>,
    bos_token: Option<String>,
    eos_token: Option<String>,
}

impl std::fmt::Debug for ChatTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatTemplate")
            .field("source", &self.source.as_ref().map(String::len))
            .field("bos_token", &self.bos_token)
            .field("eos_token", &self.eos_token)
            .finish_non_exhaustive()
    }
}

impl ChatTemplate {
    /// Compile a Jinja chat template
    pub fn new(
        source: impl Into<String>,
        bos_token: Option<String>,
        eos_token: Option<String>,
    ) -> Result<Self> {
        let source = source.into();
        let mut env = build_environment();
        env.add_template_owned(TEMPLATE_NAME, source.clone())
            .map_err(|e| anyhow::anyhow!("Invalid chat template: {e}"))?;

        Ok(Self {
            env,
            source: Some(source),
            bos_token,
            eos_token,
        })
    }

    /// Built-in ChatML (`<|im_start|>role\ncontent<|im_end|>\n`)
    pub fn chatml() -> Self {
        Self {
            env: build_environment(),
            source: None,
            bos_token: None,
            eos_token: Some("<|im_end|>".to_string()),
        }
    }

    /// Parse the contents of a `tokenizer_config.json`.
    ///
    /// Falls back to ChatML when the config carries no template.
    pub fn from_tokenizer_config_json(json: &str) -> Result<Self> {
        let config: serde_json::Value =
            serde_json::from_str(json).context("Invalid tokenizer config")?;

        let bos_token = config.get("bos_token").and_then(token_value);
        let eos_token = config.get("eos_token").and_then(token_value);

        match config.get("chat_template").and_then(template_source) {
            Some(source) => Self::new(source, bos_token, eos_token),
            None => {
                tracing::warn!("No chat_template in tokenizer config, using ChatML");
                let mut template = Self::chatml();
                template.bos_token = bos_token;
                if eos_token.is_some() {
                    template.eos_token = eos_token;
                }
                Ok(template)
            }
        }
    }

    /// Load from a `tokenizer_config.json` path
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_tokenizer_config_json(&json)
    }

    pub fn bos_token(&self) -> Option<&str> {
        self.bos_token.as_deref()
    }

    pub fn eos_token(&self) -> Option<&str> {
        self.eos_token.as_deref()
    }

    /// Render messages through the template
    pub fn render(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
        enable_thinking: bool,
    ) -> Result<String> {
        if self.source.is_none() {
            return Ok(render_chatml(messages, add_generation_prompt));
        }

        let tmpl = self
            .env
            .get_template(TEMPLATE_NAME)
            .map_err(|e| anyhow::anyhow!("Template error: {e}"))?;
        tmpl.render(context! {
            messages => messages,
            add_generation_prompt => add_generation_prompt,
            enable_thinking => enable_thinking,
            bos_token => self.bos_token.as_deref().unwrap_or(""),
            eos_token => self.eos_token.as_deref().unwrap_or(""),
        })
        .map_err(|e| anyhow::anyhow!("Render error: {e}"))
    }
}

/// Format `<eot>`-marked text with the chat template.
///
/// A generation prompt is added when the last message is a user turn.
/// With `add_bos == false` a leading BOS token is removed from the output.
pub fn apply_chat(
    text: &str,
    template: &ChatTemplate,
    add_bos: bool,
    enable_thinking: bool,
) -> Result<String> {
    let messages = split_turns(text);
    let add_generation_prompt = messages.last().is_none_or(|m| m.role == "user");
    let rendered = template.render(&messages, add_generation_prompt, enable_thinking)?;

    if !add_bos {
        if let Some(bos) = template.bos_token().filter(|b| !b.is_empty()) {
            if let Some(stripped) = rendered.strip_prefix(bos) {
                return Ok(stripped.to_string());
            }
        }
    }
    Ok(rendered)
}

fn render_chatml(messages: &[ChatMessage], add_generation_prompt: bool) -> String {
    let mut out = String::new();
    for msg in messages {
        out.push_str("<|im_start|>");
        out.push_str(&msg.role);
        out.push('\n');
        out.push_str(&msg.content);
        out.push_str("<|im_end|>\n");
    }
    if add_generation_prompt {
        out.push_str("<|im_start|>assistant\n");
    }
    out
}

/// Jinja environment configured the way HuggingFace renders chat templates
fn build_environment() -> Environment<'static> {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    env.set_unknown_method_callback(python_methods);
    env.add_function("raise_exception", |msg: String| -> Result<Value, Error> {
        Err(Error::new(ErrorKind::InvalidOperation, msg))
    });
    env.add_filter("tojson", |value: Value| -> Result<Value, Error> {
        serde_json::to_string(&value)
            .map(Value::from)
            .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))
    });
    env
}

/// The handful of Python `str`/`dict` methods chat templates call
fn python_methods(
    _state: &State<'_, '_>,
    value: &Value,
    method: &str,
    args: &[Value],
) -> Result<Value, Error> {
    if let Some(s) = value.as_str() {
        return match method {
            "strip" | "lstrip" | "rstrip" => {
                let (chars,): (Option<&str>,) = from_args(args)?;
                let is_trimmed = |c: char| match chars {
                    Some(set) => set.contains(c),
                    None => c.is_whitespace(),
                };
                let out = match method {
                    "strip" => s.trim_matches(is_trimmed),
                    "lstrip" => s.trim_start_matches(is_trimmed),
                    _ => s.trim_end_matches(is_trimmed),
                };
                Ok(Value::from(out))
            }
            "startswith" => {
                let (prefix,): (&str,) = from_args(args)?;
                Ok(Value::from(s.starts_with(prefix)))
            }
            "endswith" => {
                let (suffix,): (&str,) = from_args(args)?;
                Ok(Value::from(s.ends_with(suffix)))
            }
            "split" => {
                let (sep,): (Option<&str>,) = from_args(args)?;
                let parts: Vec<Value> = match sep {
                    Some(sep) => s.split(sep).map(Value::from).collect(),
                    None => s.split_whitespace().map(Value::from).collect(),
                };
                Ok(Value::from(parts))
            }
            "replace" => {
                let (from, to): (&str, &str) = from_args(args)?;
                Ok(Value::from(s.replace(from, to)))
            }
            "lower" => Ok(Value::from(s.to_lowercase())),
            "upper" => Ok(Value::from(s.to_uppercase())),
            _ => Err(Error::from(ErrorKind::UnknownMethod)),
        };
    }

    match method {
        "items" => {
            let mut items = Vec::new();
            for key in value.try_iter()? {
                let item = value.get_item(&key)?;
                items.push(Value::from(vec![key, item]));
            }
            Ok(Value::from(items))
        }
        "get" => {
            let (key, default): (Value, Option<Value>) = from_args(args)?;
            let item = value.get_item(&key)?;
            if item.is_undefined() {
                Ok(default.unwrap_or(Value::from(())))
            } else {
                Ok(item)
            }
        }
        _ => Err(Error::from(ErrorKind::UnknownMethod)),
    }
}

/// Special token from config: either a plain string or `{"content": ...}`
fn token_value(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Object(obj) => obj
            .get("content")
            .and_then(|v| v.as_str())
            .map(ToString::to_string),
        _ => None,
    }
}

/// Template from config: a string, or a list of named templates (`default` wins)
fn template_source(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Array(entries) => {
            let template_of =
                |e: &serde_json::Value| e.get("template")?.as_str().map(ToString::to_string);
            entries
                .iter()
                .find(|e| e.get("name").and_then(|n| n.as_str()) == Some("default"))
                .or_else(|| entries.first())
                .and_then(template_of)
        }
        _ => None,
    }
}
