//! Dual-model chat controller
//!
//! Drives one session: migration on first access, send (build prompt,
//! generate, extract, append) for the selected targets, and clear.
//! Rendering is plain text; any front end (the CLI REPL, a web page) sits
//! on top of [`DualModelChat`] and a [`SessionState`].

use std::fmt::Write as _;

use anyhow::Result;
use tracing::{debug, info};

use crate::backend::ChatMethod;
use crate::conversation::{Target, Turn};
use crate::error::ChatError;
use crate::extract::strip_prompt_from_output;
use crate::prompt::build_prompt;
use crate::session::{session_namespace, SessionState, SessionStore};

/// Reply produced for one target by a send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub target: Target,
    pub text: String,
}

/// Controller for chatting with a base and a finetuned model side by side
pub struct DualModelChat<'m, M: ChatMethod + ?Sized> {
    method: &'m M,
    title: String,
    namespace: String,
}

impl<'m, M: ChatMethod + ?Sized> DualModelChat<'m, M> {
    /// `method_name` identifies the method; its session lives under
    /// `dual_chat_<method_name>`.
    pub fn new(method: &'m M, method_name: &str, title: impl Into<String>) -> Self {
        Self {
            method,
            title: title.into(),
            namespace: session_namespace(method_name),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// This controller's session in `store`, prepared for the next interaction
    pub fn session<'s>(&self, store: &'s mut SessionStore) -> Result<&'s mut SessionState> {
        let state = store.session_mut(&self.namespace);
        self.prepare(state)?;
        Ok(state)
    }

    /// Run before reading input: one-time legacy migration and pending
    /// input reset.
    pub fn prepare(&self, state: &mut SessionState) -> Result<()> {
        state.conversation.migrate_legacy()?;
        if state.reset_input {
            state.input.clear();
            state.reset_input = false;
        }
        Ok(())
    }

    /// Send `state.input` to the selected targets.
    ///
    /// Targets are processed in order (base, then finetuned). Turns are
    /// appended only after every selected target produced a reply, so a
    /// failing backend call leaves both histories unchanged.
    pub fn send(&self, state: &mut SessionState) -> Result<Vec<Reply>> {
        let message = state.input.trim().to_string();
        if message.is_empty() {
            return Err(ChatError::EmptyMessage.into());
        }

        let settings = state.settings.clone();
        settings.validate()?;
        let params = settings.generation_params();
        let enable_thinking = settings.enable_thinking && self.method.has_thinking();
        let tokenizer = self.method.tokenizer();

        let mut staged = Vec::new();
        for &target in settings.send_target.targets() {
            let built = build_prompt(
                tokenizer,
                state.conversation.history(target),
                &message,
                settings.use_chat_formatting,
                enable_thinking,
                target,
            )?;
            let generated = self
                .method
                .generate_text(&built.full_prompt, target, &params)?;
            let reply = strip_prompt_from_output(tokenizer, &generated, &built.full_prompt)?;
            debug!("{} replied with {} chars", target, reply.len());
            staged.push((target, Turn::new(built.user_segment, reply)));
        }

        let replies = staged
            .iter()
            .map(|(target, turn)| Reply {
                target: *target,
                text: turn.assistant.clone(),
            })
            .collect();
        state.conversation.append_all(staged);
        state.reset_input = true;
        info!(
            "Sent to {} (base: {} turns, finetuned: {} turns)",
            settings.send_target,
            state.conversation.history_base.len(),
            state.conversation.history_ft.len()
        );
        Ok(replies)
    }

    /// Empty both histories and schedule an input reset
    pub fn clear(&self, state: &mut SessionState) {
        state.conversation.clear();
        state.reset_input = true;
        info!("Cleared conversation in {}", self.namespace);
    }

    /// Plain-text transcript of both histories
    pub fn render(&self, state: &SessionState) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# {}", self.title);
        for target in Target::ALL {
            let history = state.conversation.history(target);
            let _ = writeln!(out, "\n## {} ({} turns)", target.title(), history.len());
            if history.is_empty() {
                let _ = writeln!(out, "(no messages)");
            }
            for turn in history {
                let _ = writeln!(out, "User: {}", turn.user);
                let _ = writeln!(out, "Assistant: {}", turn.assistant);
            }
        }
        out
    }
}
