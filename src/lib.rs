// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_possible_wrap)] // usize→i64 in tensor ops
#![allow(clippy::many_single_char_names)] // x, y, i, j standard in math
#![allow(clippy::similar_names)] // related variables like `head`/`heads`
#![allow(clippy::module_name_repetitions)] // DiffModel in model.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::unused_self)] // &self for API consistency
#![allow(clippy::trivially_copy_pass_by_ref)] // &usize for API consistency
#![allow(clippy::struct_field_names)] // field postfix patterns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility
#![allow(clippy::unnecessary_wraps)] // Result for future error handling
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive

//! ftdiff-rs: base vs. finetuned model diffing
//!
//! Chat with a base model and its finetuned "organism" side by side, and
//! read latent directions through either model.
//!
//! ## Architecture
//!
//! - `conversation`: Per-model chat histories and legacy migration
//! - `prompt`: Prompt construction from history (raw or chat-templated)
//! - `extract`: Strip the echoed prompt from generated text by token count
//! - `session`: Persisted per-session state and generation settings
//! - `dashboard`: Dual-model chat controller (send, clear, render)
//! - `backend`: `ChatMethod` trait that generates text for a target model
//! - `organism`: Candle-backed `ChatMethod` over a base/finetuned pair
//! - `tokenizer` / `chat_template`: HuggingFace tokenizer plus Jinja chat templates
//! - `config`: Model and organism configuration
//! - `model`: Model loading and the shared model cache
//! - `forward`: Decoder-only transformer forward pass and generation
//! - `kv_cache` / `masks`: Generation helpers
//! - `adapter`: LoRA adapters merged at load time
//! - `steering`: Steering vectors applied as MLP bias
//! - `logit_lens` / `patch_scope`: Latent inspection

pub mod adapter;
pub mod backend;
pub mod chat_template;
pub mod config;
pub mod conversation;
pub mod dashboard;
pub mod error;
pub mod extract;
pub mod forward;
pub mod kv_cache;
pub mod logit_lens;
pub mod masks;
pub mod model;
pub mod organism;
pub mod patch_scope;
pub mod prompt;
pub mod session;
pub mod steering;
pub mod tokenizer;

pub use adapter::{LoraAdapter, LoraConfig};
pub use backend::{ChatMethod, GenerationParams};
pub use chat_template::ChatTemplate;
pub use config::{get_model_configurations, DiffingConfig, ModelConfig, ModelDType};
pub use conversation::{ConversationState, History, LegacyTurn, Target, Turn};
pub use dashboard::{DualModelChat, Reply};
pub use error::{is_chat_error, ChatError};
pub use extract::strip_prompt_from_output;
pub use forward::{CausalLm, DecoderConfig, ResidualPatch};
pub use kv_cache::KVCache;
pub use logit_lens::{LatentReadout, TokenPrediction};
pub use masks::{create_causal_mask, create_generation_mask};
pub use model::{load_model, select_device, CacheKey, DiffModel, ModelCache, ModelSpec};
pub use organism::OrganismPair;
pub use patch_scope::{patch_scope, DEFAULT_ID_PROMPT};
pub use prompt::{build_prompt, BuiltPrompt};
pub use session::{SendTarget, SessionSettings, SessionState, SessionStore};
pub use steering::{add_steering_vector, load_steering_vector};
pub use tokenizer::{ChatTokenizer, HfChatTokenizer};
