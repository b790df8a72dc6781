//! AI backends for cmdrelay.
//!
//! A backend turns a user message into a reply that may propose shell
//! commands with `<command>` markup. Claude keeps a server-side session;
//! Gemini replays the full message log on every call.

mod backend;
mod claude;
mod error;
mod gemini;
mod markup;
mod types;

pub use backend::{
    AuthChallenge, Backend, CredentialSubmitter, DEFAULT_SYSTEM_PROMPT, compose_system_prompt,
};
pub use claude::{ClaudeBackend, ClaudeConfig};
pub use error::{BackendError, Result};
pub use gemini::{DEFAULT_GEMINI_MODEL, GeminiBackend, GeminiConfig};
pub use markup::{ParsedReply, parse_commands};
pub use types::{
    BackendKind, BackendReply, CallUsage, ConversationState, HistoryMessage, HistoryRole,
};
