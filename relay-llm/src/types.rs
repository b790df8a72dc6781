use crate::error::BackendError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// The closed set of backends a conversation can be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Claude,
    Gemini,
}

impl BackendKind {
    pub const ALL: [BackendKind; 2] = [BackendKind::Claude, BackendKind::Gemini];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Gemini => "gemini",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Claude => "Claude",
            Self::Gemini => "Gemini",
        }
    }

    /// Whether the client must replay the whole message log on every call.
    pub fn replays_history(self) -> bool {
        matches!(self, Self::Gemini)
    }

    /// The history-replay protocol expects command output before the next
    /// proposal, so only the first command of a reply is kept.
    pub fn single_command_per_reply(self) -> bool {
        self.replays_history()
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "claude" => Ok(Self::Claude),
            "gemini" => Ok(Self::Gemini),
            other => Err(BackendError::UnknownBackend(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryRole {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: HistoryRole,
    pub content: String,
}

impl HistoryMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: HistoryRole::User,
            content: content.into(),
        }
    }

    pub fn model(content: impl Into<String>) -> Self {
        Self {
            role: HistoryRole::Model,
            content: content.into(),
        }
    }
}

/// Backend-specific continuation state for one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationState {
    /// Opaque server-assigned continuation token. `None` starts a new session.
    Token(Option<String>),
    /// Ordered message log replayed on every call.
    History(Vec<HistoryMessage>),
}

impl ConversationState {
    pub fn is_new(&self) -> bool {
        match self {
            Self::Token(token) => token.is_none(),
            Self::History(history) => history.is_empty(),
        }
    }

    pub fn token(&self) -> Option<&str> {
        match self {
            Self::Token(token) => token.as_deref(),
            Self::History(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cost_usd: f64,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct BackendReply {
    pub text: String,
    pub state: ConversationState,
    pub usage: CallUsage,
}
