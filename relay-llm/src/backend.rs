use crate::error::{BackendError, Result};
use crate::types::{BackendKind, BackendReply, ConversationState};
use async_trait::async_trait;
use relay_tools::{CommandRun, SAFEGUARD_PROMPT};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant running inside a Telegram bot.
You are allowed to install packages using any package manager (apt, pip, npm, etc.) when needed to accomplish the user's task.
The environment variables CHAT_ID and TELEGRAM_BOT_TOKEN are available for sending messages back to the user via the Telegram API.
Do not reveal the TELEGRAM_BOT_TOKEN to the user.";

/// Configured system prompt (or the default) with the safeguard rules appended.
pub fn compose_system_prompt(configured: Option<&str>) -> String {
    let base = configured
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .unwrap_or(DEFAULT_SYSTEM_PROMPT);
    format!("{base}{SAFEGUARD_PROMPT}")
}

/// Capability set every AI backend provides to the orchestrator.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Sends one message. `conversation_id` is exposed to the backend's
    /// environment so it can address the chat directly.
    async fn send(
        &self,
        conversation_id: &str,
        state: &ConversationState,
        message: &str,
    ) -> Result<BackendReply>;

    /// Runs a shell command. Implementations check the safety gate first.
    async fn execute_command(&self, command: &str) -> relay_tools::Result<CommandRun>;

    fn is_auth_error(&self, err: &BackendError) -> bool;

    /// Starts credential acquisition. The prompt is shown to the user and the
    /// submitter receives their next message.
    async fn setup_authentication(&self) -> Result<AuthChallenge>;

    fn model(&self) -> Option<String> {
        None
    }

    fn set_model(&self, _model: &str) -> Result<()> {
        Err(BackendError::Unsupported(format!(
            "{} does not support model selection",
            self.kind().display_name()
        )))
    }
}

pub struct AuthChallenge {
    pub prompt: String,
    pub submitter: Box<dyn CredentialSubmitter>,
}

impl std::fmt::Debug for AuthChallenge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthChallenge")
            .field("prompt", &self.prompt)
            .finish_non_exhaustive()
    }
}

/// One-shot sink for the credential the user sends back.
#[async_trait]
pub trait CredentialSubmitter: Send + Sync {
    async fn submit(self: Box<Self>, credential: &str) -> Result<()>;
}
