use crate::types::{CallbackId, ConversationId, InboundEvent, InteractionHandle};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Unique channel identifier, e.g. "telegram".
    fn channel_id(&self) -> &str;

    /// Start receiving events. Push to tx for each inbound event.
    async fn start(&self, tx: mpsc::Sender<InboundEvent>) -> Result<()>;

    /// Send plain text. Adapters split text that exceeds platform limits.
    async fn send_text(&self, recipient: &ConversationId, text: &str) -> Result<()>;

    /// Send a typing indicator where supported.
    async fn send_typing(&self, _recipient: &ConversationId) -> Result<()> {
        Err(anyhow::anyhow!(
            "send_typing is not supported by this channel"
        ))
    }

    /// Show a prompt with approve/deny controls.
    async fn present_approval(
        &self,
        recipient: &ConversationId,
        prompt: &str,
    ) -> Result<InteractionHandle>;

    /// Replace the prompt text and drop its controls.
    async fn edit_to_remove_interaction(
        &self,
        handle: &InteractionHandle,
        final_text: &str,
    ) -> Result<()>;

    /// Acknowledge a button press. Channels without acknowledgements keep the default.
    async fn answer_interaction(&self, _callback_id: &CallbackId, _text: &str) -> Result<()> {
        Ok(())
    }

    /// Adds a value to scrub from outbound text, such as a credential
    /// accepted at runtime.
    fn register_secret(&self, _secret: &str) {}

    fn supports_typing_events(&self) -> bool {
        false
    }
}
