//! Chat transports for cmdrelay.
//!
//! Adapters are pure I/O: they convert platform updates into
//! [`InboundEvent`]s and render outbound text and approval prompts.

mod telegram;
mod traits;
mod types;

pub use telegram::{TELEGRAM_MESSAGE_CHARS_MAX, TelegramAdapter, split_message};
pub use traits::ChannelAdapter;
pub use types::{
    APPROVE_ACTION, CallbackId, ConversationId, DENY_ACTION, InboundEvent, InboundEventKind,
    InteractionHandle, MessageId, SenderId,
};
