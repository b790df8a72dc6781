//! One async mutex per conversation. Work for the same conversation is
//! serialized; different conversations never wait on each other.

use dashmap::DashMap;
use relay_channels::ConversationId;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct ConversationLocks {
    locks: DashMap<ConversationId, Arc<Mutex<()>>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `conversation_id`. Access is released
    /// when the guard drops, on every exit path.
    pub async fn acquire(&self, conversation_id: &ConversationId) -> OwnedMutexGuard<()> {
        // The map shard must not stay borrowed across the await.
        let lock = self
            .locks
            .entry(conversation_id.clone())
            .or_default()
            .value()
            .clone();
        lock.lock_owned().await
    }
}
