//! In-flight credential flows, one per conversation.
//!
//! While a login is pending, the next text from the conversation is taken
//! as the credential. Unclaimed logins expire and drop their submitter,
//! which tears down any helper process it owns.

use dashmap::DashMap;
use relay_channels::ConversationId;
use relay_llm::{BackendKind, CredentialSubmitter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const LOGIN_TTL: Duration = Duration::from_secs(5 * 60);

pub struct PendingLogin {
    pub backend: BackendKind,
    pub submitter: Box<dyn CredentialSubmitter>,
    /// Input that hit the auth error; resubmitted once after a successful login.
    pub original_message: Option<String>,
    cancel: CancellationToken,
    generation: u64,
}

pub struct LoginStore {
    pending: Arc<DashMap<ConversationId, PendingLogin>>,
    generation: AtomicU64,
    ttl: Duration,
}

impl Default for LoginStore {
    fn default() -> Self {
        Self::with_ttl(LOGIN_TTL)
    }
}

impl LoginStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
            ttl,
        }
    }

    /// Registers a login, replacing (and cancelling) any earlier one.
    pub fn begin(
        &self,
        conversation_id: &ConversationId,
        backend: BackendKind,
        submitter: Box<dyn CredentialSubmitter>,
        original_message: Option<String>,
    ) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        let previous = self.pending.insert(
            conversation_id.clone(),
            PendingLogin {
                backend,
                submitter,
                original_message,
                cancel: cancel.clone(),
                generation,
            },
        );
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        let pending = self.pending.clone();
        let conversation_id = conversation_id.clone();
        let ttl = self.ttl;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(ttl) => {
                    let removed = pending
                        .remove_if(&conversation_id, |_, login| login.generation == generation);
                    if removed.is_some() {
                        tracing::info!(conversation_id = %conversation_id, "pending login expired");
                    }
                }
            }
        });
    }

    pub fn has(&self, conversation_id: &ConversationId) -> bool {
        self.pending.contains_key(conversation_id)
    }

    pub fn take(&self, conversation_id: &ConversationId) -> Option<PendingLogin> {
        let (_, login) = self.pending.remove(conversation_id)?;
        login.cancel.cancel();
        Some(login)
    }

    pub fn cancel(&self, conversation_id: &ConversationId) -> bool {
        self.take(conversation_id).is_some()
    }
}
