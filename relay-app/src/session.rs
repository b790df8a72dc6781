//! Per-conversation backend selection and conversation state.
//!
//! Stateful backends keep a continuation token, stateless ones a replayed
//! message log. Both are keyed by (conversation, backend) so switching the
//! active backend never leaks state from one into the other.

use dashmap::DashMap;
use relay_channels::ConversationId;
use relay_llm::{Backend, BackendKind, ConversationState, HistoryMessage};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionScope {
    conversation_id: ConversationId,
    backend: BackendKind,
}

impl SessionScope {
    fn new(conversation_id: &ConversationId, backend: BackendKind) -> Self {
        Self {
            conversation_id: conversation_id.clone(),
            backend,
        }
    }
}

pub struct SessionRegistry {
    default_backend: BackendKind,
    backends: HashMap<BackendKind, Arc<dyn Backend>>,
    active: DashMap<ConversationId, BackendKind>,
    tokens: DashMap<SessionScope, String>,
    histories: DashMap<SessionScope, Vec<HistoryMessage>>,
}

impl SessionRegistry {
    pub fn new(
        default_backend: BackendKind,
        backends: impl IntoIterator<Item = Arc<dyn Backend>>,
    ) -> Self {
        let backends = backends
            .into_iter()
            .map(|backend| (backend.kind(), backend))
            .collect();
        Self {
            default_backend,
            backends,
            active: DashMap::new(),
            tokens: DashMap::new(),
            histories: DashMap::new(),
        }
    }

    pub fn active_backend(&self, conversation_id: &ConversationId) -> BackendKind {
        self.active
            .get(conversation_id)
            .map(|kind| *kind)
            .unwrap_or(self.default_backend)
    }

    pub fn set_active_backend(&self, conversation_id: &ConversationId, backend: BackendKind) {
        self.active.insert(conversation_id.clone(), backend);
    }

    pub fn backend(&self, kind: BackendKind) -> Option<Arc<dyn Backend>> {
        self.backends.get(&kind).cloned()
    }

    /// The state to hand the backend on the next call.
    pub fn load_state(&self, conversation_id: &ConversationId, backend: BackendKind) -> ConversationState {
        let scope = SessionScope::new(conversation_id, backend);
        if backend.replays_history() {
            ConversationState::History(
                self.histories
                    .get(&scope)
                    .map(|h| h.clone())
                    .unwrap_or_default(),
            )
        } else {
            ConversationState::Token(self.tokens.get(&scope).map(|t| t.clone()))
        }
    }

    pub fn store_state(
        &self,
        conversation_id: &ConversationId,
        backend: BackendKind,
        state: ConversationState,
    ) {
        let scope = SessionScope::new(conversation_id, backend);
        match state {
            ConversationState::Token(Some(token)) => {
                self.tokens.insert(scope, token);
            }
            ConversationState::Token(None) => {
                self.tokens.remove(&scope);
            }
            ConversationState::History(history) => {
                self.histories.insert(scope, history);
            }
        }
    }

    pub fn set_token(
        &self,
        conversation_id: &ConversationId,
        backend: BackendKind,
        token: Option<String>,
    ) {
        if backend.replays_history() {
            return;
        }
        self.store_state(conversation_id, backend, ConversationState::Token(token));
    }

    /// Forgets every backend's state for the conversation. The active backend
    /// choice survives.
    pub fn clear_state(&self, conversation_id: &ConversationId) {
        for kind in BackendKind::ALL {
            let scope = SessionScope::new(conversation_id, kind);
            self.tokens.remove(&scope);
            self.histories.remove(&scope);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(BackendKind::Claude, Vec::new())
    }

    #[test]
    fn active_backend_defaults_until_switched() {
        let reg = registry();
        let id = ConversationId::new("1");
        assert_eq!(reg.active_backend(&id), BackendKind::Claude);
        reg.set_active_backend(&id, BackendKind::Gemini);
        assert_eq!(reg.active_backend(&id), BackendKind::Gemini);
        assert_eq!(reg.active_backend(&ConversationId::new("2")), BackendKind::Claude);
    }

    #[test]
    fn token_and_history_are_scoped_per_backend() {
        let reg = registry();
        let id = ConversationId::new("1");
        reg.store_state(&id, BackendKind::Claude, ConversationState::Token(Some("s-1".into())));
        reg.store_state(
            &id,
            BackendKind::Gemini,
            ConversationState::History(vec![HistoryMessage::user("hi")]),
        );

        assert_eq!(
            reg.load_state(&id, BackendKind::Claude),
            ConversationState::Token(Some("s-1".into()))
        );
        assert_eq!(
            reg.load_state(&id, BackendKind::Gemini),
            ConversationState::History(vec![HistoryMessage::user("hi")])
        );

        reg.clear_state(&id);
        assert!(reg.load_state(&id, BackendKind::Claude).is_new());
        assert!(reg.load_state(&id, BackendKind::Gemini).is_new());
    }

    #[test]
    fn set_token_ignores_history_backends() {
        let reg = registry();
        let id = ConversationId::new("1");
        reg.set_token(&id, BackendKind::Gemini, Some("x".into()));
        assert!(reg.load_state(&id, BackendKind::Gemini).is_new());
        reg.set_token(&id, BackendKind::Claude, Some("x".into()));
        assert_eq!(reg.load_state(&id, BackendKind::Claude).token(), Some("x"));
        reg.set_token(&id, BackendKind::Claude, None);
        assert!(reg.load_state(&id, BackendKind::Claude).is_new());
    }
}
