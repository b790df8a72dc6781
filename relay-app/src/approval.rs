//! Pending command turns awaiting approval, one per conversation.

use crate::error::{TurnError, TurnResult};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use relay_channels::{ConversationId, InteractionHandle};
use relay_llm::BackendKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub command: String,
    pub approved: bool,
    pub output: String,
}

/// Commands from one backend reply, resolved strictly in order.
///
/// `outcomes.len() == cursor` always holds; the turn is complete once every
/// command has an outcome.
#[derive(Debug, Clone)]
pub struct PendingTurn {
    commands: Vec<String>,
    cursor: usize,
    outcomes: Vec<CommandOutcome>,
    backend: BackendKind,
    token: Option<String>,
    /// The live prompt for the current command.
    prompt: Option<InteractionHandle>,
}

impl PendingTurn {
    pub fn new(commands: Vec<String>, backend: BackendKind, token: Option<String>) -> Self {
        Self {
            commands,
            cursor: 0,
            outcomes: Vec::new(),
            backend,
            token,
            prompt: None,
        }
    }

    pub fn current(&self) -> Option<&str> {
        self.commands.get(self.cursor).map(String::as_str)
    }

    /// 1-based index of the current command and the total count.
    pub fn position(&self) -> (usize, usize) {
        (self.cursor + 1, self.commands.len())
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn prompt(&self) -> Option<&InteractionHandle> {
        self.prompt.as_ref()
    }

    /// Whether a decision on `handle` applies to the current command.
    pub fn is_prompted_by(&self, handle: &InteractionHandle) -> bool {
        self.prompt.as_ref() == Some(handle)
    }

    /// Records the outcome of the current command and advances.
    pub fn resolve(&mut self, approved: bool, output: String) -> TurnResult<()> {
        let command = self.current().ok_or(TurnError::NoPendingTurn)?.to_string();
        self.outcomes.push(CommandOutcome {
            command,
            approved,
            output,
        });
        self.cursor += 1;
        self.prompt = None;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.cursor >= self.commands.len()
    }

    pub fn outcomes(&self) -> &[CommandOutcome] {
        &self.outcomes
    }

    pub fn into_outcomes(self) -> Vec<CommandOutcome> {
        self.outcomes
    }
}

#[derive(Default)]
pub struct ApprovalStore {
    turns: DashMap<ConversationId, PendingTurn>,
}

impl ApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, conversation_id: &ConversationId, turn: PendingTurn) -> TurnResult<()> {
        match self.turns.entry(conversation_id.clone()) {
            Entry::Occupied(_) => Err(TurnError::Conflict),
            Entry::Vacant(slot) => {
                slot.insert(turn);
                Ok(())
            }
        }
    }

    pub fn has(&self, conversation_id: &ConversationId) -> bool {
        self.turns.contains_key(conversation_id)
    }

    pub fn take(&self, conversation_id: &ConversationId) -> Option<PendingTurn> {
        self.turns.remove(conversation_id).map(|(_, turn)| turn)
    }

    /// Puts back a partially resolved turn.
    pub fn put(&self, conversation_id: &ConversationId, turn: PendingTurn) {
        self.turns.insert(conversation_id.clone(), turn);
    }

    /// Records the prompt shown for the current command.
    pub fn attach_prompt(&self, conversation_id: &ConversationId, handle: InteractionHandle) {
        if let Some(mut turn) = self.turns.get_mut(conversation_id) {
            turn.prompt = Some(handle);
        }
    }

    pub fn remove(&self, conversation_id: &ConversationId) -> Option<PendingTurn> {
        self.turns.remove(conversation_id).map(|(_, turn)| turn)
    }
}

/// Aggregates a finished turn into the next backend input.
pub fn format_command_results(outcomes: &[CommandOutcome]) -> String {
    let mut out = String::from("Command results:\n\n");
    for (i, outcome) in outcomes.iter().enumerate() {
        out.push_str(&format!("Command {}: {}\n", i + 1, outcome.command));
        if outcome.approved {
            out.push_str(&format!("Status: Executed\nOutput:\n{}\n\n", outcome.output));
        } else {
            out.push_str("Status: Denied by user\n\n");
        }
    }
    out
}
