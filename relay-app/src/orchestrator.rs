//! Turn orchestration: backend call, command extraction, approval or
//! auto-execution, and feeding command results back as the next input.
//!
//! Every entry point takes the conversation lock first, so for any one
//! conversation at most one of these runs at a time.

use crate::approval::{ApprovalStore, CommandOutcome, PendingTurn, format_command_results};
use crate::error::{TurnError, TurnResult};
use crate::heartbeat::{TYPING_INTERVAL, TypingHeartbeat};
use crate::locks::ConversationLocks;
use crate::login::LoginStore;
use crate::session::SessionRegistry;
use crate::usage::UsageTracker;
use relay_channels::{CallbackId, ChannelAdapter, ConversationId, InteractionHandle};
use relay_llm::{Backend, BackendError, BackendKind, BackendReply, parse_commands};
use relay_tools::{Safeguard, Verdict};
use std::sync::Arc;
use std::time::{Duration, Instant};

const AUTO_OUTPUT_CHARS_MAX: usize = 1000;
const APPROVED_OUTPUT_CHARS_MAX: usize = 2000;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Run proposed commands without asking.
    pub auto_execute: bool,
    pub max_rounds: usize,
    pub call_timeout: Duration,
    pub typing_interval: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            auto_execute: false,
            max_rounds: 20,
            call_timeout: Duration::from_secs(300),
            typing_interval: TYPING_INTERVAL,
        }
    }
}

pub struct Orchestrator {
    settings: OrchestratorSettings,
    channel: Arc<dyn ChannelAdapter>,
    safeguard: Arc<Safeguard>,
    sessions: SessionRegistry,
    locks: ConversationLocks,
    approvals: ApprovalStore,
    usage: UsageTracker,
    logins: LoginStore,
}

impl Orchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        channel: Arc<dyn ChannelAdapter>,
        safeguard: Arc<Safeguard>,
        sessions: SessionRegistry,
    ) -> Self {
        Self {
            settings,
            channel,
            safeguard,
            sessions,
            locks: ConversationLocks::new(),
            approvals: ApprovalStore::new(),
            usage: UsageTracker::new(),
            logins: LoginStore::new(),
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn safeguard(&self) -> &Safeguard {
        &self.safeguard
    }

    pub fn usage_report(&self, conversation_id: &ConversationId) -> String {
        self.usage.report(conversation_id)
    }

    pub fn has_pending_turn(&self, conversation_id: &ConversationId) -> bool {
        self.approvals.has(conversation_id)
    }

    /// Entry point for free text from the conversation.
    #[tracing::instrument(level = "info", skip_all, fields(conversation_id = %conversation_id))]
    pub async fn submit(&self, conversation_id: &ConversationId, text: &str) {
        let _guard = self.locks.acquire(conversation_id).await;

        if self.logins.has(conversation_id) {
            self.complete_login(conversation_id, text).await;
            return;
        }
        if self.has_pending_turn(conversation_id) {
            self.say(conversation_id, &TurnError::Conflict.to_string()).await;
            return;
        }

        let backend = self.sessions.active_backend(conversation_id);
        self.run_turn(conversation_id, backend, text.to_string(), true)
            .await;
    }

    /// Applies an Approve/Deny decision to the current command of the
    /// pending turn.
    #[tracing::instrument(level = "info", skip_all, fields(conversation_id = %conversation_id, approved = approved))]
    pub async fn resolve(
        &self,
        conversation_id: &ConversationId,
        approved: bool,
        interaction: &InteractionHandle,
        callback_id: &CallbackId,
    ) {
        let _guard = self.locks.acquire(conversation_id).await;

        let Some(mut turn) = self.approvals.take(conversation_id) else {
            self.answer(callback_id, &TurnError::NoPendingTurn.to_string())
                .await;
            return;
        };
        if !turn.is_prompted_by(interaction) {
            tracing::info!(
                message_id = %interaction.message_id,
                "decision on a prompt that is no longer current"
            );
            self.approvals.put(conversation_id, turn);
            self.answer(callback_id, &TurnError::NoPendingTurn.to_string())
                .await;
            return;
        }
        let Some(command) = turn.current().map(str::to_string) else {
            self.answer(callback_id, &TurnError::NoPendingTurn.to_string())
                .await;
            return;
        };

        let verdict = if approved { "Approved" } else { "Denied" };
        self.answer(callback_id, verdict).await;
        if let Err(e) = self
            .channel
            .edit_to_remove_interaction(interaction, &format!("{verdict}: {command}"))
            .await
        {
            tracing::warn!(%e, "failed to update approval prompt");
        }

        let output = if approved {
            let output = match self.sessions.backend(turn.backend()) {
                Some(backend) => self.run_command(backend.as_ref(), &command).await,
                None => TurnError::BackendUnavailable(turn.backend().display_name()).to_string(),
            };
            self.say(
                conversation_id,
                &truncate_for_chat(&output, APPROVED_OUTPUT_CHARS_MAX, "\n... (truncated in chat)"),
            )
            .await;
            output
        } else {
            String::new()
        };
        if let Err(e) = turn.resolve(approved, output) {
            self.say(conversation_id, &e.to_string()).await;
            return;
        }
        tracing::info!(
            command = %command,
            approved,
            resolved = turn.outcomes().len(),
            "command resolved"
        );

        if !turn.is_complete() {
            let prompt = approval_prompt(&turn);
            self.approvals.put(conversation_id, turn);
            if let Some(prompt) = prompt {
                self.present(conversation_id, &prompt).await;
            }
            return;
        }

        let backend = turn.backend();
        self.sessions
            .set_token(conversation_id, backend, turn.token().map(str::to_string));
        let input = format_command_results(&turn.into_outcomes());
        self.run_turn(conversation_id, backend, input, true).await;
    }

    /// Drops conversation state, any pending turn or login, and usage.
    pub async fn reset(&self, conversation_id: &ConversationId) -> String {
        let _guard = self.locks.acquire(conversation_id).await;
        self.clear_conversation(conversation_id).await;
        tracing::info!(conversation_id = %conversation_id, "session reset");
        "Session reset. Your next message will start a new conversation.".to_string()
    }

    pub async fn switch_backend(
        &self,
        conversation_id: &ConversationId,
        backend: BackendKind,
    ) -> String {
        let _guard = self.locks.acquire(conversation_id).await;
        if self.sessions.backend(backend).is_none() {
            return TurnError::BackendUnavailable(backend.display_name()).to_string();
        }
        if self.sessions.active_backend(conversation_id) == backend {
            return format!("{} is already active.", backend.display_name());
        }
        self.clear_conversation(conversation_id).await;
        self.sessions.set_active_backend(conversation_id, backend);
        tracing::info!(conversation_id = %conversation_id, backend = %backend, "backend switched");
        format!("Switched to {}. Conversation reset.", backend.display_name())
    }

    /// Starts a credential flow for the active backend on request.
    pub async fn login(&self, conversation_id: &ConversationId) -> String {
        let _guard = self.locks.acquire(conversation_id).await;
        self.logins.cancel(conversation_id);
        let backend = self.sessions.active_backend(conversation_id);
        self.start_login(conversation_id, backend, None).await
    }

    async fn clear_conversation(&self, conversation_id: &ConversationId) {
        self.sessions.clear_state(conversation_id);
        self.usage.reset(conversation_id);
        self.logins.cancel(conversation_id);
        let Some(turn) = self.approvals.remove(conversation_id) else {
            return;
        };
        if let (Some(handle), Some(command)) = (turn.prompt(), turn.current()) {
            if let Err(e) = self
                .channel
                .edit_to_remove_interaction(handle, &format!("Cancelled: {command}"))
                .await
            {
                tracing::warn!(%e, "failed to retire approval prompt");
            }
        }
    }

    async fn run_turn(
        &self,
        conversation_id: &ConversationId,
        backend: BackendKind,
        input: String,
        login_on_auth: bool,
    ) {
        let original = input.clone();
        match self.drive(conversation_id, backend, input).await {
            Ok(()) => {}
            Err(TurnError::AuthenticationRequired { backend, detail }) if login_on_auth => {
                tracing::info!(backend = %backend, detail = %detail, "backend needs authentication");
                let prompt = self
                    .start_login(conversation_id, backend, Some(original))
                    .await;
                self.say(conversation_id, &prompt).await;
            }
            Err(e) => {
                tracing::warn!(%e, backend = %backend, "turn aborted");
                self.say(conversation_id, &e.to_string()).await;
            }
        }
    }

    /// Backend call, then approval or execution, repeated while
    /// auto-executed rounds keep producing commands.
    async fn drive(
        &self,
        conversation_id: &ConversationId,
        kind: BackendKind,
        mut input: String,
    ) -> TurnResult<()> {
        let backend = self
            .sessions
            .backend(kind)
            .ok_or(TurnError::BackendUnavailable(kind.display_name()))?;
        let mut rounds = 0usize;

        loop {
            let reply = self
                .call_backend(conversation_id, backend.as_ref(), &input)
                .await?;
            let parsed = parse_commands(&reply.text);
            if parsed.display.is_empty() {
                self.say(conversation_id, "(empty response)").await;
            } else {
                self.say(conversation_id, &parsed.display).await;
            }

            let mut commands = parsed.commands;
            if commands.is_empty() {
                return Ok(());
            }
            if kind.single_command_per_reply() && commands.len() > 1 {
                tracing::debug!(dropped = commands.len() - 1, "keeping only the first command");
                commands.truncate(1);
            }

            if !self.settings.auto_execute {
                let token = self
                    .sessions
                    .load_state(conversation_id, kind)
                    .token()
                    .map(str::to_string);
                let turn = PendingTurn::new(commands, kind, token);
                let prompt = approval_prompt(&turn);
                self.approvals.begin(conversation_id, turn)?;
                if let Some(prompt) = prompt {
                    self.present(conversation_id, &prompt).await;
                }
                return Ok(());
            }

            if rounds >= self.settings.max_rounds {
                return Err(TurnError::RoundLimitExceeded);
            }
            rounds += 1;

            let mut outcomes = Vec::with_capacity(commands.len());
            for command in commands {
                self.say(conversation_id, &format!("Running: {command}")).await;
                let output = self.run_command(backend.as_ref(), &command).await;
                self.say(
                    conversation_id,
                    &truncate_for_chat(&output, AUTO_OUTPUT_CHARS_MAX, "\n... (truncated)"),
                )
                .await;
                outcomes.push(CommandOutcome {
                    command,
                    approved: true,
                    output,
                });
            }
            tracing::debug!(round = rounds, max_rounds = self.settings.max_rounds, "auto round finished");
            input = format_command_results(&outcomes);
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(backend = %backend.kind()))]
    async fn call_backend(
        &self,
        conversation_id: &ConversationId,
        backend: &dyn Backend,
        input: &str,
    ) -> TurnResult<BackendReply> {
        let kind = backend.kind();
        let state = self.sessions.load_state(conversation_id, kind);
        let _typing = self.channel.supports_typing_events().then(|| {
            TypingHeartbeat::start(
                self.channel.clone(),
                conversation_id.clone(),
                self.settings.typing_interval,
            )
        });

        let started = Instant::now();
        let timeout = self.settings.call_timeout;
        let result = tokio::time::timeout(
            timeout,
            backend.send(conversation_id.as_str(), &state, input),
        )
        .await;

        let mut reply = match result {
            Err(_) => {
                tracing::warn!(timeout_secs = timeout.as_secs(), "backend call timed out");
                return Err(TurnError::Timeout {
                    backend: kind,
                    after: timeout,
                });
            }
            Ok(Err(e)) if backend.is_auth_error(&e) => {
                return Err(TurnError::AuthenticationRequired {
                    backend: kind,
                    detail: e.to_string(),
                });
            }
            Ok(Err(BackendError::TimedOut(what))) => {
                tracing::warn!(what = %what, "backend reported a timeout");
                return Err(TurnError::BackendTimedOut {
                    backend: kind,
                    what,
                });
            }
            Ok(Err(e)) => return Err(TurnError::Upstream(e.to_string())),
            Ok(Ok(reply)) => reply,
        };

        if reply.usage.duration.is_zero() {
            reply.usage.duration = started.elapsed();
        }
        self.usage.record(conversation_id, &reply.usage);
        self.sessions
            .store_state(conversation_id, kind, reply.state.clone());
        tracing::info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            input_tokens = reply.usage.input_tokens,
            output_tokens = reply.usage.output_tokens,
            "backend replied"
        );
        Ok(reply)
    }

    /// Runs one command through the gate and the backend's executor.
    /// Failures become output; they never abort the turn.
    async fn run_command(&self, backend: &dyn Backend, command: &str) -> String {
        if let Verdict::Blocked { rule, reason } = self.safeguard.check(command) {
            tracing::warn!(command = %command, rule, "command blocked before execution");
            return reason;
        }
        match backend.execute_command(command).await {
            Ok(run) => run.render(),
            Err(relay_tools::ToolError::Blocked { reason, .. }) => reason,
            Err(e) => format!("Error: {e}"),
        }
    }

    async fn start_login(
        &self,
        conversation_id: &ConversationId,
        kind: BackendKind,
        original_message: Option<String>,
    ) -> String {
        let Some(backend) = self.sessions.backend(kind) else {
            return TurnError::BackendUnavailable(kind.display_name()).to_string();
        };
        match backend.setup_authentication().await {
            Ok(challenge) => {
                self.logins
                    .begin(conversation_id, kind, challenge.submitter, original_message);
                challenge.prompt
            }
            Err(e) => {
                tracing::warn!(%e, backend = %kind, "failed to start login");
                format!("Failed to start {} login: {e}", kind.display_name())
            }
        }
    }

    async fn complete_login(&self, conversation_id: &ConversationId, text: &str) {
        let Some(login) = self.logins.take(conversation_id) else {
            return;
        };
        let code = text.trim();
        if code.is_empty() {
            self.say(
                conversation_id,
                "Empty code. Please try again by sending a new message.",
            )
            .await;
            return;
        }

        self.say(conversation_id, "Verifying...").await;
        let backend = login.backend;
        if let Err(e) = login.submitter.submit(code).await {
            tracing::warn!(%e, backend = %backend, "login failed");
            self.say(
                conversation_id,
                &format!("Login failed: {e}\nPlease try again with /login."),
            )
            .await;
            return;
        }

        self.channel.register_secret(code);
        tracing::info!(backend = %backend, "login succeeded");
        match login.original_message {
            Some(original) => {
                self.say(
                    conversation_id,
                    "Login successful! Retrying your last message...",
                )
                .await;
                self.run_turn(conversation_id, backend, original, false)
                    .await;
            }
            None => {
                self.say(
                    conversation_id,
                    "Login successful! You can now send messages.",
                )
                .await;
            }
        }
    }

    /// Shows the prompt for the current command. Only decisions on the
    /// returned handle resolve it.
    async fn present(&self, conversation_id: &ConversationId, prompt: &str) {
        match self.channel.present_approval(conversation_id, prompt).await {
            Ok(handle) => self.approvals.attach_prompt(conversation_id, handle),
            Err(e) => {
                // Without a prompt the turn can never be resolved.
                tracing::warn!(%e, "failed to present approval prompt");
                self.approvals.remove(conversation_id);
                self.say(
                    conversation_id,
                    &format!("Error: could not show the approval prompt: {e}"),
                )
                .await;
            }
        }
    }

    async fn say(&self, conversation_id: &ConversationId, text: &str) {
        if let Err(e) = self.channel.send_text(conversation_id, text).await {
            tracing::warn!(%e, conversation_id = %conversation_id, "send_text failed");
        }
    }

    async fn answer(&self, callback_id: &CallbackId, text: &str) {
        if let Err(e) = self.channel.answer_interaction(callback_id, text).await {
            tracing::debug!(%e, "answer_interaction failed");
        }
    }
}

fn approval_prompt(turn: &PendingTurn) -> Option<String> {
    let command = turn.current()?;
    let (index, total) = turn.position();
    Some(format!("Command {index}/{total}:\n`{command}`"))
}

fn truncate_for_chat(text: &str, max_chars: usize, marker: &str) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}{marker}", &text[..cut]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{RecordingChannel, ScriptedBackend, Step};
    use relay_channels::MessageId;

    struct Harness {
        orch: Orchestrator,
        channel: Arc<RecordingChannel>,
        claude: Arc<ScriptedBackend>,
        gemini: Arc<ScriptedBackend>,
        id: ConversationId,
    }

    fn harness(
        settings: OrchestratorSettings,
        claude: ScriptedBackend,
        gemini: ScriptedBackend,
    ) -> Harness {
        let channel = Arc::new(RecordingChannel::default());
        let claude = Arc::new(claude);
        let gemini = Arc::new(gemini);
        let backends: Vec<Arc<dyn Backend>> = vec![claude.clone(), gemini.clone()];
        let orch = Orchestrator::new(
            settings,
            channel.clone(),
            Arc::new(Safeguard::new().unwrap()),
            SessionRegistry::new(BackendKind::Claude, backends),
        );
        Harness {
            orch,
            channel,
            claude,
            gemini,
            id: ConversationId::new("100"),
        }
    }

    fn manual(claude: impl IntoIterator<Item = Step>) -> Harness {
        harness(
            OrchestratorSettings::default(),
            ScriptedBackend::new(BackendKind::Claude, claude),
            ScriptedBackend::new(BackendKind::Gemini, []),
        )
    }

    fn reply(text: &str) -> Step {
        Step::Reply(text.to_string())
    }

    fn handle(id: &ConversationId, message_id: usize) -> InteractionHandle {
        InteractionHandle {
            conversation_id: id.clone(),
            message_id: MessageId::new(message_id.to_string()),
        }
    }

    /// Decides on the most recently shown prompt.
    async fn decide(h: &Harness, approved: bool) {
        let latest = handle(&h.id, h.channel.approvals().len());
        h.orch
            .resolve(&h.id, approved, &latest, &CallbackId::new("cb"))
            .await;
    }

    #[tokio::test]
    async fn approved_commands_run_in_order_and_results_feed_back() {
        let h = manual([
            reply("Listing: <command>ls</command> then <command>pwd</command>"),
            reply("All done."),
        ]);

        h.orch.submit(&h.id, "show files").await;
        assert_eq!(h.channel.texts(), vec!["Listing: `ls` then `pwd`"]);
        assert_eq!(h.channel.approvals(), vec!["Command 1/2:\n`ls`"]);
        assert!(h.orch.has_pending_turn(&h.id));

        decide(&h, true).await;
        assert_eq!(h.claude.executions(), vec!["ls"]);
        assert_eq!(h.channel.edits(), vec!["Approved: ls"]);
        assert_eq!(h.channel.approvals().last().unwrap(), "Command 2/2:\n`pwd`");

        decide(&h, true).await;
        assert_eq!(h.claude.executions(), vec!["ls", "pwd"]);
        assert!(!h.orch.has_pending_turn(&h.id));

        let sends = h.claude.sends();
        assert_eq!(sends.len(), 2);
        assert_eq!(
            sends[1],
            "Command results:\n\nCommand 1: ls\nStatus: Executed\nOutput:\nran ls\n\nCommand 2: pwd\nStatus: Executed\nOutput:\nran pwd\n\n"
        );
        assert_eq!(
            h.claude.tokens_seen.lock().unwrap().clone(),
            vec![None, Some("tok-1".to_string())]
        );
        assert_eq!(h.channel.texts().last().unwrap(), "All done.");
        assert_eq!(h.channel.answers(), vec!["Approved", "Approved"]);
    }

    #[tokio::test]
    async fn denied_command_is_reported_without_running() {
        let h = manual([reply("<command>rm -rf ./build</command>"), reply("Okay.")]);
        h.orch.submit(&h.id, "clean").await;
        decide(&h, false).await;

        assert!(h.claude.executions().is_empty());
        assert_eq!(h.channel.edits(), vec!["Denied: rm -rf ./build"]);
        assert_eq!(
            h.claude.sends()[1],
            "Command results:\n\nCommand 1: rm -rf ./build\nStatus: Denied by user\n\n"
        );
    }

    #[tokio::test]
    async fn new_message_while_pending_is_a_conflict() {
        let h = manual([reply("<command>ls</command>")]);
        h.orch.submit(&h.id, "first").await;
        h.orch.submit(&h.id, "second").await;

        assert_eq!(h.claude.sends(), vec!["first"]);
        assert_eq!(
            h.channel.texts().last().unwrap(),
            "Please approve or deny the pending command first."
        );
        assert!(h.orch.has_pending_turn(&h.id));
    }

    #[tokio::test]
    async fn decision_without_pending_turn_is_answered() {
        let h = manual([]);
        decide(&h, true).await;
        assert_eq!(h.channel.answers(), vec!["No pending command."]);
        assert!(h.claude.executions().is_empty());
    }

    #[tokio::test]
    async fn blocked_command_never_reaches_the_executor() {
        let h = manual([reply("<command>rm -rf /</command>"), reply("Understood.")]);
        h.orch.submit(&h.id, "wipe").await;
        decide(&h, true).await;

        assert!(h.claude.executions().is_empty());
        let results = &h.claude.sends()[1];
        assert!(results.contains("Status: Executed"));
        assert!(results.contains("Blocked by safeguard rule"));
    }

    #[tokio::test]
    async fn auto_execute_stops_after_max_rounds() {
        let h = harness(
            OrchestratorSettings {
                auto_execute: true,
                max_rounds: 3,
                ..OrchestratorSettings::default()
            },
            ScriptedBackend::new(BackendKind::Claude, [])
                .with_fallback("again <command>echo hi</command>"),
            ScriptedBackend::new(BackendKind::Gemini, []),
        );

        h.orch.submit(&h.id, "loop").await;

        assert_eq!(h.claude.executions().len(), 3);
        assert_eq!(h.claude.sends().len(), 4);
        assert_eq!(
            h.channel.texts().last().unwrap(),
            "Stopped: too many command rounds."
        );
        assert!(h.channel.approvals().is_empty());
        assert!(!h.orch.has_pending_turn(&h.id));
    }

    #[tokio::test]
    async fn auto_execute_ends_when_no_more_commands() {
        let h = harness(
            OrchestratorSettings {
                auto_execute: true,
                ..OrchestratorSettings::default()
            },
            ScriptedBackend::new(
                BackendKind::Claude,
                [reply("<command>ls</command>"), reply("Finished.")],
            ),
            ScriptedBackend::new(BackendKind::Gemini, []),
        );

        h.orch.submit(&h.id, "go").await;
        assert_eq!(h.claude.executions(), vec!["ls"]);
        assert_eq!(
            h.channel.texts(),
            vec!["`ls`", "Running: ls", "ran ls", "Finished."]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_aborts_without_pending_turn() {
        let h = harness(
            OrchestratorSettings {
                call_timeout: Duration::from_secs(5),
                ..OrchestratorSettings::default()
            },
            ScriptedBackend::new(BackendKind::Claude, [Step::Hang, reply("back")]),
            ScriptedBackend::new(BackendKind::Gemini, []),
        );

        h.orch.submit(&h.id, "slow").await;
        assert_eq!(
            h.channel.texts().last().unwrap(),
            "Error: Claude timed out after 5s"
        );
        assert!(!h.orch.has_pending_turn(&h.id));

        h.orch.submit(&h.id, "again").await;
        assert_eq!(h.channel.texts().last().unwrap(), "back");
    }

    #[tokio::test]
    async fn upstream_error_is_surfaced() {
        let h = manual([Step::Fail("rate limited".into())]);
        h.orch.submit(&h.id, "hi").await;
        assert_eq!(h.channel.texts(), vec!["Error: rate limited"]);
    }

    #[tokio::test]
    async fn empty_reply_is_reported() {
        let h = manual([reply("   ")]);
        h.orch.submit(&h.id, "hi").await;
        assert_eq!(h.channel.texts(), vec!["(empty response)"]);
    }

    #[tokio::test]
    async fn auth_error_logs_in_and_resubmits_once() {
        let h = manual([Step::AuthError, reply("Hello after login.")]);

        h.orch.submit(&h.id, "hello").await;
        assert_eq!(h.channel.texts(), vec!["Send the login code."]);

        h.orch.submit(&h.id, "  code-123 ").await;
        assert_eq!(h.claude.codes.lock().unwrap().clone(), vec!["code-123"]);
        assert_eq!(h.channel.secrets(), vec!["code-123"]);
        assert_eq!(h.claude.sends(), vec!["hello", "hello"]);
        assert_eq!(h.channel.texts().last().unwrap(), "Hello after login.");
    }

    #[tokio::test]
    async fn repeated_auth_error_after_login_is_not_retried_again() {
        let h = manual([Step::AuthError, Step::AuthError, reply("never")]);

        h.orch.submit(&h.id, "hello").await;
        h.orch.submit(&h.id, "code").await;

        assert_eq!(h.claude.sends().len(), 2);
        assert_eq!(
            h.channel.texts().last().unwrap(),
            "Claude needs authentication: not logged in"
        );

        h.orch.submit(&h.id, "next").await;
        assert_eq!(h.claude.sends().len(), 3);
        assert_eq!(h.claude.codes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejected_credential_reports_failure() {
        let h = manual([Step::AuthError]);
        h.orch.submit(&h.id, "hello").await;
        h.orch.submit(&h.id, "bad").await;
        assert!(
            h.channel
                .texts()
                .last()
                .unwrap()
                .starts_with("Login failed: rejected")
        );
        assert_eq!(h.claude.sends().len(), 1);
    }

    #[tokio::test]
    async fn backend_switch_isolates_state() {
        let h = manual([reply("<command>ls</command>"), reply("fresh")]);
        h.orch.submit(&h.id, "first").await;
        assert!(h.orch.has_pending_turn(&h.id));

        assert_eq!(
            h.orch.switch_backend(&h.id, BackendKind::Gemini).await,
            "Switched to Gemini. Conversation reset."
        );
        assert_eq!(h.orch.sessions().active_backend(&h.id), BackendKind::Gemini);
        assert!(!h.orch.has_pending_turn(&h.id));
        assert_eq!(
            h.orch.switch_backend(&h.id, BackendKind::Gemini).await,
            "Gemini is already active."
        );

        h.orch.switch_backend(&h.id, BackendKind::Claude).await;
        h.orch.submit(&h.id, "second").await;
        assert_eq!(
            h.claude.tokens_seen.lock().unwrap().clone(),
            vec![None, None]
        );
    }

    #[tokio::test]
    async fn history_backend_keeps_only_first_command() {
        let h = harness(
            OrchestratorSettings::default(),
            ScriptedBackend::new(BackendKind::Claude, []),
            ScriptedBackend::new(
                BackendKind::Gemini,
                [
                    reply("<command>ls</command><command>pwd</command>"),
                    reply("done"),
                ],
            ),
        );
        h.orch.switch_backend(&h.id, BackendKind::Gemini).await;
        h.orch.submit(&h.id, "go").await;

        assert_eq!(h.channel.approvals(), vec!["Command 1/1:\n`ls`"]);
        decide(&h, true).await;
        assert_eq!(h.gemini.executions(), vec!["ls"]);
        assert!(!h.orch.has_pending_turn(&h.id));
        assert_eq!(h.gemini.sends().len(), 2);
    }

    #[tokio::test]
    async fn history_backend_runs_only_first_command_each_auto_round() {
        let h = harness(
            OrchestratorSettings {
                auto_execute: true,
                ..OrchestratorSettings::default()
            },
            ScriptedBackend::new(BackendKind::Claude, []),
            ScriptedBackend::new(
                BackendKind::Gemini,
                [
                    reply("<command>ls</command><command>pwd</command>"),
                    reply("<command>whoami</command><command>id</command>"),
                    reply("done"),
                ],
            ),
        );
        h.orch.switch_backend(&h.id, BackendKind::Gemini).await;
        h.orch.submit(&h.id, "go").await;

        assert_eq!(h.gemini.executions(), vec!["ls", "whoami"]);
        let sends = h.gemini.sends();
        assert_eq!(sends.len(), 3);
        assert_eq!(
            sends[1],
            "Command results:\n\nCommand 1: ls\nStatus: Executed\nOutput:\nran ls\n\n"
        );
        assert_eq!(
            sends[2],
            "Command results:\n\nCommand 1: whoami\nStatus: Executed\nOutput:\nran whoami\n\n"
        );
        assert!(h.channel.approvals().is_empty());
        assert_eq!(h.channel.texts().last().unwrap(), "done");
    }

    #[tokio::test]
    async fn decision_on_a_retired_prompt_runs_nothing() {
        let h = manual([
            reply("<command>echo harmless</command>"),
            reply("<command>printenv</command>"),
            reply("ok"),
        ]);
        h.orch.submit(&h.id, "first").await;
        h.orch.reset(&h.id).await;
        assert_eq!(h.channel.edits(), vec!["Cancelled: echo harmless"]);

        h.orch.submit(&h.id, "second").await;
        assert_eq!(h.channel.approvals().len(), 2);
        h.orch
            .resolve(&h.id, true, &handle(&h.id, 1), &CallbackId::new("old"))
            .await;
        assert!(h.claude.executions().is_empty());
        assert_eq!(h.channel.answers(), vec!["No pending command."]);
        assert!(h.orch.has_pending_turn(&h.id));

        decide(&h, true).await;
        assert_eq!(h.claude.executions(), vec!["printenv"]);
        assert_eq!(
            h.channel.edits(),
            vec!["Cancelled: echo harmless", "Approved: printenv"]
        );
    }

    #[tokio::test]
    async fn decision_on_an_earlier_command_prompt_is_ignored() {
        let h = manual([
            reply("<command>ls</command><command>rm -rf ./out</command>"),
            reply("ok"),
        ]);
        h.orch.submit(&h.id, "go").await;
        decide(&h, true).await;
        assert_eq!(h.claude.executions(), vec!["ls"]);

        h.orch
            .resolve(&h.id, true, &handle(&h.id, 1), &CallbackId::new("again"))
            .await;
        assert_eq!(h.claude.executions(), vec!["ls"]);
        assert_eq!(h.channel.answers().last().unwrap(), "No pending command.");
        assert!(h.orch.has_pending_turn(&h.id));
    }

    #[tokio::test]
    async fn backend_side_timeout_reports_no_orchestrator_budget() {
        let h = manual([Step::TimedOut("http request".into())]);
        h.orch.submit(&h.id, "hi").await;
        assert_eq!(
            h.channel.texts(),
            vec!["Error: Claude http request timed out"]
        );
        assert!(!h.orch.has_pending_turn(&h.id));
    }

    #[tokio::test]
    async fn reset_clears_pending_turn_and_usage() {
        let h = manual([reply("<command>ls</command>")]);
        h.orch.submit(&h.id, "hi").await;
        assert!(h.orch.usage_report(&h.id).starts_with("Session usage:"));

        assert_eq!(
            h.orch.reset(&h.id).await,
            "Session reset. Your next message will start a new conversation."
        );
        assert!(!h.orch.has_pending_turn(&h.id));
        assert_eq!(h.channel.edits(), vec!["Cancelled: ls"]);
        assert!(h.orch.sessions().load_state(&h.id, BackendKind::Claude).is_new());
        assert_eq!(
            h.orch.usage_report(&h.id),
            "No usage data yet. Send some messages first!"
        );
    }

    #[tokio::test]
    async fn long_output_is_truncated_for_chat_only() {
        let long = "x".repeat(3000);
        assert_eq!(
            truncate_for_chat(&long, 2000, "\n... (truncated in chat)").len(),
            2000 + "\n... (truncated in chat)".len()
        );
        assert_eq!(truncate_for_chat("short", 10, "!"), "short");
        assert_eq!(truncate_for_chat("héllo", 2, "…"), "hé…");
    }
}
