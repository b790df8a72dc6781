//! Slash commands handled before a message reaches the backend.

use crate::orchestrator::Orchestrator;
use relay_channels::ConversationId;
use relay_llm::BackendKind;
use relay_tools::Verdict;

const HELP: &str = "Available commands:
/new - Start a new conversation
/login - Authenticate the active backend
/usage - Show usage for this session
/safeguard <command> - Check a command against the safety rules
/claude - Switch to Claude
/gemini - Switch to Gemini
/model [name] - Show or set the Gemini model
/help - Show this message

Send any other text to talk to the active backend. Proposed commands need your approval before they run.";

/// Returns the reply for a slash command, or `None` when `input` is not one.
pub async fn handle_command(
    orch: &Orchestrator,
    conversation_id: &ConversationId,
    input: &str,
) -> Option<String> {
    let trimmed = input.trim();
    if !trimmed.starts_with('/') {
        return None;
    }

    let (head, rest) = match trimmed.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (trimmed, ""),
    };
    // Group chats address commands as `/cmd@botname`.
    let name = head.split('@').next().unwrap_or(head);

    let reply = match name {
        "/start" => format!(
            "cmdrelay is ready. Active backend: {}.\n\n{HELP}",
            orch.sessions()
                .active_backend(conversation_id)
                .display_name()
        ),
        "/help" => HELP.to_string(),
        "/new" => orch.reset(conversation_id).await,
        "/login" => orch.login(conversation_id).await,
        "/usage" => orch.usage_report(conversation_id),
        "/safeguard" => safeguard_report(orch, rest),
        "/claude" => orch.switch_backend(conversation_id, BackendKind::Claude).await,
        "/gemini" => orch.switch_backend(conversation_id, BackendKind::Gemini).await,
        "/model" => model_command(orch, rest),
        _ => format!("Unknown command.\n\n{HELP}"),
    };
    Some(reply)
}

fn safeguard_report(orch: &Orchestrator, command: &str) -> String {
    if command.is_empty() {
        return "Usage: /safeguard <command>".to_string();
    }
    match orch.safeguard().check(command) {
        Verdict::Blocked { reason, .. } => format!("BLOCKED: {reason}"),
        Verdict::Allowed => {
            format!("ALLOWED: Command '{command}' would pass safeguard checks.")
        }
    }
}

fn model_command(orch: &Orchestrator, requested: &str) -> String {
    let Some(gemini) = orch.sessions().backend(BackendKind::Gemini) else {
        return "Gemini is not configured.".to_string();
    };
    if requested.is_empty() {
        return format!(
            "Current Gemini model: {}\nUsage: /model <name>",
            gemini.model().unwrap_or_default()
        );
    }
    match gemini.set_model(requested) {
        Ok(()) => format!("Gemini model set to {requested}."),
        Err(e) => format!("Error: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::OrchestratorSettings;
    use crate::session::SessionRegistry;
    use crate::test_support::{RecordingChannel, ScriptedBackend};
    use relay_llm::Backend;
    use relay_tools::Safeguard;
    use std::sync::Arc;

    fn orchestrator() -> Orchestrator {
        let backends: Vec<Arc<dyn Backend>> = vec![
            Arc::new(ScriptedBackend::new(BackendKind::Claude, [])),
            Arc::new(ScriptedBackend::new(BackendKind::Gemini, [])),
        ];
        Orchestrator::new(
            OrchestratorSettings::default(),
            Arc::new(RecordingChannel::default()),
            Arc::new(Safeguard::new().unwrap()),
            SessionRegistry::new(BackendKind::Claude, backends),
        )
    }

    #[tokio::test]
    async fn plain_text_is_not_a_command() {
        let orch = orchestrator();
        let id = ConversationId::new("1");
        assert!(handle_command(&orch, &id, "hello /new").await.is_none());
    }

    #[tokio::test]
    async fn safeguard_dry_run() {
        let orch = orchestrator();
        let id = ConversationId::new("1");
        let blocked = handle_command(&orch, &id, "/safeguard rm -rf /").await.unwrap();
        assert!(blocked.starts_with("BLOCKED: Blocked by safeguard rule"));

        let allowed = handle_command(&orch, &id, "/safeguard ls -la").await.unwrap();
        assert_eq!(
            allowed,
            "ALLOWED: Command 'ls -la' would pass safeguard checks."
        );

        let usage = handle_command(&orch, &id, "/safeguard").await.unwrap();
        assert_eq!(usage, "Usage: /safeguard <command>");
    }

    #[tokio::test]
    async fn backend_switch_commands_accept_bot_suffix() {
        let orch = orchestrator();
        let id = ConversationId::new("1");
        assert_eq!(
            handle_command(&orch, &id, "/gemini@cmdrelay_bot").await.unwrap(),
            "Switched to Gemini. Conversation reset."
        );
        assert_eq!(
            handle_command(&orch, &id, "/claude").await.unwrap(),
            "Switched to Claude. Conversation reset."
        );
        assert_eq!(
            handle_command(&orch, &id, "/claude").await.unwrap(),
            "Claude is already active."
        );
    }

    #[tokio::test]
    async fn unknown_command_shows_help() {
        let orch = orchestrator();
        let id = ConversationId::new("1");
        let reply = handle_command(&orch, &id, "/frobnicate").await.unwrap();
        assert!(reply.starts_with("Unknown command."));
        assert!(reply.contains("/safeguard <command>"));
    }

    #[tokio::test]
    async fn usage_and_new() {
        let orch = orchestrator();
        let id = ConversationId::new("1");
        assert_eq!(
            handle_command(&orch, &id, "/usage").await.unwrap(),
            "No usage data yet. Send some messages first!"
        );
        assert_eq!(
            handle_command(&orch, &id, "/new").await.unwrap(),
            "Session reset. Your next message will start a new conversation."
        );
    }

    #[tokio::test]
    async fn model_on_backend_without_selection_reports_error() {
        let orch = orchestrator();
        let id = ConversationId::new("1");
        let reply = handle_command(&orch, &id, "/model gemini-2.5-pro").await.unwrap();
        assert_eq!(reply, "Error: Gemini does not support model selection");
    }

    #[tokio::test]
    async fn login_starts_credential_flow() {
        let orch = orchestrator();
        let id = ConversationId::new("1");
        assert_eq!(
            handle_command(&orch, &id, "/login").await.unwrap(),
            "Send the login code."
        );
    }
}
