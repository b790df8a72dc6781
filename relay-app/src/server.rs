//! Process wiring for the bot: config, backends, transport, gateway.

use crate::config::AppConfig;
use crate::gateway::Gateway;
use crate::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::session::SessionRegistry;
use anyhow::Result;
use relay_channels::{ChannelAdapter, TelegramAdapter};
use relay_llm::{Backend, ClaudeBackend, ClaudeConfig, GeminiBackend, GeminiConfig};
use relay_tools::Safeguard;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

const INBOUND_QUEUE: usize = 256;

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    load_dotenv();
    let (cfg, path) = AppConfig::load_with_path(config_path).await?;
    tracing::info!(
        config_path = ?path,
        default_backend = %cfg.general.default_backend,
        work_dir = %cfg.general.work_dir.display(),
        auto_execute = cfg.execution.skip_permissions,
        allowed_chats = cfg.access.allowed_chat_ids.len(),
        "cmdrelay starting"
    );

    let safeguard = Arc::new(Safeguard::new()?);
    let (backends, secrets) = build_backends(&cfg, safeguard.clone());

    let telegram = TelegramAdapter::new(&cfg.telegram.bot_token)?.with_redacted_secrets(secrets);
    match telegram.get_me().await {
        Ok(username) => tracing::info!(bot = %username, "authorized on telegram"),
        Err(e) => return Err(anyhow::anyhow!("telegram getMe failed: {e}")),
    }
    let channel: Arc<dyn ChannelAdapter> = Arc::new(telegram);

    let orchestrator = Arc::new(Orchestrator::new(
        OrchestratorSettings {
            auto_execute: cfg.execution.skip_permissions,
            max_rounds: cfg.execution.max_tool_rounds,
            call_timeout: cfg.command_timeout(),
            ..OrchestratorSettings::default()
        },
        channel.clone(),
        safeguard,
        SessionRegistry::new(cfg.general.default_backend, backends),
    ));

    let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
    let gateway = Arc::new(Gateway::new(
        &cfg.access.allowed_chat_ids,
        channel.clone(),
        orchestrator,
        rx,
    ));
    let gateway_task = gateway.start();
    channel.start(tx).await?;
    tracing::info!(channel = channel.channel_id(), "listening for updates");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    gateway_task.abort();
    Ok(())
}

/// Backends plus the credentials they hold, for outbound redaction.
fn build_backends(
    cfg: &AppConfig,
    safeguard: Arc<Safeguard>,
) -> (Vec<Arc<dyn Backend>>, Vec<String>) {
    let claude: Arc<dyn Backend> = Arc::new(ClaudeBackend::new(
        ClaudeConfig {
            path: cfg.claude.path.clone(),
            work_dir: cfg.general.work_dir.clone(),
            system_prompt: cfg.general.system_prompt.clone(),
            allowed_tools: cfg.claude.allowed_tools.clone(),
            skip_permissions: cfg.execution.skip_permissions,
            command_timeout: cfg.command_timeout(),
        },
        safeguard.clone(),
    ));
    let gemini = GeminiBackend::new(
        GeminiConfig {
            api_key: cfg.gemini.api_key.clone(),
            model: cfg.gemini.model.clone(),
            work_dir: cfg.general.work_dir.clone(),
            system_prompt: cfg.general.system_prompt.clone(),
            command_timeout: cfg.command_timeout(),
            key_file: None,
        },
        safeguard,
    );
    let secrets = gemini.api_key().into_iter().collect();
    let gemini: Arc<dyn Backend> = Arc::new(gemini);
    (vec![claude, gemini], secrets)
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    load_dotenv();
    let (cfg, path) = AppConfig::load_with_path(config_path).await?;
    let safeguard = Safeguard::new()?;
    tracing::info!(
        config_path = ?path,
        default_backend = %cfg.general.default_backend,
        work_dir = %cfg.general.work_dir.display(),
        work_dir_exists = cfg.general.work_dir.is_dir(),
        claude_path = %cfg.claude.path,
        gemini_model = %cfg.gemini.model,
        gemini_key_configured = cfg.gemini.api_key.is_some(),
        command_timeout_secs = cfg.general.command_timeout_secs,
        max_tool_rounds = cfg.execution.max_tool_rounds,
        safeguard_rules = safeguard.rules().len(),
        "config ok"
    );
    Ok(())
}

fn load_dotenv() {
    match dotenvy::dotenv() {
        Ok(path) => tracing::debug!(path = %path.display(), "loaded .env"),
        Err(e) if e.not_found() => {}
        Err(e) => tracing::warn!(%e, "failed to read .env"),
    }
}
