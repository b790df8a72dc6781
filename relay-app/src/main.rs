//! cmdrelay main binary.
//!
//! A Telegram bot that relays chat to an AI backend and runs the shell
//! commands it proposes once they pass the safety gate and, unless
//! auto-execute is on, the user's approval.

mod approval;
mod commands;
mod config;
mod error;
mod gateway;
mod heartbeat;
mod locks;
mod login;
mod orchestrator;
mod server;
mod session;
#[cfg(test)]
mod test_support;
mod usage;

use clap::{Parser, Subcommand};
use relay_tools::{Safeguard, Verdict};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Debug, Parser)]
#[command(name = "cmdrelay", version, about = "Chat-driven shell with per-command approval")]
struct Cli {
    /// Config file (default: ~/.cmdrelay/config.toml when present).
    #[arg(long, global = true, env = "CMDRELAY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the bot (default).
    Serve,
    /// Print the safety gate verdict for a command. Exits 2 when blocked.
    Check {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Validate config and report what would be started.
    Doctor,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    init_tracing()?;
    install_panic_hook();

    let cli = Cli::parse();

    let command = if let Some(command) = cli.command {
        command
    } else {
        Command::Serve
    };

    match command {
        Command::Serve => server::serve(cli.config).await.map(|()| ExitCode::SUCCESS),
        Command::Check { command } => check(&command.join(" ")),
        Command::Doctor => server::doctor(cli.config).await.map(|()| ExitCode::SUCCESS),
    }
}

fn check(command: &str) -> anyhow::Result<ExitCode> {
    let safeguard = Safeguard::new()?;
    match safeguard.check(command) {
        Verdict::Allowed => {
            println!("ALLOWED: Command '{command}' would pass safeguard checks.");
            Ok(ExitCode::SUCCESS)
        }
        Verdict::Blocked { reason, .. } => {
            println!("BLOCKED: {reason}");
            Ok(ExitCode::from(2))
        }
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(v) => v,
        Err(_) => EnvFilter::new(
            "info,cmdrelay=debug,relay_app=debug,relay_llm=debug,relay_tools=debug,relay_channels=debug",
        ),
    };
    let log_format = std::env::var("CMDRELAY_LOG_FORMAT")
        .unwrap_or_else(|_| "json".to_string())
        .to_ascii_lowercase();

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(true)
                .init();
        }
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .pretty()
                .init();
        }
        "compact" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .compact()
                .init();
        }
        other => {
            return Err(anyhow::anyhow!(
                "unsupported CMDRELAY_LOG_FORMAT={other:?}; expected one of: json, pretty, compact"
            ));
        }
    }

    tracing::info!(
        log_format = %log_format,
        env_filter = ?std::env::var("RUST_LOG").ok(),
        "tracing initialized"
    );
    Ok(())
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = panic_payload_to_string(panic_info.payload());
        tracing::error!(
            panic_location = %location,
            panic_payload = %payload,
            "panic captured"
        );
        default_hook(panic_info);
    }));
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}
