//! cmdrelay configuration loader.
//!
//! An optional TOML file is read first, environment variables override it,
//! and the result is validated before anything starts.

use relay_llm::{BackendKind, DEFAULT_GEMINI_MODEL};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 300;
const DEFAULT_MAX_TOOL_ROUNDS: usize = 20;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub general: GeneralConfig,
    pub telegram: TelegramConfig,
    pub access: AccessConfig,
    pub execution: ExecutionConfig,
    pub claude: ClaudeSection,
    pub gemini: GeminiSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub work_dir: PathBuf,
    pub system_prompt: Option<String>,
    pub default_backend: BackendKind,
    pub command_timeout_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("."),
            system_prompt: None,
            default_backend: BackendKind::Claude,
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub bot_token: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    pub allowed_chat_ids: Vec<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Run proposed commands without per-command approval.
    pub skip_permissions: bool,
    pub max_tool_rounds: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            skip_permissions: false,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClaudeSection {
    pub path: String,
    pub allowed_tools: Vec<String>,
}

impl Default for ClaudeSection {
    fn default() -> Self {
        Self {
            path: "claude".to_string(),
            allowed_tools: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeminiSection {
    pub api_key: Option<String>,
    pub model: String,
}

impl Default for GeminiSection {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_GEMINI_MODEL.to_string(),
        }
    }
}

impl AppConfig {
    /// Loads config from `path`, or from the default location when it exists.
    /// Returns the file actually read, if any.
    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, Option<PathBuf>)> {
        let (path, required) = match path {
            Some(path) => (path, true),
            None => (default_config_path(), false),
        };

        let mut cfg = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => toml::from_str::<AppConfig>(&contents)
                .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?,
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file; using environment only");
                return Self::from_env().map(|cfg| (cfg, None));
            }
            Err(e) => return Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        };

        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok((cfg, Some(path)))
    }

    fn from_env() -> anyhow::Result<Self> {
        let mut cfg = AppConfig::default();
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = v.trim().to_string();
        }
        if let Some(v) = var("ALLOWED_CHAT_IDS") {
            self.access.allowed_chat_ids = parse_chat_ids(&v)?;
        }
        if let Some(v) = var("WORK_DIR") {
            self.general.work_dir = PathBuf::from(v.trim());
        }
        if let Some(v) = var("SYSTEM_PROMPT") {
            self.general.system_prompt = Some(v);
        }
        if let Some(v) = var("DEFAULT_PROVIDER") {
            self.general.default_backend = v
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid DEFAULT_PROVIDER {v:?}: {e}"))?;
        }
        if let Some(v) = var("COMMAND_TIMEOUT") {
            self.general.command_timeout_secs = parse_duration(&v)
                .map(|d| d.as_secs())
                .ok_or_else(|| anyhow::anyhow!("invalid COMMAND_TIMEOUT {v:?}"))?;
        }
        if let Some(v) = var("SKIP_PERMISSIONS") {
            self.execution.skip_permissions = v.trim() == "true";
        }
        if let Some(v) = var("MAX_TOOL_ROUNDS") {
            match v.trim().parse::<usize>() {
                Ok(rounds) if rounds > 0 => self.execution.max_tool_rounds = rounds,
                _ => {
                    tracing::warn!(value = %v, default = DEFAULT_MAX_TOOL_ROUNDS, "ignoring invalid MAX_TOOL_ROUNDS");
                    self.execution.max_tool_rounds = DEFAULT_MAX_TOOL_ROUNDS;
                }
            }
        }
        if let Some(v) = var("CLAUDE_PATH") {
            self.claude.path = v.trim().to_string();
        }
        if let Some(v) = var("ALLOWED_TOOLS") {
            self.claude.allowed_tools = v
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = var("GEMINI_API_KEY") {
            self.gemini.api_key = Some(v.trim().to_string());
        }
        if let Some(v) = var("GEMINI_MODEL") {
            self.gemini.model = v.trim().to_string();
        }
        Ok(())
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "telegram.bot_token (TELEGRAM_BOT_TOKEN) is required"
            ));
        }
        if self.access.allowed_chat_ids.is_empty() {
            return Err(anyhow::anyhow!(
                "access.allowed_chat_ids (ALLOWED_CHAT_IDS) must not be empty"
            ));
        }
        if self.general.command_timeout_secs == 0 {
            return Err(anyhow::anyhow!("general.command_timeout_secs must be > 0"));
        }
        if self.execution.max_tool_rounds == 0 {
            return Err(anyhow::anyhow!("execution.max_tool_rounds must be > 0"));
        }
        if self.claude.path.trim().is_empty() {
            return Err(anyhow::anyhow!("claude.path must not be empty"));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.general.command_timeout_secs)
    }
}

fn parse_chat_ids(raw: &str) -> anyhow::Result<Vec<i64>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>()
                .map_err(|e| anyhow::anyhow!("invalid chat ID {s:?}: {e}"))
        })
        .collect()
}

/// Parses `300`, `30s`, `5m`, `1h` or compound forms like `1h30m`.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = raw;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit())?;
        if digits == 0 {
            return None;
        }
        let value: u64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];
        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit = match &rest[..unit_len] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.checked_mul(60)?),
            "h" => Duration::from_secs(value.checked_mul(3600)?),
            _ => return None,
        };
        total = total.checked_add(unit)?;
        rest = &rest[unit_len..];
    }
    Some(total)
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".cmdrelay").join("config.toml")
}
