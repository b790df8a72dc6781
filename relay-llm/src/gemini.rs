use crate::backend::{AuthChallenge, Backend, CredentialSubmitter, compose_system_prompt};
use crate::error::{BackendError, Result};
use crate::types::{
    BackendKind, BackendReply, CallUsage, ConversationState, HistoryMessage, HistoryRole,
};
use async_trait::async_trait;
use relay_tools::{CommandRun, Safeguard, ShellExecutor, ShellPolicy};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

const GEMINI_MODELS_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const API_KEY_PAGE: &str = "https://aistudio.google.com/apikey";
const API_KEY_FILE: &str = ".gemini_api_key";
const API_KEY_HEADER: &str = "x-goog-api-key";
const API_KEY_PREFIX: &str = "AIza";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";
const HTTP_TIMEOUT: Duration = Duration::from_secs(120);
const BACKGROUND_AFTER: Duration = Duration::from_secs(15);

const AUTH_ERROR_MARKERS: [&str; 7] = [
    "api key",
    "api_key",
    "unauthenticated",
    "unauthorized",
    "not logged",
    "permission denied",
    "invalid key",
];

/// Prefixed to the very first user message of a conversation.
const COMMAND_INSTRUCTION: &str = "IMPORTANT - READ CAREFULLY:

You are a shell assistant running inside a Telegram bot. You have FULL ability to run shell commands.
You have NO built-in tools, plugins, or function-calling APIs. The ONLY mechanism to execute a command is:

  <command>your shell command here</command>

RULES:
1. Always use <command>...</command> tags on their own line when you want to run a shell command.
2. Send ONLY ONE <command> per response - wait for the output before sending the next command.
3. Do NOT write \"run_shell_command\", JSON tool-calls, or any other syntax. Only <command> tags.
4. Working directory persists between commands (cd works).
5. If a command starts a long-running process (server, etc.), it will be backgrounded automatically.
6. Explain briefly what the command does, then put the tag on its own line.

Now respond to this user message:
";

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub work_dir: PathBuf,
    pub system_prompt: Option<String>,
    pub command_timeout: Duration,
    /// Where an accepted API key is persisted. Defaults to `~/.gemini_api_key`.
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    system_instruction: Content,
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

impl Content {
    fn text(role: Option<&str>, text: &str) -> Self {
        Self {
            role: role.map(str::to_string),
            parts: vec![Part {
                text: text.to_string(),
            }],
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GenerateResponse {
    candidates: Vec<Candidate>,
    error: Option<ApiErrorBody>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Candidate {
    content: Content,
    #[serde(rename = "finishReason")]
    finish_reason: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ApiErrorBody {
    code: i64,
    message: String,
    status: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: u64,
    candidates_token_count: u64,
    cached_content_token_count: u64,
}

struct Credentials {
    api_key: RwLock<String>,
    key_file: Option<PathBuf>,
}

impl Credentials {
    fn get(&self) -> String {
        self.api_key
            .read()
            .map(|key| key.clone())
            .unwrap_or_default()
    }

    async fn store(&self, key: &str) -> Result<()> {
        if let Ok(mut guard) = self.api_key.write() {
            *guard = key.to_string();
        }
        let Some(path) = &self.key_file else {
            return Ok(());
        };
        tokio::fs::write(path, key.as_bytes())
            .await
            .map_err(|e| BackendError::Process(format!("failed to save API key: {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| BackendError::Process(format!("failed to save API key: {e}")))?;
        }
        tracing::info!(path = %path.display(), "gemini api key updated and saved");
        Ok(())
    }
}

fn default_key_file() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(API_KEY_FILE))
}

fn load_key_file(path: Option<&PathBuf>) -> String {
    path.and_then(|p| std::fs::read_to_string(p).ok())
        .map(|raw| raw.trim().to_string())
        .unwrap_or_default()
}

/// Stateless backend calling the Gemini REST API. The whole message log is
/// replayed on every call.
pub struct GeminiBackend {
    http: reqwest::Client,
    model: RwLock<String>,
    system_prompt: String,
    credentials: Arc<Credentials>,
    shell: ShellExecutor,
}

impl GeminiBackend {
    pub fn new(config: GeminiConfig, safeguard: Arc<Safeguard>) -> Self {
        let key_file = config.key_file.clone().or_else(default_key_file);
        let api_key = config
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| load_key_file(key_file.as_ref()));
        if api_key.is_empty() {
            tracing::info!("no gemini api key set; will prompt on first use");
        } else {
            tracing::info!(key_len = api_key.len(), "gemini api key loaded");
        }

        let model = if config.model.trim().is_empty() {
            DEFAULT_GEMINI_MODEL.to_string()
        } else {
            config.model.trim().to_string()
        };
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        let shell = ShellExecutor::new(
            ShellPolicy {
                work_dir: config.work_dir.clone(),
                timeout: config.command_timeout,
                track_working_directory: true,
                background_after: Some(BACKGROUND_AFTER),
            },
            safeguard,
        );
        tracing::info!(model = %model, work_dir = %config.work_dir.display(), "gemini backend configured");

        Self {
            http,
            model: RwLock::new(model),
            system_prompt: compose_system_prompt(config.system_prompt.as_deref()),
            credentials: Arc::new(Credentials {
                api_key: RwLock::new(api_key),
                key_file,
            }),
            shell,
        }
    }

    pub fn has_api_key(&self) -> bool {
        !self.credentials.get().is_empty()
    }

    /// The key currently in use, if any.
    pub fn api_key(&self) -> Option<String> {
        Some(self.credentials.get()).filter(|key| !key.is_empty())
    }

    fn current_model(&self) -> String {
        self.model
            .read()
            .map(|m| m.clone())
            .unwrap_or_else(|_| DEFAULT_GEMINI_MODEL.to_string())
    }

    fn build_request(&self, history: &[HistoryMessage], message: &str) -> GenerateRequest {
        let mut contents: Vec<Content> = history
            .iter()
            .map(|m| {
                let role = match m.role {
                    HistoryRole::User => "user",
                    HistoryRole::Model => "model",
                };
                Content::text(Some(role), &m.content)
            })
            .collect();
        let user_text = if history.is_empty() {
            format!("{COMMAND_INSTRUCTION}{message}")
        } else {
            message.to_string()
        };
        contents.push(Content::text(Some("user"), &user_text));

        GenerateRequest {
            system_instruction: Content::text(None, &self.system_prompt),
            contents,
            generation_config: GenerationConfig { temperature: 1.0 },
        }
    }
}

/// Extracts reply text and token usage from a `generateContent` body.
fn interpret_response(status: reqwest::StatusCode, body: &str) -> Result<(String, CallUsage)> {
    let parsed: GenerateResponse = match serde_json::from_str(body) {
        Ok(parsed) => parsed,
        Err(e) => {
            let preview: String = body.chars().take(500).collect();
            if !status.is_success() {
                return Err(BackendError::Http(format!(
                    "gemini status={status} body={preview}"
                )));
            }
            return Err(BackendError::ResponseFormat(format!(
                "unmarshal response: {e}\nraw: {preview}"
            )));
        }
    };

    if let Some(err) = parsed.error {
        return Err(BackendError::Api(format!(
            "gemini API error ({} {}): {}",
            err.code, err.status, err.message
        )));
    }

    let Some(candidate) = parsed.candidates.into_iter().next() else {
        let preview: String = body.chars().take(300).collect();
        return Err(BackendError::ResponseFormat(format!(
            "gemini returned no candidates (raw: {preview})"
        )));
    };
    let text: String = candidate
        .content
        .parts
        .iter()
        .map(|p| p.text.as_str())
        .collect();
    let text = text.trim().to_string();
    if text.is_empty() {
        return Err(BackendError::ResponseFormat(format!(
            "gemini returned empty response (finishReason={})",
            candidate.finish_reason
        )));
    }

    let usage = parsed
        .usage_metadata
        .map(|u| CallUsage {
            input_tokens: u.prompt_token_count,
            output_tokens: u.candidates_token_count,
            cache_read_tokens: u.cached_content_token_count,
            ..CallUsage::default()
        })
        .unwrap_or_default();
    Ok((text, usage))
}

#[async_trait]
impl Backend for GeminiBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Gemini
    }

    #[tracing::instrument(level = "info", skip_all, fields(conversation_id = %conversation_id))]
    async fn send(
        &self,
        conversation_id: &str,
        state: &ConversationState,
        message: &str,
    ) -> Result<BackendReply> {
        let api_key = self.credentials.get();
        if api_key.is_empty() {
            return Err(BackendError::MissingCredentials(
                "gemini api key not set".to_string(),
            ));
        }
        let history: &[HistoryMessage] = match state {
            ConversationState::History(history) => history.as_slice(),
            ConversationState::Token(_) => &[],
        };
        let model = self.current_model();
        let request = self.build_request(history, message);
        tracing::debug!(
            model = %model,
            history_turns = history.len(),
            message_len = message.len(),
            "gemini generateContent"
        );

        let started = Instant::now();
        let response = self
            .http
            .post(format!("{GEMINI_MODELS_URL}/{model}:generateContent"))
            .header(API_KEY_HEADER, api_key.as_str())
            .json(&request)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        let elapsed = started.elapsed();
        tracing::info!(
            status = %status,
            body_len = body.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "gemini response"
        );

        let (text, mut usage) = interpret_response(status, &body)?;
        usage.duration = elapsed;

        let mut next = history.to_vec();
        next.push(HistoryMessage::user(message));
        next.push(HistoryMessage::model(text.clone()));
        Ok(BackendReply {
            text,
            state: ConversationState::History(next),
            usage,
        })
    }

    async fn execute_command(&self, command: &str) -> relay_tools::Result<CommandRun> {
        self.shell.run(command).await
    }

    fn is_auth_error(&self, err: &BackendError) -> bool {
        if matches!(err, BackendError::MissingCredentials(_)) {
            return true;
        }
        let msg = err.to_string().to_ascii_lowercase();
        AUTH_ERROR_MARKERS.iter().any(|marker| msg.contains(marker))
    }

    async fn setup_authentication(&self) -> Result<AuthChallenge> {
        Ok(AuthChallenge {
            prompt: format!(
                "To use Gemini, you need a free API key from Google AI Studio.\n\n\
                 1. Open: {API_KEY_PAGE}\n\
                 2. Click \"Create API key\"\n\
                 3. Copy the key and paste it here as your next message."
            ),
            submitter: Box::new(GeminiKeySubmitter {
                credentials: self.credentials.clone(),
            }),
        })
    }

    fn model(&self) -> Option<String> {
        Some(self.current_model())
    }

    fn set_model(&self, model: &str) -> Result<()> {
        let model = model.trim();
        if model.is_empty() {
            return Err(BackendError::Unsupported("model name is empty".to_string()));
        }
        if let Ok(mut guard) = self.model.write() {
            *guard = model.to_string();
        }
        tracing::info!(model = %model, "gemini model changed");
        Ok(())
    }
}

struct GeminiKeySubmitter {
    credentials: Arc<Credentials>,
}

#[async_trait]
impl CredentialSubmitter for GeminiKeySubmitter {
    async fn submit(self: Box<Self>, credential: &str) -> Result<()> {
        let key = credential.trim();
        if key.is_empty() {
            return Err(BackendError::InvalidCredential("empty API key".to_string()));
        }
        if !key.starts_with(API_KEY_PREFIX) {
            tracing::warn!("submitted text does not look like a gemini api key");
            return Err(BackendError::InvalidCredential(
                "that doesn't look like a valid Gemini API key (should start with AIza)"
                    .to_string(),
            ));
        }
        self.credentials.store(key).await
    }
}
