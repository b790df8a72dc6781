use crate::traits::ChannelAdapter;
use crate::types::{
    APPROVE_ACTION, CallbackId, ConversationId, DENY_ACTION, InboundEvent, InboundEventKind,
    InteractionHandle,
};
use anyhow::Result;
use chrono::Utc;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

const TELEGRAM_CHANNEL_ID: &str = "telegram";
const TELEGRAM_LONG_POLL_TIMEOUT_SECS: &str = "30";
const TELEGRAM_ALLOWED_UPDATES: &str = r#"["message","callback_query"]"#;
const TELEGRAM_NON_TRANSIENT_DELAY: Duration = Duration::from_secs(10);
const TELEGRAM_RETRY_BASE_MS: u64 = 250;
const TELEGRAM_RETRY_MAX_MS: u64 = 30_000;
pub const TELEGRAM_MESSAGE_CHARS_MAX: usize = 4096;
const REDACTED: &str = "[REDACTED]";

#[derive(Clone)]
pub struct TelegramAdapter {
    http: reqwest::Client,
    bot_token: String,
    /// Values scrubbed from every outbound text. Always includes the bot token.
    secrets: Arc<RwLock<Vec<String>>>,
}

impl TelegramAdapter {
    pub fn new(bot_token: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            bot_token: bot_token.to_string(),
            secrets: Arc::new(RwLock::new(vec![bot_token.to_string()])),
        })
    }

    pub fn with_redacted_secrets(self, secrets: impl IntoIterator<Item = String>) -> Self {
        for secret in secrets {
            self.add_secret(&secret);
        }
        self
    }

    fn add_secret(&self, secret: &str) {
        let secret = secret.trim();
        if secret.is_empty() {
            return;
        }
        if let Ok(mut secrets) = self.secrets.write() {
            if !secrets.iter().any(|known| known == secret) {
                secrets.push(secret.to_string());
            }
        }
    }

    fn api_url(&self, method: &str) -> Result<Url> {
        Ok(Url::parse(&format!(
            "https://api.telegram.org/bot{}/{}",
            self.bot_token, method
        ))?)
    }

    fn redact(&self, text: &str) -> String {
        match self.secrets.read() {
            Ok(secrets) => redact_secrets(text, &secrets),
            Err(_) => redact_secrets(text, std::slice::from_ref(&self.bot_token)),
        }
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: serde_json::Value) -> Result<T> {
        let url = self.api_url(method)?;
        let resp = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.request_error(method, e))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| self.request_error(method, e))?;
        if !status.is_success() {
            return Err(anyhow::anyhow!(
                "telegram {method} failed: status={status} body={}",
                self.redact(&text)
            ));
        }
        let parsed: TelegramApiResponse<T> = serde_json::from_str(&text)?;
        match parsed.result {
            Some(result) if parsed.ok => Ok(result),
            _ => Err(anyhow::anyhow!(
                "telegram {method} rejected: {}",
                parsed.description.unwrap_or_default()
            )),
        }
    }

    /// Request errors drop the URL, which embeds the bot token.
    fn request_error(&self, method: &str, e: reqwest::Error) -> anyhow::Error {
        anyhow::anyhow!(
            "telegram {method} request failed: {}",
            self.redact(&e.without_url().to_string())
        )
    }

    /// Identity check used at startup.
    pub async fn get_me(&self) -> Result<String> {
        let me: TelegramUser = self.call("getMe", serde_json::json!({})).await?;
        Ok(me.username.unwrap_or_else(|| me.id.to_string()))
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn channel_id(&self) -> &str {
        TELEGRAM_CHANNEL_ID
    }

    fn register_secret(&self, secret: &str) {
        self.add_secret(secret);
    }

    async fn start(&self, tx: mpsc::Sender<InboundEvent>) -> Result<()> {
        let adapter = self.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.run_poll_loop(tx).await {
                tracing::error!(%e, "telegram poll loop exited");
            }
        });
        Ok(())
    }

    async fn send_text(&self, recipient: &ConversationId, text: &str) -> Result<()> {
        let text = self.redact(text);
        for chunk in split_message(&text, TELEGRAM_MESSAGE_CHARS_MAX) {
            let body = serde_json::json!({
                "chat_id": recipient.as_str(),
                "text": chunk,
            });
            let _: serde_json::Value = self.call("sendMessage", body).await?;
        }
        Ok(())
    }

    async fn send_typing(&self, recipient: &ConversationId) -> Result<()> {
        let body = serde_json::json!({
            "chat_id": recipient.as_str(),
            "action": "typing",
        });
        let _: serde_json::Value = self.call("sendChatAction", body).await?;
        Ok(())
    }

    async fn present_approval(
        &self,
        recipient: &ConversationId,
        prompt: &str,
    ) -> Result<InteractionHandle> {
        let text = truncate_chars(&self.redact(prompt), TELEGRAM_MESSAGE_CHARS_MAX);
        let body = serde_json::json!({
            "chat_id": recipient.as_str(),
            "text": text,
            "reply_markup": approval_keyboard(),
        });
        let sent: TelegramMessage = self.call("sendMessage", body).await?;
        let message_id = sent
            .message_id
            .ok_or_else(|| anyhow::anyhow!("telegram sendMessage returned no message_id"))?;
        Ok(InteractionHandle {
            conversation_id: recipient.clone(),
            message_id: message_id.to_string().into(),
        })
    }

    async fn edit_to_remove_interaction(
        &self,
        handle: &InteractionHandle,
        final_text: &str,
    ) -> Result<()> {
        let text = truncate_chars(&self.redact(final_text), TELEGRAM_MESSAGE_CHARS_MAX);
        let body = serde_json::json!({
            "chat_id": handle.conversation_id.as_str(),
            "message_id": handle.message_id.as_str().parse::<i64>()?,
            "text": text,
            "reply_markup": { "inline_keyboard": [] },
        });
        let _: serde_json::Value = self.call("editMessageText", body).await?;
        Ok(())
    }

    async fn answer_interaction(&self, callback_id: &CallbackId, text: &str) -> Result<()> {
        let body = serde_json::json!({
            "callback_query_id": callback_id.as_str(),
            "text": text,
        });
        let _: bool = self.call("answerCallbackQuery", body).await?;
        Ok(())
    }

    fn supports_typing_events(&self) -> bool {
        true
    }
}

impl TelegramAdapter {
    #[tracing::instrument(level = "info", skip_all)]
    async fn run_poll_loop(&self, tx: mpsc::Sender<InboundEvent>) -> Result<()> {
        let mut offset: i64 = 0;
        let mut consecutive_failures: u32 = 0;

        loop {
            let url = self.api_url("getUpdates")?;
            let response = match self
                .http
                .get(url)
                .query(&[
                    ("timeout", TELEGRAM_LONG_POLL_TIMEOUT_SECS),
                    ("offset", &offset.to_string()),
                    ("allowed_updates", TELEGRAM_ALLOWED_UPDATES),
                ])
                .send()
                .await
            {
                Ok(response) => response,
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        error = %self.redact(&error.without_url().to_string()),
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates request failed; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_else(|error| {
                    format!("<failed to read telegram error body: {error}>")
                });
                if is_transient_status(status) {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %status,
                        %body,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates transient failure; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                } else {
                    consecutive_failures = 0;
                    tracing::error!(
                        %status,
                        %body,
                        ?TELEGRAM_NON_TRANSIENT_DELAY,
                        "telegram getUpdates non-transient failure; keeping poll loop alive"
                    );
                    tokio::time::sleep(TELEGRAM_NON_TRANSIENT_DELAY).await;
                }
                continue;
            }

            let parsed = match response
                .json::<TelegramApiResponse<Vec<TelegramUpdate>>>()
                .await
            {
                Ok(parsed) => parsed,
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates payload parse failed; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            consecutive_failures = 0;

            let mut updates = parsed.result.unwrap_or_default();
            updates.sort_by_key(|update| update.update_id);
            for update in updates {
                // Advance offset before conversion to avoid poison-update replay loops.
                if update.update_id < offset {
                    continue;
                }
                offset = update.update_id.saturating_add(1);

                if let Some(event) = build_inbound_event(&update) {
                    tracing::debug!(
                        update_id = update.update_id,
                        conversation_id = %event.conversation_id,
                        "telegram update received"
                    );
                    tx.send(event)
                        .await
                        .map_err(|e| anyhow::anyhow!("telegram inbound queue closed: {e}"))?;
                }
            }
        }
    }
}

fn approval_keyboard() -> serde_json::Value {
    serde_json::json!({
        "inline_keyboard": [[
            { "text": "Approve", "callback_data": APPROVE_ACTION },
            { "text": "Deny", "callback_data": DENY_ACTION },
        ]]
    })
}

fn transient_retry_delay(attempt: u32) -> Duration {
    let multiplier = 1_u64 << attempt.saturating_sub(1).min(10);
    Duration::from_millis((TELEGRAM_RETRY_BASE_MS * multiplier).min(TELEGRAM_RETRY_MAX_MS))
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn redact_secrets(text: &str, secrets: &[String]) -> String {
    secrets
        .iter()
        .filter(|secret| !secret.is_empty())
        .fold(text.to_string(), |acc, secret| acc.replace(secret.as_str(), REDACTED))
}

/// Splits text into chunks of at most `max_chars` characters, preferring to
/// break after a newline, then after a space.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text;
    while rest.chars().count() > max_chars {
        let hard_end = rest
            .char_indices()
            .nth(max_chars)
            .map(|(idx, _)| idx)
            .unwrap_or(rest.len());
        let window = &rest[..hard_end];
        let split_at = match window.rfind('\n') {
            Some(idx) if idx > 0 => idx + 1,
            _ => match window.rfind(' ') {
                Some(idx) if idx > 0 => idx + 1,
                _ => hard_end,
            },
        };
        chunks.push(rest[..split_at].to_string());
        rest = &rest[split_at..];
    }
    if !rest.is_empty() || chunks.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

fn build_inbound_event(update: &TelegramUpdate) -> Option<InboundEvent> {
    if let Some(callback) = update.callback_query.as_ref() {
        return build_decision_event(callback);
    }
    build_message_event(update.message.as_ref()?)
}

fn build_message_event(message: &TelegramMessage) -> Option<InboundEvent> {
    let chat = message.chat.as_ref()?;
    let kind = match extract_message_text(message) {
        Some(text) => InboundEventKind::Message { text },
        None if message.has_non_text_payload() => InboundEventKind::Unsupported,
        None => return None,
    };
    Some(InboundEvent {
        conversation_id: chat.id.to_string().into(),
        sender_id: message.from.as_ref().map(|user| user.id.to_string().into()),
        kind,
        received_at: Utc::now(),
    })
}

fn build_decision_event(callback: &TelegramCallbackQuery) -> Option<InboundEvent> {
    let message = callback.message.as_ref()?;
    let chat = message.chat.as_ref()?;
    let approved = match callback.data.as_deref()? {
        APPROVE_ACTION => true,
        DENY_ACTION => false,
        other => {
            tracing::debug!(data = %other, "ignoring unknown callback data");
            return None;
        }
    };
    let conversation_id: ConversationId = chat.id.to_string().into();
    Some(InboundEvent {
        conversation_id: conversation_id.clone(),
        sender_id: callback.from.as_ref().map(|user| user.id.to_string().into()),
        kind: InboundEventKind::Decision {
            approved,
            interaction: InteractionHandle {
                conversation_id,
                message_id: message.message_id?.to_string().into(),
            },
            callback_id: callback.id.clone().into(),
        },
        received_at: Utc::now(),
    })
}

fn extract_message_text(message: &TelegramMessage) -> Option<String> {
    [message.text.as_deref(), message.caption.as_deref()]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|text| !text.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Deserialize)]
struct TelegramApiResponse<T> {
    #[serde(default)]
    ok: bool,
    #[serde(default = "Option::default")]
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<TelegramMessage>,
    #[serde(default)]
    callback_query: Option<TelegramCallbackQuery>,
}

#[derive(Debug, Default, Deserialize)]
struct TelegramMessage {
    #[serde(default)]
    message_id: Option<i64>,
    #[serde(default)]
    from: Option<TelegramUser>,
    #[serde(default)]
    chat: Option<TelegramChat>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    photo: Vec<serde_json::Value>,
    #[serde(default)]
    sticker: Option<serde_json::Value>,
    #[serde(default)]
    audio: Option<serde_json::Value>,
    #[serde(default)]
    document: Option<serde_json::Value>,
    #[serde(default)]
    video: Option<serde_json::Value>,
    #[serde(default)]
    voice: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TelegramCallbackQuery {
    id: String,
    #[serde(default)]
    from: Option<TelegramUser>,
    #[serde(default)]
    message: Option<TelegramMessage>,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramUser {
    id: i64,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
}

impl TelegramMessage {
    fn has_non_text_payload(&self) -> bool {
        !self.photo.is_empty()
            || self.sticker.is_some()
            || self.audio.is_some()
            || self.document.is_some()
            || self.video.is_some()
            || self.voice.is_some()
    }
}
