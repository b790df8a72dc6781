//! In-process fakes for orchestrator tests.

use anyhow::Result;
use async_trait::async_trait;
use relay_channels::{
    CallbackId, ChannelAdapter, ConversationId, InboundEvent, InteractionHandle, MessageId,
};
use relay_llm::{
    AuthChallenge, Backend, BackendError, BackendKind, BackendReply, CallUsage,
    ConversationState, CredentialSubmitter, HistoryMessage,
};
use relay_tools::{CommandRun, RunStatus};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub enum Step {
    Reply(String),
    AuthError,
    Fail(String),
    TimedOut(String),
    Hang,
}

pub struct ScriptedBackend {
    kind: BackendKind,
    script: Mutex<VecDeque<Step>>,
    fallback: Option<String>,
    pub sends: Mutex<Vec<String>>,
    pub tokens_seen: Mutex<Vec<Option<String>>>,
    pub executions: Mutex<Vec<String>>,
    pub codes: Arc<Mutex<Vec<String>>>,
}

impl ScriptedBackend {
    pub fn new(kind: BackendKind, script: impl IntoIterator<Item = Step>) -> Self {
        Self {
            kind,
            script: Mutex::new(script.into_iter().collect()),
            fallback: None,
            sends: Mutex::new(Vec::new()),
            tokens_seen: Mutex::new(Vec::new()),
            executions: Mutex::new(Vec::new()),
            codes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Reply used once the script runs out.
    pub fn with_fallback(mut self, reply: &str) -> Self {
        self.fallback = Some(reply.to_string());
        self
    }

    pub fn sends(&self) -> Vec<String> {
        self.sends.lock().unwrap().clone()
    }

    pub fn executions(&self) -> Vec<String> {
        self.executions.lock().unwrap().clone()
    }

    fn next_step(&self) -> Step {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| self.fallback.clone().map(Step::Reply))
            .unwrap_or_else(|| Step::Reply("ok".to_string()))
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn send(
        &self,
        _conversation_id: &str,
        state: &ConversationState,
        message: &str,
    ) -> relay_llm::Result<BackendReply> {
        self.sends.lock().unwrap().push(message.to_string());
        self.tokens_seen
            .lock()
            .unwrap()
            .push(state.token().map(str::to_string));
        let text = match self.next_step() {
            Step::Reply(text) => text,
            Step::AuthError => {
                return Err(BackendError::MissingCredentials("not logged in".into()));
            }
            Step::Fail(msg) => return Err(BackendError::Api(msg)),
            Step::TimedOut(what) => return Err(BackendError::TimedOut(what)),
            Step::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                String::new()
            }
        };
        let calls = self.sends.lock().unwrap().len();
        let state = match state {
            ConversationState::Token(_) => ConversationState::Token(Some(format!("tok-{calls}"))),
            ConversationState::History(history) => {
                let mut history = history.clone();
                history.push(HistoryMessage::user(message));
                history.push(HistoryMessage::model(text.clone()));
                ConversationState::History(history)
            }
        };
        Ok(BackendReply {
            text,
            state,
            usage: CallUsage {
                input_tokens: 3,
                output_tokens: 2,
                ..CallUsage::default()
            },
        })
    }

    async fn execute_command(&self, command: &str) -> relay_tools::Result<CommandRun> {
        self.executions.lock().unwrap().push(command.to_string());
        Ok(CommandRun {
            output: format!("ran {command}"),
            status: RunStatus::Success,
        })
    }

    fn is_auth_error(&self, err: &BackendError) -> bool {
        matches!(err, BackendError::MissingCredentials(_))
    }

    async fn setup_authentication(&self) -> relay_llm::Result<AuthChallenge> {
        Ok(AuthChallenge {
            prompt: "Send the login code.".to_string(),
            submitter: Box::new(RecordingSubmitter {
                codes: self.codes.clone(),
            }),
        })
    }
}

struct RecordingSubmitter {
    codes: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl CredentialSubmitter for RecordingSubmitter {
    async fn submit(self: Box<Self>, credential: &str) -> relay_llm::Result<()> {
        if credential == "bad" {
            return Err(BackendError::InvalidCredential("rejected".into()));
        }
        self.codes.lock().unwrap().push(credential.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingChannel {
    pub texts: Mutex<Vec<String>>,
    pub approvals: Mutex<Vec<String>>,
    pub edits: Mutex<Vec<String>>,
    pub answers: Mutex<Vec<String>>,
    pub secrets: Mutex<Vec<String>>,
    typing: AtomicUsize,
}

impl RecordingChannel {
    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }

    pub fn approvals(&self) -> Vec<String> {
        self.approvals.lock().unwrap().clone()
    }

    pub fn edits(&self) -> Vec<String> {
        self.edits.lock().unwrap().clone()
    }

    pub fn answers(&self) -> Vec<String> {
        self.answers.lock().unwrap().clone()
    }

    pub fn secrets(&self) -> Vec<String> {
        self.secrets.lock().unwrap().clone()
    }

    pub fn typing_count(&self) -> usize {
        self.typing.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelAdapter for RecordingChannel {
    fn channel_id(&self) -> &str {
        "recording"
    }

    async fn start(&self, _tx: mpsc::Sender<InboundEvent>) -> Result<()> {
        Ok(())
    }

    async fn send_text(&self, _recipient: &ConversationId, text: &str) -> Result<()> {
        self.texts.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn send_typing(&self, _recipient: &ConversationId) -> Result<()> {
        self.typing.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn present_approval(
        &self,
        recipient: &ConversationId,
        prompt: &str,
    ) -> Result<InteractionHandle> {
        let n = {
            let mut approvals = self.approvals.lock().unwrap();
            approvals.push(prompt.to_string());
            approvals.len()
        };
        Ok(InteractionHandle {
            conversation_id: recipient.clone(),
            message_id: MessageId::new(n.to_string()),
        })
    }

    async fn edit_to_remove_interaction(
        &self,
        _handle: &InteractionHandle,
        final_text: &str,
    ) -> Result<()> {
        self.edits.lock().unwrap().push(final_text.to_string());
        Ok(())
    }

    async fn answer_interaction(&self, _callback_id: &CallbackId, text: &str) -> Result<()> {
        self.answers.lock().unwrap().push(text.to_string());
        Ok(())
    }

    fn register_secret(&self, secret: &str) {
        self.secrets.lock().unwrap().push(secret.to_string());
    }

    fn supports_typing_events(&self) -> bool {
        true
    }
}
