//! Inbound dispatch: every transport event becomes a command reply, a new
//! turn, or an approval decision.

use crate::commands;
use crate::orchestrator::Orchestrator;
use anyhow::Result;
use relay_channels::{ChannelAdapter, ConversationId, InboundEvent, InboundEventKind};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct Gateway {
    allowed: HashSet<String>,
    channel: Arc<dyn ChannelAdapter>,
    orchestrator: Arc<Orchestrator>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<InboundEvent>>,
}

impl Gateway {
    pub fn new(
        allowed_chat_ids: &[i64],
        channel: Arc<dyn ChannelAdapter>,
        orchestrator: Arc<Orchestrator>,
        inbound_rx: mpsc::Receiver<InboundEvent>,
    ) -> Self {
        Self {
            allowed: allowed_chat_ids.iter().map(i64::to_string).collect(),
            channel,
            orchestrator,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
        }
    }

    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run_loop().await {
                tracing::error!(%e, "gateway loop exited");
            }
        })
    }

    /// Events for different conversations are handled concurrently; the
    /// orchestrator serializes work within one conversation.
    #[tracing::instrument(level = "info", skip_all)]
    async fn run_loop(self: &Arc<Self>) -> Result<()> {
        loop {
            let event = {
                let mut rx = self.inbound_rx.lock().await;
                rx.recv().await
            };
            let Some(event) = event else {
                tracing::info!("inbound channel closed");
                return Ok(());
            };

            let gateway = self.clone();
            tokio::spawn(async move {
                if let Err(e) = gateway.handle_inbound(event).await {
                    tracing::warn!(%e, "handle_inbound failed");
                }
            });
        }
    }

    fn is_allowed(&self, conversation_id: &ConversationId) -> bool {
        self.allowed.contains(conversation_id.as_str())
    }

    #[tracing::instrument(level = "info", skip_all, fields(conversation_id = %event.conversation_id))]
    async fn handle_inbound(&self, event: InboundEvent) -> Result<()> {
        let conversation_id = event.conversation_id;
        if !self.is_allowed(&conversation_id) {
            tracing::warn!("rejected message from unauthorized chat");
            return self
                .channel
                .send_text(
                    &conversation_id,
                    &format!("Unauthorized. Your chat ID: {conversation_id}"),
                )
                .await;
        }

        match event.kind {
            InboundEventKind::Message { text } => {
                if let Some(reply) =
                    commands::handle_command(&self.orchestrator, &conversation_id, &text).await
                {
                    return self.channel.send_text(&conversation_id, &reply).await;
                }
                self.orchestrator.submit(&conversation_id, &text).await;
            }
            InboundEventKind::Decision {
                approved,
                interaction,
                callback_id,
            } => {
                self.orchestrator
                    .resolve(&conversation_id, approved, &interaction, &callback_id)
                    .await;
            }
            InboundEventKind::Unsupported => {
                self.channel
                    .send_text(&conversation_id, "Only text messages are supported.")
                    .await?;
            }
        }
        Ok(())
    }
}
