use relay_channels::{ChannelAdapter, ConversationId};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const TYPING_INTERVAL: Duration = Duration::from_secs(4);

/// Keeps a typing indicator alive while a backend call is in flight.
///
/// The ticker stops when the heartbeat is dropped, so every exit path of
/// the call it wraps ends it.
pub struct TypingHeartbeat {
    cancel: CancellationToken,
}

impl TypingHeartbeat {
    pub fn start(
        channel: Arc<dyn ChannelAdapter>,
        recipient: ConversationId,
        interval: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = channel.send_typing(&recipient).await {
                            tracing::debug!(%e, conversation_id = %recipient, "typing indicator failed");
                        }
                    }
                }
            }
        });
        Self { cancel }
    }
}

impl Drop for TypingHeartbeat {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingChannel;

    #[tokio::test(start_paused = true)]
    async fn ticks_until_dropped() {
        let channel = Arc::new(RecordingChannel::default());
        let heartbeat = TypingHeartbeat::start(
            channel.clone(),
            ConversationId::new("1"),
            Duration::from_secs(4),
        );

        tokio::time::sleep(Duration::from_secs(9)).await;
        let while_running = channel.typing_count();
        assert!(while_running >= 2, "{while_running}");

        drop(heartbeat);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(channel.typing_count(), while_running);
    }
}
