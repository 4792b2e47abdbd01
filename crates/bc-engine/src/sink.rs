use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use bc_common::MessageType;

/// Payload delivered to every recipient of a broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePayload {
    pub message_type: MessageType,
    /// Message text, or the caption for media messages
    pub content: String,
    pub media_ref: Option<String>,
}

/// Acknowledgement returned by the transport for one delivered message
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Transport not ready")]
    NotReady,

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Outbound transport the dispatch loop delivers through.
///
/// Implementations are shared by every running broadcast and must tolerate
/// concurrent calls. No timeout is imposed on a send by the engine.
#[async_trait]
pub trait RecipientSink: Send + Sync {
    /// Whether the transport can currently accept sends
    fn is_ready(&self) -> bool;

    async fn send_text(&self, recipient: &str, text: &str) -> Result<DeliveryReceipt, DeliveryError>;

    async fn send_media(
        &self,
        recipient: &str,
        media_type: MessageType,
        media_ref: &str,
        caption: &str,
    ) -> Result<DeliveryReceipt, DeliveryError>;
}

/// Deliver `payload` to one recipient using the call matching its type
pub async fn deliver(
    sink: &dyn RecipientSink,
    recipient: &str,
    payload: &MessagePayload,
) -> Result<DeliveryReceipt, DeliveryError> {
    match (payload.message_type, payload.media_ref.as_deref()) {
        (MessageType::Text, _) => sink.send_text(recipient, &payload.content).await,
        (media_type, Some(media_ref)) => {
            sink.send_media(recipient, media_type, media_ref, &payload.content)
                .await
        }
        (media_type, None) => Err(DeliveryError::Transport(format!(
            "{} message without media reference",
            media_type
        ))),
    }
}
