//! Outbound message transport.

use async_trait::async_trait;
use cadence_core::MessageId;
use cadence_workflow::messaging::{MessageSender, OutboundMessage, SendError, SentMessage};
use chrono::Utc;
use tracing::info;

/// Transport that records sends in the log instead of calling a
/// provider. Used until SMS and email providers are wired up.
pub struct LoggingSender;

#[async_trait]
impl MessageSender for LoggingSender {
    async fn send(&self, message: OutboundMessage) -> Result<SentMessage, SendError> {
        let receipt = SentMessage {
            message_id: MessageId::new(),
            sent_at: Utc::now(),
        };
        info!(
            contact = %message.contact_id,
            channel = %message.channel,
            to = %message.to,
            message = %receipt.message_id,
            "outbound message dispatched"
        );
        Ok(receipt)
    }
}
