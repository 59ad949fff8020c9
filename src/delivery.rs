use std::sync::Arc;

use log::debug;

use crate::error::ChatError;
use crate::model::{Message, MessageStatus};
use crate::store::Store;

/// Result of a delivery or read acknowledgement. `advanced` is set only
/// when the acknowledgement actually moved the message status forward, so
/// callers emit exactly one status event per transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckOutcome {
    pub sender_id: String,
    pub advanced: Option<MessageStatus>,
}

/// Records delivery/read acknowledgements and recomputes message status.
///
/// Acknowledgements are idempotent: the underlying records are
/// insert-or-ignore per (message, user) pair, and the status only ever
/// moves forward. Recompute reads the recipient snapshot taken at send
/// time, never live membership.
pub struct DeliveryTracker {
    store: Arc<dyn Store>,
}

impl DeliveryTracker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        DeliveryTracker { store }
    }

    pub async fn mark_delivered(
        &self,
        message_id: &str,
        user_id: &str,
    ) -> Result<AckOutcome, ChatError> {
        let message = self
            .store
            .message(message_id)
            .await?
            .ok_or(ChatError::MessageNotFound)?;
        self.store.record_delivery(message_id, user_id).await?;

        let mut advanced = None;
        if message.status == MessageStatus::Sent {
            let acked = self.store.delivered_by(message_id).await?;
            if message.recipients.iter().all(|r| acked.contains(r)) {
                self.store
                    .set_message_status(message_id, MessageStatus::Delivered)
                    .await?;
                debug!("message {message_id} delivered to all recipients");
                advanced = Some(MessageStatus::Delivered);
            }
        }

        Ok(AckOutcome {
            sender_id: message.sender_id,
            advanced,
        })
    }

    pub async fn mark_read(
        &self,
        message_id: &str,
        user_id: &str,
    ) -> Result<AckOutcome, ChatError> {
        let message = self
            .store
            .message(message_id)
            .await?
            .ok_or(ChatError::MessageNotFound)?;
        self.store.record_read(message_id, user_id).await?;

        let mut advanced = None;
        if message.status != MessageStatus::Read {
            let acked = self.store.read_by(message_id).await?;
            if message.recipients.iter().all(|r| acked.contains(r)) {
                self.store
                    .set_message_status(message_id, MessageStatus::Read)
                    .await?;
                debug!("message {message_id} read by all recipients");
                advanced = Some(MessageStatus::Read);
            }
        }

        Ok(AckOutcome {
            sender_id: message.sender_id,
            advanced,
        })
    }

    /// Messages the user has not yet acknowledged receipt of, oldest
    /// first. Purely a query: the caller acknowledges each one explicitly.
    pub async fn find_undelivered(&self, user_id: &str) -> Result<Vec<Message>, ChatError> {
        Ok(self.store.undelivered_for(user_id).await?)
    }
}
