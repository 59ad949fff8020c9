use std::sync::Arc;

use log::debug;

use crate::error::ChatError;
use crate::events::ServerEvent;
use crate::model::Message;
use crate::registry::ConnectionRegistry;
use crate::store::Store;

/// Persists new messages and fans them out to the conversation room.
///
/// The recipient set is snapshotted at send time (members minus sender)
/// and stored with the message, so later membership changes never affect
/// its delivery accounting. A persistence failure is returned to the
/// caller before any broadcast happens.
pub struct MessageBroadcaster {
    store: Arc<dyn Store>,
    registry: Arc<ConnectionRegistry>,
}

impl MessageBroadcaster {
    pub fn new(store: Arc<dyn Store>, registry: Arc<ConnectionRegistry>) -> Self {
        MessageBroadcaster { store, registry }
    }

    pub async fn send(
        &self,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
    ) -> Result<Message, ChatError> {
        let record = self
            .store
            .conversation(conversation_id)
            .await?
            .ok_or(ChatError::ConversationNotFound)?;

        let recipients: Vec<String> = record
            .members
            .iter()
            .filter(|m| m.user_id != sender_id)
            .map(|m| m.user_id.clone())
            .collect();

        let message = self
            .store
            .create_message(conversation_id, sender_id, content, recipients)
            .await?;
        debug!(
            "message {} persisted for conversation {conversation_id}",
            message.id
        );

        self.registry
            .send_to_room(
                conversation_id,
                &ServerEvent::NewMessage {
                    message: message.clone(),
                },
            )
            .await;
        Ok(message)
    }
}
