use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{Conversation, Member, Message, MessageStatus, Role};

pub struct NewMember {
    pub user_id: String,
    pub email: String,
    pub role: Option<Role>,
}

pub struct InitialMessage {
    pub sender_id: String,
    pub content: String,
}

/// Everything needed to create a conversation atomically: members with
/// their roles, and for private conversations optionally a first message.
pub struct NewConversation {
    pub name: Option<String>,
    pub is_group: bool,
    pub members: Vec<NewMember>,
    pub initial_message: Option<InitialMessage>,
}

#[derive(Debug, Clone)]
pub struct ConversationRecord {
    pub conversation: Conversation,
    pub members: Vec<Member>,
}

impl ConversationRecord {
    pub fn member_ids(&self) -> HashSet<String> {
        self.members.iter().map(|m| m.user_id.clone()).collect()
    }
}

/// Durable presence projection for a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRow {
    pub online: bool,
    pub last_seen_at: DateTime<Utc>,
}

/// Persistence gateway. The storage engine itself is an external
/// collaborator; this trait is its contract. Delivery/read upserts are
/// insert-or-ignore per (message, user) pair and report whether a row was
/// actually inserted.
#[async_trait]
pub trait Store: Send + Sync {
    async fn find_private_conversation(
        &self,
        user_a: &str,
        user_b: &str,
    ) -> Result<Option<ConversationRecord>, StoreError>;

    async fn create_conversation(
        &self,
        new: NewConversation,
    ) -> Result<ConversationRecord, StoreError>;

    async fn conversation(&self, id: &str) -> Result<Option<ConversationRecord>, StoreError>;

    /// Conversations containing the user, most recently updated first.
    async fn conversations_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<ConversationRecord>, StoreError>;

    async fn create_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
        recipients: Vec<String>,
    ) -> Result<Message, StoreError>;

    async fn message(&self, id: &str) -> Result<Option<Message>, StoreError>;

    async fn latest_message(&self, conversation_id: &str)
        -> Result<Option<Message>, StoreError>;

    async fn record_delivery(&self, message_id: &str, user_id: &str)
        -> Result<bool, StoreError>;

    async fn record_read(&self, message_id: &str, user_id: &str) -> Result<bool, StoreError>;

    async fn delivered_by(&self, message_id: &str) -> Result<HashSet<String>, StoreError>;

    async fn read_by(&self, message_id: &str) -> Result<HashSet<String>, StoreError>;

    async fn set_message_status(
        &self,
        message_id: &str,
        status: MessageStatus,
    ) -> Result<(), StoreError>;

    /// Messages addressed to the user that carry no delivery record for
    /// them, oldest first. Does not mutate anything.
    async fn undelivered_for(&self, user_id: &str) -> Result<Vec<Message>, StoreError>;

    async fn set_presence(
        &self,
        user_id: &str,
        online: bool,
        last_seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn presence(&self, user_id: &str) -> Result<Option<PresenceRow>, StoreError>;
}

/// In-memory store used by tests and the dev binary.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<StoreState>,
}

#[derive(Default)]
struct StoreState {
    conversations: HashMap<String, Conversation>,
    members: HashMap<String, Vec<Member>>,
    messages: HashMap<String, Message>,
    conversation_messages: HashMap<String, Vec<String>>,
    deliveries: HashMap<String, HashSet<String>>,
    reads: HashMap<String, HashSet<String>>,
    presence: HashMap<String, PresenceRow>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }
}

fn record_for(state: &StoreState, id: &str) -> Option<ConversationRecord> {
    let conversation = state.conversations.get(id)?.clone();
    let members = state.members.get(id).cloned().unwrap_or_default();
    Some(ConversationRecord {
        conversation,
        members,
    })
}

fn insert_message(
    state: &mut StoreState,
    conversation_id: &str,
    sender_id: &str,
    content: &str,
    recipients: Vec<String>,
    now: DateTime<Utc>,
) -> Message {
    let message = Message {
        id: Uuid::new_v4().to_string(),
        conversation_id: conversation_id.to_string(),
        sender_id: sender_id.to_string(),
        content: content.to_string(),
        status: MessageStatus::Sent,
        recipients,
        created_at: now,
    };
    state
        .conversation_messages
        .entry(conversation_id.to_string())
        .or_default()
        .push(message.id.clone());
    state.messages.insert(message.id.clone(), message.clone());
    if let Some(conversation) = state.conversations.get_mut(conversation_id) {
        conversation.updated_at = now;
    }
    message
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_private_conversation(
        &self,
        user_a: &str,
        user_b: &str,
    ) -> Result<Option<ConversationRecord>, StoreError> {
        let state = self.inner.read().await;
        let wanted: HashSet<&str> = [user_a, user_b].into_iter().collect();
        for (id, conversation) in &state.conversations {
            if conversation.is_group {
                continue;
            }
            let members = state.members.get(id).map(Vec::as_slice).unwrap_or(&[]);
            let ids: HashSet<&str> = members.iter().map(|m| m.user_id.as_str()).collect();
            if ids == wanted {
                return Ok(record_for(&state, id));
            }
        }
        Ok(None)
    }

    async fn create_conversation(
        &self,
        new: NewConversation,
    ) -> Result<ConversationRecord, StoreError> {
        let mut state = self.inner.write().await;
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let conversation = Conversation {
            id: id.clone(),
            is_group: new.is_group,
            name: new.name,
            created_at: now,
            updated_at: now,
        };
        let members: Vec<Member> = new
            .members
            .into_iter()
            .map(|m| Member {
                conversation_id: id.clone(),
                user_id: m.user_id,
                email: m.email,
                role: m.role,
            })
            .collect();
        state.conversations.insert(id.clone(), conversation);
        state.members.insert(id.clone(), members);
        if let Some(initial) = new.initial_message {
            let recipients: Vec<String> = state
                .members
                .get(&id)
                .map(Vec::as_slice)
                .unwrap_or(&[])
                .iter()
                .filter(|m| m.user_id != initial.sender_id)
                .map(|m| m.user_id.clone())
                .collect();
            insert_message(
                &mut state,
                &id,
                &initial.sender_id,
                &initial.content,
                recipients,
                now,
            );
        }
        record_for(&state, &id).ok_or_else(|| {
            StoreError::WriteFailed("conversation vanished during create".to_string())
        })
    }

    async fn conversation(&self, id: &str) -> Result<Option<ConversationRecord>, StoreError> {
        let state = self.inner.read().await;
        Ok(record_for(&state, id))
    }

    async fn conversations_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<ConversationRecord>, StoreError> {
        let state = self.inner.read().await;
        let mut records: Vec<ConversationRecord> = state
            .conversations
            .keys()
            .filter_map(|id| record_for(&state, id))
            .filter(|record| record.members.iter().any(|m| m.user_id == user_id))
            .collect();
        records.sort_by(|a, b| b.conversation.updated_at.cmp(&a.conversation.updated_at));
        Ok(records)
    }

    async fn create_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
        recipients: Vec<String>,
    ) -> Result<Message, StoreError> {
        let mut state = self.inner.write().await;
        if !state.conversations.contains_key(conversation_id) {
            return Err(StoreError::WriteFailed(format!(
                "unknown conversation {conversation_id}"
            )));
        }
        Ok(insert_message(
            &mut state,
            conversation_id,
            sender_id,
            content,
            recipients,
            Utc::now(),
        ))
    }

    async fn message(&self, id: &str) -> Result<Option<Message>, StoreError> {
        let state = self.inner.read().await;
        Ok(state.messages.get(id).cloned())
    }

    async fn latest_message(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Message>, StoreError> {
        let state = self.inner.read().await;
        Ok(state
            .conversation_messages
            .get(conversation_id)
            .and_then(|ids| ids.last())
            .and_then(|id| state.messages.get(id))
            .cloned())
    }

    async fn record_delivery(
        &self,
        message_id: &str,
        user_id: &str,
    ) -> Result<bool, StoreError> {
        let mut state = self.inner.write().await;
        Ok(state
            .deliveries
            .entry(message_id.to_string())
            .or_default()
            .insert(user_id.to_string()))
    }

    async fn record_read(&self, message_id: &str, user_id: &str) -> Result<bool, StoreError> {
        let mut state = self.inner.write().await;
        Ok(state
            .reads
            .entry(message_id.to_string())
            .or_default()
            .insert(user_id.to_string()))
    }

    async fn delivered_by(&self, message_id: &str) -> Result<HashSet<String>, StoreError> {
        let state = self.inner.read().await;
        Ok(state.deliveries.get(message_id).cloned().unwrap_or_default())
    }

    async fn read_by(&self, message_id: &str) -> Result<HashSet<String>, StoreError> {
        let state = self.inner.read().await;
        Ok(state.reads.get(message_id).cloned().unwrap_or_default())
    }

    async fn set_message_status(
        &self,
        message_id: &str,
        status: MessageStatus,
    ) -> Result<(), StoreError> {
        let mut state = self.inner.write().await;
        match state.messages.get_mut(message_id) {
            Some(message) => {
                message.status = status;
                Ok(())
            }
            None => Err(StoreError::WriteFailed(format!(
                "unknown message {message_id}"
            ))),
        }
    }

    async fn undelivered_for(&self, user_id: &str) -> Result<Vec<Message>, StoreError> {
        let state = self.inner.read().await;
        let mut missed: Vec<Message> = state
            .messages
            .values()
            .filter(|message| message.recipients.iter().any(|r| r == user_id))
            .filter(|message| {
                state
                    .deliveries
                    .get(&message.id)
                    .map_or(true, |acked| !acked.contains(user_id))
            })
            .cloned()
            .collect();
        missed.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(missed)
    }

    async fn set_presence(
        &self,
        user_id: &str,
        online: bool,
        last_seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.inner.write().await;
        state.presence.insert(
            user_id.to_string(),
            PresenceRow {
                online,
                last_seen_at,
            },
        );
        Ok(())
    }

    async fn presence(&self, user_id: &str) -> Result<Option<PresenceRow>, StoreError> {
        let state = self.inner.read().await;
        Ok(state.presence.get(user_id).cloned())
    }
}
