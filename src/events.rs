use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ChatError;
use crate::model::{ConversationView, Message, MessageStatus};

/// Events a client may send over the socket. The `type` tag selects the
/// handler; serde validates the payload shape before any handler runs.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "message")]
    Broadcast { text: String },
    #[serde(rename = "private-message")]
    Private { to: String, text: String },
    #[serde(rename = "join-conversation", rename_all = "camelCase")]
    JoinConversation { conversation_id: String },
    #[serde(rename = "create-conversation", rename_all = "camelCase")]
    CreateConversation {
        name: Option<String>,
        #[serde(default)]
        participant_emails: Vec<String>,
        is_group: Option<bool>,
        initial_message: Option<String>,
    },
    #[serde(rename = "send-message", rename_all = "camelCase")]
    SendMessage {
        conversation_id: String,
        client_correlation_id: String,
        content: String,
    },
    #[serde(rename = "message:delivered", rename_all = "camelCase")]
    Delivered { message_id: String },
    #[serde(rename = "message:read", rename_all = "camelCase")]
    Read { message_id: String },
    #[serde(rename = "join-group", rename_all = "camelCase")]
    JoinGroup { group_id: String },
    #[serde(rename = "leave-group", rename_all = "camelCase")]
    LeaveGroup { group_id: String },
    #[serde(rename = "group-message", rename_all = "camelCase")]
    GroupMessage { group_id: String, text: String },
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GroupEventKind {
    Join,
    Leave,
}

/// Error payload carried inside acknowledgements and error events.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl From<&ChatError> for ErrorBody {
    fn from(err: &ChatError) -> Self {
        ErrorBody {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Events pushed from the server to clients.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "presence", rename_all = "camelCase")]
    Presence { user_id: String, online: bool },
    #[serde(rename = "message")]
    Broadcast {
        from: String,
        text: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "private-message")]
    Private {
        from: String,
        text: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "new-conversation")]
    NewConversation { conversation: ConversationView },
    #[serde(rename = "create-conversation:ack")]
    CreateConversationAck {
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        conversation: Option<ConversationView>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },
    #[serde(rename = "send-message:ack", rename_all = "camelCase")]
    SendMessageAck {
        status: String,
        client_correlation_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<Message>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },
    #[serde(rename = "new-message")]
    NewMessage { message: Message },
    #[serde(rename = "message:statusUpdated", rename_all = "camelCase")]
    StatusUpdated {
        message_id: String,
        status: MessageStatus,
    },
    // The envelope tag already occupies "type", so the join/leave
    // discriminant is carried as "kind".
    #[serde(rename = "group-event", rename_all = "camelCase")]
    GroupEvent {
        kind: GroupEventKind,
        user_id: String,
        group_id: String,
    },
    #[serde(rename = "group-message", rename_all = "camelCase")]
    GroupMessage {
        from: String,
        group_id: String,
        text: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "error")]
    Error { code: String, message: String },
}

impl ServerEvent {
    pub fn error(err: &ChatError) -> Self {
        ServerEvent::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}
