use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role of a member inside a group conversation. Private conversations
/// carry no role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Admin,
    Member,
}

/// Delivery state of a message. Transitions are monotonic:
/// Sent -> Delivered -> Read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub is_group: bool,
    /// Present iff the conversation is a group.
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub conversation_id: String,
    pub user_id: String,
    pub email: String,
    pub role: Option<Role>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub status: MessageStatus,
    /// Recipient set snapshot, fixed at send time: conversation members
    /// minus the sender. Status recompute reads this, never live
    /// membership.
    pub recipients: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Profile as exposed by the directory collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberPreview {
    pub id: String,
    pub email: String,
    pub avatar_url: Option<String>,
}

/// Latest-message preview; both fields null for an empty conversation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePreview {
    pub content: Option<String>,
    pub status: Option<MessageStatus>,
}

/// Normalized conversation as returned to clients. `name` is the stored
/// group name, or the counterpart's display name or email for private
/// conversations. `members` holds up to 3 previews excluding the viewer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationView {
    pub id: String,
    pub name: Option<String>,
    pub latest_message: MessagePreview,
    pub member_count: usize,
    pub members: Vec<MemberPreview>,
    pub is_group: bool,
}
