use thiserror::Error;

/// Failure at the persistence gateway boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("storage write rejected: {0}")]
    WriteFailed(String),
}

/// Crate-wide error taxonomy. Authentication errors close the connection;
/// everything else is reported back to the calling connection only.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("missing bearer token")]
    Unauthenticated,
    #[error("token verification failed")]
    InvalidToken,
    #[error("user with email {0} does not exist")]
    UnknownParticipant(String),
    #[error("conversation creator does not exist")]
    UnknownCreator,
    #[error("at least one other member is required")]
    InsufficientMembers,
    #[error("name is required to create a group")]
    MissingGroupName,
    #[error("cannot create a group conversation with an initial message")]
    GroupWithInitialMessage,
    #[error("conversation not found")]
    ConversationNotFound,
    #[error("message not found")]
    MessageNotFound,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ChatError {
    /// Stable wire code used in error payloads and acknowledgements.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Unauthenticated => "unauthenticated",
            ChatError::InvalidToken => "invalid_token",
            ChatError::UnknownParticipant(_) => "unknown_participant",
            ChatError::UnknownCreator => "unknown_creator",
            ChatError::InsufficientMembers => "insufficient_members",
            ChatError::MissingGroupName => "missing_group_name",
            ChatError::GroupWithInitialMessage => "group_with_initial_message",
            ChatError::ConversationNotFound => "conversation_not_found",
            ChatError::MessageNotFound => "message_not_found",
            ChatError::Store(_) => "persistence_failure",
        }
    }

    /// Authentication failures are the only errors that close the
    /// connection instead of producing a structured payload.
    pub fn closes_connection(&self) -> bool {
        matches!(self, ChatError::Unauthenticated | ChatError::InvalidToken)
    }
}
