use std::collections::HashMap;
use std::sync::Arc;

use log::debug;

use crate::directory::Directory;
use crate::error::ChatError;
use crate::model::{ConversationView, MemberPreview, MessagePreview, Role};
use crate::store::{ConversationRecord, InitialMessage, NewConversation, NewMember, Store};

/// Creates or reuses conversations and produces normalized views.
///
/// Every validation step runs before the first mutating call, so a failed
/// request never leaves a partial conversation behind.
pub struct ConversationResolver {
    store: Arc<dyn Store>,
    directory: Arc<dyn Directory>,
}

impl ConversationResolver {
    pub fn new(store: Arc<dyn Store>, directory: Arc<dyn Directory>) -> Self {
        ConversationResolver { store, directory }
    }

    pub async fn create_or_reuse(
        &self,
        creator_id: &str,
        participant_emails: &[String],
        explicit_group_flag: bool,
        name: Option<String>,
        initial_message: Option<String>,
    ) -> Result<ConversationView, ChatError> {
        // Resolve participants first so an unknown email fails the whole
        // request before anything else happens.
        let mut resolved: HashMap<String, String> = HashMap::new();
        for email in participant_emails {
            let lowered = email.to_lowercase();
            match self.directory.resolve_by_email(&lowered).await? {
                Some(user_id) => {
                    resolved.insert(lowered, user_id);
                }
                None => return Err(ChatError::UnknownParticipant(email.clone())),
            }
        }

        let creator = self
            .directory
            .profile(creator_id)
            .await?
            .ok_or(ChatError::UnknownCreator)?;
        let creator_email = creator.email.to_lowercase();
        resolved.insert(creator_email.clone(), creator.id.clone());

        // Deduplicated member emails, participants first, creator appended.
        let mut unique_emails: Vec<String> = Vec::new();
        for email in participant_emails {
            let lowered = email.to_lowercase();
            if !unique_emails.contains(&lowered) {
                unique_emails.push(lowered);
            }
        }
        if !unique_emails.contains(&creator_email) {
            unique_emails.push(creator_email.clone());
        }

        if unique_emails.len() < 2 {
            return Err(ChatError::InsufficientMembers);
        }

        let is_group = explicit_group_flag || unique_emails.len() > 2;

        if !is_group {
            let ids: Vec<&String> = unique_emails
                .iter()
                .map(|email| &resolved[email])
                .collect();
            if let Some(existing) = self
                .store
                .find_private_conversation(ids[0], ids[1])
                .await?
            {
                // Reuse path: a supplied initial message is discarded,
                // matching current product behavior.
                debug!(
                    "reusing private conversation {} for {creator_id}",
                    existing.conversation.id
                );
                return self.view(&existing.conversation.id, creator_id).await;
            }
        }

        if is_group && name.is_none() {
            return Err(ChatError::MissingGroupName);
        }
        if is_group && initial_message.is_some() {
            return Err(ChatError::GroupWithInitialMessage);
        }

        let members: Vec<NewMember> = unique_emails
            .iter()
            .map(|email| NewMember {
                user_id: resolved[email].clone(),
                email: email.clone(),
                role: if is_group {
                    if *email == creator_email {
                        Some(Role::Admin)
                    } else {
                        Some(Role::Member)
                    }
                } else {
                    None
                },
            })
            .collect();

        let record = self
            .store
            .create_conversation(NewConversation {
                name: if is_group { name } else { None },
                is_group,
                members,
                initial_message: initial_message.map(|content| InitialMessage {
                    sender_id: creator.id.clone(),
                    content,
                }),
            })
            .await?;

        self.view(&record.conversation.id, creator_id).await
    }

    /// Conversations containing the user, most recently updated first.
    pub async fn list_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<ConversationView>, ChatError> {
        let records = self.store.conversations_for_user(user_id).await?;
        let mut views = Vec::with_capacity(records.len());
        for record in records {
            views.push(self.view_from_record(&record, user_id).await?);
        }
        Ok(views)
    }

    /// Normalized view of one conversation from the viewer's perspective.
    pub async fn view(
        &self,
        conversation_id: &str,
        viewer_id: &str,
    ) -> Result<ConversationView, ChatError> {
        let record = self
            .store
            .conversation(conversation_id)
            .await?
            .ok_or(ChatError::ConversationNotFound)?;
        self.view_from_record(&record, viewer_id).await
    }

    async fn view_from_record(
        &self,
        record: &ConversationRecord,
        viewer_id: &str,
    ) -> Result<ConversationView, ChatError> {
        let others: Vec<_> = record
            .members
            .iter()
            .filter(|m| m.user_id != viewer_id)
            .collect();

        let name = if record.conversation.is_group {
            record.conversation.name.clone()
        } else {
            // Counterpart display name, falling back to their email.
            match others.first() {
                Some(counterpart) => {
                    match self.directory.profile(&counterpart.user_id).await? {
                        Some(profile) => {
                            Some(profile.display_name.unwrap_or(profile.email))
                        }
                        None => Some(counterpart.email.clone()),
                    }
                }
                None => None,
            }
        };

        let mut previews = Vec::new();
        for member in others.iter().take(3) {
            let avatar_url = self
                .directory
                .profile(&member.user_id)
                .await?
                .and_then(|p| p.avatar_url);
            previews.push(MemberPreview {
                id: member.user_id.clone(),
                email: member.email.clone(),
                avatar_url,
            });
        }

        let latest_message = match self
            .store
            .latest_message(&record.conversation.id)
            .await?
        {
            Some(message) => MessagePreview {
                content: Some(message.content),
                status: Some(message.status),
            },
            None => MessagePreview::default(),
        };

        Ok(ConversationView {
            id: record.conversation.id.clone(),
            name,
            latest_message,
            member_count: record.members.len(),
            members: previews,
            is_group: record.conversation.is_group,
        })
    }
}
