use std::sync::Arc;

use chrono::Utc;
use log::{info, warn};

use crate::auth::{Handshake, TokenVerifier};
use crate::delivery::DeliveryTracker;
use crate::error::ChatError;
use crate::events::{GroupEventKind, ServerEvent};
use crate::registry::{group_room, ConnectionRegistry, EventSender};
use crate::store::Store;

/// Identity of an authenticated connection, established once during the
/// handshake and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    pub connection_id: String,
    pub user_id: String,
    pub email: String,
}

/// Ties user identities to live connections and room memberships: the
/// connect/disconnect lifecycle, offline-message replay, and ad-hoc group
/// rooms.
pub struct PresenceRouter {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn Store>,
    verifier: Arc<dyn TokenVerifier>,
    tracker: Arc<DeliveryTracker>,
}

impl PresenceRouter {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn Store>,
        verifier: Arc<dyn TokenVerifier>,
        tracker: Arc<DeliveryTracker>,
    ) -> Self {
        PresenceRouter {
            registry,
            store,
            verifier,
            tracker,
        }
    }

    /// Authenticates the handshake and brings the connection online:
    /// registers it, persists the presence transition, joins conversation
    /// rooms, replays undelivered messages, and announces presence.
    ///
    /// Authentication failures are returned so the caller can close the
    /// connection; no structured error payload is sent in that case.
    pub async fn connect(
        &self,
        handshake: &Handshake,
        connection_id: &str,
        sender: EventSender,
    ) -> Result<ConnectionContext, ChatError> {
        let token = handshake.bearer_token().ok_or(ChatError::Unauthenticated)?;
        let claims = self.verifier.verify(token).await?;

        let ctx = ConnectionContext {
            connection_id: connection_id.to_string(),
            user_id: claims.subject,
            email: claims.email,
        };

        let first_for_user = self
            .registry
            .register(connection_id, &ctx.user_id, sender)
            .await;

        if let Err(err) = self.bring_online(&ctx, first_for_user).await {
            // Roll the registration back so a half-connected socket never
            // lingers in the presence map.
            let _ = self.registry.unregister(connection_id).await;
            return Err(err);
        }

        info!(
            "user {} connected with connection {connection_id}",
            ctx.user_id
        );
        Ok(ctx)
    }

    async fn bring_online(
        &self,
        ctx: &ConnectionContext,
        first_for_user: bool,
    ) -> Result<(), ChatError> {
        if first_for_user {
            self.store
                .set_presence(&ctx.user_id, true, Utc::now())
                .await?;
        }

        for record in self.store.conversations_for_user(&ctx.user_id).await? {
            self.registry
                .join_room(&record.conversation.id, &ctx.connection_id)
                .await;
        }

        self.replay_undelivered(ctx).await?;

        if first_for_user {
            self.registry
                .broadcast_all(&ServerEvent::Presence {
                    user_id: ctx.user_id.clone(),
                    online: true,
                })
                .await;
        }
        Ok(())
    }

    /// Pushes every message the user missed while offline to the new
    /// connection, acknowledges each, and notifies the sender once per
    /// message whose status actually advanced.
    async fn replay_undelivered(&self, ctx: &ConnectionContext) -> Result<(), ChatError> {
        let missed = self.tracker.find_undelivered(&ctx.user_id).await?;
        if missed.is_empty() {
            return Ok(());
        }
        info!(
            "replaying {} undelivered messages to user {}",
            missed.len(),
            ctx.user_id
        );
        for message in missed {
            let message_id = message.id.clone();
            self.registry
                .send_to_connection(
                    &ctx.connection_id,
                    &ServerEvent::NewMessage { message },
                )
                .await;
            let outcome = self.tracker.mark_delivered(&message_id, &ctx.user_id).await?;
            if let Some(status) = outcome.advanced {
                self.registry
                    .send_to_user(
                        &outcome.sender_id,
                        &ServerEvent::StatusUpdated { message_id, status },
                    )
                    .await;
            }
        }
        Ok(())
    }

    /// Takes the connection offline. The user is only marked offline and
    /// announced as such when this was their last live connection, so a
    /// second device keeps the user online.
    pub async fn disconnect(&self, ctx: &ConnectionContext) {
        let Some(disconnected) = self.registry.unregister(&ctx.connection_id).await else {
            return;
        };
        info!(
            "user {} disconnected connection {}",
            ctx.user_id, ctx.connection_id
        );
        if !disconnected.last_for_user {
            return;
        }
        if let Err(err) = self
            .store
            .set_presence(&ctx.user_id, false, Utc::now())
            .await
        {
            warn!("failed to persist offline presence for {}: {err}", ctx.user_id);
        }
        self.registry
            .broadcast_all(&ServerEvent::Presence {
                user_id: ctx.user_id.clone(),
                online: false,
            })
            .await;
    }

    pub async fn send_to_user(&self, user_id: &str, event: &ServerEvent) {
        self.registry.send_to_user(user_id, event).await;
    }

    /// Adds the user to the group roster, joins the calling connection to
    /// the group room, and announces the join to the room.
    pub async fn join_group(&self, ctx: &ConnectionContext, group_id: &str) {
        self.registry.add_group_member(group_id, &ctx.user_id).await;
        self.registry
            .join_room(&group_room(group_id), &ctx.connection_id)
            .await;
        self.registry
            .send_to_room(
                &group_room(group_id),
                &ServerEvent::GroupEvent {
                    kind: GroupEventKind::Join,
                    user_id: ctx.user_id.clone(),
                    group_id: group_id.to_string(),
                },
            )
            .await;
    }

    /// Removes the user from the roster and the connection from the room,
    /// then announces the leave to the remaining members.
    pub async fn leave_group(&self, ctx: &ConnectionContext, group_id: &str) {
        self.registry
            .remove_group_member(group_id, &ctx.user_id)
            .await;
        self.registry
            .leave_room(&group_room(group_id), &ctx.connection_id)
            .await;
        self.registry
            .send_to_room(
                &group_room(group_id),
                &ServerEvent::GroupEvent {
                    kind: GroupEventKind::Leave,
                    user_id: ctx.user_id.clone(),
                    group_id: group_id.to_string(),
                },
            )
            .await;
    }
}
