use std::sync::Arc;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio::sync::mpsc;
use uuid::Uuid;
use warp::ws::{Message as WsMessage, WebSocket};

use crate::auth::{Handshake, TokenVerifier};
use crate::broadcast::MessageBroadcaster;
use crate::delivery::{AckOutcome, DeliveryTracker};
use crate::directory::Directory;
use crate::error::ChatError;
use crate::events::{ClientEvent, ErrorBody, ServerEvent};
use crate::presence::{ConnectionContext, PresenceRouter};
use crate::registry::{group_room, ConnectionRegistry};
use crate::resolver::ConversationResolver;
use crate::store::Store;

/// Wires the chat core together and drives one websocket connection per
/// task: a writer task drains the connection's event channel, the reader
/// loop dispatches client events until the socket closes.
pub struct Server {
    pub registry: Arc<ConnectionRegistry>,
    pub presence: PresenceRouter,
    pub resolver: ConversationResolver,
    pub tracker: Arc<DeliveryTracker>,
    pub broadcaster: MessageBroadcaster,
    store: Arc<dyn Store>,
}

impl Server {
    pub fn new(
        store: Arc<dyn Store>,
        directory: Arc<dyn Directory>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let tracker = Arc::new(DeliveryTracker::new(store.clone()));
        Server {
            presence: PresenceRouter::new(
                registry.clone(),
                store.clone(),
                verifier,
                tracker.clone(),
            ),
            resolver: ConversationResolver::new(store.clone(), directory),
            broadcaster: MessageBroadcaster::new(store.clone(), registry.clone()),
            tracker,
            registry,
            store,
        }
    }

    pub async fn handle_connection(&self, ws: WebSocket, handshake: Handshake) {
        let connection_id = Uuid::new_v4().to_string();
        let (mut ws_tx, mut ws_rx) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match serde_json::to_string(&event) {
                    Ok(text) => {
                        if let Err(err) = ws_tx.send(WsMessage::text(text)).await {
                            debug!("websocket send failed: {err}");
                            break;
                        }
                    }
                    Err(err) => warn!("failed to serialize server event: {err}"),
                }
            }
        });

        // An authentication failure closes the socket without a payload;
        // dropping the sender ends the writer task and the connection.
        let ctx = match self.presence.connect(&handshake, &connection_id, tx).await {
            Ok(ctx) => ctx,
            Err(err) => {
                warn!("closing connection {connection_id}: {err}");
                return;
            }
        };

        while let Some(result) = ws_rx.next().await {
            match result {
                Ok(frame) => {
                    let Ok(text) = frame.to_str() else {
                        continue;
                    };
                    match serde_json::from_str::<ClientEvent>(text) {
                        Ok(event) => self.handle_event(&ctx, event).await,
                        Err(err) => {
                            self.registry
                                .send_to_connection(
                                    &ctx.connection_id,
                                    &ServerEvent::Error {
                                        code: "invalid_payload".to_string(),
                                        message: err.to_string(),
                                    },
                                )
                                .await;
                        }
                    }
                }
                Err(err) => {
                    warn!("websocket error on {connection_id}: {err}");
                    break;
                }
            }
        }

        self.presence.disconnect(&ctx).await;
    }

    pub async fn handle_event(&self, ctx: &ConnectionContext, event: ClientEvent) {
        match event {
            ClientEvent::Broadcast { text } => {
                self.registry
                    .broadcast_all(&ServerEvent::Broadcast {
                        from: ctx.user_id.clone(),
                        text,
                        timestamp: Utc::now(),
                    })
                    .await;
            }
            ClientEvent::Private { to, text } => {
                self.registry
                    .send_to_user(
                        &to,
                        &ServerEvent::Private {
                            from: ctx.user_id.clone(),
                            text,
                            timestamp: Utc::now(),
                        },
                    )
                    .await;
            }
            ClientEvent::JoinConversation { conversation_id } => {
                self.join_conversation(ctx, &conversation_id).await;
            }
            ClientEvent::CreateConversation {
                name,
                participant_emails,
                is_group,
                initial_message,
            } => {
                self.create_conversation(
                    ctx,
                    name,
                    participant_emails,
                    is_group.unwrap_or(false),
                    initial_message,
                )
                .await;
            }
            ClientEvent::SendMessage {
                conversation_id,
                client_correlation_id,
                content,
            } => {
                self.send_message(ctx, &conversation_id, client_correlation_id, &content)
                    .await;
            }
            ClientEvent::Delivered { message_id } => {
                let result = self.tracker.mark_delivered(&message_id, &ctx.user_id).await;
                self.publish_receipt(ctx, message_id, result).await;
            }
            ClientEvent::Read { message_id } => {
                let result = self.tracker.mark_read(&message_id, &ctx.user_id).await;
                self.publish_receipt(ctx, message_id, result).await;
            }
            ClientEvent::JoinGroup { group_id } => {
                self.presence.join_group(ctx, &group_id).await;
            }
            ClientEvent::LeaveGroup { group_id } => {
                self.presence.leave_group(ctx, &group_id).await;
            }
            ClientEvent::GroupMessage { group_id, text } => {
                let room = group_room(&group_id);
                self.registry
                    .send_to_room(
                        &room,
                        &ServerEvent::GroupMessage {
                            from: ctx.user_id.clone(),
                            group_id,
                            text,
                            timestamp: Utc::now(),
                        },
                    )
                    .await;
            }
        }
    }

    /// Membership-checked room join; used for conversations created after
    /// this connection came online.
    async fn join_conversation(&self, ctx: &ConnectionContext, conversation_id: &str) {
        let record = match self.store.conversation(conversation_id).await {
            Ok(record) => record,
            Err(err) => {
                self.send_error(ctx, &ChatError::Store(err)).await;
                return;
            }
        };
        let is_member = record
            .as_ref()
            .is_some_and(|r| r.members.iter().any(|m| m.user_id == ctx.user_id));
        if is_member {
            self.registry
                .join_room(conversation_id, &ctx.connection_id)
                .await;
        } else {
            // Non-members get the same answer as a missing conversation.
            self.send_error(ctx, &ChatError::ConversationNotFound).await;
        }
    }

    async fn create_conversation(
        &self,
        ctx: &ConnectionContext,
        name: Option<String>,
        participant_emails: Vec<String>,
        explicit_group_flag: bool,
        initial_message: Option<String>,
    ) {
        let result = self
            .resolver
            .create_or_reuse(
                &ctx.user_id,
                &participant_emails,
                explicit_group_flag,
                name,
                initial_message,
            )
            .await;

        let ack = match result {
            Ok(view) => {
                self.attach_members(ctx, &view.id).await;
                ServerEvent::CreateConversationAck {
                    status: "ok".to_string(),
                    conversation: Some(view),
                    error: None,
                }
            }
            Err(err) => ServerEvent::CreateConversationAck {
                status: "error".to_string(),
                conversation: None,
                error: Some(ErrorBody::from(&err)),
            },
        };
        self.registry
            .send_to_connection(&ctx.connection_id, &ack)
            .await;
    }

    /// Joins every member's live connections to the conversation room and
    /// announces the conversation to members other than the creator, each
    /// seeing the view from their own perspective.
    async fn attach_members(&self, ctx: &ConnectionContext, conversation_id: &str) {
        let record = match self.store.conversation(conversation_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(err) => {
                warn!("conversation {conversation_id} lookup failed after create: {err}");
                return;
            }
        };
        for member in &record.members {
            self.registry
                .join_user_to_room(conversation_id, &member.user_id)
                .await;
            if member.user_id == ctx.user_id {
                continue;
            }
            match self.resolver.view(conversation_id, &member.user_id).await {
                Ok(view) => {
                    self.registry
                        .send_to_user(
                            &member.user_id,
                            &ServerEvent::NewConversation { conversation: view },
                        )
                        .await;
                }
                Err(err) => {
                    warn!(
                        "could not build conversation view for {}: {err}",
                        member.user_id
                    );
                }
            }
        }
    }

    async fn send_message(
        &self,
        ctx: &ConnectionContext,
        conversation_id: &str,
        client_correlation_id: String,
        content: &str,
    ) {
        let ack = match self
            .broadcaster
            .send(conversation_id, &ctx.user_id, content)
            .await
        {
            Ok(message) => ServerEvent::SendMessageAck {
                status: "ok".to_string(),
                client_correlation_id,
                message: Some(message),
                error: None,
            },
            Err(err) => {
                warn!("send to conversation {conversation_id} failed: {err}");
                ServerEvent::SendMessageAck {
                    status: "error".to_string(),
                    client_correlation_id,
                    message: None,
                    error: Some(ErrorBody::from(&err)),
                }
            }
        };
        self.registry
            .send_to_connection(&ctx.connection_id, &ack)
            .await;
    }

    /// Pushes a status update to the sender when the acknowledgement
    /// advanced the message; errors go back to the acking connection.
    async fn publish_receipt(
        &self,
        ctx: &ConnectionContext,
        message_id: String,
        result: Result<AckOutcome, ChatError>,
    ) {
        match result {
            Ok(outcome) => {
                if let Some(status) = outcome.advanced {
                    self.registry
                        .send_to_user(
                            &outcome.sender_id,
                            &ServerEvent::StatusUpdated { message_id, status },
                        )
                        .await;
                }
            }
            Err(err) => self.send_error(ctx, &err).await,
        }
    }

    async fn send_error(&self, ctx: &ConnectionContext, err: &ChatError) {
        self.registry
            .send_to_connection(&ctx.connection_id, &ServerEvent::error(err))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SharedSecretVerifier;
    use crate::directory::MemoryDirectory;
    use crate::model::{MessageStatus, UserProfile};
    use crate::store::MemoryStore;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn server_with_users(users: &[(&str, &str)]) -> (Server, Arc<SharedSecretVerifier>) {
        let store = Arc::new(MemoryStore::new());
        let directory = Arc::new(MemoryDirectory::new());
        for (id, email) in users {
            directory
                .register(UserProfile {
                    id: (*id).to_string(),
                    email: (*email).to_string(),
                    display_name: None,
                    avatar_url: None,
                })
                .await;
        }
        let verifier = Arc::new(SharedSecretVerifier::new("test-secret"));
        (
            Server::new(store, directory, verifier.clone()),
            verifier,
        )
    }

    async fn connect(
        server: &Server,
        verifier: &SharedSecretVerifier,
        connection_id: &str,
        user_id: &str,
        email: &str,
    ) -> (ConnectionContext, UnboundedReceiver<ServerEvent>) {
        let token = verifier.issue(user_id, email);
        let handshake = Handshake {
            query_token: Some(token),
            ..Handshake::default()
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = server
            .presence
            .connect(&handshake, connection_id, tx)
            .await
            .unwrap();
        (ctx, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn private_message_reaches_only_the_target() {
        let (server, verifier) = server_with_users(&[("a", "a@x.com"), ("b", "b@x.com")]).await;
        let (ctx_a, mut rx_a) = connect(&server, &verifier, "c1", "a", "a@x.com").await;
        let (_ctx_b, mut rx_b) = connect(&server, &verifier, "c2", "b", "b@x.com").await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        server
            .handle_event(
                &ctx_a,
                ClientEvent::Private {
                    to: "b".to_string(),
                    text: "psst".to_string(),
                },
            )
            .await;

        assert!(matches!(
            drain(&mut rx_b).as_slice(),
            [ServerEvent::Private { from, text, .. }] if from == "a" && text == "psst"
        ));
        assert!(drain(&mut rx_a).is_empty());
    }

    #[tokio::test]
    async fn create_conversation_acks_and_notifies_members() {
        let (server, verifier) = server_with_users(&[("a", "a@x.com"), ("b", "b@x.com")]).await;
        let (ctx_a, mut rx_a) = connect(&server, &verifier, "c1", "a", "a@x.com").await;
        let (_ctx_b, mut rx_b) = connect(&server, &verifier, "c2", "b", "b@x.com").await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        server
            .handle_event(
                &ctx_a,
                ClientEvent::CreateConversation {
                    name: None,
                    participant_emails: vec!["b@x.com".to_string()],
                    is_group: None,
                    initial_message: Some("hi".to_string()),
                },
            )
            .await;

        let acks = drain(&mut rx_a);
        let conversation_id = match acks.as_slice() {
            [ServerEvent::CreateConversationAck {
                status,
                conversation: Some(view),
                error: None,
            }] => {
                assert_eq!(status, "ok");
                assert!(!view.is_group);
                view.id.clone()
            }
            other => panic!("unexpected ack: {other:?}"),
        };

        // The other member learns about the conversation from their own
        // perspective: the counterpart is the creator.
        match drain(&mut rx_b).as_slice() {
            [ServerEvent::NewConversation { conversation }] => {
                assert_eq!(conversation.id, conversation_id);
                assert_eq!(conversation.members[0].id, "a");
            }
            other => panic!("unexpected events: {other:?}"),
        }

        // Both live connections were joined to the room.
        server
            .handle_event(
                &ctx_a,
                ClientEvent::SendMessage {
                    conversation_id: conversation_id.clone(),
                    client_correlation_id: "k1".to_string(),
                    content: "first".to_string(),
                },
            )
            .await;
        assert!(drain(&mut rx_b)
            .iter()
            .any(|e| matches!(e, ServerEvent::NewMessage { .. })));
    }

    #[tokio::test]
    async fn failed_create_acks_error_without_side_effects() {
        let (server, verifier) = server_with_users(&[("a", "a@x.com")]).await;
        let (ctx_a, mut rx_a) = connect(&server, &verifier, "c1", "a", "a@x.com").await;
        drain(&mut rx_a);

        server
            .handle_event(
                &ctx_a,
                ClientEvent::CreateConversation {
                    name: None,
                    participant_emails: vec!["ghost@x.com".to_string()],
                    is_group: None,
                    initial_message: None,
                },
            )
            .await;

        match drain(&mut rx_a).as_slice() {
            [ServerEvent::CreateConversationAck {
                status,
                conversation: None,
                error: Some(body),
            }] => {
                assert_eq!(status, "error");
                assert_eq!(body.code, "unknown_participant");
            }
            other => panic!("unexpected ack: {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_to_unknown_conversation_acks_error_only_to_sender() {
        let (server, verifier) = server_with_users(&[("a", "a@x.com")]).await;
        let (ctx_a, mut rx_a) = connect(&server, &verifier, "c1", "a", "a@x.com").await;
        drain(&mut rx_a);

        server
            .handle_event(
                &ctx_a,
                ClientEvent::SendMessage {
                    conversation_id: "missing".to_string(),
                    client_correlation_id: "k9".to_string(),
                    content: "hello?".to_string(),
                },
            )
            .await;

        match drain(&mut rx_a).as_slice() {
            [ServerEvent::SendMessageAck {
                status,
                client_correlation_id,
                message: None,
                error: Some(body),
            }] => {
                assert_eq!(status, "error");
                assert_eq!(client_correlation_id, "k9");
                assert_eq!(body.code, "conversation_not_found");
            }
            other => panic!("unexpected ack: {other:?}"),
        }
    }

    #[tokio::test]
    async fn delivery_ack_routes_status_update_to_sender() {
        let (server, verifier) = server_with_users(&[("a", "a@x.com"), ("b", "b@x.com")]).await;
        let (ctx_a, mut rx_a) = connect(&server, &verifier, "c1", "a", "a@x.com").await;
        let (ctx_b, mut rx_b) = connect(&server, &verifier, "c2", "b", "b@x.com").await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        server
            .handle_event(
                &ctx_a,
                ClientEvent::CreateConversation {
                    name: None,
                    participant_emails: vec!["b@x.com".to_string()],
                    is_group: None,
                    initial_message: None,
                },
            )
            .await;
        let conversation_id = match drain(&mut rx_a).as_slice() {
            [ServerEvent::CreateConversationAck {
                conversation: Some(view),
                ..
            }] => view.id.clone(),
            other => panic!("unexpected ack: {other:?}"),
        };
        drain(&mut rx_b);

        server
            .handle_event(
                &ctx_a,
                ClientEvent::SendMessage {
                    conversation_id,
                    client_correlation_id: "k1".to_string(),
                    content: "hi".to_string(),
                },
            )
            .await;
        let message_id = match drain(&mut rx_b).as_slice() {
            [ServerEvent::NewMessage { message }] => message.id.clone(),
            other => panic!("unexpected events: {other:?}"),
        };
        drain(&mut rx_a);

        server
            .handle_event(
                &ctx_b,
                ClientEvent::Delivered {
                    message_id: message_id.clone(),
                },
            )
            .await;
        assert!(matches!(
            drain(&mut rx_a).as_slice(),
            [ServerEvent::StatusUpdated { message_id: id, status: MessageStatus::Delivered }]
                if *id == message_id
        ));

        // Redundant ack: no duplicate update.
        server
            .handle_event(&ctx_b, ClientEvent::Delivered { message_id })
            .await;
        assert!(drain(&mut rx_a).is_empty());
    }

    #[tokio::test]
    async fn unknown_message_ack_reports_error_to_acker() {
        let (server, verifier) = server_with_users(&[("a", "a@x.com")]).await;
        let (ctx_a, mut rx_a) = connect(&server, &verifier, "c1", "a", "a@x.com").await;
        drain(&mut rx_a);

        server
            .handle_event(
                &ctx_a,
                ClientEvent::Read {
                    message_id: "missing".to_string(),
                },
            )
            .await;
        assert!(matches!(
            drain(&mut rx_a).as_slice(),
            [ServerEvent::Error { code, .. }] if code == "message_not_found"
        ));
    }

    #[tokio::test]
    async fn group_message_stays_inside_the_group_room() {
        let (server, verifier) = server_with_users(&[("a", "a@x.com"), ("b", "b@x.com")]).await;
        let (ctx_a, mut rx_a) = connect(&server, &verifier, "c1", "a", "a@x.com").await;
        let (_ctx_b, mut rx_b) = connect(&server, &verifier, "c2", "b", "b@x.com").await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        server
            .handle_event(
                &ctx_a,
                ClientEvent::JoinGroup {
                    group_id: "g1".to_string(),
                },
            )
            .await;
        drain(&mut rx_a);

        server
            .handle_event(
                &ctx_a,
                ClientEvent::GroupMessage {
                    group_id: "g1".to_string(),
                    text: "in-group".to_string(),
                },
            )
            .await;

        assert!(matches!(
            drain(&mut rx_a).as_slice(),
            [ServerEvent::GroupMessage { text, .. }] if text == "in-group"
        ));
        // b never joined the group.
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn join_conversation_requires_membership() {
        let (server, verifier) = server_with_users(&[("a", "a@x.com")]).await;
        let (ctx_a, mut rx_a) = connect(&server, &verifier, "c1", "a", "a@x.com").await;
        drain(&mut rx_a);

        server
            .handle_event(
                &ctx_a,
                ClientEvent::JoinConversation {
                    conversation_id: "missing".to_string(),
                },
            )
            .await;
        assert!(matches!(
            drain(&mut rx_a).as_slice(),
            [ServerEvent::Error { code, .. }] if code == "conversation_not_found"
        ));
    }
}
