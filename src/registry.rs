use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc;
use tokio::sync::RwLock;

use crate::events::ServerEvent;

/// Room name for a group broadcast channel. Conversation rooms use the
/// conversation id directly; group rooms are namespaced so an ad-hoc
/// group id can never collide with a conversation id.
pub fn group_room(group_id: &str) -> String {
    format!("group:{group_id}")
}

pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

/// Outcome of removing a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnected {
    pub user_id: String,
    /// True when this was the user's last live connection.
    pub last_for_user: bool,
}

struct ConnectionEntry {
    user_id: String,
    sender: EventSender,
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<String, ConnectionEntry>,
    user_connections: HashMap<String, HashSet<String>>,
    rooms: HashMap<String, HashSet<String>>,
    groups: HashMap<String, HashSet<String>>,
}

/// Live connection state for the whole process: user -> connections,
/// room -> connections, and the ad-hoc group roster. All access is
/// serialized behind a single lock so concurrent connects/disconnects for
/// the same user never lose updates. Pushes are best-effort, at-most-once:
/// a closed receiver is simply skipped.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<RegistryState>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        ConnectionRegistry::default()
    }

    /// Registers a connection for a user. Returns true when the user had
    /// no other live connection.
    pub async fn register(
        &self,
        connection_id: &str,
        user_id: &str,
        sender: EventSender,
    ) -> bool {
        let mut state = self.inner.write().await;
        state.connections.insert(
            connection_id.to_string(),
            ConnectionEntry {
                user_id: user_id.to_string(),
                sender,
            },
        );
        let connections = state
            .user_connections
            .entry(user_id.to_string())
            .or_default();
        connections.insert(connection_id.to_string());
        connections.len() == 1
    }

    /// Removes a connection from the registry and from every room it had
    /// joined. Returns None for unknown connection ids.
    pub async fn unregister(&self, connection_id: &str) -> Option<Disconnected> {
        let mut state = self.inner.write().await;
        let entry = state.connections.remove(connection_id)?;
        for members in state.rooms.values_mut() {
            members.remove(connection_id);
        }
        state.rooms.retain(|_, members| !members.is_empty());

        let last_for_user = match state.user_connections.get_mut(&entry.user_id) {
            Some(connections) => {
                connections.remove(connection_id);
                connections.is_empty()
            }
            None => true,
        };
        if last_for_user {
            state.user_connections.remove(&entry.user_id);
        }
        Some(Disconnected {
            user_id: entry.user_id,
            last_for_user,
        })
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        let state = self.inner.read().await;
        state
            .user_connections
            .get(user_id)
            .is_some_and(|connections| !connections.is_empty())
    }

    pub async fn join_room(&self, room: &str, connection_id: &str) {
        let mut state = self.inner.write().await;
        if state.connections.contains_key(connection_id) {
            state
                .rooms
                .entry(room.to_string())
                .or_default()
                .insert(connection_id.to_string());
        }
    }

    pub async fn leave_room(&self, room: &str, connection_id: &str) {
        let mut state = self.inner.write().await;
        if let Some(members) = state.rooms.get_mut(room) {
            members.remove(connection_id);
            if members.is_empty() {
                state.rooms.remove(room);
            }
        }
    }

    /// Joins every live connection of the user to the room. Used when a
    /// conversation is created while its members are already connected.
    pub async fn join_user_to_room(&self, room: &str, user_id: &str) {
        let mut state = self.inner.write().await;
        let connections: Vec<String> = state
            .user_connections
            .get(user_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        if connections.is_empty() {
            return;
        }
        let members = state.rooms.entry(room.to_string()).or_default();
        for connection_id in connections {
            members.insert(connection_id);
        }
    }

    pub async fn send_to_connection(&self, connection_id: &str, event: &ServerEvent) {
        let state = self.inner.read().await;
        if let Some(entry) = state.connections.get(connection_id) {
            let _ = entry.sender.send(event.clone());
        }
    }

    /// Best-effort push to every live connection of the user; silently a
    /// no-op when the user is offline.
    pub async fn send_to_user(&self, user_id: &str, event: &ServerEvent) {
        let state = self.inner.read().await;
        let Some(connections) = state.user_connections.get(user_id) else {
            return;
        };
        for connection_id in connections {
            if let Some(entry) = state.connections.get(connection_id) {
                let _ = entry.sender.send(event.clone());
            }
        }
    }

    pub async fn send_to_room(&self, room: &str, event: &ServerEvent) {
        self.send_to_room_except(room, event, None).await;
    }

    pub async fn send_to_room_except(
        &self,
        room: &str,
        event: &ServerEvent,
        except_connection: Option<&str>,
    ) {
        let state = self.inner.read().await;
        let Some(members) = state.rooms.get(room) else {
            return;
        };
        for connection_id in members {
            if Some(connection_id.as_str()) == except_connection {
                continue;
            }
            if let Some(entry) = state.connections.get(connection_id) {
                let _ = entry.sender.send(event.clone());
            }
        }
    }

    pub async fn broadcast_all(&self, event: &ServerEvent) {
        let state = self.inner.read().await;
        for entry in state.connections.values() {
            let _ = entry.sender.send(event.clone());
        }
    }

    /// Adds a user to the ad-hoc group roster. Returns true when the user
    /// was not already a member.
    pub async fn add_group_member(&self, group_id: &str, user_id: &str) -> bool {
        let mut state = self.inner.write().await;
        state
            .groups
            .entry(group_id.to_string())
            .or_default()
            .insert(user_id.to_string())
    }

    pub async fn remove_group_member(&self, group_id: &str, user_id: &str) -> bool {
        let mut state = self.inner.write().await;
        match state.groups.get_mut(group_id) {
            Some(members) => {
                let removed = members.remove(user_id);
                if members.is_empty() {
                    state.groups.remove(group_id);
                }
                removed
            }
            None => false,
        }
    }

    pub async fn group_members(&self, group_id: &str) -> HashSet<String> {
        let state = self.inner.read().await;
        state.groups.get(group_id).cloned().unwrap_or_default()
    }
}
