//! Session registry: live connections, their display names and rooms.
//!
//! Room membership lists come from the [`ConnectionHub`] multicast groups
//! intersected with the names recorded here, so the two can never disagree
//! about who receives a room broadcast.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::broadcast::ConnectionHub;
use crate::protocol::{ConnectionId, Member, RoomId};

/// Lifecycle of a session.
///
/// ```text
/// Disconnected ──join──► Joining ──initial sync sent──► Active
///       ▲                                                 │
///       └───────────────── leave / disconnect ◄───────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Joining,
    Active,
}

/// One connection's session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub connection_id: ConnectionId,
    pub username: String,
    pub rooms: BTreeSet<RoomId>,
    pub state: SessionState,
}

/// Volatile map of connections to sessions.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<ConnectionId, Session>>,
    hub: Arc<ConnectionHub>,
}

impl SessionRegistry {
    pub fn new(hub: Arc<ConnectionHub>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            hub,
        }
    }

    pub fn hub(&self) -> &Arc<ConnectionHub> {
        &self.hub
    }

    /// Record that a connection joined a room under a display name.
    ///
    /// Previous room memberships are kept; the display name is overwritten.
    pub async fn join(&self, connection_id: ConnectionId, room: &str, username: &str) {
        {
            let mut sessions = self.sessions.write().await;
            let session = sessions.entry(connection_id).or_insert_with(|| Session {
                connection_id,
                username: username.to_string(),
                rooms: BTreeSet::new(),
                state: SessionState::Disconnected,
            });
            session.username = username.to_string();
            session.rooms.insert(room.to_string());
            session.state = SessionState::Joining;
        }
        self.hub.join_room(connection_id, room).await;
        log::debug!("Session {connection_id} ({username}) joined room {room}");
    }

    /// Mark a session's initial sync as delivered.
    pub async fn activate(&self, connection_id: &ConnectionId) {
        if let Some(session) = self.sessions.write().await.get_mut(connection_id) {
            session.state = SessionState::Active;
        }
    }

    /// Members of a room in join order.
    pub async fn list_members(&self, room: &str) -> Vec<Member> {
        let ids = self.hub.members(room).await;
        let sessions = self.sessions.read().await;
        ids.into_iter()
            .filter_map(|id| {
                sessions.get(&id).map(|s| Member {
                    socket_id: id,
                    username: s.username.clone(),
                })
            })
            .collect()
    }

    pub async fn is_member(&self, connection_id: &ConnectionId, room: &str) -> bool {
        self.sessions
            .read()
            .await
            .get(connection_id)
            .is_some_and(|s| s.rooms.contains(room))
    }

    pub async fn session(&self, connection_id: &ConnectionId) -> Option<Session> {
        self.sessions.read().await.get(connection_id).cloned()
    }

    pub async fn username(&self, connection_id: &ConnectionId) -> Option<String> {
        self.sessions
            .read()
            .await
            .get(connection_id)
            .map(|s| s.username.clone())
    }

    pub async fn state(&self, connection_id: &ConnectionId) -> SessionState {
        self.sessions
            .read()
            .await
            .get(connection_id)
            .map_or(SessionState::Disconnected, |s| s.state)
    }

    /// Rooms a connection has joined, sorted.
    pub async fn rooms_of(&self, connection_id: &ConnectionId) -> Vec<RoomId> {
        self.sessions
            .read()
            .await
            .get(connection_id)
            .map(|s| s.rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove a session and all its room memberships. Idempotent.
    ///
    /// Returns the removed session and the rooms that became empty.
    pub async fn leave(&self, connection_id: &ConnectionId) -> Option<(Session, Vec<RoomId>)> {
        let mut session = self.sessions.write().await.remove(connection_id)?;
        let mut emptied = Vec::new();
        for room in &session.rooms {
            if self.hub.leave_room(connection_id, room).await {
                emptied.push(room.clone());
            }
        }
        session.state = SessionState::Disconnected;
        log::debug!("Session {connection_id} ({}) removed", session.username);
        Some((session, emptied))
    }

    /// Leave a single room. The session is removed once it has no rooms.
    ///
    /// Returns `None` when the connection was not in the room, otherwise
    /// whether the room became empty.
    pub async fn leave_room(&self, connection_id: &ConnectionId, room: &str) -> Option<bool> {
        {
            let mut sessions = self.sessions.write().await;
            let session = sessions.get_mut(connection_id)?;
            if !session.rooms.remove(room) {
                return None;
            }
            if session.rooms.is_empty() {
                sessions.remove(connection_id);
            }
        }
        Some(self.hub.leave_room(connection_id, room).await)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> (Arc<ConnectionHub>, SessionRegistry) {
        let hub = Arc::new(ConnectionHub::new(16));
        let registry = SessionRegistry::new(hub.clone());
        (hub, registry)
    }

    #[tokio::test]
    async fn test_join_lists_members_in_order() {
        let (hub, registry) = setup().await;
        let (a, _ra) = hub.register().await;
        let (b, _rb) = hub.register().await;
        registry.join(a, "r", "alice").await;
        registry.join(b, "r", "bob").await;

        let members = registry.list_members("r").await;
        let names: Vec<&str> = members.iter().map(|m| m.username.as_str()).collect();
        assert_eq!(names, vec!["alice", "bob"]);
        assert_eq!(members[1].socket_id, b);
        assert_eq!(registry.state(&a).await, SessionState::Joining);
    }

    #[tokio::test]
    async fn test_duplicate_display_names_are_allowed() {
        let (hub, registry) = setup().await;
        let (a, _ra) = hub.register().await;
        let (b, _rb) = hub.register().await;
        registry.join(a, "r", "sam").await;
        registry.join(b, "r", "sam").await;
        assert_eq!(registry.list_members("r").await.len(), 2);
    }

    #[tokio::test]
    async fn test_second_room_keeps_first() {
        let (hub, registry) = setup().await;
        let (a, _ra) = hub.register().await;
        registry.join(a, "one", "alice").await;
        registry.join(a, "two", "alice").await;
        assert_eq!(registry.rooms_of(&a).await, vec!["one".to_string(), "two".to_string()]);
        assert!(registry.is_member(&a, "one").await);
        assert_eq!(hub.rooms_of(&a).await.len(), 2);
    }

    #[tokio::test]
    async fn test_leave_is_idempotent() {
        let (hub, registry) = setup().await;
        let (a, _ra) = hub.register().await;
        registry.join(a, "r", "alice").await;
        registry.activate(&a).await;
        assert_eq!(registry.state(&a).await, SessionState::Active);

        let (session, emptied) = registry.leave(&a).await.unwrap();
        assert_eq!(session.username, "alice");
        assert_eq!(emptied, vec!["r".to_string()]);
        assert!(registry.leave(&a).await.is_none());
        assert_eq!(registry.state(&a).await, SessionState::Disconnected);
        assert!(registry.list_members("r").await.is_empty());
    }

    #[tokio::test]
    async fn test_leave_single_room() {
        let (hub, registry) = setup().await;
        let (a, _ra) = hub.register().await;
        let (b, _rb) = hub.register().await;
        registry.join(a, "one", "alice").await;
        registry.join(a, "two", "alice").await;
        registry.join(b, "two", "bob").await;

        assert_eq!(registry.leave_room(&a, "two").await, Some(false));
        assert_eq!(registry.leave_room(&a, "two").await, None);
        assert_eq!(registry.rooms_of(&a).await, vec!["one".to_string()]);
        assert_eq!(registry.leave_room(&a, "one").await, Some(true));
        assert_eq!(registry.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_rejoin_overwrites_display_name() {
        let (hub, registry) = setup().await;
        let (a, _ra) = hub.register().await;
        registry.join(a, "r", "old").await;
        registry.join(a, "r", "new").await;
        assert_eq!(registry.username(&a).await.as_deref(), Some("new"));
        assert_eq!(registry.list_members("r").await.len(), 1);
    }
}
