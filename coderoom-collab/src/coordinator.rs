//! Join / leave orchestration and initial sync.
//!
//! On join the joining session receives, in order:
//! 1. `sync-code-response` with the room's body and version
//! 2. `room-language` if the room has a language tag
//! 3. `joined` (sent to every member, old and new, with the full list)
//!
//! Optionally the longest-present other member is then asked for its
//! buffer with `request-current-code`.

use std::sync::Arc;

use crate::protocol::{
    ConnectionId, DisconnectedPayload, JoinedPayload, ProtocolError, RoomLanguagePayload,
    RoomPayload, ServerEvent, SyncCodeResponse,
};
use crate::registry::SessionRegistry;
use crate::store::VersionedDocumentStore;

/// What a join produced, for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub version: u64,
    pub members: usize,
    pub degraded: bool,
    /// Member asked to publish its buffer, if any.
    pub snapshot_requested_from: Option<ConnectionId>,
}

/// Session join/leave coordinator.
pub struct RoomCoordinator {
    registry: Arc<SessionRegistry>,
    store: Arc<VersionedDocumentStore>,
    request_peer_snapshot: bool,
}

impl RoomCoordinator {
    pub fn new(
        registry: Arc<SessionRegistry>,
        store: Arc<VersionedDocumentStore>,
        request_peer_snapshot: bool,
    ) -> Self {
        Self {
            registry,
            store,
            request_peer_snapshot,
        }
    }

    /// Handle `join`.
    pub async fn join(
        &self,
        connection_id: ConnectionId,
        room: &str,
        username: &str,
    ) -> Result<JoinOutcome, ProtocolError> {
        let hub = self.registry.hub();
        let others: Vec<ConnectionId> = hub
            .members(room)
            .await
            .into_iter()
            .filter(|id| *id != connection_id)
            .collect();

        self.registry.join(connection_id, room, username).await;

        let snapshot = self.store.read(room, others.len()).await;
        hub.send_to(
            &connection_id,
            &ServerEvent::SyncCodeResponse(SyncCodeResponse::snapshot(
                snapshot.body.as_str(),
                snapshot.version,
            )),
        )
        .await?;

        if let Some(language) = self.store.language(room).await {
            hub.send_to(
                &connection_id,
                &ServerEvent::RoomLanguage(RoomLanguagePayload { language }),
            )
            .await?;
        }

        let users = self.registry.list_members(room).await;
        let members = users.len();
        hub.broadcast(
            room,
            &ServerEvent::Joined(JoinedPayload {
                users,
                username: username.to_string(),
                socket_id: connection_id,
            }),
        )
        .await?;
        self.registry.activate(&connection_id).await;

        let mut snapshot_requested_from = None;
        if self.request_peer_snapshot {
            if let Some(peer) = others.first() {
                let request = ServerEvent::RequestCurrentCode(RoomPayload {
                    room_id: room.to_string(),
                });
                if hub.send_to(peer, &request).await? {
                    snapshot_requested_from = Some(*peer);
                }
            }
        }

        log::info!(
            "{username} ({connection_id}) joined room {room} at v{} with {members} member(s)",
            snapshot.version
        );
        Ok(JoinOutcome {
            version: snapshot.version,
            members,
            degraded: snapshot.degraded,
            snapshot_requested_from,
        })
    }

    /// Handle a closed connection: notify every room once, then drop the
    /// session. Returns the rooms that were notified.
    pub async fn disconnect(&self, connection_id: &ConnectionId) -> Result<Vec<String>, ProtocolError> {
        let Some(session) = self.registry.session(connection_id).await else {
            return Ok(Vec::new());
        };
        let rooms: Vec<String> = session.rooms.iter().cloned().collect();
        for room in &rooms {
            self.announce_departure(connection_id, &session.username, room)
                .await?;
        }

        if let Some((_, emptied)) = self.registry.leave(connection_id).await {
            for room in emptied {
                self.store.forget(&room).await;
            }
        }
        log::info!("{} ({connection_id}) disconnected", session.username);
        Ok(rooms)
    }

    /// Handle a client-sent `disconnected`: leave one room, or every room
    /// when `room` is `None`, keeping the connection open.
    pub async fn leave(
        &self,
        connection_id: &ConnectionId,
        room: Option<&str>,
    ) -> Result<Vec<String>, ProtocolError> {
        let Some(room) = room else {
            return self.disconnect(connection_id).await;
        };
        let Some(username) = self.registry.username(connection_id).await else {
            return Ok(Vec::new());
        };
        if !self.registry.is_member(connection_id, room).await {
            return Ok(Vec::new());
        }

        self.announce_departure(connection_id, &username, room).await?;
        if self.registry.leave_room(connection_id, room).await == Some(true) {
            self.store.forget(room).await;
        }
        log::info!("{username} ({connection_id}) left room {room}");
        Ok(vec![room.to_string()])
    }

    async fn announce_departure(
        &self,
        connection_id: &ConnectionId,
        username: &str,
        room: &str,
    ) -> Result<(), ProtocolError> {
        let event = ServerEvent::Disconnected(DisconnectedPayload {
            socket_id: Some(*connection_id),
            username: Some(username.to_string()),
            room_id: Some(room.to_string()),
        });
        self.registry
            .hub()
            .broadcast_except(room, connection_id, &event)
            .await?;
        Ok(())
    }
}
