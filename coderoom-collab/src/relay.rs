//! Live edit relay and snapshot reconciliation.
//!
//! Two independent channels:
//! - **live edits**: `code-change` is forwarded verbatim to every other
//!   member of the room. Nothing is stored or ordered across senders.
//! - **snapshots**: `send-current-code` attempts a versioned write; an
//!   accepted write is broadcast to the whole room as `sync-code-response`.
//!   `request-code` pulls the current state if the caller is stale.
//!
//! Snapshot gate, evaluated against the server's current version:
//! ```text
//! force ─────────────────────┐
//! no clientVersion ──────────┼──► write ──► Updated(v)   → broadcast {code, v}
//! server ≤ clientVersion ────┘          ├─► Unchanged(v) → broadcast {code, v}
//!                                       └─► Unavailable  → dropped (logged)
//! server > clientVersion ───────────────────► dropped silently
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::broadcast::ConnectionHub;
use crate::protocol::{
    CodeChangePayload, ConnectionId, ProtocolError, RequestCodePayload, SendCurrentCodePayload,
    ServerEvent, SyncCodePayload, SyncCodeResponse,
};
use crate::registry::SessionRegistry;
use crate::store::{VersionedDocumentStore, WriteOutcome};

/// What happened to a snapshot write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotDecision {
    /// Persisted and broadcast under a new version.
    Accepted(u64),
    /// Body matched the stored one; broadcast under the same version.
    Unchanged(u64),
    /// Client was behind the server and did not force.
    Stale { server: u64, client: u64 },
    /// Storage failed; nothing was broadcast.
    Unavailable,
    /// Sender is not a member of the room.
    Ignored,
}

/// Relay counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub edits_relayed: u64,
    pub snapshots_accepted: u64,
    pub snapshots_unchanged: u64,
    pub snapshots_stale: u64,
    pub snapshots_dropped: u64,
}

#[derive(Default)]
struct AtomicRelayStats {
    edits_relayed: AtomicU64,
    snapshots_accepted: AtomicU64,
    snapshots_unchanged: AtomicU64,
    snapshots_stale: AtomicU64,
    snapshots_dropped: AtomicU64,
}

/// Edit and snapshot relay.
pub struct ChangeRelay {
    registry: Arc<SessionRegistry>,
    store: Arc<VersionedDocumentStore>,
    stats: AtomicRelayStats,
}

impl ChangeRelay {
    pub fn new(registry: Arc<SessionRegistry>, store: Arc<VersionedDocumentStore>) -> Self {
        Self {
            registry,
            store,
            stats: AtomicRelayStats::default(),
        }
    }

    fn hub(&self) -> &ConnectionHub {
        self.registry.hub()
    }

    /// Forward `code-change` to every other member of `room`.
    pub async fn code_change(
        &self,
        sender: &ConnectionId,
        room: &str,
        payload: CodeChangePayload,
    ) -> Result<usize, ProtocolError> {
        if !self.registry.is_member(sender, room).await {
            log::debug!("Dropping code-change from {sender}: not in room {room}");
            return Ok(0);
        }
        let count = self
            .hub()
            .broadcast_except(room, sender, &ServerEvent::CodeChange(payload))
            .await?;
        self.stats.edits_relayed.fetch_add(1, Ordering::Relaxed);
        log::trace!("Relayed code-change in {room} to {count} peer(s)");
        Ok(count)
    }

    /// Handle `send-current-code`.
    pub async fn send_current_code(
        &self,
        sender: &ConnectionId,
        payload: SendCurrentCodePayload,
    ) -> Result<SnapshotDecision, ProtocolError> {
        let room = payload.room_id.as_str();
        if !self.registry.is_member(sender, room).await {
            log::debug!("Dropping send-current-code from {sender}: not in room {room}");
            return Ok(SnapshotDecision::Ignored);
        }

        let server_version = self.store.current_version(room).await.unwrap_or(0);
        if !payload.is_forced() {
            if let Some(client) = payload.client_version {
                if server_version > client {
                    self.stats.snapshots_stale.fetch_add(1, Ordering::Relaxed);
                    log::debug!(
                        "Rejecting stale snapshot from {sender} in {room}: server v{server_version} > client v{client}"
                    );
                    return Ok(SnapshotDecision::Stale {
                        server: server_version,
                        client,
                    });
                }
            }
        }

        match self.store.write(room, &payload.code).await {
            WriteOutcome::Updated(version) => {
                self.stats.snapshots_accepted.fetch_add(1, Ordering::Relaxed);
                let event =
                    ServerEvent::SyncCodeResponse(SyncCodeResponse::snapshot(payload.code, version));
                self.hub().broadcast(room, &event).await?;
                Ok(SnapshotDecision::Accepted(version))
            }
            WriteOutcome::Unchanged(version) => {
                self.stats.snapshots_unchanged.fetch_add(1, Ordering::Relaxed);
                // Members that drifted from the stored body converge on it.
                let event =
                    ServerEvent::SyncCodeResponse(SyncCodeResponse::snapshot(payload.code, version));
                self.hub().broadcast(room, &event).await?;
                Ok(SnapshotDecision::Unchanged(version))
            }
            WriteOutcome::Unavailable => {
                self.stats.snapshots_dropped.fetch_add(1, Ordering::Relaxed);
                Ok(SnapshotDecision::Unavailable)
            }
        }
    }

    /// Handle `request-code`: answer the requester with the current body, or
    /// just `upToDate` when its version already matches. `None` when the
    /// requester is not in the room.
    pub async fn request_code(
        &self,
        sender: &ConnectionId,
        payload: RequestCodePayload,
    ) -> Result<Option<SyncCodeResponse>, ProtocolError> {
        let room = payload.room_id.as_str();
        if !self.registry.is_member(sender, room).await {
            log::debug!("Dropping request-code from {sender}: not in room {room}");
            return Ok(None);
        }
        let active = self.hub().member_count(room).await;
        let snapshot = self.store.read(room, active).await;

        let response = match payload.client_version {
            Some(client) if client == snapshot.version && !snapshot.degraded => {
                SyncCodeResponse::up_to_date(snapshot.version)
            }
            _ => SyncCodeResponse::snapshot(snapshot.body, snapshot.version),
        };
        self.hub()
            .send_to(sender, &ServerEvent::SyncCodeResponse(response.clone()))
            .await?;
        Ok(Some(response))
    }

    /// Handle legacy `sync-code`: a push when it carries a body, a pull
    /// otherwise.
    pub async fn sync_code(
        &self,
        sender: &ConnectionId,
        payload: SyncCodePayload,
    ) -> Result<(), ProtocolError> {
        match payload.code {
            Some(code) => {
                self.send_current_code(
                    sender,
                    SendCurrentCodePayload {
                        room_id: payload.room_id,
                        code,
                        force: None,
                        client_version: payload.client_version,
                    },
                )
                .await?;
            }
            None => {
                self.request_code(
                    sender,
                    RequestCodePayload {
                        room_id: payload.room_id,
                        client_version: payload.client_version,
                    },
                )
                .await?;
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            edits_relayed: self.stats.edits_relayed.load(Ordering::Relaxed),
            snapshots_accepted: self.stats.snapshots_accepted.load(Ordering::Relaxed),
            snapshots_unchanged: self.stats.snapshots_unchanged.load(Ordering::Relaxed),
            snapshots_stale: self.stats.snapshots_stale.load(Ordering::Relaxed),
            snapshots_dropped: self.stats.snapshots_dropped.load(Ordering::Relaxed),
        }
    }
}
