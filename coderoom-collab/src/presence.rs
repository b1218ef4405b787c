//! Presence: cursors, selections and the room language.
//!
//! ## Architecture
//!
//! ```text
//! Local caret move
//!       │
//!       ▼
//! PresenceTable::local_cursor()        (client, throttled)
//!       │
//!       ▼   cursor-change / selection-change
//! PresenceBroadcaster                  (server, relay to N-1, no state)
//!       │
//!       ▼
//! Remote PresenceTable::handle_event() (client, keyed by display name)
//! ```
//!
//! Cursor and selection state is ephemeral: the server never stores it and
//! clients drop a peer's entry on `cursor-leave` or `disconnected`. Only the
//! language tag is persisted, through the document store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::protocol::{
    ConnectionId, CursorLeavePayload, CursorPayload, CursorPosition, EditRange, LanguagePayload,
    ProtocolError, RoomLanguagePayload, SelectionPayload, ServerEvent,
};
use crate::registry::SessionRegistry;
use crate::store::VersionedDocumentStore;

/// Cursor colors handed out to participants.
pub const CURSOR_PALETTE: [&str; 15] = [
    "#FF5252", "#FF4081", "#E040FB", "#7C4DFF", "#536DFE", "#448AFF", "#40C4FF", "#18FFFF",
    "#64FFDA", "#69F0AE", "#B2FF59", "#EEFF41", "#FFD740", "#FFAB40", "#FF6E40",
];

/// Stable palette color for a display name.
pub fn color_for(username: &str) -> &'static str {
    let hash = username
        .bytes()
        .fold(0u32, |h, b| h.wrapping_mul(31).wrapping_add(u32::from(b)));
    CURSOR_PALETTE[hash as usize % CURSOR_PALETTE.len()]
}

// ───────────────────────────────────────────────────────────────────
// Server side: relay
// ───────────────────────────────────────────────────────────────────

/// Relays presence events to the other members of a room.
pub struct PresenceBroadcaster {
    registry: Arc<SessionRegistry>,
    store: Arc<VersionedDocumentStore>,
}

impl PresenceBroadcaster {
    pub fn new(registry: Arc<SessionRegistry>, store: Arc<VersionedDocumentStore>) -> Self {
        Self { registry, store }
    }

    async fn relay(
        &self,
        sender: &ConnectionId,
        room: &str,
        event: ServerEvent,
    ) -> Result<usize, ProtocolError> {
        if !self.registry.is_member(sender, room).await {
            log::debug!("Dropping presence from {sender}: not in room {room}");
            return Ok(0);
        }
        self.registry.hub().broadcast_except(room, sender, &event).await
    }

    pub async fn cursor_change(
        &self,
        sender: &ConnectionId,
        room: &str,
        payload: CursorPayload,
    ) -> Result<usize, ProtocolError> {
        self.relay(sender, room, ServerEvent::CursorChange(payload)).await
    }

    pub async fn selection_change(
        &self,
        sender: &ConnectionId,
        room: &str,
        payload: SelectionPayload,
    ) -> Result<usize, ProtocolError> {
        self.relay(sender, room, ServerEvent::SelectionChange(payload)).await
    }

    pub async fn cursor_leave(
        &self,
        sender: &ConnectionId,
        room: &str,
        payload: CursorLeavePayload,
    ) -> Result<usize, ProtocolError> {
        self.relay(sender, room, ServerEvent::CursorLeave(payload)).await
    }

    /// Persist the room language, then relay it. A failed write is logged
    /// by the store and the change is still relayed.
    pub async fn language_change(
        &self,
        sender: &ConnectionId,
        room: &str,
        payload: LanguagePayload,
    ) -> Result<usize, ProtocolError> {
        if !self.registry.is_member(sender, room).await {
            log::debug!("Dropping language-change from {sender}: not in room {room}");
            return Ok(0);
        }
        self.store.set_language(room, &payload.language).await;
        log::debug!("Room {room} language set to {}", payload.language);
        self.registry
            .hub()
            .broadcast_except(room, sender, &ServerEvent::LanguageChange(payload))
            .await
    }

    /// Answer `request-language` with the stored tag, if any.
    pub async fn request_language(
        &self,
        sender: &ConnectionId,
        room: &str,
    ) -> Result<Option<String>, ProtocolError> {
        let Some(language) = self.store.language(room).await else {
            return Ok(None);
        };
        self.registry
            .hub()
            .send_to(
                sender,
                &ServerEvent::RoomLanguage(RoomLanguagePayload {
                    language: language.clone(),
                }),
            )
            .await?;
        Ok(Some(language))
    }
}

// ───────────────────────────────────────────────────────────────────
// Client side: remote presence table
// ───────────────────────────────────────────────────────────────────

/// One remote participant's presence.
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePresence {
    pub username: String,
    pub color: String,
    pub cursor: Option<CursorPosition>,
    pub selection: Option<EditRange>,
    last_update: Instant,
}

impl RemotePresence {
    fn new(username: &str, color: &str) -> Self {
        Self {
            username: username.to_string(),
            color: if color.is_empty() {
                color_for(username).to_string()
            } else {
                color.to_string()
            },
            cursor: None,
            selection: None,
            last_update: Instant::now(),
        }
    }

    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_update.elapsed() > timeout
    }
}

/// What a presence event changed in the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceUpdate {
    /// A peer's cursor or selection moved.
    Changed(String),
    /// A peer's indicators were removed.
    Cleared(String),
    /// Event ignored (own echo or not a presence event).
    None,
}

/// Client-side presence state, keyed by display name.
pub struct PresenceTable {
    local_username: String,
    local_color: String,
    peers: HashMap<String, RemotePresence>,
    last_cursor_broadcast: Option<Instant>,
    cursor_broadcast_interval: Duration,
    idle_timeout: Duration,
}

impl PresenceTable {
    pub fn new(local_username: impl Into<String>) -> Self {
        let local_username = local_username.into();
        let local_color = color_for(&local_username).to_string();
        Self {
            local_username,
            local_color,
            peers: HashMap::new(),
            last_cursor_broadcast: None,
            cursor_broadcast_interval: Duration::from_millis(33),
            idle_timeout: Duration::from_secs(60),
        }
    }

    /// Custom cursor throttle (for testing).
    pub fn with_interval(local_username: impl Into<String>, interval: Duration) -> Self {
        let mut table = Self::new(local_username);
        table.cursor_broadcast_interval = interval;
        table
    }

    /// How long a silent peer's indicators survive.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.local_color = color.into();
        self
    }

    pub fn local_username(&self) -> &str {
        &self.local_username
    }

    pub fn local_color(&self) -> &str {
        &self.local_color
    }

    /// Apply a server event. Events naming the local user are ignored.
    pub fn handle_event(&mut self, event: &ServerEvent) -> PresenceUpdate {
        match event {
            ServerEvent::CursorChange(p) => {
                if p.username == self.local_username {
                    return PresenceUpdate::None;
                }
                let peer = self.peer_entry(&p.username, &p.color);
                peer.cursor = Some(p.position);
                PresenceUpdate::Changed(p.username.clone())
            }
            ServerEvent::SelectionChange(p) => {
                if p.username == self.local_username {
                    return PresenceUpdate::None;
                }
                let peer = self.peer_entry(&p.username, &p.color);
                peer.selection = Some(p.selection);
                PresenceUpdate::Changed(p.username.clone())
            }
            ServerEvent::CursorLeave(p) => self.clear(&p.username),
            ServerEvent::Disconnected(p) => match &p.username {
                Some(name) => self.clear(name),
                None => PresenceUpdate::None,
            },
            _ => PresenceUpdate::None,
        }
    }

    fn peer_entry(&mut self, username: &str, color: &str) -> &mut RemotePresence {
        let peer = self
            .peers
            .entry(username.to_string())
            .or_insert_with(|| RemotePresence::new(username, color));
        if !color.is_empty() {
            peer.color = color.to_string();
        }
        peer.last_update = Instant::now();
        peer
    }

    fn clear(&mut self, username: &str) -> PresenceUpdate {
        match self.peers.remove(username) {
            Some(_) => PresenceUpdate::Cleared(username.to_string()),
            None => PresenceUpdate::None,
        }
    }

    /// Cursor event for the local caret, or `None` while throttled.
    pub fn local_cursor(&mut self, room: &str, position: CursorPosition) -> Option<CursorPayload> {
        if let Some(last) = self.last_cursor_broadcast {
            if last.elapsed() < self.cursor_broadcast_interval {
                return None;
            }
        }
        self.last_cursor_broadcast = Some(Instant::now());
        Some(CursorPayload {
            room_id: Some(room.to_string()),
            position,
            username: self.local_username.clone(),
            color: self.local_color.clone(),
        })
    }

    /// Selection event for the local selection. Never throttled.
    pub fn local_selection(&self, room: &str, selection: EditRange) -> SelectionPayload {
        SelectionPayload {
            room_id: Some(room.to_string()),
            selection,
            username: self.local_username.clone(),
            color: self.local_color.clone(),
        }
    }

    pub fn local_leave(&self, room: &str) -> CursorLeavePayload {
        CursorLeavePayload {
            room_id: Some(room.to_string()),
            username: self.local_username.clone(),
        }
    }

    pub fn peer(&self, username: &str) -> Option<&RemotePresence> {
        self.peers.get(username)
    }

    pub fn peers(&self) -> impl Iterator<Item = &RemotePresence> {
        self.peers.values()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Drop every remote indicator (e.g. after losing the connection).
    pub fn clear_all(&mut self) -> Vec<String> {
        self.peers.drain().map(|(name, _)| name).collect()
    }

    /// Remove peers with no update within the idle timeout.
    pub fn cleanup_idle_peers(&mut self) -> Vec<String> {
        let timeout = self.idle_timeout;
        let stale: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, p)| p.is_idle(timeout))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &stale {
            self.peers.remove(name);
        }
        stale
    }
}
