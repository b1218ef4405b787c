//! Room-scoped multicast over per-connection outbound queues.
//!
//! Every connection registers one bounded queue; rooms are ordered lists of
//! connection ids. A frame is encoded once and the same `Arc<str>` is pushed
//! into each member's queue.
//!
//! ```text
//!                 ┌──────────────── room "r1" ────────────────┐
//!  broadcast ───► │ conn A ─► mpsc ─► ws writer (A)           │
//!                 │ conn B ─► mpsc ─► ws writer (B)           │
//!                 │ conn C ─► mpsc ─► ws writer (C)           │
//!                 └───────────────────────────────────────────┘
//! ```
//!
//! A member whose queue is full loses the frame (backpressure); the drop is
//! counted and logged, other members are unaffected.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, RwLock};

use crate::protocol::{ConnectionId, ProtocolError, RoomId, ServerEvent};

/// Encoded frame shared between all recipients.
pub type Frame = Arc<str>;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_connections: usize,
    pub active_rooms: usize,
}

/// Atomic broadcast stats, lock-free on the hot path.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// Connection and room-group table.
pub struct ConnectionHub {
    /// Outbound queue per live connection
    outbound: RwLock<HashMap<ConnectionId, mpsc::Sender<Frame>>>,

    /// Room id → members in join order
    rooms: RwLock<HashMap<RoomId, Vec<ConnectionId>>>,

    /// Queue capacity per connection
    capacity: usize,

    atomic_stats: AtomicBroadcastStats,
}

impl ConnectionHub {
    /// Create a hub whose connection queues buffer `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            outbound: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            atomic_stats: AtomicBroadcastStats::new(),
        }
    }

    /// Register a new connection. Returns its id and the receiving half of
    /// its outbound queue.
    pub async fn register(&self) -> (ConnectionId, mpsc::Receiver<Frame>) {
        let id = ConnectionId::new();
        let rx = self.register_with_id(id).await;
        (id, rx)
    }

    /// Register a connection under a caller-chosen id.
    pub async fn register_with_id(&self, id: ConnectionId) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.outbound.write().await.insert(id, tx);
        rx
    }

    /// Drop a connection's queue and remove it from every room.
    ///
    /// Returns the rooms that became empty.
    pub async fn unregister(&self, id: &ConnectionId) -> Vec<RoomId> {
        self.outbound.write().await.remove(id);
        let rooms: Vec<RoomId> = self.rooms_of(id).await;
        let mut emptied = Vec::new();
        for room in rooms {
            if self.leave_room(id, &room).await {
                emptied.push(room);
            }
        }
        emptied
    }

    /// Add a connection to a room group, creating the group if needed.
    /// Joining twice is a no-op.
    pub async fn join_room(&self, id: ConnectionId, room: &str) {
        let mut rooms = self.rooms.write().await;
        let members = rooms.entry(room.to_string()).or_default();
        if !members.contains(&id) {
            members.push(id);
        }
    }

    /// Remove a connection from a room group. Returns `true` when the group
    /// became empty and was dropped.
    pub async fn leave_room(&self, id: &ConnectionId, room: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(members) = rooms.get_mut(room) else {
            return false;
        };
        members.retain(|m| m != id);
        if members.is_empty() {
            rooms.remove(room);
            log::debug!("Room {room} is empty, dropping its group");
            return true;
        }
        false
    }

    /// Members of a room in join order.
    pub async fn members(&self, room: &str) -> Vec<ConnectionId> {
        self.rooms.read().await.get(room).cloned().unwrap_or_default()
    }

    pub async fn member_count(&self, room: &str) -> usize {
        self.rooms.read().await.get(room).map_or(0, Vec::len)
    }

    pub async fn is_in_room(&self, id: &ConnectionId, room: &str) -> bool {
        self.rooms
            .read()
            .await
            .get(room)
            .is_some_and(|members| members.contains(id))
    }

    /// Rooms a connection currently belongs to.
    pub async fn rooms_of(&self, id: &ConnectionId) -> Vec<RoomId> {
        let rooms = self.rooms.read().await;
        let mut joined: Vec<RoomId> = rooms
            .iter()
            .filter(|(_, members)| members.contains(id))
            .map(|(room, _)| room.clone())
            .collect();
        joined.sort();
        joined
    }

    /// Send one event to one connection.
    pub async fn send_to(&self, id: &ConnectionId, event: &ServerEvent) -> Result<bool, ProtocolError> {
        let frame: Frame = Arc::from(event.encode()?);
        let outbound = self.outbound.read().await;
        Ok(self.deliver(&outbound, id, &frame))
    }

    /// Send an event to every member of a room, sender included.
    /// Returns the number of queues that accepted the frame.
    pub async fn broadcast(&self, room: &str, event: &ServerEvent) -> Result<usize, ProtocolError> {
        self.fan_out(room, None, event).await
    }

    /// Send an event to every member of a room except `sender`.
    pub async fn broadcast_except(
        &self,
        room: &str,
        sender: &ConnectionId,
        event: &ServerEvent,
    ) -> Result<usize, ProtocolError> {
        self.fan_out(room, Some(sender), event).await
    }

    async fn fan_out(
        &self,
        room: &str,
        skip: Option<&ConnectionId>,
        event: &ServerEvent,
    ) -> Result<usize, ProtocolError> {
        let members = self.members(room).await;
        if members.is_empty() {
            return Ok(0);
        }
        let frame: Frame = Arc::from(event.encode()?);
        let outbound = self.outbound.read().await;
        let mut delivered = 0;
        for id in members.iter().filter(|id| Some(*id) != skip) {
            if self.deliver(&outbound, id, &frame) {
                delivered += 1;
            }
        }
        log::trace!("Fan-out in room {room}: {delivered} recipients");
        Ok(delivered)
    }

    fn deliver(
        &self,
        outbound: &HashMap<ConnectionId, mpsc::Sender<Frame>>,
        id: &ConnectionId,
        frame: &Frame,
    ) -> bool {
        let Some(tx) = outbound.get(id) else {
            return false;
        };
        match tx.try_send(frame.clone()) {
            Ok(()) => {
                self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.atomic_stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Outbound queue full for {id}, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Number of non-empty rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn connection_count(&self) -> usize {
        self.outbound.read().await.len()
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_connections: self.connection_count().await,
            active_rooms: self.room_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
