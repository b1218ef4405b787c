//! # coderoom-collab: room-based live code sharing
//!
//! A WebSocket server that groups connections into rooms, relays edits and
//! presence between members, and keeps one versioned snapshot of each
//! room's document. The client side reconciles a local buffer against that
//! snapshot.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐    JSON events     ┌──────────────────┐
//! │ SyncClient       │ ◄────────────────► │ SyncServer       │
//! │  ClientReconciler│    over WebSocket  │  RoomCoordinator │
//! │  PresenceTable   │                    │  ChangeRelay     │
//! └──────────────────┘                    │  Presence        │
//!                                         └────────┬─────────┘
//!                                                  │
//!                                   ┌──────────────┴──────────────┐
//!                                   │ VersionedDocumentStore      │
//!                                   │  PersistenceGateway         │
//!                                   │  (memory | RocksDB | none)  │
//!                                   └─────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: event names, payloads and JSON framing
//! - [`broadcast`]: connection table and per-room fan-out
//! - [`registry`]: who is in which room, under which name
//! - [`store`]: room snapshots with monotonic versions
//! - [`storage`]: key/value persistence backends with expiry
//! - [`coordinator`]: join and leave handling
//! - [`relay`]: edit relay and snapshot reconciliation
//! - [`presence`]: cursor, selection and language relay; client presence table
//! - [`server`]: WebSocket server
//! - [`buffer`]: line/column text buffer
//! - [`reconciler`]: client-side apply and publish state machine
//! - [`client`]: WebSocket client driving the reconciler

pub mod protocol;
pub mod broadcast;
pub mod registry;
pub mod storage;
pub mod store;
pub mod coordinator;
pub mod relay;
pub mod presence;
pub mod server;
pub mod buffer;
pub mod reconciler;
pub mod client;

// Re-exports for convenience
pub use protocol::{
    ClientEvent, ConnectionId, CursorPosition, EditOperation, EditRange, Member,
    ProtocolError, RoomId, ServerEvent, SyncCodeResponse,
};
pub use broadcast::{BroadcastStats, ConnectionHub};
pub use registry::{Session, SessionRegistry, SessionState};
pub use storage::{
    DisabledGateway, MemoryGateway, PersistenceGateway, RocksConfig, RocksGateway, RoomKeys,
    StoreError,
};
pub use store::{
    DocumentSnapshot, StoreOptions, VersionedDocumentStore, WriteOrdering, WriteOutcome,
    DOCUMENT_TTL, PLACEHOLDER_BODY,
};
pub use coordinator::{JoinOutcome, RoomCoordinator};
pub use relay::{ChangeRelay, RelayStats, SnapshotDecision};
pub use presence::{color_for, PresenceBroadcaster, PresenceTable, PresenceUpdate, RemotePresence};
pub use server::{ServerConfig, ServerContext, ServerStats, StorageBackend, SyncServer};
pub use buffer::{EditorBuffer, TextBuffer};
pub use reconciler::{ApplyState, ClientReconciler, Reconciled};
pub use client::{ClientConfig, ConnectionState, SyncClient, SyncEvent};
