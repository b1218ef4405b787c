//! WebSocket room server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                 ┌── RoomCoordinator ──┐
//!             ├── ws ── dispatch ├── ChangeRelay ──────┼── SessionRegistry ── ConnectionHub ──► Client A, B, C
//! Client B ──┘                 └── PresenceBroadcaster┘          │
//!                                        │                       │
//!                                        └── VersionedDocumentStore
//!                                                  │
//!                                                  └── PersistenceGateway (memory | RocksDB | disabled)
//! ```
//!
//! Each connection runs one task that reads client events and drains its
//! outbound queue. Events from one connection are handled in order; events
//! from different connections interleave freely.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::ConnectionHub;
use crate::coordinator::RoomCoordinator;
use crate::presence::PresenceBroadcaster;
use crate::protocol::{ClientEvent, ConnectionId, ProtocolError, RoomId};
use crate::registry::SessionRegistry;
use crate::relay::ChangeRelay;
use crate::storage::{
    DisabledGateway, MemoryGateway, PersistenceGateway, RocksConfig, RocksGateway, StoreError,
};
use crate::store::{StoreOptions, VersionedDocumentStore};

/// Default listening port.
pub const DEFAULT_PORT: u16 = 5001;

/// Where room documents are persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    /// In-process, lost on restart
    Memory,
    /// RocksDB at the given directory
    RocksDb { path: PathBuf },
    /// No persistence; rooms run in degraded relay-only mode
    Disabled,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound frames buffered per connection
    pub outbound_capacity: usize,
    /// Persistence backend
    pub storage: StorageBackend,
    /// Document TTL, placeholder and write ordering
    pub store: StoreOptions,
    /// Ask the longest-present member for its buffer when someone joins
    pub request_peer_snapshot: bool,
    /// How often expired RocksDB entries are swept
    pub purge_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("127.0.0.1:{DEFAULT_PORT}"),
            outbound_capacity: 256,
            storage: StorageBackend::Memory,
            store: StoreOptions::default(),
            request_peer_snapshot: true,
            purge_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl ServerConfig {
    pub fn with_bind(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            ..Self::default()
        }
    }

    pub fn with_storage(bind_addr: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            storage: StorageBackend::RocksDb { path: path.into() },
            ..Self::default()
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_messages: u64,
    pub active_rooms: usize,
    pub snapshots_accepted: u64,
    pub snapshots_stale: u64,
    pub frames_dropped: u64,
}

/// Shared handles passed to every connection task.
#[derive(Clone)]
pub struct ServerContext {
    pub hub: Arc<ConnectionHub>,
    pub registry: Arc<SessionRegistry>,
    pub store: Arc<VersionedDocumentStore>,
    pub coordinator: Arc<RoomCoordinator>,
    pub relay: Arc<ChangeRelay>,
    pub presence: Arc<PresenceBroadcaster>,
    stats: Arc<RwLock<ServerStats>>,
}

impl ServerContext {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        store_options: StoreOptions,
        outbound_capacity: usize,
        request_peer_snapshot: bool,
    ) -> Self {
        let hub = Arc::new(ConnectionHub::new(outbound_capacity));
        let registry = Arc::new(SessionRegistry::new(hub.clone()));
        let store = Arc::new(VersionedDocumentStore::new(gateway, store_options));
        Self {
            coordinator: Arc::new(RoomCoordinator::new(
                registry.clone(),
                store.clone(),
                request_peer_snapshot,
            )),
            relay: Arc::new(ChangeRelay::new(registry.clone(), store.clone())),
            presence: Arc::new(PresenceBroadcaster::new(registry.clone(), store.clone())),
            hub,
            registry,
            store,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Route one client event.
    pub async fn dispatch(&self, conn: ConnectionId, event: ClientEvent) -> Result<(), ProtocolError> {
        log::trace!("{conn} → {}", event.name());
        match event {
            ClientEvent::Join(p) => {
                self.coordinator.join(conn, &p.room_id, &p.username).await?;
            }
            ClientEvent::Disconnected(p) => {
                self.coordinator.leave(&conn, p.room_id.as_deref()).await?;
            }
            ClientEvent::CodeChange(p) => {
                for room in self.target_rooms(&conn, p.room_id.as_deref()).await {
                    self.relay.code_change(&conn, &room, p.clone()).await?;
                }
            }
            ClientEvent::SendCurrentCode(p) => {
                self.relay.send_current_code(&conn, p).await?;
            }
            ClientEvent::RequestCode(p) => {
                self.relay.request_code(&conn, p).await?;
            }
            ClientEvent::SyncCode(p) => {
                self.relay.sync_code(&conn, p).await?;
            }
            ClientEvent::CursorChange(p) => {
                for room in self.target_rooms(&conn, p.room_id.as_deref()).await {
                    self.presence.cursor_change(&conn, &room, p.clone()).await?;
                }
            }
            ClientEvent::SelectionChange(p) => {
                for room in self.target_rooms(&conn, p.room_id.as_deref()).await {
                    self.presence.selection_change(&conn, &room, p.clone()).await?;
                }
            }
            ClientEvent::CursorLeave(p) => {
                for room in self.target_rooms(&conn, p.room_id.as_deref()).await {
                    self.presence.cursor_leave(&conn, &room, p.clone()).await?;
                }
            }
            ClientEvent::LanguageChange(p) => {
                for room in self.target_rooms(&conn, p.room_id.as_deref()).await {
                    self.presence.language_change(&conn, &room, p.clone()).await?;
                }
            }
            ClientEvent::RequestLanguage(p) => {
                self.presence.request_language(&conn, &p.room_id).await?;
            }
        }
        Ok(())
    }

    /// The named room, or every joined room when the event omits it.
    async fn target_rooms(&self, conn: &ConnectionId, room: Option<&str>) -> Vec<RoomId> {
        match room {
            Some(room) => vec![room.to_string()],
            None => self.registry.rooms_of(conn).await,
        }
    }

    /// Tear down a closed connection.
    pub async fn close(&self, conn: &ConnectionId) {
        if let Err(e) = self.coordinator.disconnect(conn).await {
            log::warn!("Failed to announce departure of {conn}: {e}");
        }
        for room in self.hub.unregister(conn).await {
            self.store.forget(&room).await;
        }
    }
}

/// The room server.
pub struct SyncServer {
    config: ServerConfig,
    ctx: ServerContext,
    /// Kept for the periodic expiry sweep
    rocks: Option<Arc<RocksGateway>>,
}

impl SyncServer {
    /// Create a server, opening the configured storage backend.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let (gateway, rocks): (Arc<dyn PersistenceGateway>, Option<Arc<RocksGateway>>) =
            match &config.storage {
                StorageBackend::Memory => (Arc::new(MemoryGateway::new()), None),
                StorageBackend::RocksDb { path } => {
                    let rocks = Arc::new(RocksGateway::open(RocksConfig::at(path.clone()))?);
                    (rocks.clone(), Some(rocks))
                }
                StorageBackend::Disabled => (Arc::new(DisabledGateway), None),
            };
        let mut server = Self::with_gateway(config, gateway);
        server.rocks = rocks;
        Ok(server)
    }

    /// Create a server over an existing gateway.
    pub fn with_gateway(config: ServerConfig, gateway: Arc<dyn PersistenceGateway>) -> Self {
        let ctx = ServerContext::new(
            gateway,
            config.store.clone(),
            config.outbound_capacity,
            config.request_peer_snapshot,
        );
        Self {
            config,
            ctx,
            rocks: None,
        }
    }

    /// Create with default configuration (in-memory storage).
    pub fn with_defaults() -> Self {
        Self::with_gateway(ServerConfig::default(), Arc::new(MemoryGateway::new()))
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener, std::future::pending()).await
    }

    /// Serve connections from `listener` until `shutdown` resolves.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        log::info!(
            "Room server listening on {} (storage: {})",
            listener.local_addr()?,
            self.ctx.store.backend_name()
        );

        let sweeper = self.rocks.clone().map(|rocks| {
            let every = self.config.purge_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let gateway = Arc::clone(&rocks);
                    match tokio::task::spawn_blocking(move || gateway.purge_expired()).await {
                        Ok(Ok(0)) => {}
                        Ok(Ok(n)) => log::info!("Purged {n} expired keys"),
                        Ok(Err(e)) => log::warn!("Expiry sweep failed: {e}"),
                        Err(e) => log::error!("Expiry sweep task panicked: {e}"),
                    }
                }
            })
        });

        tokio::pin!(shutdown);
        let result = loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => break Err(e.into()),
                    };
                    log::debug!("New TCP connection from {addr}");

                    let ctx = self.ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, addr, ctx).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = &mut shutdown => {
                    log::info!("Shutting down room server");
                    break Ok(());
                }
            }
        };

        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        result
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        ctx: ServerContext,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (conn, mut outbound) = ctx.hub.register().await;
        log::info!("WebSocket connection {conn} established from {addr}");

        {
            let mut s = ctx.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = ctx.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += text.len() as u64;
                            }
                            match ClientEvent::decode(text.as_str()) {
                                Ok(event) => {
                                    let name = event.name();
                                    if let Err(e) = ctx.dispatch(conn, event).await {
                                        log::warn!("Failed to handle {name} from {conn}: {e}");
                                    }
                                }
                                Err(e) => {
                                    ctx.stats.write().await.rejected_messages += 1;
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break Ok(());
                        }

                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                break Err(e.into());
                            }
                        }

                        Some(Ok(Message::Binary(_))) => {
                            ctx.stats.write().await.rejected_messages += 1;
                            log::debug!("Ignoring binary frame from {addr}");
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break Ok(());
                        }

                        _ => {}
                    }
                }

                // Outgoing frames queued by the hub
                frame = outbound.recv() => {
                    let Some(frame) = frame else { break Ok(()) };
                    if let Err(e) = ws_sender.send(Message::Text(frame.to_string().into())).await {
                        break Err(e.into());
                    }
                }
            }
        };

        // Cleanup: announce departure, drop the queue and empty rooms
        ctx.close(&conn).await;
        {
            let mut s = ctx.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::info!("Connection {conn} from {addr} cleaned up");
        result
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.ctx.stats.read().await.clone();
        let hub = self.ctx.hub.stats().await;
        let relay = self.ctx.relay.stats();
        stats.active_rooms = hub.active_rooms;
        stats.frames_dropped = hub.messages_dropped;
        stats.snapshots_accepted = relay.snapshots_accepted;
        stats.snapshots_stale = relay.snapshots_stale;
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn context(&self) -> &ServerContext {
        &self.ctx
    }

    pub fn store(&self) -> &Arc<VersionedDocumentStore> {
        &self.ctx.store
    }
}
