//! WebSocket client for one room.
//!
//! Provides:
//! - Connection lifecycle (connect, join, leave, disconnect)
//! - Local edits published on both channels through [`ClientReconciler`]
//! - Periodic `send-current-code` reconciliation (default every 5 s)
//! - Remote presence tracking through [`PresenceTable`]
//!
//! ```text
//!  app ──edit/cursor──► SyncClient ──mpsc──► writer task ──► ws
//!                           │
//!                           ├── ticker task ── send-current-code every interval
//!                           │
//!  app ◄──SyncEvent──── reader task ◄── ws
//!                           ├─► ClientReconciler (document)
//!                           └─► PresenceTable   (cursors, selections)
//! ```

use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::buffer::TextBuffer;
use crate::presence::{PresenceTable, PresenceUpdate, RemotePresence};
use crate::protocol::{
    ClientEvent, ConnectionId, CursorPosition, DisconnectedPayload, EditOperation, EditRange,
    LanguagePayload, Member, ProtocolError, RoomId, ServerEvent,
};
use crate::reconciler::{ClientReconciler, Reconciled};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server URL, e.g. `ws://127.0.0.1:5001`
    pub server_url: String,
    pub room_id: RoomId,
    pub username: String,
    /// Interval of the periodic full-document push; idle peers are swept
    /// on the same tick
    pub reconcile_interval: Duration,
    /// Peers silent for this long lose their cursor and selection
    pub presence_idle_timeout: Duration,
    /// Cursor color; derived from the username when `None`
    pub color: Option<String>,
    /// Buffered application events
    pub event_capacity: usize,
}

impl ClientConfig {
    pub fn new(
        server_url: impl Into<String>,
        room_id: impl Into<RoomId>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            room_id: room_id.into(),
            username: username.into(),
            reconcile_interval: Duration::from_secs(5),
            presence_idle_timeout: Duration::from_secs(60),
            color: None,
            event_capacity: 256,
        }
    }

    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    pub fn with_presence_idle_timeout(mut self, timeout: Duration) -> Self {
        self.presence_idle_timeout = timeout;
        self
    }
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Connection established and `join` sent
    Connected,
    /// Connection lost or closed
    Disconnected,
    /// Someone (possibly us) joined; full member list
    MembersChanged {
        users: Vec<Member>,
        joined: String,
        socket_id: ConnectionId,
    },
    /// A member left the room
    PeerLeft {
        socket_id: Option<ConnectionId>,
        username: Option<String>,
    },
    /// Buffer replaced by a snapshot
    DocumentReplaced { version: u64 },
    /// Mirrored version moved without touching the buffer
    VersionAdopted(u64),
    /// Remote incremental edits applied
    RemoteEdit(Vec<EditOperation>),
    /// A peer's cursor or selection moved
    PresenceChanged(String),
    /// A peer's indicators were removed
    PresenceCleared(String),
    /// Room language changed or was reported
    LanguageChanged {
        language: String,
        username: Option<String>,
    },
}

enum Outgoing {
    Event(ClientEvent),
    Close,
}

/// The sync client.
pub struct SyncClient {
    config: ClientConfig,

    state: Arc<RwLock<ConnectionState>>,

    reconciler: Arc<Mutex<ClientReconciler<TextBuffer>>>,

    presence: Arc<Mutex<PresenceTable>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Outgoing>>,

    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    event_tx: mpsc::Sender<SyncEvent>,

    tasks: Vec<JoinHandle<()>>,
}

impl SyncClient {
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let mut presence = PresenceTable::new(config.username.as_str())
            .with_idle_timeout(config.presence_idle_timeout);
        if let Some(color) = &config.color {
            presence = presence.with_color(color.as_str());
        }
        Self {
            reconciler: Arc::new(Mutex::new(ClientReconciler::with_text(
                config.room_id.as_str(),
                "",
            ))),
            presence: Arc::new(Mutex::new(presence)),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            tasks: Vec::new(),
            config,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect, send `join` and start the reader, writer and ticker tasks.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.config.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.config.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Outgoing>(256);
        self.outgoing_tx = Some(out_tx.clone());

        // Writer task: forward outgoing events to the WebSocket
        self.tasks.push(tokio::spawn(async move {
            while let Some(item) = out_rx.recv().await {
                match item {
                    Outgoing::Event(event) => {
                        let text = match event.encode() {
                            Ok(text) => text,
                            Err(e) => {
                                log::error!("Failed to encode {}: {e}", event.name());
                                continue;
                            }
                        };
                        if ws_writer.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Outgoing::Close => {
                        let _ = ws_writer.close().await;
                        break;
                    }
                }
            }
        }));

        let join = self.reconciler.lock().await.join(&self.config.username);
        out_tx
            .send(Outgoing::Event(join))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        // Reader task: apply server events and notify the application
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let reconciler = self.reconciler.clone();
        let presence = self.presence.clone();
        let reply_tx = out_tx.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let event = match ServerEvent::decode(text.as_str()) {
                            Ok(event) => event,
                            Err(e) => {
                                log::warn!("Ignoring undecodable frame: {e}");
                                continue;
                            }
                        };
                        for evt in Self::route(&event, &reconciler, &presence, &reply_tx).await {
                            let _ = event_tx.send(evt).await;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            for name in presence.lock().await.clear_all() {
                let _ = event_tx.send(SyncEvent::PresenceCleared(name)).await;
            }
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        }));

        // Ticker task: periodic full reconciliation and idle presence sweep
        let interval = self.config.reconcile_interval;
        let reconciler = self.reconciler.clone();
        let presence = self.presence.clone();
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let tick_tx = out_tx;
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if *state.read().await != ConnectionState::Connected {
                    break;
                }
                let push = reconciler.lock().await.tick();
                if tick_tx.send(Outgoing::Event(push)).await.is_err() {
                    break;
                }
                let idle = presence.lock().await.cleanup_idle_peers();
                for name in idle {
                    log::debug!("Dropping idle presence of {name}");
                    let _ = event_tx.send(SyncEvent::PresenceCleared(name)).await;
                }
            }
        }));

        log::info!(
            "Connected to {} as {} in room {}",
            self.config.server_url,
            self.config.username,
            self.config.room_id
        );
        Ok(())
    }

    async fn route(
        event: &ServerEvent,
        reconciler: &Mutex<ClientReconciler<TextBuffer>>,
        presence: &Mutex<PresenceTable>,
        reply_tx: &mpsc::Sender<Outgoing>,
    ) -> Vec<SyncEvent> {
        match event {
            ServerEvent::Joined(p) => vec![SyncEvent::MembersChanged {
                users: p.users.clone(),
                joined: p.username.clone(),
                socket_id: p.socket_id,
            }],
            ServerEvent::Disconnected(p) => {
                let mut events = Vec::new();
                if let PresenceUpdate::Cleared(name) = presence.lock().await.handle_event(event) {
                    events.push(SyncEvent::PresenceCleared(name));
                }
                events.push(SyncEvent::PeerLeft {
                    socket_id: p.socket_id,
                    username: p.username.clone(),
                });
                events
            }
            ServerEvent::CodeChange(_)
            | ServerEvent::SyncCodeResponse(_)
            | ServerEvent::RequestCurrentCode(_) => {
                let outcome = reconciler.lock().await.handle(event);
                match outcome {
                    Reconciled::EditsApplied(edits) => vec![SyncEvent::RemoteEdit(edits)],
                    Reconciled::Replaced { version } => vec![SyncEvent::DocumentReplaced { version }],
                    Reconciled::VersionAdopted(v) => vec![SyncEvent::VersionAdopted(v)],
                    Reconciled::Reply(reply) => {
                        let _ = reply_tx.send(Outgoing::Event(reply)).await;
                        Vec::new()
                    }
                    Reconciled::StaleSnapshot { .. } | Reconciled::Nothing => Vec::new(),
                }
            }
            ServerEvent::CursorChange(_)
            | ServerEvent::SelectionChange(_)
            | ServerEvent::CursorLeave(_) => match presence.lock().await.handle_event(event) {
                PresenceUpdate::Changed(name) => vec![SyncEvent::PresenceChanged(name)],
                PresenceUpdate::Cleared(name) => vec![SyncEvent::PresenceCleared(name)],
                PresenceUpdate::None => Vec::new(),
            },
            ServerEvent::LanguageChange(p) => vec![SyncEvent::LanguageChanged {
                language: p.language.clone(),
                username: Some(p.username.clone()),
            }],
            ServerEvent::RoomLanguage(p) => vec![SyncEvent::LanguageChanged {
                language: p.language.clone(),
                username: None,
            }],
        }
    }

    async fn send(&self, event: ClientEvent) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        let Some(tx) = &self.outgoing_tx else {
            return Err(ProtocolError::ConnectionClosed);
        };
        tx.send(Outgoing::Event(event))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Apply a local edit and publish it.
    pub async fn edit(&self, edits: &[EditOperation]) -> Result<(), ProtocolError> {
        let events = self.reconciler.lock().await.local_edit(edits);
        for event in events {
            self.send(event).await?;
        }
        Ok(())
    }

    /// Publish the buffer with `force`, overriding the version gate.
    pub async fn force_publish(&self) -> Result<(), ProtocolError> {
        let event = self.reconciler.lock().await.force_publish();
        self.send(event).await
    }

    /// Ask for the current document if ours is stale.
    pub async fn resume(&self) -> Result<(), ProtocolError> {
        let event = self.reconciler.lock().await.resume();
        self.send(event).await
    }

    /// Publish the local caret. Throttled; returns `false` when skipped.
    pub async fn move_cursor(&self, position: CursorPosition) -> Result<bool, ProtocolError> {
        let payload = self
            .presence
            .lock()
            .await
            .local_cursor(&self.config.room_id, position);
        match payload {
            Some(payload) => {
                self.send(ClientEvent::CursorChange(payload)).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn select(&self, selection: EditRange) -> Result<(), ProtocolError> {
        let payload = self
            .presence
            .lock()
            .await
            .local_selection(&self.config.room_id, selection);
        self.send(ClientEvent::SelectionChange(payload)).await
    }

    /// Remove our cursor from the other editors.
    pub async fn hide_cursor(&self) -> Result<(), ProtocolError> {
        let payload = self.presence.lock().await.local_leave(&self.config.room_id);
        self.send(ClientEvent::CursorLeave(payload)).await
    }

    pub async fn set_language(&self, language: &str) -> Result<(), ProtocolError> {
        self.send(ClientEvent::LanguageChange(LanguagePayload {
            room_id: Some(self.config.room_id.clone()),
            language: language.to_string(),
            username: self.config.username.clone(),
        }))
        .await
    }

    pub async fn request_language(&self) -> Result<(), ProtocolError> {
        let event = self.reconciler.lock().await.request_language();
        self.send(event).await
    }

    /// Leave the room but keep the connection open.
    pub async fn leave(&self) -> Result<(), ProtocolError> {
        self.send(ClientEvent::Disconnected(DisconnectedPayload {
            socket_id: None,
            username: None,
            room_id: Some(self.config.room_id.clone()),
        }))
        .await
    }

    /// Close the connection and stop background tasks.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(Outgoing::Close).await;
        }
        *self.state.write().await = ConnectionState::Disconnected;
        // The reader finishes on the server's close reply; the ticker stops
        // on its next tick.
        self.tasks.clear();
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Current local buffer content.
    pub async fn value(&self) -> String {
        self.reconciler.lock().await.value().to_string()
    }

    pub async fn version(&self) -> Option<u64> {
        self.reconciler.lock().await.version()
    }

    /// Snapshot of remote presence, sorted by name.
    pub async fn peers(&self) -> Vec<RemotePresence> {
        let mut peers: Vec<RemotePresence> = self.presence.lock().await.peers().cloned().collect();
        peers.sort_by(|a, b| a.username.cmp(&b.username));
        peers
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
