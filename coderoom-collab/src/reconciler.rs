//! Client-side reconciliation of a local buffer with the room.
//!
//! ```text
//!            local keystroke                      server event
//!                  │                                   │
//!                  ▼                                   ▼
//!      ┌───────────────────────┐          ┌────────────────────────┐
//!      │ state == Idle         │          │ state := ApplyingRemote │
//!      │  → code-change        │          │ clamp + apply           │
//!      │  → send-current-code  │          │ change notifications    │
//!      └───────────────────────┘          │  are swallowed          │
//!                                         │ state := Idle           │
//!                                         └────────────────────────┘
//! ```
//!
//! The mirrored version starts unknown on every join. A full snapshot is
//! applied only when its version is at least the mirrored one.

use crate::buffer::{EditorBuffer, TextBuffer};
use crate::protocol::{
    ClientEvent, CodeChangePayload, EditOperation, JoinPayload, RequestCodePayload, RoomId,
    RoomPayload, SendCurrentCodePayload, ServerEvent, SyncCodeResponse,
};

/// Origin of buffer mutations currently being observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyState {
    /// Mutations come from the local user and are published.
    Idle,
    /// Mutations come from the server and must not be re-emitted.
    ApplyingRemote,
}

/// Effect of a server event on the local side.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
    /// Not a document event.
    Nothing,
    /// Remote incremental edits applied (after clamping).
    EditsApplied(Vec<EditOperation>),
    /// Buffer replaced by a full snapshot.
    Replaced { version: u64 },
    /// Snapshot matched the buffer or carried no body; version mirrored.
    VersionAdopted(u64),
    /// Snapshot older than the mirrored version; ignored.
    StaleSnapshot { local: u64, remote: u64 },
    /// The server asked for our buffer; send this back.
    Reply(ClientEvent),
}

/// Local buffer plus the room's mirrored version.
#[derive(Debug, Clone)]
pub struct ClientReconciler<B: EditorBuffer = TextBuffer> {
    room_id: RoomId,
    buffer: B,
    state: ApplyState,
    version: Option<u64>,
}

impl ClientReconciler<TextBuffer> {
    pub fn with_text(room_id: impl Into<RoomId>, text: &str) -> Self {
        Self::new(room_id, TextBuffer::new(text))
    }
}

impl<B: EditorBuffer> ClientReconciler<B> {
    pub fn new(room_id: impl Into<RoomId>, buffer: B) -> Self {
        Self {
            room_id: room_id.into(),
            buffer,
            state: ApplyState::Idle,
            version: None,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn buffer(&self) -> &B {
        &self.buffer
    }

    pub fn value(&self) -> &str {
        self.buffer.value()
    }

    /// Mirrored document version; `None` until the first snapshot.
    pub fn version(&self) -> Option<u64> {
        self.version
    }

    pub fn state(&self) -> ApplyState {
        self.state
    }

    /// `join` for this room. Forgets the mirrored version.
    pub fn join(&mut self, username: &str) -> ClientEvent {
        self.version = None;
        self.state = ApplyState::Idle;
        ClientEvent::Join(JoinPayload {
            room_id: self.room_id.clone(),
            username: username.to_string(),
        })
    }

    /// Apply a local edit and return the events to publish.
    pub fn local_edit(&mut self, edits: &[EditOperation]) -> Vec<ClientEvent> {
        let applied = self.buffer.apply_edits(edits);
        self.on_content_changed(&applied)
    }

    /// Change notification from the editing surface.
    ///
    /// Publishes `code-change` followed by `send-current-code` for local
    /// changes; returns nothing while a remote change is being applied.
    pub fn on_content_changed(&mut self, changes: &[EditOperation]) -> Vec<ClientEvent> {
        if self.state == ApplyState::ApplyingRemote || changes.is_empty() {
            return Vec::new();
        }
        vec![
            ClientEvent::CodeChange(CodeChangePayload {
                room_id: Some(self.room_id.clone()),
                changes: changes.to_vec(),
            }),
            self.publish(false),
        ]
    }

    /// Periodic full-document push.
    pub fn tick(&self) -> ClientEvent {
        self.publish(false)
    }

    /// Push the buffer regardless of the server's version.
    pub fn force_publish(&self) -> ClientEvent {
        self.publish(true)
    }

    /// Pull the server state after being backgrounded or reconnecting.
    pub fn resume(&self) -> ClientEvent {
        ClientEvent::RequestCode(RequestCodePayload {
            room_id: self.room_id.clone(),
            client_version: self.version,
        })
    }

    pub fn request_language(&self) -> ClientEvent {
        ClientEvent::RequestLanguage(RoomPayload {
            room_id: self.room_id.clone(),
        })
    }

    fn publish(&self, force: bool) -> ClientEvent {
        ClientEvent::SendCurrentCode(SendCurrentCodePayload {
            room_id: self.room_id.clone(),
            code: self.buffer.value().to_string(),
            force: force.then_some(true),
            client_version: self.version,
        })
    }

    /// Apply a server event to the local buffer.
    pub fn handle(&mut self, event: &ServerEvent) -> Reconciled {
        match event {
            ServerEvent::CodeChange(payload) => {
                let applied = self.apply_remote(|buffer| buffer.apply_edits(&payload.changes));
                Reconciled::EditsApplied(applied)
            }
            ServerEvent::SyncCodeResponse(response) => self.handle_snapshot(response),
            ServerEvent::RequestCurrentCode(payload) if payload.room_id == self.room_id => {
                Reconciled::Reply(self.publish(false))
            }
            _ => Reconciled::Nothing,
        }
    }

    fn handle_snapshot(&mut self, response: &SyncCodeResponse) -> Reconciled {
        let Some(remote) = response.version else {
            // Versionless push from a legacy peer: treat as current.
            let Some(code) = &response.code else {
                return Reconciled::Nothing;
            };
            let version = self.version.unwrap_or(0);
            self.replace(code);
            return Reconciled::Replaced { version };
        };

        if let Some(local) = self.version {
            if remote < local {
                log::debug!("Ignoring snapshot v{remote}, local is v{local}");
                return Reconciled::StaleSnapshot { local, remote };
            }
        }
        self.version = Some(remote);

        match &response.code {
            Some(code) if !response.is_up_to_date() && code != self.buffer.value() => {
                self.replace(code);
                Reconciled::Replaced { version: remote }
            }
            _ => Reconciled::VersionAdopted(remote),
        }
    }

    fn replace(&mut self, code: &str) {
        self.apply_remote(|buffer| {
            buffer.set_value(code);
            Vec::new()
        });
    }

    fn apply_remote(&mut self, apply: impl FnOnce(&mut B) -> Vec<EditOperation>) -> Vec<EditOperation> {
        self.state = ApplyState::ApplyingRemote;
        let applied = apply(&mut self.buffer);
        // The editing surface reports every mutation, remote ones included.
        let echoed = self.on_content_changed(&applied);
        debug_assert!(echoed.is_empty());
        self.state = ApplyState::Idle;
        applied
    }
}
