//! JSON event protocol spoken between editors and the room server.
//!
//! Every WebSocket text frame carries exactly one event:
//! ```text
//! { "event": "<name>", "data": { ...camelCase payload... } }
//! ```
//!
//! Events fall into four families that never share a variant:
//!
//! | Channel      | Client → server                      | Server → client              |
//! |--------------|--------------------------------------|------------------------------|
//! | Membership   | `join`, `disconnected`               | `joined`, `disconnected`     |
//! | Live edits   | `code-change`                        | `code-change`                |
//! | Snapshots    | `send-current-code`, `request-code`, | `sync-code-response`,        |
//! |              | `sync-code`                          | `request-current-code`       |
//! | Presence     | `cursor-change`, `selection-change`, | same, plus `room-language`   |
//! |              | `cursor-leave`, `language-change`,   |                              |
//! |              | `request-language`                   |                              |
//!
//! Coordinates are 1-based line/column pairs using the editor's field names
//! (`startLineNumber`, `startColumn`, ...).

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque, caller-supplied room identifier.
pub type RoomId = String;

/// Transport-level identity of one connection (`socketId` on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ───────────────────────────────────────────────────────────────────
// Shared payload types
// ───────────────────────────────────────────────────────────────────

/// A range in 1-based line/column coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditRange {
    pub start_line_number: u32,
    pub start_column: u32,
    pub end_line_number: u32,
    pub end_column: u32,
}

impl EditRange {
    pub fn new(start_line: u32, start_column: u32, end_line: u32, end_column: u32) -> Self {
        Self {
            start_line_number: start_line,
            start_column,
            end_line_number: end_line,
            end_column,
        }
    }

    /// Zero-width range at a position.
    pub fn caret(line: u32, column: u32) -> Self {
        Self::new(line, column, line, column)
    }

    pub fn start(&self) -> CursorPosition {
        CursorPosition::new(self.start_line_number, self.start_column)
    }

    pub fn end(&self) -> CursorPosition {
        CursorPosition::new(self.end_line_number, self.end_column)
    }

    pub fn is_empty(&self) -> bool {
        self.start() == self.end()
    }
}

/// A caret position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPosition {
    pub line_number: u32,
    pub column: u32,
}

impl CursorPosition {
    pub fn new(line_number: u32, column: u32) -> Self {
        Self { line_number, column }
    }
}

/// One incremental replacement: `range` in the sender's buffer becomes `text`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditOperation {
    pub range: EditRange,
    pub text: String,
}

impl EditOperation {
    pub fn new(range: EditRange, text: impl Into<String>) -> Self {
        Self {
            range,
            text: text.into(),
        }
    }

    pub fn insert(line: u32, column: u32, text: impl Into<String>) -> Self {
        Self::new(EditRange::caret(line, column), text)
    }

    pub fn delete(range: EditRange) -> Self {
        Self::new(range, String::new())
    }
}

/// A room member as listed in `joined` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub socket_id: ConnectionId,
    pub username: String,
}

// ───────────────────────────────────────────────────────────────────
// Payloads
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    pub room_id: RoomId,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinedPayload {
    pub users: Vec<Member>,
    pub username: String,
    pub socket_id: ConnectionId,
}

/// `disconnected`, in both directions. Clients send it (with or without a
/// room) to leave without closing the socket; the server sends it to the
/// remaining members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectedPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_id: Option<ConnectionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeChangePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    pub changes: Vec<EditOperation>,
}

/// Legacy full-sync: with `code` it is a push, without it a pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCodePayload {
    pub room_id: RoomId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_version: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCodeResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub up_to_date: Option<bool>,
}

impl SyncCodeResponse {
    pub fn snapshot(code: impl Into<String>, version: u64) -> Self {
        Self {
            code: Some(code.into()),
            version: Some(version),
            up_to_date: None,
        }
    }

    pub fn up_to_date(version: u64) -> Self {
        Self {
            code: None,
            version: Some(version),
            up_to_date: Some(true),
        }
    }

    pub fn is_up_to_date(&self) -> bool {
        self.up_to_date == Some(true)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestCodePayload {
    pub room_id: RoomId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_version: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendCurrentCodePayload {
    pub room_id: RoomId,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_version: Option<u64>,
}

impl SendCurrentCodePayload {
    pub fn is_forced(&self) -> bool {
        self.force == Some(true)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomPayload {
    pub room_id: RoomId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    pub position: CursorPosition,
    pub username: String,
    #[serde(default)]
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    pub selection: EditRange,
    pub username: String,
    #[serde(default)]
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorLeavePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguagePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    pub language: String,
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomLanguagePayload {
    pub language: String,
}

// ───────────────────────────────────────────────────────────────────
// Events
// ───────────────────────────────────────────────────────────────────

/// Events sent by editors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    Join(JoinPayload),
    Disconnected(DisconnectedPayload),
    CodeChange(CodeChangePayload),
    SyncCode(SyncCodePayload),
    RequestCode(RequestCodePayload),
    SendCurrentCode(SendCurrentCodePayload),
    CursorChange(CursorPayload),
    SelectionChange(SelectionPayload),
    CursorLeave(CursorLeavePayload),
    LanguageChange(LanguagePayload),
    RequestLanguage(RoomPayload),
}

impl ClientEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Join(_) => "join",
            Self::Disconnected(_) => "disconnected",
            Self::CodeChange(_) => "code-change",
            Self::SyncCode(_) => "sync-code",
            Self::RequestCode(_) => "request-code",
            Self::SendCurrentCode(_) => "send-current-code",
            Self::CursorChange(_) => "cursor-change",
            Self::SelectionChange(_) => "selection-change",
            Self::CursorLeave(_) => "cursor-leave",
            Self::LanguageChange(_) => "language-change",
            Self::RequestLanguage(_) => "request-language",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Events sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    Joined(JoinedPayload),
    Disconnected(DisconnectedPayload),
    CodeChange(CodeChangePayload),
    SyncCodeResponse(SyncCodeResponse),
    RequestCurrentCode(RoomPayload),
    CursorChange(CursorPayload),
    SelectionChange(SelectionPayload),
    CursorLeave(CursorLeavePayload),
    LanguageChange(LanguagePayload),
    RoomLanguage(RoomLanguagePayload),
}

impl ServerEvent {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("connection closed")]
    ConnectionClosed,
}
