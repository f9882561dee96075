//! Wire protocol and shared records
//!
//! JSON envelopes named by event, exchanged over the WebSocket channel in
//! both directions, plus the row shapes the relay persists. Wire field
//! names are camelCase; envelopes look like `{"event": "file:diff",
//! "data": {...}}`.

use crate::config::MAX_PAYLOAD_BYTES;
use crate::core::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Who produced a change, inferred from write cadence.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthorType {
    #[default]
    Human,
    Agent,
}

/// Kind of soft lock held on a file.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum LockType {
    #[default]
    #[serde(rename = "editing")]
    Editing,
    #[serde(rename = "agent-writing")]
    AgentWriting,
}

impl From<AuthorType> for LockType {
    fn from(author: AuthorType) -> Self {
        match author {
            AuthorType::Human => LockType::Editing,
            AuthorType::Agent => LockType::AgentWriting,
        }
    }
}

/// One change to one file by one author.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileDiff {
    /// Store-assigned monotonic id; absent until persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// Project-relative path, forward-slash normalized.
    pub file: String,
    /// Unified-hunk patch text.
    pub patch: String,
    pub author: String,
    #[serde(rename = "type", default)]
    pub author_type: AuthorType,
    /// Milliseconds since epoch at the producer.
    pub timestamp: i64,
    /// Fingerprint after the patch applies cleanly.
    pub version: String,
    /// Fingerprint before.
    pub previous_version: String,
    /// Reserved; never set by this implementation.
    #[serde(default)]
    pub compressed: bool,
}

/// Current fingerprint of a file at the relay.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileVersion {
    pub file: String,
    pub hash: String,
    pub timestamp: i64,
}

/// Soft advisory lock row. The holder's connection id is runtime-only
/// state and never serialized.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LockState {
    pub file: String,
    pub locked_by: String,
    #[serde(default)]
    pub lock_type: LockType,
    /// Milliseconds since epoch of acquisition or last refresh.
    pub since: i64,
}

/// Record of two overlapping patches to the same file.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConflictEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub file: String,
    /// Suggested conflict-copy name: `<base>.conflict-<ts>.<ext>`.
    pub conflict_file: String,
    pub author_a: String,
    pub author_b: String,
    pub timestamp: i64,
    #[serde(default)]
    pub resolved: bool,
}

/// Lock acquisition request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRequest {
    pub file: String,
    #[serde(default)]
    pub lock_type: LockType,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnlockRequest {
    pub file: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDeletePayload {
    pub file: String,
    pub author: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRenamePayload {
    pub old_file: String,
    pub new_file: String,
    pub author: String,
}

/// Whole-file content push, used for new files and empty-cache sends.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullFileSync {
    pub file: String,
    pub content: String,
    pub hash: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoRequest {
    pub file: String,
    pub diff_id: i64,
}

/// Connect-time state exchange: the client reports its fingerprints, the
/// relay answers with everything it missed.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncHandshake {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    pub client_id: String,
    pub project_id: String,
    pub file_versions: HashMap<String, String>,
}

/// A full file delivered in a handshake response. The reference relay
/// always sends this list empty; clients iterate it regardless.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullFile {
    pub file: String,
    pub content: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SyncHandshakeResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    pub missing_diffs: Vec<FileDiff>,
    pub full_files: Vec<FullFile>,
    pub locks: Vec<LockState>,
}

/// A connected peer as shown on the dashboard.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSummary {
    pub connection_id: String,
    pub display_name: String,
    pub connected_since: i64,
    pub last_activity: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMetrics {
    pub uptime_ms: i64,
    pub db_size_bytes: u64,
    pub total_diffs: u64,
    pub total_files: u64,
}

/// Periodic rollup pushed to dashboard subscribers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardState {
    pub clients: Vec<ClientSummary>,
    pub locks: Vec<LockState>,
    pub recent_diffs: Vec<FileDiff>,
    pub recent_conflicts: Vec<ConflictEvent>,
    pub health: HealthMetrics,
}

/// Every message that crosses the wire, in either direction.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum Envelope {
    // Client → relay
    #[serde(rename = "file:diff")]
    FileDiff(FileDiff),
    #[serde(rename = "file:lock")]
    FileLock(LockRequest),
    #[serde(rename = "file:unlock")]
    FileUnlock(UnlockRequest),
    #[serde(rename = "file:delete")]
    FileDelete(FileDeletePayload),
    #[serde(rename = "file:rename")]
    FileRename(FileRenamePayload),
    #[serde(rename = "sync:handshake")]
    SyncHandshake(SyncHandshake),
    #[serde(rename = "sync:full-file")]
    SyncFullFile(FullFileSync),
    #[serde(rename = "dashboard:subscribe")]
    DashboardSubscribe,
    #[serde(rename = "diff:undo")]
    DiffUndo(UndoRequest),

    // Relay → client
    #[serde(rename = "sync:handshake-response")]
    SyncHandshakeResponse(SyncHandshakeResponse),
    #[serde(rename = "file:lock-changed")]
    FileLockChanged(Vec<LockState>),
    #[serde(rename = "file:conflict")]
    FileConflict(ConflictEvent),
    #[serde(rename = "dashboard:state")]
    DashboardState(Box<DashboardState>),
    #[serde(rename = "sync:apply-full-file")]
    SyncApplyFullFile(FullFileSync),
}

impl Envelope {
    /// Event name as it appears on the wire.
    pub fn event(&self) -> &'static str {
        match self {
            Envelope::FileDiff(_) => "file:diff",
            Envelope::FileLock(_) => "file:lock",
            Envelope::FileUnlock(_) => "file:unlock",
            Envelope::FileDelete(_) => "file:delete",
            Envelope::FileRename(_) => "file:rename",
            Envelope::SyncHandshake(_) => "sync:handshake",
            Envelope::SyncFullFile(_) => "sync:full-file",
            Envelope::DashboardSubscribe => "dashboard:subscribe",
            Envelope::DiffUndo(_) => "diff:undo",
            Envelope::SyncHandshakeResponse(_) => "sync:handshake-response",
            Envelope::FileLockChanged(_) => "file:lock-changed",
            Envelope::FileConflict(_) => "file:conflict",
            Envelope::DashboardState(_) => "dashboard:state",
            Envelope::SyncApplyFullFile(_) => "sync:apply-full-file",
        }
    }

    /// Serialize, enforcing the payload cap.
    pub fn encode(&self) -> Result<String> {
        let text = serde_json::to_string(self)?;
        if text.len() > MAX_PAYLOAD_BYTES {
            return Err(SyncError::PayloadTooLarge {
                max: MAX_PAYLOAD_BYTES,
                actual: text.len(),
            });
        }
        Ok(text)
    }

    /// Parse a wire message. Unknown events surface as errors; callers log
    /// and ignore them without dropping the connection.
    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
