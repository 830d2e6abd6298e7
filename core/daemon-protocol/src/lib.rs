//! Wire types and request validation for companion-daemon.
//!
//! Shared by the daemon and its clients to prevent schema drift. The daemon
//! remains the authority on validation, but clients can reuse the same types
//! to build valid requests and decode queue payloads.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 8 * 1024 * 1024; // 8MB, code payloads can be large
const MAX_FILE_PATH_LEN: usize = 4096;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Body returned with every non-2xx HTTP response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorInfo,
}

// ─────────────────────────────────────────────────────────────────────────────
// Activity records
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntrySource {
    FileWatcher,
    Mcp,
}

/// A recorded, significant code change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entry {
    pub id: String,
    pub session_id: String,
    pub workspace_id: String,
    pub file_path: String,
    pub before_content: String,
    pub after_content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub prompt_id: Option<String>,
    pub source: EntrySource,
    pub diff_size: u64,
    pub lines_added: u32,
    pub lines_removed: u32,
    pub chars_added: u64,
    pub chars_deleted: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PromptStatus {
    Pending,
    Captured,
    Linked,
}

impl PromptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptStatus::Pending => "pending",
            PromptStatus::Captured => "captured",
            PromptStatus::Linked => "linked",
        }
    }

    pub fn is_linkable(&self) -> bool {
        matches!(self, PromptStatus::Pending | PromptStatus::Captured)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PromptOrigin {
    Api,
    Editor,
    Mcp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Prompt {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub status: PromptStatus,
    #[serde(default)]
    pub linked_entry_id: Option<String>,
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub origin: PromptOrigin,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
}

/// One threaded message of an editor conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationTurn {
    pub conversation_id: String,
    pub role: TurnRole,
    pub text: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub thinking_time_ms: Option<i64>,
    pub workspace_id: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Prompt,
    PromptResponse,
    CodeChange,
    FileDeleted,
    ConversationTurn,
    Clipboard,
    SessionRotated,
}

/// Payload of every queue item of kind `event`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityEvent {
    pub id: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkspaceInfo {
    pub id: String,
    pub root_path: String,
    pub method: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Delivery queue
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    Entry,
    Event,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueItem {
    pub seq: u64,
    pub kind: QueueKind,
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
}

/// Response to `GET /queue`. `entries` holds the payloads of entry items,
/// `events` the full event items; `cursor` is the latest assigned sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueResponse {
    pub entries: Vec<Value>,
    pub events: Vec<QueueItem>,
    pub cursor: u64,
}

impl QueueResponse {
    pub fn from_items(items: Vec<QueueItem>, cursor: u64) -> Self {
        let mut entries = Vec::new();
        let mut events = Vec::new();
        for item in items {
            match item.kind {
                QueueKind::Entry => entries.push(item.payload),
                QueueKind::Event => events.push(item),
            }
        }
        Self {
            entries,
            events,
            cursor,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AckResponse {
    pub cursor: u64,
    pub purged: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntryIdResponse {
    pub entry_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PromptIdResponse {
    pub prompt_id: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Request bodies
// ─────────────────────────────────────────────────────────────────────────────

pub trait Validate {
    fn validate(&self) -> Result<(), ErrorInfo>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AckRequest {
    pub cursor: u64,
}

impl Validate for AckRequest {
    fn validate(&self) -> Result<(), ErrorInfo> {
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogCodeChangeRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    pub file_path: String,
    #[serde(default)]
    pub before_code: String,
    #[serde(default)]
    pub after_code: String,
}

impl Validate for LogCodeChangeRequest {
    fn validate(&self) -> Result<(), ErrorInfo> {
        require_file_path(&self.file_path)?;
        if self.before_code == self.after_code {
            return Err(ErrorInfo::new(
                "invalid_params",
                "before_code and after_code are identical",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogPromptResponseRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    pub file_path: String,
    pub prompt: String,
    #[serde(default)]
    pub response: String,
}

impl Validate for LogPromptResponseRequest {
    fn validate(&self) -> Result<(), ErrorInfo> {
        require_file_path(&self.file_path)?;
        require_text(&self.prompt, "prompt")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CapturePromptRequest {
    pub text: String,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Validate for CapturePromptRequest {
    fn validate(&self) -> Result<(), ErrorInfo> {
        require_text(&self.text, "text")?;
        if let Some(path) = &self.file_path {
            require_file_path(path)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClipboardRequest {
    pub content: String,
    #[serde(default)]
    pub file_path: Option<String>,
}

impl Validate for ClipboardRequest {
    fn validate(&self) -> Result<(), ErrorInfo> {
        require_text(&self.content, "content")
    }
}

/// Decodes and validates a JSON request body.
pub fn parse_body<T>(bytes: &[u8]) -> Result<T, ErrorInfo>
where
    T: DeserializeOwned + Validate,
{
    if bytes.len() > MAX_REQUEST_BYTES {
        return Err(ErrorInfo::new(
            "request_too_large",
            "request exceeded maximum size",
        ));
    }
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }
    let body: T = serde_json::from_slice(bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })?;
    body.validate()?;
    Ok(body)
}

fn require_file_path(path: &str) -> Result<(), ErrorInfo> {
    require_text(path, "file_path")?;
    if path.len() > MAX_FILE_PATH_LEN {
        return Err(ErrorInfo::new(
            "invalid_params",
            format!("file_path must be {} characters or fewer", MAX_FILE_PATH_LEN),
        ));
    }
    Ok(())
}

fn require_text(value: &str, field: &str) -> Result<(), ErrorInfo> {
    if value.trim().is_empty() {
        return Err(ErrorInfo::new(
            "missing_field",
            format!("{} is required", field),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ack_request() {
        let ack: AckRequest = parse_body(br#"{"cursor": 42}"#).expect("ack");
        assert_eq!(ack.cursor, 42);
    }

    #[test]
    fn rejects_ack_with_unknown_fields() {
        let err = parse_body::<AckRequest>(br#"{"cursor": 1, "extra": true}"#).unwrap_err();
        assert_eq!(err.code, "invalid_json");
    }

    #[test]
    fn rejects_empty_body() {
        let err = parse_body::<AckRequest>(b"   ").unwrap_err();
        assert_eq!(err.code, "empty_request");
    }

    #[test]
    fn code_change_requires_file_path() {
        let err = parse_body::<LogCodeChangeRequest>(
            br#"{"file_path": "  ", "before_code": "a", "after_code": "b"}"#,
        )
        .unwrap_err();
        assert_eq!(err.code, "missing_field");
    }

    #[test]
    fn code_change_rejects_identical_content() {
        let err = parse_body::<LogCodeChangeRequest>(
            br#"{"file_path": "/repo/a.rs", "before_code": "x", "after_code": "x"}"#,
        )
        .unwrap_err();
        assert_eq!(err.code, "invalid_params");
    }

    #[test]
    fn prompt_response_accepts_missing_session() {
        let body: LogPromptResponseRequest = parse_body(
            br#"{"file_path": "/repo/a.rs", "prompt": "fix it", "response": "done"}"#,
        )
        .expect("body");
        assert!(body.session_id.is_none());
        assert_eq!(body.prompt, "fix it");
    }

    #[test]
    fn capture_prompt_parses_timestamp() {
        let body: CapturePromptRequest =
            parse_body(br#"{"text": "add tests", "timestamp": "2026-01-31T00:00:00Z"}"#)
                .expect("body");
        assert_eq!(
            body.timestamp.map(|ts| ts.to_rfc3339()),
            Some("2026-01-31T00:00:00+00:00".to_string())
        );
    }

    #[test]
    fn queue_response_splits_by_kind() {
        let now = Utc::now();
        let items = vec![
            QueueItem {
                seq: 1,
                kind: QueueKind::Event,
                payload: serde_json::json!({"id": "p1"}),
                enqueued_at: now,
            },
            QueueItem {
                seq: 2,
                kind: QueueKind::Entry,
                payload: serde_json::json!({"id": "e1"}),
                enqueued_at: now,
            },
        ];
        let response = QueueResponse::from_items(items, 2);
        assert_eq!(response.entries.len(), 1);
        assert_eq!(response.events.len(), 1);
        assert_eq!(response.events[0].seq, 1);
        assert_eq!(response.cursor, 2);
    }

    #[test]
    fn prompt_status_linkability() {
        assert!(PromptStatus::Pending.is_linkable());
        assert!(PromptStatus::Captured.is_linkable());
        assert!(!PromptStatus::Linked.is_linkable());
    }
}
