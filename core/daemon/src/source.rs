//! Read-only access to the editor's own prompt/generation history.
//!
//! Each editor workspace keeps a `state.vscdb` SQLite file under
//! `workspaceStorage/<hash>/` alongside a `workspace.json` naming the folder
//! it belongs to. Prompts and generations live as JSON arrays in `ItemTable`.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, types::Value as SqlValue, Connection, OpenFlags, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use url::Url;

use crate::conversation::{RawGeneration, RawPrompt};
use crate::error::{CompanionError, Result};

pub const STATE_DB_NAME: &str = "state.vscdb";
pub const WORKSPACE_MANIFEST: &str = "workspace.json";
pub const PROMPTS_KEY: &str = "aiService.prompts";
pub const GENERATIONS_KEY: &str = "aiService.generations";

/// Everything one editor workspace currently holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceBatch {
    pub storage_key: String,
    pub workspace_path: Option<PathBuf>,
    pub prompts: Vec<RawPrompt>,
    pub generations: Vec<RawGeneration>,
}

pub trait PromptSource: Send + Sync {
    fn name(&self) -> &'static str;
    fn fetch(&self) -> Result<Vec<SourceBatch>>;
}

#[derive(Debug, Clone)]
pub struct CursorSource {
    storage_dir: PathBuf,
}

impl CursorSource {
    pub fn new(storage_dir: PathBuf) -> Self {
        Self { storage_dir }
    }

    /// `<config>/Cursor/User/workspaceStorage` for the current platform.
    pub fn default_storage_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("Cursor").join("User").join("workspaceStorage"))
    }

    fn read_batch(&self, dir: &Path) -> Result<Option<SourceBatch>> {
        let db_path = dir.join(STATE_DB_NAME);
        if !db_path.is_file() {
            return Ok(None);
        }

        let conn = open_read_only(&db_path)?;
        let prompts = read_item(&conn, &db_path, PROMPTS_KEY)?
            .map(|raw| parse_prompts(&raw))
            .unwrap_or_default();
        let generations = read_item(&conn, &db_path, GENERATIONS_KEY)?
            .map(|raw| parse_generations(&raw))
            .unwrap_or_default();

        let storage_key = dir
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();

        Ok(Some(SourceBatch {
            storage_key,
            workspace_path: read_workspace_folder(dir),
            prompts,
            generations,
        }))
    }
}

impl PromptSource for CursorSource {
    fn name(&self) -> &'static str {
        "cursor"
    }

    fn fetch(&self) -> Result<Vec<SourceBatch>> {
        let entries = fs_err::read_dir(&self.storage_dir).map_err(|err| {
            CompanionError::SourceUnavailable {
                path: self.storage_dir.clone(),
                details: err.to_string(),
            }
        })?;

        let mut batches = Vec::new();
        for entry in entries.flatten() {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            match self.read_batch(&dir) {
                Ok(Some(batch)) => batches.push(batch),
                Ok(None) => {}
                Err(err) => {
                    warn!(path = %dir.display(), error = %err, "Skipping unreadable editor workspace");
                }
            }
        }
        batches.sort_by(|a, b| a.storage_key.cmp(&b.storage_key));
        Ok(batches)
    }
}

fn open_read_only(path: &Path) -> Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags).map_err(|source| {
        CompanionError::SourceQuery {
            path: path.to_path_buf(),
            source,
        }
    })?;
    conn.pragma_update(None, "busy_timeout", 2000)
        .map_err(|source| CompanionError::SourceQuery {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(conn)
}

fn read_item(conn: &Connection, path: &Path, key: &str) -> Result<Option<String>> {
    let value: Option<SqlValue> = conn
        .query_row(
            "SELECT value FROM ItemTable WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(|source| CompanionError::SourceQuery {
            path: path.to_path_buf(),
            source,
        })?;

    Ok(match value {
        Some(SqlValue::Text(text)) => Some(text),
        Some(SqlValue::Blob(bytes)) => String::from_utf8(bytes).ok(),
        _ => None,
    })
}

fn read_workspace_folder(dir: &Path) -> Option<PathBuf> {
    let content = fs_err::read_to_string(dir.join(WORKSPACE_MANIFEST)).ok()?;
    let manifest: Value = serde_json::from_str(&content).ok()?;
    let folder = manifest.get("folder")?.as_str()?;
    folder_uri_to_path(folder)
}

/// `file:///Users/me/code/app` → `/Users/me/code/app`. Percent escapes are
/// decoded for the common ASCII cases editors emit.
pub fn folder_uri_to_path(uri: &str) -> Option<PathBuf> {
    let url = Url::parse(uri).ok()?;
    if url.scheme() != "file" {
        return None;
    }
    // Rejects hosts other than `localhost`; remote shares have no local path.
    url.to_file_path().ok()
}

/// Parses `aiService.prompts`. Elements that are not objects or carry no
/// text are dropped; the rest of the array is still used.
pub fn parse_prompts(raw: &str) -> Vec<RawPrompt> {
    parse_array(raw, PROMPTS_KEY)
        .into_iter()
        .filter_map(|element| {
            let Some(text) = text_field(&element, &["text", "textDescription"]) else {
                debug!(key = PROMPTS_KEY, "Dropping malformed prompt record");
                return None;
            };
            Some(RawPrompt {
                text,
                correlation_id: string_field(&element, &["generationUUID", "id"]),
                timestamp: timestamp_field(&element),
            })
        })
        .collect()
}

/// Parses `aiService.generations`, with the same per-element tolerance as
/// [`parse_prompts`].
pub fn parse_generations(raw: &str) -> Vec<RawGeneration> {
    parse_array(raw, GENERATIONS_KEY)
        .into_iter()
        .filter_map(|element| {
            let Some(text) = text_field(&element, &["textDescription", "text"]) else {
                debug!(key = GENERATIONS_KEY, "Dropping malformed generation record");
                return None;
            };
            Some(RawGeneration {
                text,
                correlation_id: string_field(&element, &["generationUUID", "id"]),
                timestamp: timestamp_field(&element),
            })
        })
        .collect()
}

fn parse_array(raw: &str, key: &str) -> Vec<Value> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Array(items)) => items,
        Ok(_) => {
            debug!(key, "Source value is not an array");
            Vec::new()
        }
        Err(err) => {
            debug!(key, error = %err, "Source value is not valid JSON");
            Vec::new()
        }
    }
}

fn text_field(element: &Value, keys: &[&str]) -> Option<String> {
    string_field(element, keys).filter(|text| !text.trim().is_empty())
}

fn string_field(element: &Value, keys: &[&str]) -> Option<String> {
    let object = element.as_object()?;
    keys.iter()
        .find_map(|key| object.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

fn timestamp_field(element: &Value) -> Option<DateTime<Utc>> {
    let object = element.as_object()?;
    ["unixMs", "timestamp"].iter().find_map(|key| {
        match object.get(*key)? {
            Value::Number(number) => number
                .as_i64()
                .or_else(|| number.as_f64().map(|value| value as i64))
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            Value::String(text) => DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|ts| ts.with_timezone(&Utc)),
            _ => None,
        }
    })
}
