//! SQLite persistence for companion-daemon.
//!
//! The store is a durability sink. Nothing in the live correlation path reads
//! from it, so every write is an idempotent upsert keyed by id and callers log
//! failures instead of unwinding in-memory state.

use companion_daemon_protocol::{ActivityEvent, Entry, Prompt};
use rusqlite::{params, Connection, OpenFlags};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::error::{CompanionError, Result};

pub const DB_FILE_NAME: &str = "companion.db";

/// Write-side contract of the persistence collaborator.
pub trait ActivityStore: Send {
    fn save_entry(&self, entry: &Entry) -> Result<()>;
    fn save_prompt(&self, prompt: &Prompt) -> Result<()>;
    fn save_event(&self, event: &ActivityEvent) -> Result<()>;

    /// Rewrites a prompt after a status change. Same upsert as `save_prompt`,
    /// so an update for a prompt whose save was lost still lands.
    fn update_prompt(&self, prompt: &Prompt) -> Result<()> {
        self.save_prompt(prompt)
    }

    fn update_entry(&self, entry: &Entry) -> Result<()> {
        self.save_entry(entry)
    }

    fn counts(&self) -> Result<StoreCounts>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub entries: u64,
    pub prompts: u64,
    pub events: u64,
}

pub struct Db {
    path: PathBuf,
}

impl Db {
    pub fn new(path: PathBuf) -> Result<Self> {
        let db = Self { path };
        db.init_schema()?;
        Ok(db)
    }

    pub fn in_dir(data_dir: &Path) -> Result<Self> {
        Self::new(data_dir.join(DB_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn init_schema(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS entries (
                    id TEXT PRIMARY KEY,
                    session_id TEXT NOT NULL,
                    workspace_id TEXT NOT NULL,
                    file_path TEXT NOT NULL,
                    timestamp TEXT NOT NULL,
                    prompt_id TEXT,
                    source TEXT NOT NULL,
                    diff_size INTEGER NOT NULL,
                    lines_added INTEGER NOT NULL,
                    lines_removed INTEGER NOT NULL,
                    payload TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS prompts (
                    id TEXT PRIMARY KEY,
                    timestamp TEXT NOT NULL,
                    status TEXT NOT NULL,
                    linked_entry_id TEXT,
                    workspace_id TEXT,
                    conversation_id TEXT,
                    text TEXT NOT NULL,
                    payload TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS events (
                    id TEXT PRIMARY KEY,
                    event_type TEXT NOT NULL,
                    timestamp TEXT NOT NULL,
                    session_id TEXT,
                    workspace_id TEXT,
                    file_path TEXT,
                    payload TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS entries_workspace_idx ON entries(workspace_id, timestamp);
                 CREATE INDEX IF NOT EXISTS events_type_idx ON events(event_type, timestamp);
                 COMMIT;",
            )
            .map_err(|err| CompanionError::store("Failed to initialize schema", err))
        })
    }

    fn count(conn: &Connection, table: &str) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", table);
        conn.query_row(&sql, [], |row| row.get::<_, i64>(0))
            .map(|count| count.max(0) as u64)
            .map_err(|err| CompanionError::store(format!("Failed to count {}", table), err))
    }

    fn with_connection<T>(&self, op: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)
                .map_err(|err| CompanionError::io("Failed to create data dir", err))?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| CompanionError::store("Failed to open sqlite db", err))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| CompanionError::store("Failed to enable WAL", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| CompanionError::store("Failed to set synchronous", err))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| CompanionError::store("Failed to set busy_timeout", err))?;

        Ok(conn)
    }
}

impl ActivityStore for Db {
    fn save_entry(&self, entry: &Entry) -> Result<()> {
        let payload = to_payload(entry, "entry")?;
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO entries \
                    (id, session_id, workspace_id, file_path, timestamp, prompt_id, source, \
                     diff_size, lines_added, lines_removed, payload) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
                 ON CONFLICT(id) DO UPDATE SET \
                    prompt_id = excluded.prompt_id, \
                    payload = excluded.payload",
                params![
                    entry.id,
                    entry.session_id,
                    entry.workspace_id,
                    entry.file_path,
                    entry.timestamp.to_rfc3339(),
                    entry.prompt_id,
                    enum_label(&entry.source),
                    entry.diff_size as i64,
                    entry.lines_added,
                    entry.lines_removed,
                    payload
                ],
            )
            .map_err(|err| CompanionError::store("Failed to upsert entry", err))?;
            Ok(())
        })
    }

    fn save_prompt(&self, prompt: &Prompt) -> Result<()> {
        let payload = to_payload(prompt, "prompt")?;
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO prompts \
                    (id, timestamp, status, linked_entry_id, workspace_id, conversation_id, text, payload) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                 ON CONFLICT(id) DO UPDATE SET \
                    status = excluded.status, \
                    linked_entry_id = excluded.linked_entry_id, \
                    workspace_id = excluded.workspace_id, \
                    conversation_id = excluded.conversation_id, \
                    payload = excluded.payload",
                params![
                    prompt.id,
                    prompt.timestamp.to_rfc3339(),
                    prompt.status.as_str(),
                    prompt.linked_entry_id,
                    prompt.workspace_id,
                    prompt.conversation_id,
                    prompt.text,
                    payload
                ],
            )
            .map_err(|err| CompanionError::store("Failed to upsert prompt", err))?;
            Ok(())
        })
    }

    fn save_event(&self, event: &ActivityEvent) -> Result<()> {
        let payload = to_payload(event, "event")?;
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO events \
                    (id, event_type, timestamp, session_id, workspace_id, file_path, payload) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT(id) DO UPDATE SET payload = excluded.payload",
                params![
                    event.id,
                    enum_label(&event.event_type),
                    event.timestamp.to_rfc3339(),
                    event.session_id,
                    event.workspace_id,
                    event.file_path,
                    payload
                ],
            )
            .map_err(|err| CompanionError::store("Failed to upsert event", err))?;
            Ok(())
        })
    }

    fn counts(&self) -> Result<StoreCounts> {
        self.with_connection(|conn| {
            Ok(StoreCounts {
                entries: Self::count(conn, "entries")?,
                prompts: Self::count(conn, "prompts")?,
                events: Self::count(conn, "events")?,
            })
        })
    }
}

fn to_payload<T: Serialize>(value: &T, kind: &str) -> Result<String> {
    serde_json::to_string(value).map_err(|source| CompanionError::Json {
        context: format!("Failed to serialize {} payload", kind),
        source,
    })
}

fn enum_label<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value)
        .unwrap_or_else(|_| "unknown".to_string())
        .trim_matches('"')
        .to_string()
}
