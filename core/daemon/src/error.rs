//! Error types for companion-daemon operations.

use std::path::PathBuf;

use companion_daemon_protocol::ErrorInfo;

#[derive(Debug, thiserror::Error)]
pub enum CompanionError {
    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // Persistence Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Store error: {context}: {source}")]
    Store {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    // ─────────────────────────────────────────────────────────────────────
    // External Source Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Prompt source unavailable: {path}: {details}")]
    SourceUnavailable { path: PathBuf, details: String },

    #[error("Prompt source query failed: {path}: {source}")]
    SourceQuery {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    // ─────────────────────────────────────────────────────────────────────
    // I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Daemon is shutting down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, CompanionError>;

impl CompanionError {
    pub fn store(context: impl Into<String>, source: rusqlite::Error) -> Self {
        CompanionError::Store {
            context: context.into(),
            source,
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        CompanionError::Io {
            context: context.into(),
            source,
        }
    }

    /// Maps the error onto the wire error shape returned by the HTTP surface.
    pub fn to_error_info(&self) -> ErrorInfo {
        let code = match self {
            CompanionError::HomeDirNotFound | CompanionError::ConfigMalformed { .. } => {
                "config_error"
            }
            CompanionError::Store { .. } => "store_error",
            CompanionError::SourceUnavailable { .. } | CompanionError::SourceQuery { .. } => {
                "source_error"
            }
            CompanionError::Io { .. } | CompanionError::Watch(_) => "io_error",
            CompanionError::Json { .. } => "serialization_error",
            CompanionError::Shutdown => "unavailable",
        };
        ErrorInfo::new(code, self.to_string())
    }
}
