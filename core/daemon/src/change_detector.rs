//! Significance detection for watched file content.
//!
//! Keeps the last accepted content per path and decides whether a new read is
//! worth recording. The snapshot advances on every accepted read, significant
//! or not, because editors write intermediate states while saving.

use similar::{ChangeTag, TextDiff};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Files larger than this are never diffed or snapshotted.
pub const MAX_FILE_BYTES: u64 = 5 * 1024 * 1024;

/// Past this deadline the line diff falls back to an approximate result.
const DIFF_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffStats {
    pub diff_size: u64,
    pub lines_added: u32,
    pub lines_removed: u32,
    pub chars_added: u64,
    pub chars_deleted: u64,
}

pub fn diff_stats(before: &str, after: &str) -> DiffStats {
    let mut lines_added = 0u32;
    let mut lines_removed = 0u32;
    let diff = TextDiff::configure()
        .timeout(DIFF_TIMEOUT)
        .diff_lines(before, after);
    for change in diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Insert => lines_added += 1,
            ChangeTag::Delete => lines_removed += 1,
            ChangeTag::Equal => {}
        }
    }

    let before_chars = before.chars().count() as u64;
    let after_chars = after.chars().count() as u64;

    DiffStats {
        diff_size: (after.len() as i64 - before.len() as i64).unsigned_abs(),
        lines_added,
        lines_removed,
        chars_added: after_chars.saturating_sub(before_chars),
        chars_deleted: before_chars.saturating_sub(after_chars),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeDraft {
    pub file_path: PathBuf,
    pub before: String,
    pub after: String,
    pub stats: DiffStats,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOutcome {
    Significant(ChangeDraft),
    Insignificant { diff_size: u64 },
    Unchanged,
    Oversized { bytes: u64 },
}

#[derive(Debug)]
pub struct ChangeDetector {
    snapshots: HashMap<PathBuf, String>,
    threshold: u64,
    max_file_bytes: u64,
}

impl ChangeDetector {
    pub fn new(threshold: u64, max_file_bytes: u64) -> Self {
        Self {
            snapshots: HashMap::new(),
            threshold,
            max_file_bytes: max_file_bytes.min(MAX_FILE_BYTES),
        }
    }

    pub fn observe(&mut self, path: &Path, content: String) -> ChangeOutcome {
        let bytes = content.len() as u64;
        if bytes > self.max_file_bytes {
            return ChangeOutcome::Oversized { bytes };
        }

        let before = self.snapshots.get(path).map(String::as_str).unwrap_or("");
        if before == content {
            return ChangeOutcome::Unchanged;
        }

        let stats = diff_stats(before, &content);
        if stats.diff_size < self.threshold {
            let diff_size = stats.diff_size;
            self.snapshots.insert(path.to_path_buf(), content);
            return ChangeOutcome::Insignificant { diff_size };
        }

        let before = self
            .snapshots
            .insert(path.to_path_buf(), content.clone())
            .unwrap_or_default();
        ChangeOutcome::Significant(ChangeDraft {
            file_path: path.to_path_buf(),
            before,
            after: content,
            stats,
        })
    }

    /// Seeds a baseline without emitting anything.
    pub fn prime(&mut self, path: &Path, content: String) {
        if content.len() as u64 <= self.max_file_bytes {
            self.snapshots.insert(path.to_path_buf(), content);
        }
    }

    pub fn remove(&mut self, path: &Path) -> bool {
        self.snapshots.remove(path).is_some()
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }
}
