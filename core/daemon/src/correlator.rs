//! Temporal correlation between prompts and the code changes they caused.
//!
//! A new entry is linked to the latest unlinked prompt whose timestamp falls
//! inside `[entry.timestamp - link_window, entry.timestamp]`. Linking flips
//! the prompt to `linked` and removes it from the pending set in the same
//! call, so a prompt can never be claimed twice. Entries that find no prompt
//! stay unlinked for good.

use chrono::{DateTime, Duration, Utc};
use companion_daemon_protocol::{Entry, EntrySource, Prompt, PromptStatus};
use tracing::debug;

use crate::change_detector::DiffStats;

#[derive(Debug)]
pub struct ActivityCorrelator {
    pending: Vec<Prompt>,
    link_window: Duration,
    max_prompt_age: Duration,
    linked_total: u64,
    evicted_total: u64,
}

impl ActivityCorrelator {
    pub fn new(link_window: Duration, max_prompt_age: Duration) -> Self {
        Self {
            pending: Vec::new(),
            link_window,
            max_prompt_age,
            linked_total: 0,
            evicted_total: 0,
        }
    }

    /// Adds a prompt to the pending set. Already-linked prompts and duplicate
    /// ids are ignored.
    pub fn register(&mut self, prompt: Prompt) -> bool {
        if !prompt.status.is_linkable() || prompt.linked_entry_id.is_some() {
            return false;
        }
        if self.pending.iter().any(|existing| existing.id == prompt.id) {
            return false;
        }
        self.pending.push(prompt);
        true
    }

    /// Links `entry` to the closest preceding prompt, returning the prompt in
    /// its linked state.
    pub fn link(&mut self, entry: &mut Entry) -> Option<Prompt> {
        if entry.prompt_id.is_some() {
            return None;
        }

        let window_start = entry.timestamp - self.link_window;
        let mut best: Option<usize> = None;
        for (index, prompt) in self.pending.iter().enumerate() {
            if !prompt.status.is_linkable() || prompt.linked_entry_id.is_some() {
                continue;
            }
            if prompt.timestamp < window_start || prompt.timestamp > entry.timestamp {
                continue;
            }
            let is_later = best
                .map(|current| prompt.timestamp >= self.pending[current].timestamp)
                .unwrap_or(true);
            if is_later {
                best = Some(index);
            }
        }

        let mut prompt = self.pending.remove(best?);
        prompt.status = PromptStatus::Linked;
        prompt.linked_entry_id = Some(entry.id.clone());
        entry.prompt_id = Some(prompt.id.clone());
        self.linked_total += 1;

        debug!(
            prompt_id = %prompt.id,
            entry_id = %entry.id,
            gap_ms = entry
                .timestamp
                .signed_duration_since(prompt.timestamp)
                .num_milliseconds(),
            "Prompt linked to entry"
        );
        Some(prompt)
    }

    /// Drops prompts that went unanswered by any edit for longer than the
    /// maximum prompt age.
    pub fn evict_stale(&mut self, now: DateTime<Utc>) -> Vec<Prompt> {
        let cutoff = now - self.max_prompt_age;
        let (stale, fresh): (Vec<Prompt>, Vec<Prompt>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|prompt| prompt.timestamp < cutoff);
        self.pending = fresh;
        self.evicted_total += stale.len() as u64;
        stale
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn linked_total(&self) -> u64 {
        self.linked_total
    }

    pub fn evicted_total(&self) -> u64 {
        self.evicted_total
    }
}

/// Fields needed to materialize an entry.
pub struct EntryDraft<'a> {
    pub session_id: &'a str,
    pub workspace_id: &'a str,
    pub file_path: &'a str,
    pub before: String,
    pub after: String,
    pub stats: DiffStats,
    pub source: EntrySource,
}

pub fn new_entry(draft: EntryDraft<'_>, timestamp: DateTime<Utc>) -> Entry {
    Entry {
        id: ulid::Ulid::new().to_string(),
        session_id: draft.session_id.to_string(),
        workspace_id: draft.workspace_id.to_string(),
        file_path: draft.file_path.to_string(),
        before_content: draft.before,
        after_content: draft.after,
        timestamp,
        prompt_id: None,
        source: draft.source,
        diff_size: draft.stats.diff_size,
        lines_added: draft.stats.lines_added,
        lines_removed: draft.stats.lines_removed,
        chars_added: draft.stats.chars_added,
        chars_deleted: draft.stats.chars_deleted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use companion_daemon_protocol::PromptOrigin;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-31T12:00:00Z")
            .expect("parse")
            .with_timezone(&Utc)
    }

    fn prompt(id: &str, at: DateTime<Utc>, status: PromptStatus) -> Prompt {
        Prompt {
            id: id.to_string(),
            timestamp: at,
            text: format!("prompt {}", id),
            status,
            linked_entry_id: None,
            workspace_id: None,
            conversation_id: None,
            origin: PromptOrigin::Api,
        }
    }

    fn entry(id: &str, at: DateTime<Utc>) -> Entry {
        let mut entry = new_entry(
            EntryDraft {
                session_id: "session-1",
                workspace_id: "ws-1",
                file_path: "/repo/src/lib.rs",
                before: String::new(),
                after: "fn added() {}".to_string(),
                stats: DiffStats::default(),
                source: EntrySource::FileWatcher,
            },
            at,
        );
        entry.id = id.to_string();
        entry
    }

    fn correlator() -> ActivityCorrelator {
        ActivityCorrelator::new(Duration::minutes(5), Duration::minutes(10))
    }

    #[test]
    fn links_latest_preceding_prompt() {
        let mut correlator = correlator();
        correlator.register(prompt("p-old", t0(), PromptStatus::Pending));
        correlator.register(prompt(
            "p-new",
            t0() + Duration::minutes(2),
            PromptStatus::Captured,
        ));

        let mut change = entry("e-1", t0() + Duration::minutes(3));
        let linked = correlator.link(&mut change).expect("linked prompt");

        assert_eq!(linked.id, "p-new");
        assert_eq!(linked.status, PromptStatus::Linked);
        assert_eq!(linked.linked_entry_id.as_deref(), Some("e-1"));
        assert_eq!(change.prompt_id.as_deref(), Some("p-new"));
        assert_eq!(correlator.pending_count(), 1);
    }

    #[test]
    fn prompt_links_at_most_once() {
        let mut correlator = correlator();
        correlator.register(prompt("p-1", t0(), PromptStatus::Pending));

        let mut first = entry("e-1", t0() + Duration::seconds(30));
        let mut second = entry("e-2", t0() + Duration::seconds(40));

        assert!(correlator.link(&mut first).is_some());
        assert!(correlator.link(&mut second).is_none());

        assert_eq!(first.prompt_id.as_deref(), Some("p-1"));
        assert!(second.prompt_id.is_none());
        assert_eq!(correlator.linked_total(), 1);
    }

    #[test]
    fn window_bounds_are_inclusive() {
        let mut correlator = correlator();
        correlator.register(prompt("p-edge", t0(), PromptStatus::Pending));
        let mut change = entry("e-1", t0() + Duration::minutes(5));
        assert!(correlator.link(&mut change).is_some());

        correlator.register(prompt("p-same", t0(), PromptStatus::Pending));
        let mut same_instant = entry("e-2", t0());
        assert!(correlator.link(&mut same_instant).is_some());
    }

    #[test]
    fn ignores_prompts_outside_window() {
        let mut correlator = correlator();
        correlator.register(prompt("p-early", t0(), PromptStatus::Pending));
        correlator.register(prompt(
            "p-future",
            t0() + Duration::minutes(20),
            PromptStatus::Pending,
        ));

        let mut change = entry("e-1", t0() + Duration::minutes(6));
        assert!(correlator.link(&mut change).is_none());
        assert!(change.prompt_id.is_none());
    }

    #[test]
    fn never_overwrites_existing_link() {
        let mut correlator = correlator();
        correlator.register(prompt("p-1", t0(), PromptStatus::Pending));

        let mut change = entry("e-1", t0() + Duration::seconds(10));
        change.prompt_id = Some("p-manual".to_string());

        assert!(correlator.link(&mut change).is_none());
        assert_eq!(change.prompt_id.as_deref(), Some("p-manual"));
        assert_eq!(correlator.pending_count(), 1);
    }

    #[test]
    fn rejects_linked_and_duplicate_prompts() {
        let mut correlator = correlator();
        assert!(correlator.register(prompt("p-1", t0(), PromptStatus::Pending)));
        assert!(!correlator.register(prompt("p-1", t0(), PromptStatus::Pending)));
        assert!(!correlator.register(prompt("p-2", t0(), PromptStatus::Linked)));
        assert_eq!(correlator.pending_count(), 1);
    }

    #[test]
    fn evicts_prompts_older_than_max_age() {
        let mut correlator = correlator();
        correlator.register(prompt("p-stale", t0(), PromptStatus::Pending));
        correlator.register(prompt(
            "p-fresh",
            t0() + Duration::minutes(8),
            PromptStatus::Pending,
        ));

        let evicted = correlator.evict_stale(t0() + Duration::minutes(11));

        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, "p-stale");
        assert_eq!(correlator.pending_count(), 1);
        assert_eq!(correlator.evicted_total(), 1);
    }
}
