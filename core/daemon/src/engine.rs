//! Single owner of all correlation and delivery state.
//!
//! Every mutation arrives through one of the handlers below, called from the
//! dispatch loop only. Store writes happen after in-memory state is settled;
//! a failed write is logged and counted but never unwinds correlation.

use chrono::{DateTime, Utc};
use companion_daemon_protocol::{
    AckRequest, AckResponse, ActivityEvent, CapturePromptRequest, ClipboardRequest,
    ConversationTurn, Entry, EntrySource, EventType, LogCodeChangeRequest,
    LogPromptResponseRequest, Prompt, PromptOrigin, PromptStatus, QueueItem, QueueKind,
    QueueResponse, TurnRole, PROTOCOL_VERSION,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::change_detector::{diff_stats, ChangeDetector, ChangeOutcome, DiffStats};
use crate::clock::Clock;
use crate::config::{seconds, CompanionConfig};
use crate::conversation::ConversationThreader;
use crate::correlator::{new_entry, ActivityCorrelator, EntryDraft};
use crate::db::ActivityStore;
use crate::error::Result;
use crate::privacy::{FilterDecision, PrivacyFilter};
use crate::queue::DeliveryQueue;
use crate::resources::ResourceSampler;
use crate::scheduler::{SyncGuard, Task};
use crate::sessions::SessionRegistry;
use crate::source::SourceBatch;
use crate::watcher::FileEvent;
use crate::workspace::WorkspaceResolver;

#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub entries_recorded: u64,
    pub insignificant_changes: u64,
    pub oversized_skipped: u64,
    pub files_removed: u64,
    pub prompts_registered: u64,
    pub turns_emitted: u64,
    pub privacy_dropped: u64,
    pub store_failures: u64,
}

pub struct Engine {
    clock: Arc<dyn Clock>,
    started_at: DateTime<Utc>,
    resolver: WorkspaceResolver,
    detector: ChangeDetector,
    sessions: SessionRegistry,
    threader: ConversationThreader,
    correlator: ActivityCorrelator,
    queue: DeliveryQueue,
    privacy: PrivacyFilter,
    store: Box<dyn ActivityStore>,
    sync: SyncGuard,
    sampler: ResourceSampler,
    stats: EngineStats,
}

impl Engine {
    pub fn new(
        config: &CompanionConfig,
        clock: Arc<dyn Clock>,
        store: Box<dyn ActivityStore>,
    ) -> Self {
        let now = clock.now();
        Self {
            started_at: now,
            resolver: WorkspaceResolver::new(),
            detector: ChangeDetector::new(
                config.detector.significance_threshold,
                config.watch.max_file_bytes,
            ),
            sessions: SessionRegistry::new(
                now,
                seconds(config.sessions.inactivity_timeout_secs),
            ),
            threader: ConversationThreader::new(),
            correlator: ActivityCorrelator::new(
                seconds(config.correlation.link_window_secs),
                seconds(config.correlation.prompt_max_age_secs),
            ),
            queue: DeliveryQueue::new(seconds(config.queue.grace_window_secs)),
            privacy: PrivacyFilter::new(config.privacy.clone()),
            store,
            sync: SyncGuard::new(),
            sampler: ResourceSampler::new(),
            stats: EngineStats::default(),
            clock,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Filesystem
    // ─────────────────────────────────────────────────────────────────────

    pub fn handle_file_event(&mut self, event: FileEvent) -> Option<Entry> {
        match event {
            FileEvent::Changed { path, content } => self.file_changed(&path, content),
            FileEvent::Removed { path } => {
                self.file_removed(&path);
                None
            }
        }
    }

    pub fn file_changed(&mut self, path: &Path, content: String) -> Option<Entry> {
        let now = self.clock.now();
        match self.detector.observe(path, content) {
            ChangeOutcome::Unchanged => None,
            ChangeOutcome::Oversized { bytes } => {
                self.stats.oversized_skipped += 1;
                debug!(path = %path.display(), bytes, "Skipping oversized file");
                None
            }
            ChangeOutcome::Insignificant { diff_size } => {
                let workspace = self.resolver.resolve(path);
                self.sessions.touch(&workspace.id, now);
                self.stats.insignificant_changes += 1;
                debug!(path = %path.display(), diff_size, "Change below significance threshold");
                None
            }
            ChangeOutcome::Significant(draft) => {
                let workspace = self.resolver.resolve(path);
                let file_path = path_string(&draft.file_path);
                Some(self.record_entry(RecordRequest {
                    workspace_id: workspace.id,
                    session_id: None,
                    file_path,
                    before: draft.before,
                    after: draft.after,
                    stats: draft.stats,
                    source: EntrySource::FileWatcher,
                    now,
                }))
            }
        }
    }

    pub fn file_removed(&mut self, path: &Path) {
        if !self.detector.remove(path) {
            return;
        }
        let now = self.clock.now();
        let workspace = self.resolver.resolve(path);
        let session_id = self.sessions.touch(&workspace.id, now).id.clone();
        self.stats.files_removed += 1;

        self.publish_event(ActivityEvent {
            id: new_id(),
            event_type: EventType::FileDeleted,
            timestamp: now,
            session_id: Some(session_id),
            workspace_id: Some(workspace.id),
            file_path: Some(path_string(path)),
            content: None,
            data: Value::Null,
        });
    }

    // ─────────────────────────────────────────────────────────────────────
    // Client operations
    // ─────────────────────────────────────────────────────────────────────

    pub fn capture_prompt(&mut self, request: CapturePromptRequest) -> Prompt {
        let now = self.clock.now();
        let workspace_id = request
            .file_path
            .as_deref()
            .map(|path| self.resolver.resolve(Path::new(path)).id);
        let session_id = workspace_id
            .as_deref()
            .map(|id| self.sessions.touch(id, now).id.clone());

        let prompt = Prompt {
            id: new_id(),
            timestamp: request.timestamp.unwrap_or(now),
            text: request.text,
            status: PromptStatus::Pending,
            linked_entry_id: None,
            workspace_id,
            conversation_id: None,
            origin: PromptOrigin::Api,
        };
        self.register_prompt(&prompt);

        self.publish_event(ActivityEvent {
            id: new_id(),
            event_type: EventType::Prompt,
            timestamp: prompt.timestamp,
            session_id,
            workspace_id: prompt.workspace_id.clone(),
            file_path: request.file_path,
            content: Some(prompt.text.clone()),
            data: json!({
                "prompt_id": prompt.id,
                "status": prompt.status.as_str(),
            }),
        });
        prompt
    }

    pub fn log_code_change(&mut self, request: LogCodeChangeRequest) -> Entry {
        let now = self.clock.now();
        let path = PathBuf::from(&request.file_path);
        let workspace = self.resolver.resolve(&path);
        let stats = diff_stats(&request.before_code, &request.after_code);

        // The watcher will see the same write; seed the snapshot so it reads
        // as unchanged.
        self.detector.prime(&path, request.after_code.clone());

        let entry = self.record_entry(RecordRequest {
            workspace_id: workspace.id,
            session_id: request.session_id,
            file_path: request.file_path,
            before: request.before_code,
            after: request.after_code,
            stats,
            source: EntrySource::Mcp,
            now,
        });

        self.publish_event(ActivityEvent {
            id: new_id(),
            event_type: EventType::CodeChange,
            timestamp: now,
            session_id: Some(entry.session_id.clone()),
            workspace_id: Some(entry.workspace_id.clone()),
            file_path: Some(entry.file_path.clone()),
            content: None,
            data: json!({
                "entry_id": entry.id,
                "prompt_id": entry.prompt_id,
                "diff_size": entry.diff_size,
                "lines_added": entry.lines_added,
                "lines_removed": entry.lines_removed,
            }),
        });
        entry
    }

    /// Registers the prompt for correlation and enqueues one combined
    /// record. Returns the record id.
    pub fn log_prompt_response(&mut self, request: LogPromptResponseRequest) -> String {
        let now = self.clock.now();
        let workspace = self.resolver.resolve(Path::new(&request.file_path));
        let touched = self.sessions.touch(&workspace.id, now).id.clone();
        let session_id = request.session_id.unwrap_or(touched);

        let prompt = Prompt {
            id: new_id(),
            timestamp: now,
            text: request.prompt.clone(),
            status: PromptStatus::Captured,
            linked_entry_id: None,
            workspace_id: Some(workspace.id.clone()),
            conversation_id: None,
            origin: PromptOrigin::Mcp,
        };
        self.register_prompt(&prompt);

        let record_id = new_id();
        self.publish_event(ActivityEvent {
            id: record_id.clone(),
            event_type: EventType::PromptResponse,
            timestamp: now,
            session_id: Some(session_id),
            workspace_id: Some(workspace.id),
            file_path: Some(request.file_path),
            content: None,
            data: json!({
                "prompt_id": prompt.id,
                "prompt": request.prompt,
                "response": request.response,
            }),
        });
        record_id
    }

    /// Returns whether the clipboard event made it past the privacy gate.
    pub fn clipboard(&mut self, request: ClipboardRequest) -> bool {
        let now = self.clock.now();
        let workspace_id = request
            .file_path
            .as_deref()
            .map(|path| self.resolver.resolve(Path::new(path)).id);

        self.publish_event(ActivityEvent {
            id: new_id(),
            event_type: EventType::Clipboard,
            timestamp: now,
            session_id: Some(self.sessions.current().id.clone()),
            workspace_id,
            file_path: request.file_path,
            content: Some(request.content),
            data: Value::Null,
        })
        .is_some()
    }

    pub fn pull(&self, since: u64) -> QueueResponse {
        QueueResponse::from_items(self.queue.pull(since), self.queue.latest_seq())
    }

    pub fn conversations(&self, since: u64) -> Vec<QueueItem> {
        self.queue
            .pull(since)
            .into_iter()
            .filter(|item| {
                item.kind == QueueKind::Event
                    && item.payload.get("event_type").and_then(Value::as_str)
                        == Some("conversation_turn")
            })
            .collect()
    }

    pub fn ack(&mut self, request: AckRequest) -> AckResponse {
        let now = self.clock.now();
        let purged = self.queue.ack(request.cursor, now);
        debug!(cursor = request.cursor, purged, "Cursor acknowledged");
        AckResponse {
            cursor: request.cursor,
            purged,
        }
    }

    pub fn subscribe(&mut self, since: u64) -> (Vec<QueueItem>, Receiver<QueueItem>) {
        self.queue.subscribe(since)
    }

    pub fn workspaces(&self) -> Value {
        json!({ "workspaces": self.resolver.known_workspaces() })
    }

    pub fn health(&self) -> Value {
        let now = self.clock.now();
        let store = match self.store.counts() {
            Ok(counts) => json!({ "ok": true, "counts": counts }),
            Err(err) => json!({ "ok": false, "error": err.to_string() }),
        };
        json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "protocol_version": PROTOCOL_VERSION,
            "started_at": self.started_at,
            "uptime_secs": now.signed_duration_since(self.started_at).num_seconds(),
            "queue": {
                "depth": self.queue.depth(),
                "latest_seq": self.queue.latest_seq(),
                "acked_seq": self.queue.acked_seq(),
                "subscribers": self.queue.subscriber_count(),
                "purged_total": self.queue.purged_total(),
            },
            "workspaces": self.resolver.len(),
            "sessions": {
                "current_session_id": self.sessions.current().id,
                "workspace_sessions": self.sessions.workspace_count(),
                "rotations": self.sessions.rotations(),
                "last_activity": self.sessions.last_activity(),
            },
            "detector": { "snapshots": self.detector.snapshot_count() },
            "correlator": {
                "pending_prompts": self.correlator.pending_count(),
                "linked_total": self.correlator.linked_total(),
                "evicted_total": self.correlator.evicted_total(),
            },
            "conversations": { "emitted_turns": self.threader.emitted_count() },
            "sync": self.sync.stats(),
            "store": store,
            "stats": self.stats(),
            "resources": self.sampler.latest(),
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // External source sync
    // ─────────────────────────────────────────────────────────────────────

    pub fn begin_sync(&mut self) -> bool {
        let now = self.clock.now();
        self.sync.try_begin(now)
    }

    /// Threads fetched batches into turns. Returns how many turns were new.
    pub fn complete_sync(&mut self, result: Result<Vec<SourceBatch>>) -> usize {
        let now = self.clock.now();
        let batches = match result {
            Ok(batches) => batches,
            Err(err) => {
                warn!(error = %err, "Prompt source sync failed");
                self.sync.finish(now, Some(err.to_string()));
                return 0;
            }
        };

        let mut emitted = 0;
        for batch in batches {
            emitted += self.ingest_batch(batch, now);
        }
        self.sync.finish(now, None);
        if emitted > 0 {
            info!(turns = emitted, "Conversation turns synced");
        }
        emitted
    }

    fn ingest_batch(&mut self, batch: SourceBatch, now: DateTime<Utc>) -> usize {
        let workspace_id = match &batch.workspace_path {
            Some(path) => self.resolver.resolve(path).id,
            None => format!("editor-{}", batch.storage_key),
        };

        let turns = self
            .threader
            .thread(&workspace_id, &batch.prompts, &batch.generations);
        let count = turns.len();
        for turn in turns {
            self.emit_turn(turn, now);
        }
        count
    }

    fn emit_turn(&mut self, turn: ConversationTurn, now: DateTime<Utc>) {
        let timestamp = turn.timestamp.unwrap_or(now);
        let mut prompt_id = None;

        // Undated user turns are emitted but never registered for correlation.
        if let (TurnRole::User, Some(sent_at)) = (turn.role, turn.timestamp) {
            let prompt = Prompt {
                id: new_id(),
                timestamp: sent_at,
                text: turn.text.clone(),
                status: PromptStatus::Captured,
                linked_entry_id: None,
                workspace_id: Some(turn.workspace_id.clone()),
                conversation_id: Some(turn.conversation_id.clone()),
                origin: PromptOrigin::Editor,
            };
            self.register_prompt(&prompt);
            prompt_id = Some(prompt.id);
        } else if turn.role == TurnRole::User {
            debug!(
                conversation_id = %turn.conversation_id,
                "User turn has no timestamp; not registered for correlation"
            );
        }

        self.stats.turns_emitted += 1;
        self.publish_event(ActivityEvent {
            id: new_id(),
            event_type: EventType::ConversationTurn,
            timestamp,
            session_id: self
                .sessions
                .session_for(&turn.workspace_id)
                .map(|session| session.id.clone()),
            workspace_id: Some(turn.workspace_id),
            file_path: None,
            content: Some(turn.text),
            data: json!({
                "conversation_id": turn.conversation_id,
                "role": turn.role,
                "thinking_time_ms": turn.thinking_time_ms,
                "prompt_id": prompt_id,
                "timestamp_backfilled": turn.timestamp.is_none(),
            }),
        });
    }

    // ─────────────────────────────────────────────────────────────────────
    // Periodic tasks
    // ─────────────────────────────────────────────────────────────────────

    pub fn run_task(&mut self, task: Task) {
        let now = self.clock.now();
        match task {
            Task::SessionCheck => {
                let rotated = self
                    .sessions
                    .check_timeout(now)
                    .map(|session| (session.id.clone(), session.started_at));
                if let Some((session_id, started_at)) = rotated {
                    self.publish_event(ActivityEvent {
                        id: new_id(),
                        event_type: EventType::SessionRotated,
                        timestamp: now,
                        session_id: Some(session_id),
                        workspace_id: None,
                        file_path: None,
                        content: None,
                        data: json!({ "started_at": started_at }),
                    });
                }
            }
            Task::PromptEviction => {
                let evicted = self.correlator.evict_stale(now);
                if !evicted.is_empty() {
                    debug!(evicted = evicted.len(), "Evicted unanswered prompts");
                }
            }
            Task::QueueRetention => {
                self.queue.enforce_retention(now);
            }
            Task::ResourceSample => {
                if let Some(sample) = self.sampler.sample(now) {
                    debug!(
                        rss_bytes = sample.rss_bytes,
                        cpu_percent = sample.cpu_percent,
                        "Resource sample"
                    );
                }
            }
            // Owned by the dispatcher, which holds the source.
            Task::PromptSync => {}
        }
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    // ─────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────

    fn record_entry(&mut self, request: RecordRequest) -> Entry {
        let RecordRequest {
            workspace_id,
            session_id,
            file_path,
            before,
            after,
            stats,
            source,
            now,
        } = request;

        let touched = self.sessions.touch(&workspace_id, now).id.clone();
        let session_id = session_id.unwrap_or(touched);

        let mut entry = new_entry(
            EntryDraft {
                session_id: &session_id,
                workspace_id: &workspace_id,
                file_path: &file_path,
                before,
                after,
                stats,
                source,
            },
            now,
        );
        let linked = self.correlator.link(&mut entry);

        let saved = self.store.save_entry(&entry);
        self.note_store("save_entry", saved);
        if let Some(prompt) = &linked {
            let updated = self.store.update_prompt(&self.stored_prompt(prompt));
            self.note_store("update_prompt", updated);
        }

        self.stats.entries_recorded += 1;
        info!(
            entry_id = %entry.id,
            workspace_id = %entry.workspace_id,
            file_path = %entry.file_path,
            diff_size = entry.diff_size,
            prompt_id = entry.prompt_id.as_deref().unwrap_or(""),
            "Entry recorded"
        );

        match serde_json::to_value(&entry) {
            Ok(payload) => {
                self.publish_entry(payload);
            }
            Err(err) => warn!(entry_id = %entry.id, error = %err, "Failed to serialize entry"),
        }
        entry
    }

    fn register_prompt(&mut self, prompt: &Prompt) {
        if self.correlator.register(prompt.clone()) {
            self.stats.prompts_registered += 1;
        }
        let saved = self.store.save_prompt(&self.stored_prompt(prompt));
        self.note_store("save_prompt", saved);
    }

    /// Copy of a prompt with its text scrubbed for the prompts table.
    fn stored_prompt(&self, prompt: &Prompt) -> Prompt {
        Prompt {
            text: self.privacy.scrub_text(&prompt.text),
            ..prompt.clone()
        }
    }

    /// Filters, persists, and enqueues an event. Only the filtered copy is
    /// written to the events table, so dropped events never reach disk.
    fn publish_event(&mut self, event: ActivityEvent) -> Option<u64> {
        let payload = match serde_json::to_value(&event) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(event_id = %event.id, error = %err, "Failed to serialize event");
                return None;
            }
        };

        let payload = match self.privacy.apply(Some(event.event_type), payload) {
            FilterDecision::Pass(payload) => payload,
            FilterDecision::Drop { reason } => {
                self.stats.privacy_dropped += 1;
                debug!(event_id = %event.id, reason, "Event dropped by privacy policy");
                return None;
            }
        };

        match serde_json::from_value::<ActivityEvent>(payload.clone()) {
            Ok(filtered) => {
                let saved = self.store.save_event(&filtered);
                self.note_store("save_event", saved);
            }
            Err(err) => warn!(event_id = %event.id, error = %err, "Filtered event lost its shape"),
        }

        Some(self.queue.enqueue(QueueKind::Event, payload, self.clock.now()))
    }

    fn publish_entry(&mut self, payload: Value) -> Option<u64> {
        match self.privacy.apply(None, payload) {
            FilterDecision::Pass(payload) => {
                Some(self.queue.enqueue(QueueKind::Entry, payload, self.clock.now()))
            }
            FilterDecision::Drop { reason } => {
                self.stats.privacy_dropped += 1;
                debug!(reason, "Entry dropped by privacy policy");
                None
            }
        }
    }

    fn note_store(&mut self, operation: &'static str, result: Result<()>) {
        if let Err(err) = result {
            self.stats.store_failures += 1;
            warn!(operation, error = %err, "Store write failed; continuing from memory");
        }
    }
}

struct RecordRequest {
    workspace_id: String,
    session_id: Option<String>,
    file_path: String,
    before: String,
    after: String,
    stats: DiffStats,
    source: EntrySource,
    now: DateTime<Utc>,
}

fn new_id() -> String {
    ulid::Ulid::new().to_string()
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}
