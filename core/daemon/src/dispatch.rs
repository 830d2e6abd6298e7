//! The one loop that touches engine state.
//!
//! Watcher, HTTP handler threads, and the sync worker all talk to the engine
//! by sending a `Command`. The loop wakes on the next command or the next
//! scheduler deadline, whichever comes first.

use chrono::Duration as ChronoDuration;
use companion_daemon_protocol::{
    AckRequest, CapturePromptRequest, ClipboardRequest, EntryIdResponse, ErrorBody, ErrorInfo,
    LogCodeChangeRequest, LogPromptResponseRequest, PromptIdResponse, QueueItem,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{seconds, CompanionConfig};
use crate::engine::Engine;
use crate::error::Result;
use crate::scheduler::{Scheduler, Task};
use crate::source::{PromptSource, SourceBatch};
use crate::watcher::FileEvent;

const MIN_WAIT: Duration = Duration::from_millis(10);
const MAX_WAIT: Duration = Duration::from_secs(1);

pub enum Command {
    File(FileEvent),
    Api {
        request: ApiRequest,
        reply: Sender<ApiReply>,
    },
    SyncCompleted(Result<Vec<SourceBatch>>),
}

/// Validated client request, already decoded by the HTTP layer.
#[derive(Debug)]
pub enum ApiRequest {
    Health,
    Queue { since: u64 },
    Conversations { since: u64 },
    Workspaces,
    Ack(AckRequest),
    LogCodeChange(LogCodeChangeRequest),
    LogPromptResponse(LogPromptResponseRequest),
    CapturePrompt(CapturePromptRequest),
    Clipboard(ClipboardRequest),
    Subscribe { since: u64 },
}

pub enum ApiReply {
    Json { status: u16, body: Value },
    Stream {
        backlog: Vec<QueueItem>,
        live: Receiver<QueueItem>,
    },
}

impl ApiReply {
    pub fn ok<T: Serialize>(body: &T) -> Self {
        match serde_json::to_value(body) {
            Ok(body) => ApiReply::Json { status: 200, body },
            Err(err) => ApiReply::error(
                500,
                ErrorInfo::new("serialization_error", err.to_string()),
            ),
        }
    }

    pub fn error(status: u16, error: ErrorInfo) -> Self {
        ApiReply::Json {
            status,
            body: error_body(error),
        }
    }
}

/// Wire shape shared by every non-2xx reply.
pub fn error_body(error: ErrorInfo) -> Value {
    serde_json::to_value(ErrorBody { error }).unwrap_or_default()
}

pub fn handle_api(engine: &mut Engine, request: ApiRequest) -> ApiReply {
    match request {
        ApiRequest::Health => ApiReply::ok(&engine.health()),
        ApiRequest::Queue { since } => ApiReply::ok(&engine.pull(since)),
        ApiRequest::Conversations { since } => {
            ApiReply::ok(&json!({ "turns": engine.conversations(since) }))
        }
        ApiRequest::Workspaces => ApiReply::ok(&engine.workspaces()),
        ApiRequest::Ack(body) => ApiReply::ok(&engine.ack(body)),
        ApiRequest::LogCodeChange(body) => {
            let entry = engine.log_code_change(body);
            ApiReply::ok(&EntryIdResponse { entry_id: entry.id })
        }
        ApiRequest::LogPromptResponse(body) => {
            let entry_id = engine.log_prompt_response(body);
            ApiReply::ok(&EntryIdResponse { entry_id })
        }
        ApiRequest::CapturePrompt(body) => {
            let prompt = engine.capture_prompt(body);
            ApiReply::ok(&PromptIdResponse {
                prompt_id: prompt.id,
            })
        }
        ApiRequest::Clipboard(body) => {
            let accepted = engine.clipboard(body);
            ApiReply::ok(&json!({ "accepted": accepted }))
        }
        ApiRequest::Subscribe { since } => {
            let (backlog, live) = engine.subscribe(since);
            ApiReply::Stream { backlog, live }
        }
    }
}

pub struct Dispatcher {
    engine: Engine,
    scheduler: Scheduler,
    clock: Arc<dyn Clock>,
    source: Option<Arc<dyn PromptSource>>,
    commands: Receiver<Command>,
    loopback: Sender<Command>,
}

impl Dispatcher {
    pub fn new(
        engine: Engine,
        config: &CompanionConfig,
        clock: Arc<dyn Clock>,
        source: Option<Arc<dyn PromptSource>>,
        commands: Receiver<Command>,
        loopback: Sender<Command>,
    ) -> Self {
        let now = clock.now();
        let mut scheduler = Scheduler::new();
        scheduler
            .every(
                Task::SessionCheck,
                seconds(config.sessions.check_interval_secs),
                now,
            )
            .every(
                Task::PromptEviction,
                seconds(config.correlation.eviction_interval_secs),
                now,
            )
            .every(
                Task::QueueRetention,
                seconds(config.queue.retention_interval_secs),
                now,
            )
            .every(
                Task::ResourceSample,
                seconds(config.source.resource_sample_interval_secs),
                now,
            );
        if source.is_some() {
            scheduler.every(
                Task::PromptSync,
                seconds(config.source.sync_interval_secs),
                now,
            );
        }

        Self {
            engine,
            scheduler,
            clock,
            source,
            commands,
            loopback,
        }
    }

    pub fn run(mut self) {
        info!(tasks = self.scheduler.len(), "Dispatch loop started");
        // Sample once up front so /health has numbers before the first tick.
        self.engine.run_task(Task::ResourceSample);
        if self.source.is_some() {
            self.start_sync();
        }

        loop {
            match self.commands.recv_timeout(self.wait_time()) {
                Ok(command) => self.handle(command),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("All command senders dropped, stopping dispatch loop");
                    break;
                }
            }
            self.run_due_tasks();
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::File(event) => {
                self.engine.handle_file_event(event);
            }
            Command::Api { request, reply } => {
                let response = handle_api(&mut self.engine, request);
                if reply.send(response).is_err() {
                    debug!("Client went away before reply");
                }
            }
            Command::SyncCompleted(result) => {
                self.engine.complete_sync(result);
            }
        }
    }

    fn run_due_tasks(&mut self) {
        for task in self.scheduler.due(self.clock.now()) {
            match task {
                Task::PromptSync => self.start_sync(),
                other => self.engine.run_task(other),
            }
        }
    }

    /// Runs the source query off-loop; the result comes back as a command.
    fn start_sync(&mut self) {
        let Some(source) = self.source.clone() else {
            return;
        };
        if !self.engine.begin_sync() {
            return;
        }

        let loopback = self.loopback.clone();
        let spawned = thread::Builder::new()
            .name("prompt-sync".to_string())
            .spawn(move || {
                let result = source.fetch();
                if let Err(err) = &result {
                    debug!(source = source.name(), error = %err, "Source fetch failed");
                }
                let _ = loopback.send(Command::SyncCompleted(result));
            });

        if let Err(err) = spawned {
            warn!(error = %err, "Failed to spawn sync worker");
            self.engine
                .complete_sync(Err(crate::error::CompanionError::io("spawn sync worker", err)));
        }
    }

    fn wait_time(&self) -> Duration {
        let Some(deadline) = self.scheduler.next_deadline() else {
            return MAX_WAIT;
        };
        let remaining = deadline.signed_duration_since(self.clock.now());
        if remaining <= ChronoDuration::zero() {
            return MIN_WAIT;
        }
        remaining
            .to_std()
            .unwrap_or(MAX_WAIT)
            .clamp(MIN_WAIT, MAX_WAIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::Db;
    use crate::error::CompanionError;
    use chrono::{DateTime, Utc};
    use std::sync::mpsc;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-31T10:00:00Z")
            .expect("parse")
            .with_timezone(&Utc)
    }

    fn engine(clock: &ManualClock, dir: &std::path::Path) -> Engine {
        Engine::new(
            &CompanionConfig::default(),
            Arc::new(clock.clone()),
            Box::new(Db::in_dir(dir).expect("db")),
        )
    }

    fn json_body(reply: ApiReply) -> (u16, Value) {
        match reply {
            ApiReply::Json { status, body } => (status, body),
            ApiReply::Stream { .. } => panic!("expected json reply"),
        }
    }

    #[test]
    fn api_requests_map_to_engine_operations() {
        let temp = tempdir().expect("tempdir");
        let clock = ManualClock::new(t0());
        let mut engine = engine(&clock, temp.path());

        let (status, body) = json_body(handle_api(
            &mut engine,
            ApiRequest::CapturePrompt(CapturePromptRequest {
                text: "add retries".to_string(),
                file_path: None,
                timestamp: None,
            }),
        ));
        assert_eq!(status, 200);
        assert!(body["prompt_id"].is_string());

        let (_, queue) = json_body(handle_api(&mut engine, ApiRequest::Queue { since: 0 }));
        assert_eq!(queue["cursor"], 1);
        assert_eq!(queue["events"].as_array().map(Vec::len), Some(1));

        let (_, ack) = json_body(handle_api(
            &mut engine,
            ApiRequest::Ack(AckRequest { cursor: 1 }),
        ));
        assert_eq!(ack["cursor"], 1);
        assert_eq!(ack["purged"], 0);
    }

    #[test]
    fn error_replies_decode_as_error_body() {
        let (status, body) = json_body(ApiReply::error(
            404,
            ErrorInfo::new("not_found", "no route for /nope"),
        ));

        assert_eq!(status, 404);
        let decoded: ErrorBody = serde_json::from_value(body).expect("error body");
        assert_eq!(decoded.error, ErrorInfo::new("not_found", "no route for /nope"));
    }

    #[test]
    fn subscribe_returns_stream_reply() {
        let temp = tempdir().expect("tempdir");
        let clock = ManualClock::new(t0());
        let mut engine = engine(&clock, temp.path());

        match handle_api(&mut engine, ApiRequest::Subscribe { since: 0 }) {
            ApiReply::Stream { backlog, live } => {
                assert!(backlog.is_empty());
                engine.capture_prompt(CapturePromptRequest {
                    text: "stream me".to_string(),
                    file_path: None,
                    timestamp: None,
                });
                assert_eq!(live.try_recv().expect("live item").seq, 1);
            }
            ApiReply::Json { .. } => panic!("expected stream"),
        }
    }

    struct SlowSource {
        calls: Mutex<u32>,
    }

    impl PromptSource for SlowSource {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn fetch(&self) -> Result<Vec<SourceBatch>> {
            *self.calls.lock().expect("lock") += 1;
            Err(CompanionError::SourceUnavailable {
                path: "/nowhere".into(),
                details: "offline".to_string(),
            })
        }
    }

    #[test]
    fn overlapping_sync_ticks_are_skipped() {
        let temp = tempdir().expect("tempdir");
        let clock = ManualClock::new(t0());
        let (tx, rx) = mpsc::channel();
        let source = Arc::new(SlowSource {
            calls: Mutex::new(0),
        });
        let mut dispatcher = Dispatcher::new(
            engine(&clock, temp.path()),
            &CompanionConfig::default(),
            Arc::new(clock.clone()),
            Some(source.clone()),
            rx,
            tx,
        );

        dispatcher.start_sync();
        dispatcher.start_sync();

        let completed = dispatcher
            .commands
            .recv_timeout(Duration::from_secs(5))
            .expect("sync completion");
        assert!(matches!(completed, Command::SyncCompleted(Err(_))));
        assert_eq!(*source.calls.lock().expect("lock"), 1);

        dispatcher.handle(completed);
        let health = dispatcher.engine.health();
        assert_eq!(health["sync"]["skipped"], 1);
        assert_eq!(health["sync"]["failed"], 1);
        assert_eq!(health["sync"]["in_flight"], false);
    }

    #[test]
    fn wait_time_tracks_next_deadline() {
        let temp = tempdir().expect("tempdir");
        let clock = ManualClock::new(t0());
        let (tx, rx) = mpsc::channel();
        let dispatcher = Dispatcher::new(
            engine(&clock, temp.path()),
            &CompanionConfig::default(),
            Arc::new(clock.clone()),
            None,
            rx,
            tx,
        );

        assert_eq!(dispatcher.wait_time(), MAX_WAIT);
        clock.advance(ChronoDuration::minutes(10));
        assert_eq!(dispatcher.wait_time(), MIN_WAIT);
    }
}
