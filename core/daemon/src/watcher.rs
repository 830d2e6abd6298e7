//! Recursive filesystem watch feeding the dispatch loop.
//!
//! Raw notify events are buffered per path until the path has been quiet for
//! the settle delay. Only then is the file read, so half-written saves are
//! never diffed. Oversized files are skipped from metadata without reading.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::dispatch::Command;
use crate::error::Result;

const IDLE_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    Changed { path: PathBuf, content: String },
    Removed { path: PathBuf },
}

/// Ignore list: `*suffix` entries match the end of the file name, anything
/// else matches a whole path segment.
#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    segments: Vec<String>,
    suffixes: Vec<String>,
}

impl IgnoreRules {
    pub fn new(patterns: &[String]) -> Self {
        let mut rules = Self::default();
        for pattern in patterns {
            match pattern.strip_prefix('*') {
                Some(suffix) if !suffix.is_empty() => rules.suffixes.push(suffix.to_string()),
                Some(_) => {}
                None => rules.segments.push(pattern.clone()),
            }
        }
        rules
    }

    pub fn is_ignored(&self, path: &Path) -> bool {
        let segment_hit = path.components().any(|component| {
            component
                .as_os_str()
                .to_str()
                .map(|name| self.segments.iter().any(|segment| segment == name))
                .unwrap_or(false)
        });
        if segment_hit {
            return true;
        }
        path.file_name()
            .and_then(|name| name.to_str())
            .map(|name| self.suffixes.iter().any(|suffix| name.ends_with(suffix.as_str())))
            .unwrap_or(false)
    }
}

/// Per-path quiet-period tracker.
#[derive(Debug)]
pub struct SettleBuffer {
    delay: Duration,
    pending: HashMap<PathBuf, Instant>,
}

impl SettleBuffer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: HashMap::new(),
        }
    }

    pub fn note(&mut self, path: PathBuf, at: Instant) {
        self.pending.insert(path, at);
    }

    /// Paths quiet for at least the settle delay, removed from the buffer.
    pub fn ready(&mut self, now: Instant) -> Vec<PathBuf> {
        let delay = self.delay;
        let mut ready: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, last)| now.saturating_duration_since(**last) >= delay)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &ready {
            self.pending.remove(path);
        }
        ready.sort();
        ready
    }

    pub fn time_until_next(&self, now: Instant) -> Option<Duration> {
        self.pending
            .values()
            .map(|last| (*last + self.delay).saturating_duration_since(now))
            .min()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

pub struct WatchSettings {
    pub roots: Vec<PathBuf>,
    pub ignore: IgnoreRules,
    pub settle_delay: Duration,
    pub max_file_bytes: u64,
}

/// Starts the watch thread. The returned handle finishes when the command
/// channel closes.
pub fn spawn_watcher(settings: WatchSettings, commands: Sender<Command>) -> Result<JoinHandle<()>> {
    let (tx, rx) = mpsc::channel();
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = tx.send(res);
        },
        notify::Config::default(),
    )?;

    let mut watched = 0;
    for root in &settings.roots {
        if !root.exists() {
            warn!(root = %root.display(), "Watch root does not exist, skipping");
            continue;
        }
        watcher.watch(root, RecursiveMode::Recursive)?;
        watched += 1;
        info!(root = %root.display(), "Watching directory");
    }
    if watched == 0 {
        info!("No watch roots configured; filesystem activity will not be recorded");
    }

    let handle = thread::spawn(move || {
        // Dropping the watcher stops event delivery.
        let _watcher = watcher;
        let mut settle = SettleBuffer::new(settings.settle_delay);

        loop {
            let timeout = settle
                .time_until_next(Instant::now())
                .unwrap_or(IDLE_POLL)
                .min(IDLE_POLL);

            match rx.recv_timeout(timeout) {
                Ok(Ok(event)) => note_event(&mut settle, &settings.ignore, event),
                Ok(Err(err)) => warn!(error = %err, "Filesystem watch error"),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            for path in settle.ready(Instant::now()) {
                let Some(event) = read_settled(&path, settings.max_file_bytes) else {
                    continue;
                };
                if commands.send(Command::File(event)).is_err() {
                    debug!("Command channel closed, stopping watcher");
                    return;
                }
            }
        }
    });

    Ok(handle)
}

fn note_event(settle: &mut SettleBuffer, ignore: &IgnoreRules, event: Event) {
    if !matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) {
        return;
    }
    let now = Instant::now();
    for path in event.paths {
        if !ignore.is_ignored(&path) {
            settle.note(path, now);
        }
    }
}

/// Reads a settled path. Missing files become removals; directories,
/// oversized files, and undecodable content yield nothing.
pub fn read_settled(path: &Path, max_file_bytes: u64) -> Option<FileEvent> {
    let metadata = match fs_err::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Some(FileEvent::Removed {
                path: path.to_path_buf(),
            });
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Failed to stat changed file");
            return None;
        }
    };

    if !metadata.is_file() || metadata.len() > max_file_bytes {
        return None;
    }

    match fs_err::read_to_string(path) {
        Ok(content) => Some(FileEvent::Changed {
            path: path.to_path_buf(),
            content,
        }),
        Err(err) if err.kind() == std::io::ErrorKind::InvalidData => {
            debug!(path = %path.display(), "Skipping non-UTF-8 file");
            None
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Failed to read changed file");
            None
        }
    }
}
