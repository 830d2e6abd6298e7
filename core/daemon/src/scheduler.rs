//! Periodic task set driven by an injected clock.
//!
//! The dispatch loop asks for due tasks after every command (or receive
//! timeout), so nothing here sleeps. Missed ticks are collapsed into one run.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    SessionCheck,
    PromptSync,
    PromptEviction,
    QueueRetention,
    ResourceSample,
}

#[derive(Debug, Clone)]
struct Ticker {
    task: Task,
    interval: Duration,
    next_due: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct Scheduler {
    tickers: Vec<Ticker>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `task` to fire every `interval`, first at `now + interval`.
    pub fn every(&mut self, task: Task, interval: Duration, now: DateTime<Utc>) -> &mut Self {
        self.tickers.retain(|ticker| ticker.task != task);
        self.tickers.push(Ticker {
            task,
            interval,
            next_due: now + interval,
        });
        self
    }

    /// Tasks whose deadline has passed, in registration order.
    pub fn due(&mut self, now: DateTime<Utc>) -> Vec<Task> {
        let mut due = Vec::new();
        for ticker in &mut self.tickers {
            if ticker.next_due > now {
                continue;
            }
            let missed = now.signed_duration_since(ticker.next_due).num_milliseconds()
                / ticker.interval.num_milliseconds().max(1);
            if missed > 0 {
                debug!(task = ?ticker.task, missed, "Collapsing missed ticks");
            }
            ticker.next_due = now + ticker.interval;
            due.push(ticker.task);
        }
        due
    }

    /// Earliest upcoming deadline, used as the dispatch loop's receive timeout.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.tickers.iter().map(|ticker| ticker.next_due).min()
    }

    pub fn len(&self) -> usize {
        self.tickers.len()
    }
}

/// At most one external sync in flight. Overlapping ticks are skipped, not
/// queued.
#[derive(Debug, Default)]
pub struct SyncGuard {
    in_flight_since: Option<DateTime<Utc>>,
    stats: SyncStats,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub in_flight: bool,
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl SyncGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_begin(&mut self, now: DateTime<Utc>) -> bool {
        if let Some(since) = self.in_flight_since {
            self.stats.skipped += 1;
            debug!(
                in_flight_ms = now.signed_duration_since(since).num_milliseconds(),
                skipped = self.stats.skipped,
                "Sync already in flight, skipping tick"
            );
            return false;
        }
        self.in_flight_since = Some(now);
        self.stats.started += 1;
        true
    }

    pub fn finish(&mut self, now: DateTime<Utc>, error: Option<String>) {
        self.in_flight_since = None;
        match error {
            Some(error) => {
                self.stats.failed += 1;
                self.stats.last_error = Some(error);
            }
            None => {
                self.stats.completed += 1;
                self.stats.last_completed_at = Some(now);
            }
        }
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight_since.is_some()
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            in_flight: self.in_flight(),
            ..self.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-31T08:00:00Z")
            .expect("parse")
            .with_timezone(&Utc)
    }

    #[test]
    fn fires_tasks_by_injected_clock() {
        let clock = ManualClock::new(t0());
        let mut scheduler = Scheduler::new();
        scheduler
            .every(Task::SessionCheck, Duration::minutes(5), clock.now())
            .every(Task::PromptSync, Duration::seconds(10), clock.now());

        assert!(scheduler.due(clock.now()).is_empty());

        clock.advance(Duration::seconds(10));
        assert_eq!(scheduler.due(clock.now()), vec![Task::PromptSync]);
        assert!(scheduler.due(clock.now()).is_empty());

        clock.advance(Duration::minutes(5));
        assert_eq!(
            scheduler.due(clock.now()),
            vec![Task::SessionCheck, Task::PromptSync]
        );
    }

    #[test]
    fn missed_ticks_collapse_into_one_run() {
        let mut scheduler = Scheduler::new();
        scheduler.every(Task::QueueRetention, Duration::seconds(60), t0());

        let late = t0() + Duration::minutes(10);
        assert_eq!(scheduler.due(late), vec![Task::QueueRetention]);
        assert!(scheduler.due(late + Duration::seconds(59)).is_empty());
        assert_eq!(scheduler.next_deadline(), Some(late + Duration::seconds(60)));
    }

    #[test]
    fn re_registering_replaces_the_ticker() {
        let mut scheduler = Scheduler::new();
        scheduler.every(Task::ResourceSample, Duration::seconds(30), t0());
        scheduler.every(Task::ResourceSample, Duration::seconds(5), t0());
        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.next_deadline(), Some(t0() + Duration::seconds(5)));
    }

    #[test]
    fn sync_guard_skips_overlapping_ticks() {
        let mut guard = SyncGuard::new();

        assert!(guard.try_begin(t0()));
        assert!(!guard.try_begin(t0() + Duration::seconds(10)));
        assert!(!guard.try_begin(t0() + Duration::seconds(20)));

        guard.finish(t0() + Duration::seconds(25), None);
        assert!(guard.try_begin(t0() + Duration::seconds(30)));

        let stats = guard.stats();
        assert!(stats.in_flight);
        assert_eq!(stats.started, 2);
        assert_eq!(stats.skipped, 2);
        assert_eq!(stats.completed, 1);
    }

    #[test]
    fn failed_sync_releases_guard() {
        let mut guard = SyncGuard::new();
        assert!(guard.try_begin(t0()));
        guard.finish(t0(), Some("source unavailable".to_string()));

        assert!(!guard.in_flight());
        assert_eq!(guard.stats().failed, 1);
        assert!(guard.try_begin(t0()));
    }
}
