//! Cursor-addressed delivery queue.
//!
//! The queue is the only place sequence numbers are assigned. Pulls never
//! mutate it, so any number of pollers can read the same backlog. Items leave
//! only through retention: acknowledged AND older than the grace window, which
//! lets a client that reconnects within the window replay what it already
//! acknowledged.

use chrono::{DateTime, Duration, Utc};
use companion_daemon_protocol::{QueueItem, QueueKind};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use tracing::debug;

#[derive(Debug)]
pub struct DeliveryQueue {
    items: VecDeque<QueueItem>,
    counter: u64,
    acked: u64,
    grace: Duration,
    subscribers: Vec<Sender<QueueItem>>,
    purged_total: u64,
}

impl DeliveryQueue {
    pub fn new(grace: Duration) -> Self {
        Self {
            items: VecDeque::new(),
            counter: 0,
            acked: 0,
            grace,
            subscribers: Vec::new(),
            purged_total: 0,
        }
    }

    pub fn enqueue(&mut self, kind: QueueKind, payload: Value, now: DateTime<Utc>) -> u64 {
        self.counter += 1;
        let item = QueueItem {
            seq: self.counter,
            kind,
            payload,
            enqueued_at: now,
        };

        self.subscribers
            .retain(|subscriber| subscriber.send(item.clone()).is_ok());
        self.items.push_back(item);
        self.counter
    }

    /// Items with `seq > since`, oldest first.
    pub fn pull(&self, since: u64) -> Vec<QueueItem> {
        let start = self.items.partition_point(|item| item.seq <= since);
        self.items.range(start..).cloned().collect()
    }

    /// Records a client cursor and purges whatever retention now allows.
    pub fn ack(&mut self, seq: u64, now: DateTime<Utc>) -> usize {
        let seq = seq.min(self.counter);
        if seq > self.acked {
            self.acked = seq;
        }
        self.enforce_retention(now)
    }

    pub fn enforce_retention(&mut self, now: DateTime<Utc>) -> usize {
        let acked = self.acked;
        let grace = self.grace;
        let before = self.items.len();
        self.items.retain(|item| {
            item.seq > acked || now.signed_duration_since(item.enqueued_at) <= grace
        });
        let purged = before - self.items.len();
        if purged > 0 {
            self.purged_total += purged as u64;
            debug!(purged, acked, remaining = self.items.len(), "Queue retention applied");
        }
        purged
    }

    /// Backlog after `since` plus a receiver for everything enqueued later.
    pub fn subscribe(&mut self, since: u64) -> (Vec<QueueItem>, Receiver<QueueItem>) {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        (self.pull(since), rx)
    }

    pub fn latest_seq(&self) -> u64 {
        self.counter
    }

    pub fn acked_seq(&self) -> u64 {
        self.acked
    }

    pub fn depth(&self) -> usize {
        self.items.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn purged_total(&self) -> u64 {
        self.purged_total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-31T08:00:00Z")
            .expect("parse")
            .with_timezone(&Utc)
    }

    fn queue() -> DeliveryQueue {
        DeliveryQueue::new(Duration::hours(1))
    }

    #[test]
    fn sequence_numbers_are_gapless_and_increasing() {
        let mut queue = queue();
        let seqs: Vec<u64> = (0..50)
            .map(|index| queue.enqueue(QueueKind::Event, json!({ "n": index }), t0()))
            .collect();
        let expected: Vec<u64> = (1..=50).collect();
        assert_eq!(seqs, expected);
    }

    #[test]
    fn sequence_numbers_survive_purges() {
        let mut queue = queue();
        queue.enqueue(QueueKind::Event, json!({}), t0());
        queue.enqueue(QueueKind::Event, json!({}), t0());
        queue.ack(2, t0() + Duration::hours(2));
        assert_eq!(queue.depth(), 0);

        let next = queue.enqueue(QueueKind::Entry, json!({}), t0() + Duration::hours(2));
        assert_eq!(next, 3);
    }

    #[test]
    fn pull_is_non_destructive_and_ordered() {
        let mut queue = queue();
        for index in 0..3 {
            queue.enqueue(QueueKind::Event, json!({ "n": index }), t0());
        }

        let first = queue.pull(0);
        let second = queue.pull(0);
        assert_eq!(first, second);
        assert_eq!(
            first.iter().map(|item| item.seq).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(queue.pull(2).len(), 1);
        assert!(queue.pull(3).is_empty());
    }

    #[test]
    fn acked_items_survive_grace_window() {
        let mut queue = queue();
        let seq = queue.enqueue(QueueKind::Entry, json!({ "id": "e-1" }), t0());

        assert_eq!(queue.ack(seq, t0()), 0);
        let replay = queue.pull(seq - 1);
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].seq, seq);

        assert_eq!(queue.enforce_retention(t0() + Duration::minutes(59)), 0);
        assert_eq!(queue.enforce_retention(t0() + Duration::hours(1)), 0);
        assert_eq!(queue.pull(seq - 1).len(), 1);

        let just_past = t0() + Duration::hours(1) + Duration::seconds(1);
        assert_eq!(queue.enforce_retention(just_past), 1);
        assert!(queue.pull(seq - 1).is_empty());
    }

    #[test]
    fn unacked_items_are_never_purged() {
        let mut queue = queue();
        queue.enqueue(QueueKind::Event, json!({}), t0());
        let second = queue.enqueue(QueueKind::Event, json!({}), t0());

        queue.ack(1, t0() + Duration::hours(3));

        let remaining = queue.pull(0);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].seq, second);
    }

    #[test]
    fn ack_cursor_never_moves_backwards_or_past_counter() {
        let mut queue = queue();
        queue.enqueue(QueueKind::Event, json!({}), t0());
        queue.enqueue(QueueKind::Event, json!({}), t0());

        queue.ack(99, t0());
        assert_eq!(queue.acked_seq(), 2);
        queue.ack(1, t0());
        assert_eq!(queue.acked_seq(), 2);
    }

    #[test]
    fn subscribers_receive_backlog_then_live_items() {
        let mut queue = queue();
        queue.enqueue(QueueKind::Event, json!({ "n": 1 }), t0());

        let (backlog, rx) = queue.subscribe(0);
        assert_eq!(backlog.len(), 1);

        queue.enqueue(QueueKind::Entry, json!({ "n": 2 }), t0());
        let pushed = rx.try_recv().expect("pushed item");
        assert_eq!(pushed.seq, 2);
        assert_eq!(pushed.kind, QueueKind::Entry);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let mut queue = queue();
        let (_, rx) = queue.subscribe(0);
        assert_eq!(queue.subscriber_count(), 1);
        drop(rx);

        queue.enqueue(QueueKind::Event, json!({}), t0());
        assert_eq!(queue.subscriber_count(), 0);
    }
}
