//! Process-lifetime counters
//!
//! `received` is bumped on the submit path (many callers, atomic). The
//! processed tally (unique, duplicates, topic set) is written only by the
//! consumer worker and guarded by one mutex so a reader never sees a unique
//! count without its topic. Nothing here is persisted: a restart starts from
//! zero while the store keeps its history.

use super::types::StatsSnapshot;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

#[derive(Debug, Default)]
struct ProcessedTally {
    unique_processed: u64,
    duplicate_dropped: u64,
    topics: BTreeSet<String>,
}

#[derive(Debug)]
pub struct Counters {
    received: AtomicU64,
    tally: Mutex<ProcessedTally>,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl Default for Counters {
    fn default() -> Self {
        Self::new()
    }
}

impl Counters {
    pub fn new() -> Self {
        Self {
            received: AtomicU64::new(0),
            tally: Mutex::new(ProcessedTally::default()),
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    /// An event is about to be enqueued
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::SeqCst);
    }

    /// The enqueue that followed `record_received` failed
    pub fn revert_received(&self) {
        self.received.fetch_sub(1, Ordering::SeqCst);
    }

    /// Event passed the dedup check and was persisted
    pub fn record_unique(&self, topic: &str) {
        let mut tally = self.lock_tally();
        tally.unique_processed += 1;
        if !tally.topics.contains(topic) {
            tally.topics.insert(topic.to_string());
        }
    }

    /// Event was already in the store
    pub fn record_duplicate(&self) {
        self.lock_tally().duplicate_dropped += 1;
    }

    /// Consistent copy of all counters.
    ///
    /// The tally is read before `received`, and `received` is always bumped
    /// before the event can reach the worker, so the snapshot never shows
    /// more resolved events than received ones.
    pub fn snapshot(&self) -> StatsSnapshot {
        let (unique_processed, duplicate_dropped, topics) = {
            let tally = self.lock_tally();
            (
                tally.unique_processed,
                tally.duplicate_dropped,
                tally.topics.iter().cloned().collect(),
            )
        };
        let received = self.received.load(Ordering::SeqCst);

        StatsSnapshot {
            received,
            unique_processed,
            duplicate_dropped,
            topics,
            uptime_seconds: self.started.elapsed().as_secs_f64(),
            started_at: self.started_at,
        }
    }

    // Each update is a single step under the lock, so a poisoned tally is
    // still consistent.
    fn lock_tally(&self) -> MutexGuard<'_, ProcessedTally> {
        self.tally.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_starts_at_zero() {
        let counters = Counters::new();
        let snapshot = counters.snapshot();

        assert_eq!(snapshot.received, 0);
        assert_eq!(snapshot.unique_processed, 0);
        assert_eq!(snapshot.duplicate_dropped, 0);
        assert!(snapshot.topics.is_empty());
        assert!(snapshot.uptime_seconds >= 0.0);
    }

    #[test]
    fn test_topics_are_distinct_and_sorted() {
        let counters = Counters::new();
        for topic in ["order.placed", "user.created", "order.placed", "audit"] {
            counters.record_received();
            counters.record_unique(topic);
        }
        counters.record_received();
        counters.record_duplicate();

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.received, 5);
        assert_eq!(snapshot.unique_processed, 4);
        assert_eq!(snapshot.duplicate_dropped, 1);
        assert_eq!(snapshot.topics, vec!["audit", "order.placed", "user.created"]);
    }

    #[test]
    fn test_revert_received() {
        let counters = Counters::new();
        counters.record_received();
        counters.record_received();
        counters.revert_received();
        assert_eq!(counters.snapshot().received, 1);
    }

    #[test]
    fn test_concurrent_received_not_lost() {
        let counters = Arc::new(Counters::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counters = counters.clone();
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        counters.record_received();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counters.snapshot().received, 8_000);
    }
}
