//! Core data types flowing through the pipeline

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A validated event as published by a producer.
///
/// This is what the ingest queue carries. `received_at` is not part of it:
/// the store assigns that at persistence time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub topic: String,
    pub event_id: String,
    /// Producer-supplied creation time, offset preserved
    pub timestamp: DateTime<FixedOffset>,
    pub source: String,
    /// Stored verbatim
    pub payload: serde_json::Value,
}

impl Event {
    pub fn key(&self) -> DedupKey {
        DedupKey::new(&self.topic, &self.event_id)
    }
}

/// An event as it exists in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    #[serde(flatten)]
    pub event: Event,
    /// Assigned by the store when the row was first inserted
    pub received_at: DateTime<Utc>,
}

/// Identity of an event for deduplication.
///
/// `event_id` is only unique within a topic, so the pair is the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DedupKey {
    pub topic: String,
    pub event_id: String,
}

impl DedupKey {
    pub fn new(topic: impl Into<String>, event_id: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            event_id: event_id.into(),
        }
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.event_id)
    }
}

/// Result of an atomic check-and-insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// First time this key was seen; the row now exists
    Inserted,
    /// A row with this key already existed; nothing was written
    AlreadyExists,
}

/// Point-in-time copy of the process counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub unique_processed: u64,
    pub duplicate_dropped: u64,
    /// Distinct topics processed successfully since start, sorted
    pub topics: Vec<String>,
    pub uptime_seconds: f64,
    pub started_at: DateTime<Utc>,
}

impl StatsSnapshot {
    /// Events accepted but not yet resolved by the worker
    pub fn in_flight(&self) -> u64 {
        self.received
            .saturating_sub(self.unique_processed + self.duplicate_dropped)
    }
}
