//! # eventflow
//!
//! Deduplicating event aggregator. Publishers re-send events under
//! at-least-once delivery; every `(topic, event_id)` pair is persisted
//! exactly once.
//!
//! ```text
//! publisher → ingress (validate) → IngestQueue → ConsumerWorker → SqliteEventStore
//!                  │                                  │
//!                  └──── received ────► Counters ◄────┘ unique / duplicate / topics
//! ```
//!
//! Queries (`Aggregator::list_events`, `Aggregator::get_stats`) read the
//! store and counters directly. Events still sitting in the queue are not
//! visible to queries until the worker persists them.

pub mod aggregator;
pub mod ingress;
pub mod pipeline;
pub mod sqlite_pragma;

pub use aggregator::{Aggregator, WorkerHandle};
pub use pipeline::{
    AggregatorConfig, DedupKey, Event, EventStore, InsertOutcome, PipelineError, ShutdownMode,
    SqliteEventStore, StatsSnapshot, StoreError, StoredEvent, WorkerReport,
};
