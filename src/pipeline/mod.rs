//! # Ingestion pipeline
//!
//! ```text
//! submit ──► IngestQueue (FIFO, bounded = blocking) ──► ConsumerWorker ──► EventStore
//!   │                                                        │
//!   └── Counters.received                Counters.unique / duplicate / topics
//! ```
//!
//! ## Guarantees
//!
//! - At most one stored row per `(topic, event_id)`, enforced by the store's
//!   primary key and an atomic check-and-insert.
//! - After the queue drains, `received == unique_processed + duplicate_dropped`.
//! - Store rows survive restarts; counters do not.
//!
//! ## Loss window
//!
//! The queue is in memory. Events accepted but not yet persisted are lost if
//! the process dies, and an `Abandon` shutdown discards them on purpose (the
//! count is logged). Making that window durable means a log in front of the
//! store, not a change to the store's contract.
//!
//! ## Module Organization
//!
//! - `types` - Event, StoredEvent, DedupKey, InsertOutcome, StatsSnapshot
//! - `db` - EventStore trait and the SQLite implementation
//! - `queue` - Ingest queue sender/receiver pair
//! - `ingestion` - Consumer worker loop
//! - `counters` - Process-lifetime tallies
//! - `backoff` - Retry delays for transient store faults
//! - `config` - Environment configuration
//! - `error` - StoreError, PipelineError, QueueClosed

pub mod backoff;
pub mod config;
pub mod counters;
pub mod db;
pub mod error;
pub mod ingestion;
pub mod queue;
pub mod types;

pub use config::{AggregatorConfig, ConfigError, RetryPolicy, ShutdownMode};
pub use counters::Counters;
pub use db::{EventStore, SqliteEventStore};
pub use error::{PipelineError, QueueClosed, StoreError};
pub use ingestion::{ConsumerWorker, WorkerReport};
pub use queue::{ingest_queue, QueueReceiver, QueueSender, QueueSlot};
pub use types::{DedupKey, Event, InsertOutcome, StatsSnapshot, StoredEvent};
