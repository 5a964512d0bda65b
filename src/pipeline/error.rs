//! Error types for the ingestion pipeline

use super::types::DedupKey;
use rusqlite::ErrorCode;
use thiserror::Error;

/// Failures reported by an [`EventStore`](super::db::EventStore).
///
/// A duplicate key is never an error; it is the `AlreadyExists` outcome.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Storage medium temporarily unavailable (busy, locked, I/O, disk full)
    #[error("Transient database error: {0}")]
    Transient(#[source] rusqlite::Error),

    /// Any other SQLite failure, including constraint violations that the
    /// conflict clause should have absorbed
    #[error("Database error: {0}")]
    Database(#[source] rusqlite::Error),

    /// A stored row could not be decoded back into an event
    #[error("Corrupt row {key}: {reason}")]
    CorruptRow { key: DedupKey, reason: String },

    /// Database directory could not be created
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A connection mutex was poisoned by a panicking thread
    #[error("Store connection poisoned")]
    Poisoned,

    /// The blocking task running the statement failed to complete
    #[error("Store task failed: {0}")]
    TaskFailed(String),
}

impl StoreError {
    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::SystemIoFailure
                | ErrorCode::DiskFull
                | ErrorCode::CannotOpen,
            ) => StoreError::Transient(err),
            _ => StoreError::Database(err),
        }
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        StoreError::TaskFailed(err.to_string())
    }
}

/// Unrecoverable pipeline conditions surfaced to the worker's supervisor.
///
/// Once the worker returns one of these it has stopped; counters are no
/// longer advanced and the queue is closed.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// `discarded` counts the events still queued behind `key` when the
    /// worker stopped
    #[error("Store write for {key} failed after {attempts} attempts: {source} ({discarded} queued events discarded)")]
    RetriesExhausted {
        key: DedupKey,
        attempts: u32,
        discarded: u64,
        #[source]
        source: StoreError,
    },

    #[error("Fatal store failure while processing {key}: {source} ({discarded} queued events discarded)")]
    FatalStore {
        key: DedupKey,
        discarded: u64,
        #[source]
        source: StoreError,
    },

    /// Store could not be opened or migrated
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Consumer worker panicked: {0}")]
    WorkerPanicked(String),

    /// The worker already finished and its result was taken
    #[error("Consumer worker already stopped")]
    WorkerStopped,
}

impl PipelineError {
    /// Record how many queued events were dropped when the worker stopped
    pub fn with_discarded(mut self, count: u64) -> Self {
        if let PipelineError::RetriesExhausted { discarded, .. }
        | PipelineError::FatalStore { discarded, .. } = &mut self
        {
            *discarded = count;
        }
        self
    }
}

/// The queue no longer accepts events (worker stopping or gone).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Ingest queue is closed")]
pub struct QueueClosed;
