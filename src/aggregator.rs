//! Aggregator facade: the surface the ingress layer talks to.
//!
//! [`Aggregator`] is cheap to clone and handed to every ingress task. It
//! submits into the queue and reads the store and counters directly.
//! [`WorkerHandle`] belongs to whoever supervises the process: it stops the
//! worker and reports fatal exits.

use crate::pipeline::{
    ingest_queue, AggregatorConfig, ConsumerWorker, Counters, Event, EventStore, PipelineError,
    QueueSender, ShutdownMode, SqliteEventStore, StatsSnapshot, StoreError, StoredEvent,
    WorkerReport,
};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct Aggregator {
    queue: QueueSender,
    store: Arc<dyn EventStore>,
    counters: Arc<Counters>,
}

pub struct WorkerHandle {
    shutdown: watch::Sender<Option<ShutdownMode>>,
    join: Option<JoinHandle<Result<WorkerReport, PipelineError>>>,
}

impl Aggregator {
    /// Open the SQLite store from `config` and spawn the consumer worker.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(config: &AggregatorConfig) -> Result<(Self, WorkerHandle), PipelineError> {
        let store = SqliteEventStore::open(&config.db_path)?;
        Ok(Self::with_store(Arc::new(store), config))
    }

    /// Spawn the consumer worker over an already opened store.
    pub fn with_store(store: Arc<dyn EventStore>, config: &AggregatorConfig) -> (Self, WorkerHandle) {
        let (queue, rx) = ingest_queue(config.queue_capacity);
        let counters = Arc::new(Counters::new());
        let (shutdown, shutdown_rx) = watch::channel(None);

        let worker = ConsumerWorker::new(
            rx,
            store.clone(),
            counters.clone(),
            config.retry.clone(),
            shutdown_rx,
        );
        let join = tokio::spawn(worker.run());

        match queue.capacity() {
            Some(capacity) => log::info!("✅ Ingest queue ready (capacity: {})", capacity),
            None => log::info!("✅ Ingest queue ready (unbounded)"),
        }

        (
            Self {
                queue,
                store,
                counters,
            },
            WorkerHandle {
                shutdown,
                join: Some(join),
            },
        )
    }

    /// Queue a validated event.
    ///
    /// Waits for capacity when the queue is bounded and full. Returns `false`
    /// only if the queue is closed (worker shutting down or stopped); the
    /// event is then not counted as received.
    ///
    /// Cancel-safe: `received` is only counted once a slot is held, and the
    /// send after that does not wait.
    pub async fn submit(&self, event: Event) -> bool {
        let Ok(slot) = self.queue.reserve().await else {
            return false;
        };

        // Counted before the send so a snapshot never sees the event
        // processed but not received
        self.counters.record_received();
        match slot.send(event) {
            Ok(()) => true,
            Err(_) => {
                self.counters.revert_received();
                false
            }
        }
    }

    /// Queue events in order, stopping at the first rejection.
    /// Returns how many were queued.
    pub async fn submit_batch(&self, events: Vec<Event>) -> usize {
        let mut queued = 0;
        for event in events {
            if !self.submit(event).await {
                break;
            }
            queued += 1;
        }
        queued
    }

    /// Persisted events, optionally for one topic, oldest first.
    ///
    /// Events still in the queue are not included.
    pub async fn list_events(&self, topic: Option<&str>) -> Result<Vec<StoredEvent>, StoreError> {
        self.store.query_all(topic).await
    }

    pub async fn count_events(&self) -> Result<u64, StoreError> {
        self.store.count_all().await
    }

    pub fn get_stats(&self) -> StatsSnapshot {
        self.counters.snapshot()
    }

    /// Whether the queue still accepts events
    pub fn is_accepting(&self) -> bool {
        !self.queue.is_closed()
    }
}

impl WorkerHandle {
    /// Stop the worker and wait for it.
    ///
    /// `Drain` processes everything already queued first; `Abandon` discards
    /// it. If the worker had already failed, that failure is returned.
    pub async fn shutdown(mut self, mode: ShutdownMode) -> Result<WorkerReport, PipelineError> {
        log::info!("Stopping consumer worker ({})", mode);
        // Err only means the worker is already gone; its result is below
        let _ = self.shutdown.send(Some(mode));
        self.wait().await
    }

    /// Wait for the worker to finish on its own (queue closed or fatal fault).
    ///
    /// Cancel-safe: dropping the future leaves the handle usable.
    pub async fn wait(&mut self) -> Result<WorkerReport, PipelineError> {
        let join = self.join.as_mut().ok_or(PipelineError::WorkerStopped)?;
        let result = join.await;
        self.join = None;

        match result {
            Ok(report) => report,
            Err(e) => Err(PipelineError::WorkerPanicked(e.to_string())),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, JoinHandle::is_finished)
    }
}
