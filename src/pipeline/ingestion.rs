//! Consumer worker: the single task that moves events from the ingest queue
//! into the store.
//!
//! Per event: dequeue → `try_insert` → count. `Inserted` bumps
//! `unique_processed` and the topic set in one step; `AlreadyExists` bumps
//! `duplicate_dropped`. Transient store faults are retried with backoff and
//! the event is counted neither way until it resolves. Exhausted retries
//! and fatal faults stop the worker with an error; events still queued
//! behind the failing one are discarded and counted in that error.
//!
//! Exactly one worker runs per queue (it owns the only receiver), so
//! processing order equals enqueue order. If this is ever scaled out,
//! correctness rests entirely on the store's atomic `try_insert`; the
//! counters already tolerate concurrent writers.

use super::backoff::ExponentialBackoff;
use super::config::{RetryPolicy, ShutdownMode};
use super::counters::Counters;
use super::db::EventStore;
use super::error::{PipelineError, StoreError};
use super::queue::QueueReceiver;
use super::types::{Event, InsertOutcome};
use std::sync::Arc;
use tokio::sync::watch;

/// What the worker did before it stopped
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub unique_processed: u64,
    pub duplicate_dropped: u64,
    /// Queued events discarded by an `Abandon` shutdown
    pub abandoned: u64,
    /// Shutdown mode that ended the loop, `None` if every sender went away
    pub shutdown_mode: Option<ShutdownMode>,
}

enum Step {
    Shutdown(Option<ShutdownMode>),
    Next(Option<Event>),
}

pub struct ConsumerWorker {
    rx: QueueReceiver,
    store: Arc<dyn EventStore>,
    counters: Arc<Counters>,
    retry: RetryPolicy,
    shutdown: watch::Receiver<Option<ShutdownMode>>,
}

impl ConsumerWorker {
    pub fn new(
        rx: QueueReceiver,
        store: Arc<dyn EventStore>,
        counters: Arc<Counters>,
        retry: RetryPolicy,
        shutdown: watch::Receiver<Option<ShutdownMode>>,
    ) -> Self {
        Self {
            rx,
            store,
            counters,
            retry,
            shutdown,
        }
    }

    /// Run until shut down, the queue closes, or a fatal store fault.
    ///
    /// A dropped shutdown sender is treated as `Drain`.
    pub async fn run(mut self) -> Result<WorkerReport, PipelineError> {
        log::info!("🚀 Consumer worker started");

        let mut report = WorkerReport::default();
        let mut draining = false;

        loop {
            let step = tokio::select! {
                biased;

                changed = self.shutdown.changed(), if !draining => match changed {
                    Ok(()) => Step::Shutdown(*self.shutdown.borrow_and_update()),
                    Err(_) => Step::Shutdown(Some(ShutdownMode::Drain)),
                },

                next = self.rx.dequeue() => Step::Next(next),
            };

            match step {
                Step::Shutdown(None) => continue,
                Step::Shutdown(Some(ShutdownMode::Drain)) => {
                    log::info!("🔄 Shutdown requested (drain), processing queued events");
                    self.rx.close();
                    draining = true;
                    report.shutdown_mode = Some(ShutdownMode::Drain);
                }
                Step::Shutdown(Some(ShutdownMode::Abandon)) => {
                    report.abandoned = self.rx.discard_remaining();
                    report.shutdown_mode = Some(ShutdownMode::Abandon);
                    if report.abandoned > 0 {
                        log::warn!(
                            "⚠️  Shutdown requested (abandon), discarded {} queued events",
                            report.abandoned
                        );
                    } else {
                        log::info!("Shutdown requested (abandon), queue was empty");
                    }
                    break;
                }
                Step::Next(Some(event)) => {
                    match self.process(&event).await {
                        Ok(InsertOutcome::Inserted) => report.unique_processed += 1,
                        Ok(InsertOutcome::AlreadyExists) => report.duplicate_dropped += 1,
                        Err(e) => {
                            let discarded = self.rx.discard_remaining();
                            let e = e.with_discarded(discarded);
                            log::error!("❌ Consumer worker stopping: {}", e);
                            if discarded > 0 {
                                log::warn!(
                                    "⚠️  Discarded {} queued events after store failure",
                                    discarded
                                );
                            }
                            return Err(e);
                        }
                    }
                }
                Step::Next(None) => break,
            }
        }

        log::info!(
            "✅ Consumer worker stopped: {} unique, {} duplicates, {} abandoned",
            report.unique_processed,
            report.duplicate_dropped,
            report.abandoned
        );
        Ok(report)
    }

    /// Dedup, persist and count one event
    async fn process(&self, event: &Event) -> Result<InsertOutcome, PipelineError> {
        let outcome = self.insert_with_retry(event).await?;

        match outcome {
            InsertOutcome::Inserted => {
                self.counters.record_unique(&event.topic);
                log::debug!(
                    "PROCESSED: topic={}, event_id={}, source={}",
                    event.topic,
                    event.event_id,
                    event.source
                );
            }
            InsertOutcome::AlreadyExists => {
                self.counters.record_duplicate();
                log::info!(
                    "DUPLICATE DETECTED: topic={}, event_id={}, source={}",
                    event.topic,
                    event.event_id,
                    event.source
                );
            }
        }

        Ok(outcome)
    }

    async fn insert_with_retry(&self, event: &Event) -> Result<InsertOutcome, PipelineError> {
        let mut backoff = ExponentialBackoff::from_policy(&self.retry);

        loop {
            match self.store.try_insert(event).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_transient() => {
                    log::warn!(
                        "⚠️  Transient store failure for {}: {}",
                        event.key(),
                        e
                    );
                    if backoff.sleep().await.is_err() {
                        return Err(PipelineError::RetriesExhausted {
                            key: event.key(),
                            attempts: backoff.attempts() + 1,
                            discarded: 0,
                            source: e,
                        });
                    }
                }
                Err(e) => return Err(fatal(event, e)),
            }
        }
    }
}

fn fatal(event: &Event, source: StoreError) -> PipelineError {
    PipelineError::FatalStore {
        key: event.key(),
        discarded: 0,
        source,
    }
}
