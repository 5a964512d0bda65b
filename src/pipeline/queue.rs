//! In-memory ingest queue between ingress and the consumer worker
//!
//! FIFO, bounded or unbounded. With a bounded queue a full buffer blocks the
//! submitter until the worker frees a slot; nothing is dropped at the edge.
//!
//! There is exactly one [`QueueReceiver`] per queue and it is not `Clone`, so
//! only one consumer can ever drain it. Anything still queued when the
//! process dies is lost; the store only knows about what the worker
//! persisted.

use super::error::QueueClosed;
use super::types::Event;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

/// Create a queue. `None` capacity means unbounded.
pub fn ingest_queue(capacity: Option<usize>) -> (QueueSender, QueueReceiver) {
    match capacity {
        Some(capacity) => {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            (QueueSender::Bounded(tx), QueueReceiver::Bounded(rx))
        }
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (QueueSender::Unbounded(tx), QueueReceiver::Unbounded(rx))
        }
    }
}

#[derive(Debug, Clone)]
pub enum QueueSender {
    Bounded(mpsc::Sender<Event>),
    Unbounded(mpsc::UnboundedSender<Event>),
}

/// A reserved place in the queue. Sending through it never waits, so
/// whatever the caller records between `reserve` and `send` cannot be left
/// behind by a cancelled wait.
pub enum QueueSlot<'a> {
    Bounded(mpsc::Permit<'a, Event>),
    Unbounded(&'a mpsc::UnboundedSender<Event>),
}

impl QueueSlot<'_> {
    pub fn send(self, event: Event) -> Result<(), QueueClosed> {
        match self {
            QueueSlot::Bounded(permit) => {
                permit.send(event);
                Ok(())
            }
            QueueSlot::Unbounded(tx) => tx.send(event).map_err(|_| QueueClosed),
        }
    }
}

impl QueueSender {
    /// Wait for capacity if the queue is bounded and full.
    ///
    /// Cancel-safe: dropping the future before it resolves leaves the queue
    /// untouched.
    pub async fn reserve(&self) -> Result<QueueSlot<'_>, QueueClosed> {
        match self {
            QueueSender::Bounded(tx) => tx
                .reserve()
                .await
                .map(QueueSlot::Bounded)
                .map_err(|_| QueueClosed),
            QueueSender::Unbounded(tx) if tx.is_closed() => Err(QueueClosed),
            QueueSender::Unbounded(tx) => Ok(QueueSlot::Unbounded(tx)),
        }
    }

    /// Append an event, waiting for capacity if the queue is bounded and full.
    pub async fn enqueue(&self, event: Event) -> Result<(), QueueClosed> {
        self.reserve().await?.send(event)
    }

    /// Configured capacity, `None` when unbounded
    pub fn capacity(&self) -> Option<usize> {
        match self {
            QueueSender::Bounded(tx) => Some(tx.max_capacity()),
            QueueSender::Unbounded(_) => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            QueueSender::Bounded(tx) => tx.is_closed(),
            QueueSender::Unbounded(tx) => tx.is_closed(),
        }
    }
}

#[derive(Debug)]
pub enum QueueReceiver {
    Bounded(mpsc::Receiver<Event>),
    Unbounded(mpsc::UnboundedReceiver<Event>),
}

impl QueueReceiver {
    /// Wait for the next event. `None` once the queue is closed and empty,
    /// or every sender is gone.
    pub async fn dequeue(&mut self) -> Option<Event> {
        match self {
            QueueReceiver::Bounded(rx) => rx.recv().await,
            QueueReceiver::Unbounded(rx) => rx.recv().await,
        }
    }

    /// Refuse further enqueues. Already queued events can still be dequeued.
    pub fn close(&mut self) {
        match self {
            QueueReceiver::Bounded(rx) => rx.close(),
            QueueReceiver::Unbounded(rx) => rx.close(),
        }
    }

    /// Close the queue and drop everything still in it, returning how many
    /// events were discarded.
    pub fn discard_remaining(&mut self) -> u64 {
        self.close();
        let mut discarded = 0;
        loop {
            let next = match self {
                QueueReceiver::Bounded(rx) => rx.try_recv(),
                QueueReceiver::Unbounded(rx) => rx.try_recv(),
            };
            match next {
                Ok(_) => discarded += 1,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        discarded
    }
}
