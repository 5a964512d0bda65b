//! Ingress: turns publish bodies into validated events and hands them to
//! the [`Aggregator`].

pub mod reader;
pub mod validator;

pub use reader::{decode_line, ReadMode, TailReader};
pub use validator::{parse_publish, ValidationError};

use crate::aggregator::Aggregator;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PublishReceipt {
    /// Events in the body
    pub received: usize,
    /// Events accepted by the queue; less than `received` once shutdown began
    pub queued: usize,
}

/// Validate `body` and queue its events in order.
///
/// Nothing is queued if any event in the body is invalid.
pub async fn publish(aggregator: &Aggregator, body: &str) -> Result<PublishReceipt, ValidationError> {
    let events = parse_publish(body)?;
    let received = events.len();
    let queued = aggregator.submit_batch(events).await;

    if queued < received {
        log::warn!(
            "⚠️  Queue closed mid-publish: {}/{} events queued",
            queued,
            received
        );
    }

    Ok(PublishReceipt { received, queued })
}
