//! Queue transport abstraction.
//!
//! Every component talks to queues through `QueueTransport` so the same
//! consumer/producer code runs against the durable SQLite transport in
//! production and in tests. Delivery is at-least-once: a received message
//! stays invisible until deleted or until its visibility timeout lapses.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::errors::QueueError;

mod sqlite;

pub use sqlite::SqliteQueue;

/// Largest page a single receive/send/delete call handles.
pub const MAX_BATCH: usize = 10;

/// A received message and the handle needed to acknowledge it.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub body: String,
    pub receipt: String,
    pub receive_count: u32,
}

/// One entry of a batched send. `id` is only meaningful within the batch.
#[derive(Debug, Clone, PartialEq)]
pub struct SendEntry {
    pub id: String,
    pub body: String,
}

/// Entries the transport rejected from an otherwise accepted batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    pub failed: Vec<String>,
}

/// Abstraction over a message queue for testability.
/// Real implementation: `SqliteQueue`.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Approximate number of visible messages.
    async fn depth(&self, queue: &str) -> Result<usize, QueueError>;

    /// Receive up to `max` messages, waiting at most `wait` for the first.
    async fn receive(
        &self,
        queue: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    async fn send(&self, queue: &str, body: String) -> Result<(), QueueError>;

    /// Send a message that stays invisible to receivers for `delay`.
    async fn send_delayed(
        &self,
        queue: &str,
        body: String,
        delay: Duration,
    ) -> Result<(), QueueError>;

    /// Send at most [`MAX_BATCH`] entries.
    async fn send_batch(
        &self,
        queue: &str,
        entries: Vec<SendEntry>,
    ) -> Result<BatchOutcome, QueueError>;

    async fn delete_batch(&self, queue: &str, receipts: Vec<String>) -> Result<(), QueueError>;
}

/// Serialize `items` and send them in [`MAX_BATCH`]-sized groups.
///
/// Entry ids are the item indices, so a partially rejected group still
/// tells the caller exactly which items landed. Stops at the first group
/// that fails outright or has rejected entries. Both arms carry the indices
/// of the items durably sent.
pub async fn send_json_batches<T: Serialize + Sync>(
    transport: &dyn QueueTransport,
    queue: &str,
    items: &[T],
) -> Result<Vec<usize>, (Vec<usize>, QueueError)> {
    let mut delivered = Vec::with_capacity(items.len());
    for (n, chunk) in items.chunks(MAX_BATCH).enumerate() {
        let offset = n * MAX_BATCH;
        let mut entries = Vec::with_capacity(chunk.len());
        for (i, item) in chunk.iter().enumerate() {
            let body = match serde_json::to_string(item) {
                Ok(body) => body,
                Err(e) => return Err((delivered, QueueError::from(e))),
            };
            entries.push(SendEntry {
                id: (offset + i).to_string(),
                body,
            });
        }
        let outcome = match transport.send_batch(queue, entries).await {
            Ok(outcome) => outcome,
            Err(e) => return Err((delivered, e)),
        };
        let landed = (offset..offset + chunk.len())
            .filter(|idx| !outcome.failed.iter().any(|f| f == &idx.to_string()));
        delivered.extend(landed);
        if !outcome.failed.is_empty() {
            return Err((
                delivered,
                QueueError::Unavailable {
                    queue: queue.to_string(),
                    source: anyhow::anyhow!(
                        "{} of {} entries rejected",
                        outcome.failed.len(),
                        chunk.len()
                    ),
                },
            ));
        }
    }
    Ok(delivered)
}

/// Acknowledge receipts in [`MAX_BATCH`]-sized groups.
pub async fn delete_all(
    transport: &dyn QueueTransport,
    queue: &str,
    receipts: Vec<String>,
) -> Result<(), QueueError> {
    for chunk in receipts.chunks(MAX_BATCH) {
        transport.delete_batch(queue, chunk.to_vec()).await?;
    }
    Ok(())
}
