use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::{BatchOutcome, MAX_BATCH, QueueMessage, QueueTransport, SendEntry};
use crate::errors::QueueError;
use crate::store::DbHandle;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Queue transport that stores messages in the fleet database.
#[derive(Clone)]
pub struct SqliteQueue {
    db: DbHandle,
    visibility: Duration,
}

impl SqliteQueue {
    pub fn new(db: DbHandle, visibility: Duration) -> Self {
        Self { db, visibility }
    }

    fn unavailable(queue: &str, source: anyhow::Error) -> QueueError {
        QueueError::Unavailable {
            queue: queue.to_string(),
            source,
        }
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[async_trait]
impl QueueTransport for SqliteQueue {
    async fn depth(&self, queue: &str) -> Result<usize, QueueError> {
        let name = queue.to_string();
        self.db
            .call(move |db| db.visible_message_count(&name, now_ms()))
            .await
            .map_err(|e| Self::unavailable(queue, e))
    }

    async fn receive(
        &self,
        queue: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let max = max.clamp(1, MAX_BATCH);
        let visibility_ms = self.visibility.as_millis() as i64;
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let name = queue.to_string();
            let claimed = self
                .db
                .call(move |db| db.claim_messages(&name, max, now_ms(), visibility_ms))
                .await
                .map_err(|e| Self::unavailable(queue, e))?;
            if !claimed.is_empty() || tokio::time::Instant::now() >= deadline {
                return Ok(claimed
                    .into_iter()
                    .map(|m| QueueMessage {
                        body: m.body,
                        receipt: m.receipt,
                        receive_count: m.receive_count,
                    })
                    .collect());
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - tokio::time::Instant::now())).await;
        }
    }

    async fn send(&self, queue: &str, body: String) -> Result<(), QueueError> {
        let name = queue.to_string();
        self.db
            .call(move |db| db.enqueue_message(&name, &body, now_ms()))
            .await
            .map(|_| ())
            .map_err(|e| Self::unavailable(queue, e))
    }

    async fn send_delayed(
        &self,
        queue: &str,
        body: String,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let name = queue.to_string();
        let visible_at = now_ms() + delay.as_millis() as i64;
        self.db
            .call(move |db| db.enqueue_message(&name, &body, visible_at))
            .await
            .map(|_| ())
            .map_err(|e| Self::unavailable(queue, e))
    }

    async fn send_batch(
        &self,
        queue: &str,
        entries: Vec<SendEntry>,
    ) -> Result<BatchOutcome, QueueError> {
        if entries.len() > MAX_BATCH {
            return Err(QueueError::BatchTooLarge {
                len: entries.len(),
                max: MAX_BATCH,
            });
        }
        let name = queue.to_string();
        let bodies: Vec<String> = entries.into_iter().map(|e| e.body).collect();
        self.db
            .call(move |db| db.enqueue_messages(&name, &bodies, now_ms()))
            .await
            .map_err(|e| Self::unavailable(queue, e))?;
        Ok(BatchOutcome::default())
    }

    async fn delete_batch(&self, queue: &str, receipts: Vec<String>) -> Result<(), QueueError> {
        if receipts.len() > MAX_BATCH {
            return Err(QueueError::BatchTooLarge {
                len: receipts.len(),
                max: MAX_BATCH,
            });
        }
        let name = queue.to_string();
        self.db
            .call(move |db| db.delete_messages(&name, &receipts))
            .await
            .map(|_| ())
            .map_err(|e| Self::unavailable(queue, e))
    }
}
