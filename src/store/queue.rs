//! Durable message queues backed by the `queue_messages` table.
//!
//! Times are epoch milliseconds supplied by the caller so visibility
//! behaviour can be driven deterministically from tests.

use anyhow::{Context, Result};
use rusqlite::{TransactionBehavior, params};

use super::FleetDb;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub id: i64,
    pub body: String,
    pub receipt: String,
    pub receive_count: u32,
}

impl FleetDb {
    pub fn enqueue_message(&self, queue: &str, body: &str, now_ms: i64) -> Result<i64> {
        self.conn()
            .execute(
                "INSERT INTO queue_messages (queue, body, visible_at) VALUES (?1, ?2, ?3)",
                params![queue, body, now_ms],
            )
            .context("Failed to enqueue message")?;
        Ok(self.conn().last_insert_rowid())
    }

    /// Insert several bodies atomically. Either all land or none do.
    pub fn enqueue_messages(&self, queue: &str, bodies: &[String], now_ms: i64) -> Result<()> {
        let tx = self
            .conn()
            .unchecked_transaction()
            .context("Failed to begin enqueue transaction")?;
        {
            let mut stmt = tx
                .prepare("INSERT INTO queue_messages (queue, body, visible_at) VALUES (?1, ?2, ?3)")
                .context("Failed to prepare enqueue")?;
            for body in bodies {
                stmt.execute(params![queue, body, now_ms])
                    .context("Failed to enqueue message")?;
            }
        }
        tx.commit().context("Failed to commit enqueue")?;
        Ok(())
    }

    /// Claim up to `max` visible messages, hiding them for `visibility_ms`.
    ///
    /// Each claim issues a fresh receipt, so a receipt from an earlier
    /// delivery can no longer delete the message.
    pub fn claim_messages(
        &self,
        queue: &str,
        max: usize,
        now_ms: i64,
        visibility_ms: i64,
    ) -> Result<Vec<StoredMessage>> {
        let tx = rusqlite::Transaction::new_unchecked(self.conn(), TransactionBehavior::Immediate)
            .context("Failed to begin claim transaction")?;
        let candidates: Vec<(i64, String, u32)> = {
            let mut stmt = tx
                .prepare(
                    "SELECT id, body, receive_count FROM queue_messages
                     WHERE queue = ?1 AND visible_at <= ?2
                     ORDER BY id LIMIT ?3",
                )
                .context("Failed to prepare claim")?;
            let rows = stmt
                .query_map(params![queue, now_ms, max as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })
                .context("Failed to query visible messages")?;
            rows.collect::<rusqlite::Result<_>>()
                .context("Failed to read message row")?
        };

        let mut claimed = Vec::with_capacity(candidates.len());
        for (id, body, count) in candidates {
            let receipt = uuid::Uuid::new_v4().to_string();
            tx.execute(
                "UPDATE queue_messages SET receipt = ?1, visible_at = ?2,
                     receive_count = receive_count + 1 WHERE id = ?3",
                params![receipt, now_ms + visibility_ms, id],
            )
            .context("Failed to claim message")?;
            claimed.push(StoredMessage {
                id,
                body,
                receipt,
                receive_count: count + 1,
            });
        }
        tx.commit().context("Failed to commit claim")?;
        Ok(claimed)
    }

    /// Delete messages by receipt. Unknown or stale receipts are ignored.
    pub fn delete_messages(&self, queue: &str, receipts: &[String]) -> Result<usize> {
        let mut deleted = 0;
        for receipt in receipts {
            deleted += self
                .conn()
                .execute(
                    "DELETE FROM queue_messages WHERE queue = ?1 AND receipt = ?2",
                    params![queue, receipt],
                )
                .context("Failed to delete message")?;
        }
        Ok(deleted)
    }

    pub fn visible_message_count(&self, queue: &str, now_ms: i64) -> Result<usize> {
        let count: i64 = self
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM queue_messages WHERE queue = ?1 AND visible_at <= ?2",
                params![queue, now_ms],
                |row| row.get(0),
            )
            .context("Failed to count messages")?;
        Ok(count as usize)
    }
}
