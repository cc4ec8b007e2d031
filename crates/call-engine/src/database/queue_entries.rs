//! Queue entry persistence. Callers serialize access per group; see
//! [`QueueManager`](crate::queue::QueueManager).

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::debug;

use super::DatabaseManager;
use crate::directory::{GroupId, QueueEntry, QueueStatus};
use crate::error::{CallEngineError, Result};

fn queue_entry_from_row(row: &SqliteRow) -> Result<QueueEntry> {
    let status: String = row.try_get("status")?;
    Ok(QueueEntry {
        id: row.try_get("id")?,
        group_id: row.try_get("group_id")?,
        caller_id: row.try_get("caller_id")?,
        called_number: row.try_get("called_number")?,
        session_id: row.try_get("session_id")?,
        position: row.try_get("queue_position")?,
        wait_start_time: row.try_get("wait_start_time")?,
        estimated_wait_secs: row.try_get("estimated_wait_time")?,
        status: status
            .parse::<QueueStatus>()
            .map_err(|_| CallEngineError::database(format!("invalid queue status in store: {status}")))?,
        left_at: row.try_get("left_at")?,
    })
}

impl DatabaseManager {
    pub async fn waiting_count(&self, group_id: GroupId) -> Result<u32> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM queue_entries WHERE group_id = ? AND status = 'waiting'")
                .bind(group_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    /// Append a waiting entry at `position`.
    pub async fn insert_queue_entry(
        &self,
        group_id: GroupId,
        caller_id: &str,
        called_number: &str,
        session_id: &str,
        position: u32,
        wait_start_time: DateTime<Utc>,
        estimated_wait_secs: u32,
    ) -> Result<QueueEntry> {
        let id = sqlx::query(
            "INSERT INTO queue_entries (group_id, caller_id, called_number, session_id, queue_position,
                 wait_start_time, estimated_wait_time, status)
             VALUES (?, ?, ?, ?, ?, ?, ?, 'waiting')",
        )
        .bind(group_id)
        .bind(caller_id)
        .bind(called_number)
        .bind(session_id)
        .bind(position)
        .bind(wait_start_time)
        .bind(estimated_wait_secs)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        debug!("Queue entry {} added to group {} at position {}", id, group_id, position);
        self.get_queue_entry(id)
            .await?
            .ok_or_else(|| CallEngineError::internal("queue entry vanished after insert"))
    }

    pub async fn get_queue_entry(&self, id: i64) -> Result<Option<QueueEntry>> {
        let row = sqlx::query("SELECT * FROM queue_entries WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(queue_entry_from_row).transpose()
    }

    /// The non-terminal entry for a session, if it is still queued.
    pub async fn open_queue_entry_for_session(&self, session_id: &str) -> Result<Option<QueueEntry>> {
        let row = sqlx::query(
            "SELECT * FROM queue_entries
             WHERE session_id = ? AND status IN ('waiting', 'connecting')
             ORDER BY id DESC LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(queue_entry_from_row).transpose()
    }

    /// Waiting entries, oldest first.
    pub async fn waiting_entries(&self, group_id: GroupId) -> Result<Vec<QueueEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM queue_entries
             WHERE group_id = ? AND status = 'waiting'
             ORDER BY wait_start_time, id",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(queue_entry_from_row).collect()
    }

    /// All waiting entries across groups, grouped then oldest first.
    pub async fn all_waiting_entries(&self) -> Result<Vec<QueueEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM queue_entries WHERE status = 'waiting' ORDER BY group_id, wait_start_time, id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(queue_entry_from_row).collect()
    }

    /// Groups that currently have at least one waiting entry.
    pub async fn groups_with_waiting_calls(&self) -> Result<Vec<GroupId>> {
        Ok(sqlx::query_scalar(
            "SELECT DISTINCT group_id FROM queue_entries WHERE status = 'waiting' ORDER BY group_id",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    /// Move an entry to `status`. Leaving the waiting state stamps `left_at`.
    pub async fn set_queue_entry_status(&self, id: i64, status: QueueStatus, at: DateTime<Utc>) -> Result<()> {
        let left_at = (status != QueueStatus::Waiting).then_some(at);
        let result = sqlx::query("UPDATE queue_entries SET status = ?, left_at = COALESCE(left_at, ?) WHERE id = ?")
            .bind(status.as_str())
            .bind(left_at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CallEngineError::not_found(format!("queue entry {id}")));
        }
        Ok(())
    }

    /// Renumber the group's waiting entries 1..n by arrival.
    pub async fn recompute_queue_positions(&self, group_id: GroupId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM queue_entries WHERE group_id = ? AND status = 'waiting' ORDER BY wait_start_time, id",
        )
        .bind(group_id)
        .fetch_all(&mut *tx)
        .await?;

        for (index, id) in ids.iter().enumerate() {
            sqlx::query("UPDATE queue_entries SET queue_position = ? WHERE id = ? AND queue_position != ?")
                .bind(index as i64 + 1)
                .bind(id)
                .bind(index as i64 + 1)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Delete terminal entries that left the queue before `before`.
    pub async fn purge_terminal_queue_entries(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM queue_entries
             WHERE status IN ('connected', 'abandoned', 'timeout')
               AND COALESCE(left_at, wait_start_time) < ?",
        )
        .bind(before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
