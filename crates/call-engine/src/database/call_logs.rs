//! Call record persistence.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::debug;

use super::DatabaseManager;
use crate::directory::{CallDirection, CallLog, CallStatus, GroupId, NumberId};
use crate::error::{CallEngineError, Result};

/// Fields known when an inbound call first arrives
#[derive(Debug, Clone)]
pub struct NewCallLog {
    pub session_id: String,
    pub caller_id: String,
    pub called_number: String,
    pub direction: CallDirection,
    pub start_time: DateTime<Utc>,
    pub user_agent: Option<String>,
}

fn call_log_from_row(row: &SqliteRow) -> Result<CallLog> {
    let direction: String = row.try_get("direction")?;
    let status: String = row.try_get("status")?;
    Ok(CallLog {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        caller_id: row.try_get("caller_id")?,
        called_number: row.try_get("called_number")?,
        direction: direction
            .parse()
            .map_err(|_| CallEngineError::database(format!("invalid call direction in store: {direction}")))?,
        routed_to_number: row.try_get("routed_to_number")?,
        routed_to_group: row.try_get("routed_to_group")?,
        routing_rule_id: row.try_get("routing_rule_id")?,
        start_time: row.try_get("start_time")?,
        answer_time: row.try_get("answer_time")?,
        end_time: row.try_get("end_time")?,
        queued: row.try_get("queued")?,
        queue_exit_time: row.try_get("queue_exit_time")?,
        status: status
            .parse::<CallStatus>()
            .map_err(|_| CallEngineError::database(format!("invalid call status in store: {status}")))?,
        duration_secs: row.try_get("duration")?,
        queue_wait_secs: row.try_get("queue_wait_time")?,
        user_agent: row.try_get("user_agent")?,
        codec: row.try_get("codec")?,
        recording_file: row.try_get("recording_file")?,
        notes: row.try_get("notes")?,
    })
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw).ok().map(|t| t.with_timezone(&Utc))
}

impl DatabaseManager {
    /// Insert the initial `ringing` record. A reused session id surfaces as
    /// [`CallEngineError::AlreadyExists`].
    pub async fn insert_call_log(&self, new: &NewCallLog) -> Result<CallLog> {
        let id = self
            .with_write_retry("insert call log", || {
                let pool = self.pool.clone();
                let new = new.clone();
                async move {
                    sqlx::query(
                        "INSERT INTO call_logs (session_id, caller_id, called_number, direction, start_time, status,
                             user_agent)
                         VALUES (?, ?, ?, ?, ?, 'ringing', ?)",
                    )
                    .bind(&new.session_id)
                    .bind(&new.caller_id)
                    .bind(&new.called_number)
                    .bind(new.direction.as_str())
                    .bind(new.start_time)
                    .bind(&new.user_agent)
                    .execute(&pool)
                    .await
                    .map(|r| r.last_insert_rowid())
                }
            })
            .await?;

        debug!("Call log {} created for session {}", id, new.session_id);
        self.get_call_log_by_id(id)
            .await?
            .ok_or_else(|| CallEngineError::internal("call log vanished after insert"))
    }

    pub async fn get_call_log(&self, session_id: &str) -> Result<Option<CallLog>> {
        let row = sqlx::query("SELECT * FROM call_logs WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(call_log_from_row).transpose()
    }

    pub async fn get_call_log_by_id(&self, id: i64) -> Result<Option<CallLog>> {
        let row = sqlx::query("SELECT * FROM call_logs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(call_log_from_row).transpose()
    }

    /// Persist every mutable field of `log`.
    pub async fn save_call_log(&self, log: &CallLog) -> Result<()> {
        let affected = self
            .with_write_retry("update call log", || {
                let pool = self.pool.clone();
                let log = log.clone();
                async move {
                    sqlx::query(
                        "UPDATE call_logs SET
                             routed_to_number = ?, routed_to_group = ?, routing_rule_id = ?,
                             answer_time = ?, end_time = ?, queued = ?, queue_exit_time = ?,
                             status = ?, duration = ?, queue_wait_time = ?,
                             user_agent = ?, codec = ?, recording_file = ?, notes = ?
                         WHERE id = ?",
                    )
                    .bind(log.routed_to_number)
                    .bind(log.routed_to_group)
                    .bind(log.routing_rule_id)
                    .bind(log.answer_time)
                    .bind(log.end_time)
                    .bind(log.queued)
                    .bind(log.queue_exit_time)
                    .bind(log.status.as_str())
                    .bind(log.duration_secs)
                    .bind(log.queue_wait_secs)
                    .bind(&log.user_agent)
                    .bind(&log.codec)
                    .bind(&log.recording_file)
                    .bind(&log.notes)
                    .bind(log.id)
                    .execute(&pool)
                    .await
                    .map(|r| r.rows_affected())
                }
            })
            .await?;

        if affected == 0 {
            return Err(CallEngineError::not_found(format!("call log {}", log.id)));
        }
        Ok(())
    }

    /// Record when a queued call left the queue. Only the first exit counts.
    pub async fn mark_queue_exit(&self, session_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE call_logs SET queue_exit_time = ? WHERE session_id = ? AND queue_exit_time IS NULL")
            .bind(at)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn recent_call_logs(&self, limit: u32) -> Result<Vec<CallLog>> {
        let rows = sqlx::query("SELECT * FROM call_logs ORDER BY start_time DESC, id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(call_log_from_row).collect()
    }

    /// Most recent answer time per extension, for the given extensions.
    /// Extensions that never answered are absent from the map.
    pub async fn last_answered_times(&self, number_ids: &[NumberId]) -> Result<HashMap<NumberId, DateTime<Utc>>> {
        if number_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = vec!["?"; number_ids.len()].join(", ");
        let sql = format!(
            "SELECT routed_to_number, MAX(answer_time) AS last_answered
             FROM call_logs
             WHERE answer_time IS NOT NULL AND routed_to_number IN ({placeholders})
             GROUP BY routed_to_number"
        );
        let mut query = sqlx::query(&sql);
        for id in number_ids {
            query = query.bind(*id);
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut last = HashMap::with_capacity(rows.len());
        for row in &rows {
            let number: NumberId = row.try_get("routed_to_number")?;
            let raw: Option<String> = row.try_get("last_answered")?;
            if let Some(at) = raw.as_deref().and_then(parse_timestamp) {
                last.insert(number, at);
            }
        }
        Ok(last)
    }

    /// Mean talk time of answered calls routed through `group_id` since
    /// `since`, or `None` without history.
    pub async fn average_answered_duration(&self, group_id: GroupId, since: DateTime<Utc>) -> Result<Option<f64>> {
        let avg: Option<f64> = sqlx::query_scalar(
            "SELECT AVG(duration) FROM call_logs
             WHERE routed_to_group = ? AND status = 'answered' AND duration IS NOT NULL AND start_time >= ?",
        )
        .bind(group_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(avg)
    }
}
