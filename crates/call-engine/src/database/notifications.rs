//! Notification audit trail.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::Row;

use super::DatabaseManager;
use crate::error::{CallEngineError, Result};
use crate::monitoring::Notification;

/// A stored notification, recipients and payload kept as JSON text
#[derive(Debug, Clone, Serialize)]
pub struct NotificationRecord {
    pub id: String,
    pub kind: String,
    pub severity: String,
    pub subject: String,
    pub recipients: serde_json::Value,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl DatabaseManager {
    pub async fn record_notification(&self, notification: &Notification) -> Result<()> {
        let recipients = serde_json::to_string(&notification.recipients)
            .map_err(|e| CallEngineError::internal(format!("cannot encode recipients: {e}")))?;
        sqlx::query(
            "INSERT INTO notification_log (id, kind, severity, subject, recipients, payload, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(notification.id.to_string())
        .bind(notification.kind.as_str())
        .bind(notification.severity.as_str())
        .bind(&notification.subject)
        .bind(recipients)
        .bind(notification.payload.to_string())
        .bind(notification.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recent_notifications(&self, limit: u32) -> Result<Vec<NotificationRecord>> {
        let rows = sqlx::query("SELECT * FROM notification_log ORDER BY created_at DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<NotificationRecord> {
                let recipients: String = row.try_get("recipients")?;
                let payload: String = row.try_get("payload")?;
                Ok(NotificationRecord {
                    id: row.try_get("id")?,
                    kind: row.try_get("kind")?,
                    severity: row.try_get("severity")?,
                    subject: row.try_get("subject")?,
                    recipients: serde_json::from_str(&recipients).unwrap_or(serde_json::Value::Null),
                    payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}
