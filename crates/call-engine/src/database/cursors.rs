//! Persisted round-robin cursors.

use chrono::Utc;

use super::DatabaseManager;
use crate::directory::GroupId;
use crate::error::Result;

impl DatabaseManager {
    /// Membership position of the member most recently handed out.
    pub async fn group_cursor(&self, group_id: GroupId) -> Result<Option<i64>> {
        Ok(sqlx::query_scalar("SELECT last_position FROM group_cursors WHERE group_id = ?")
            .bind(group_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn set_group_cursor(&self, group_id: GroupId, last_position: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO group_cursors (group_id, last_position, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(group_id) DO UPDATE SET last_position = excluded.last_position,
                                                 updated_at = excluded.updated_at",
        )
        .bind(group_id)
        .bind(last_position)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
