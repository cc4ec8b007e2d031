//! Aggregate queries over call records.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};

use super::DatabaseManager;
use crate::directory::{GroupId, NumberId};
use crate::error::Result;

const COUNT_COLUMNS: &str = "COUNT(*) AS total,
    COALESCE(SUM(CASE WHEN status = 'answered' THEN 1 ELSE 0 END), 0) AS answered,
    COALESCE(SUM(CASE WHEN status = 'no_answer' THEN 1 ELSE 0 END), 0) AS no_answer,
    COALESCE(SUM(CASE WHEN status = 'busy' THEN 1 ELSE 0 END), 0) AS busy,
    COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failed,
    COALESCE(SUM(CASE WHEN status = 'abandoned' THEN 1 ELSE 0 END), 0) AS abandoned,
    AVG(CASE WHEN status = 'answered' THEN duration END) AS avg_duration,
    AVG(queue_wait_time) AS avg_queue_wait";

/// Which call records an aggregate covers; `from` inclusive, `to` exclusive
#[derive(Debug, Clone, Default)]
pub struct StatsFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub group_id: Option<GroupId>,
    pub number_id: Option<NumberId>,
}

impl StatsFilter {
    pub fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
            ..Self::default()
        }
    }

    pub fn for_group(mut self, group_id: GroupId) -> Self {
        self.group_id = Some(group_id);
        self
    }

    pub fn for_number(mut self, number_id: NumberId) -> Self {
        self.number_id = Some(number_id);
        self
    }

    fn push_where(&self, query: &mut QueryBuilder<'_, Sqlite>) {
        query.push(" WHERE 1 = 1");
        if let Some(from) = self.from {
            query.push(" AND start_time >= ").push_bind(from);
        }
        if let Some(to) = self.to {
            query.push(" AND start_time < ").push_bind(to);
        }
        if let Some(group_id) = self.group_id {
            query.push(" AND routed_to_group = ").push_bind(group_id);
        }
        if let Some(number_id) = self.number_id {
            query.push(" AND routed_to_number = ").push_bind(number_id);
        }
    }
}

/// Raw status counts and averages for a set of call records
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CallCounts {
    pub total: i64,
    pub answered: i64,
    pub no_answer: i64,
    pub busy: i64,
    pub failed: i64,
    pub abandoned: i64,
    pub average_duration_secs: Option<f64>,
    pub average_queue_wait_secs: Option<f64>,
}

impl CallCounts {
    /// Calls that reached nobody: `no_answer` and `busy`.
    pub fn missed(&self) -> i64 {
        self.no_answer + self.busy
    }

    fn from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            total: row.try_get("total")?,
            answered: row.try_get("answered")?,
            no_answer: row.try_get("no_answer")?,
            busy: row.try_get("busy")?,
            failed: row.try_get("failed")?,
            abandoned: row.try_get("abandoned")?,
            average_duration_secs: row.try_get("avg_duration")?,
            average_queue_wait_secs: row.try_get("avg_queue_wait")?,
        })
    }
}

impl DatabaseManager {
    pub async fn call_counts(&self, filter: &StatsFilter) -> Result<CallCounts> {
        let mut query = QueryBuilder::new(format!("SELECT {COUNT_COLUMNS} FROM call_logs"));
        filter.push_where(&mut query);
        let row = query.build().fetch_one(&self.pool).await?;
        CallCounts::from_row(&row)
    }

    /// Counts per routed group, for groups that saw at least one call.
    pub async fn call_counts_by_group(&self, filter: &StatsFilter) -> Result<Vec<(GroupId, CallCounts)>> {
        self.grouped_counts("routed_to_group", filter).await
    }

    /// Counts per routed extension, for extensions that saw at least one call.
    pub async fn call_counts_by_number(&self, filter: &StatsFilter) -> Result<Vec<(NumberId, CallCounts)>> {
        self.grouped_counts("routed_to_number", filter).await
    }

    async fn grouped_counts(&self, column: &'static str, filter: &StatsFilter) -> Result<Vec<(i64, CallCounts)>> {
        let mut query = QueryBuilder::new(format!("SELECT {column} AS bucket, {COUNT_COLUMNS} FROM call_logs"));
        filter.push_where(&mut query);
        query.push(format!(" AND {column} IS NOT NULL GROUP BY {column} ORDER BY {column}"));
        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| -> Result<(i64, CallCounts)> { Ok((row.try_get("bucket")?, CallCounts::from_row(row)?)) })
            .collect()
    }

    /// Called numbers with the most missed calls, most missed first.
    pub async fn top_missed_called_numbers(&self, filter: &StatsFilter, limit: u32) -> Result<Vec<(String, i64)>> {
        let mut query = QueryBuilder::new("SELECT called_number, COUNT(*) AS missed FROM call_logs");
        filter.push_where(&mut query);
        query
            .push(" AND status IN ('no_answer', 'busy') GROUP BY called_number ORDER BY missed DESC, called_number LIMIT ")
            .push_bind(limit);
        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| -> Result<(String, i64)> { Ok((row.try_get("called_number")?, row.try_get("missed")?)) })
            .collect()
    }
}
