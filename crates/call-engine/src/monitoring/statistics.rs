//! Call statistics and the daily report.
//!
//! Read-only views over `call_logs` for dashboards. Rates are percentages
//! rounded to one decimal place; an empty range has a rate of zero.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, TimeZone, Utc};
use serde::Serialize;
use tracing::debug;

use crate::database::{CallCounts, DatabaseManager, StatsFilter};
use crate::directory::{GroupId, NumberId};
use crate::error::{CallEngineError, Result};

/// Aggregate figures for one set of calls
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CallStatistics {
    pub total: i64,
    pub answered: i64,
    /// `no_answer` + `busy`
    pub missed: i64,
    pub no_answer: i64,
    pub busy: i64,
    pub failed: i64,
    pub abandoned: i64,
    pub answer_rate: f64,
    pub average_duration_secs: f64,
    pub average_queue_wait_secs: f64,
}

impl From<CallCounts> for CallStatistics {
    fn from(counts: CallCounts) -> Self {
        Self {
            total: counts.total,
            answered: counts.answered,
            missed: counts.missed(),
            no_answer: counts.no_answer,
            busy: counts.busy,
            failed: counts.failed,
            abandoned: counts.abandoned,
            answer_rate: percent(counts.answered, counts.total),
            average_duration_secs: round1(counts.average_duration_secs.unwrap_or(0.0)),
            average_queue_wait_secs: round1(counts.average_queue_wait_secs.unwrap_or(0.0)),
        }
    }
}

impl CallStatistics {
    pub fn miss_rate(&self) -> f64 {
        percent(self.missed, self.total)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupStatistics {
    pub group_id: GroupId,
    pub group_name: String,
    pub stats: CallStatistics,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberStatistics {
    pub number_id: NumberId,
    pub number: String,
    pub stats: CallStatistics,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissedNumber {
    pub called_number: String,
    pub missed: i64,
}

/// One calendar day of traffic in the engine's local offset
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyReport {
    pub date: NaiveDate,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub totals: CallStatistics,
    pub groups: Vec<GroupStatistics>,
    pub top_missed: Vec<MissedNumber>,
}

const TOP_MISSED_LIMIT: u32 = 5;

/// `part` as a percentage of `whole`, one decimal place.
pub fn percent(part: i64, whole: i64) -> f64 {
    if whole <= 0 {
        return 0.0;
    }
    round1(part as f64 * 100.0 / whole as f64)
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Statistics queries over the call record store
#[derive(Clone)]
pub struct StatisticsService {
    db: DatabaseManager,
}

impl StatisticsService {
    pub fn new(db: DatabaseManager) -> Self {
        Self { db }
    }

    pub async fn overall(&self, filter: &StatsFilter) -> Result<CallStatistics> {
        Ok(self.db.call_counts(filter).await?.into())
    }

    /// Per-group figures for every group that received calls in the range.
    pub async fn by_group(&self, filter: &StatsFilter) -> Result<Vec<GroupStatistics>> {
        let mut out = Vec::new();
        for (group_id, counts) in self.db.call_counts_by_group(filter).await? {
            let group_name = match self.db.get_group(group_id).await? {
                Some(group) => group.name,
                None => format!("group {group_id}"),
            };
            out.push(GroupStatistics {
                group_id,
                group_name,
                stats: counts.into(),
            });
        }
        Ok(out)
    }

    /// Per-extension figures for every extension that was routed calls.
    pub async fn by_member(&self, filter: &StatsFilter) -> Result<Vec<MemberStatistics>> {
        let mut out = Vec::new();
        for (number_id, counts) in self.db.call_counts_by_number(filter).await? {
            let number = match self.db.get_internal_number(number_id).await? {
                Some(n) => n.number,
                None => format!("#{number_id}"),
            };
            out.push(MemberStatistics {
                number_id,
                number,
                stats: counts.into(),
            });
        }
        Ok(out)
    }

    pub async fn group(&self, group_id: GroupId, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<GroupStatistics> {
        let group = self
            .db
            .get_group(group_id)
            .await?
            .ok_or_else(|| CallEngineError::not_found(format!("group {group_id}")))?;
        let counts = self.db.call_counts(&StatsFilter::between(from, to).for_group(group_id)).await?;
        Ok(GroupStatistics {
            group_id,
            group_name: group.name,
            stats: counts.into(),
        })
    }

    pub async fn member(&self, number_id: NumberId, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<MemberStatistics> {
        let number = self
            .db
            .get_internal_number(number_id)
            .await?
            .ok_or_else(|| CallEngineError::not_found(format!("internal number {number_id}")))?;
        let counts = self.db.call_counts(&StatsFilter::between(from, to).for_number(number_id)).await?;
        Ok(MemberStatistics {
            number_id,
            number: number.number,
            stats: counts.into(),
        })
    }

    /// Report for `date`, where days start at local midnight for
    /// `utc_offset_minutes`.
    pub async fn daily_report(&self, date: NaiveDate, utc_offset_minutes: i32) -> Result<DailyReport> {
        let offset = FixedOffset::east_opt(utc_offset_minutes * 60)
            .ok_or_else(|| CallEngineError::validation(format!("invalid UTC offset {utc_offset_minutes}")))?;
        let midnight = date
            .and_hms_opt(0, 0, 0)
            .and_then(|naive| offset.from_local_datetime(&naive).single())
            .ok_or_else(|| CallEngineError::validation(format!("no local midnight on {date}")))?;
        let from = midnight.with_timezone(&Utc);
        let to = from + Duration::days(1);
        let filter = StatsFilter::between(from, to);

        let totals = self.overall(&filter).await?;
        let groups = self.by_group(&filter).await?;
        let top_missed = self
            .db
            .top_missed_called_numbers(&filter, TOP_MISSED_LIMIT)
            .await?
            .into_iter()
            .map(|(called_number, missed)| MissedNumber { called_number, missed })
            .collect();

        debug!("Daily report for {}: {} calls, {}% answered", date, totals.total, totals.answer_rate);
        Ok(DailyReport {
            date,
            from,
            to,
            totals,
            groups,
            top_missed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::NewCallLog;
    use crate::directory::{CallDirection, CallStatus, DistributionStrategy};
    use crate::test_support::Fixture;

    #[allow(clippy::too_many_arguments)]
    async fn log_call(
        fx: &Fixture,
        session: &str,
        called: &str,
        start: DateTime<Utc>,
        status: CallStatus,
        group: Option<GroupId>,
        number: Option<NumberId>,
        duration: i64,
    ) {
        let mut log = fx
            .db
            .insert_call_log(&NewCallLog {
                session_id: session.into(),
                caller_id: "+15550000".into(),
                called_number: called.into(),
                direction: CallDirection::Inbound,
                start_time: start,
                user_agent: None,
            })
            .await
            .unwrap();
        log.status = status;
        log.routed_to_group = group;
        log.routed_to_number = number;
        if status == CallStatus::Answered {
            log.answer_time = Some(start);
            log.end_time = Some(start + Duration::seconds(duration));
        }
        log.duration_secs = Some(duration);
        fx.db.save_call_log(&log).await.unwrap();
    }

    #[test]
    fn test_percent_rounding() {
        assert_eq!(percent(1, 3), 33.3);
        assert_eq!(percent(2, 3), 66.7);
        assert_eq!(percent(0, 0), 0.0);
        assert_eq!(percent(5, 5), 100.0);
    }

    #[tokio::test]
    async fn test_group_and_member_statistics() {
        let fx = Fixture::new().await;
        let a = fx.extension("alice").await;
        let sales = fx.group("Sales", DistributionStrategy::RoundRobin, &[&a], 5, 300).await;
        let now = Utc::now();

        log_call(&fx, "s1", "5000", now, CallStatus::Answered, Some(sales.id), Some(a.number.id), 60).await;
        log_call(&fx, "s2", "5000", now, CallStatus::Answered, Some(sales.id), Some(a.number.id), 120).await;
        log_call(&fx, "s3", "5000", now, CallStatus::NoAnswer, Some(sales.id), Some(a.number.id), 0).await;
        log_call(&fx, "s4", "7000", now, CallStatus::Failed, None, None, 0).await;

        let service = StatisticsService::new(fx.db.clone());
        let range = StatsFilter::between(now - Duration::hours(1), now + Duration::hours(1));

        let overall = service.overall(&range).await.unwrap();
        assert_eq!((overall.total, overall.answered, overall.missed, overall.failed), (4, 2, 1, 1));
        assert_eq!(overall.answer_rate, 50.0);

        let groups = service.by_group(&range).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].group_name, "Sales");
        assert_eq!(groups[0].stats.total, 3);
        assert_eq!(groups[0].stats.answer_rate, 66.7);
        assert_eq!(groups[0].stats.average_duration_secs, 90.0);

        let member = service
            .member(a.number.id, now - Duration::hours(1), now + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(member.number, a.number.number);
        assert_eq!(member.stats.missed, 1);

        assert!(matches!(
            service.group(999, now, now).await,
            Err(CallEngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_daily_report_window_and_top_missed() {
        let fx = Fixture::new().await;
        let day = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let noon = Utc.from_utc_datetime(&day.and_hms_opt(12, 0, 0).unwrap());

        for i in 0..3 {
            log_call(&fx, &format!("a{i}"), "100", noon, CallStatus::NoAnswer, None, None, 0).await;
        }
        log_call(&fx, "b0", "200", noon, CallStatus::Busy, None, None, 0).await;
        log_call(&fx, "c0", "300", noon, CallStatus::Answered, None, None, 30).await;
        // Previous day; outside the window.
        log_call(&fx, "old", "100", noon - Duration::days(1), CallStatus::NoAnswer, None, None, 0).await;

        let report = StatisticsService::new(fx.db.clone()).daily_report(day, 0).await.unwrap();
        assert_eq!(report.totals.total, 5);
        assert_eq!(report.totals.missed, 4);
        assert_eq!(report.top_missed[0], MissedNumber { called_number: "100".into(), missed: 3 });
        assert_eq!(report.top_missed[1].called_number, "200");
        assert_eq!(report.to - report.from, Duration::days(1));

        // A +14h offset moves local midnight to 10:00 UTC the day before.
        let shifted = StatisticsService::new(fx.db.clone()).daily_report(day, 14 * 60).await.unwrap();
        assert_eq!(shifted.from, noon - Duration::hours(26));
        assert_eq!(shifted.totals.total, 1);
    }
}
