//! System health report.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use super::notifications::Severity;
use super::statistics::CallStatistics;
use crate::config::MonitoringConfig;
use crate::database::{DatabaseManager, StatsFilter};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthIssueKind {
    /// Active users whose telephony account is switched off.
    InactiveAccounts,
    /// Active rules whose action target is missing or inactive.
    MisconfiguredRules,
    /// Active groups without a single member.
    EmptyGroups,
    HighMissRate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthIssue {
    pub kind: HealthIssueKind,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemHealthReport {
    pub generated_at: DateTime<Utc>,
    /// Highest issue severity, `Info` when there are no issues.
    pub severity: Severity,
    pub issues: Vec<HealthIssue>,
    /// Traffic over the trailing 24 hours.
    pub last_24h: CallStatistics,
}

impl SystemHealthReport {
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }
}

pub struct HealthChecker {
    db: DatabaseManager,
    config: MonitoringConfig,
}

impl HealthChecker {
    pub fn new(db: DatabaseManager, config: MonitoringConfig) -> Self {
        Self { db, config }
    }

    pub async fn check(&self) -> Result<SystemHealthReport> {
        self.check_at(Utc::now()).await
    }

    pub async fn check_at(&self, now: DateTime<Utc>) -> Result<SystemHealthReport> {
        let mut issues = Vec::new();

        let inactive = self.db.inactive_account_count().await?;
        if inactive > 0 {
            issues.push(HealthIssue {
                kind: HealthIssueKind::InactiveAccounts,
                severity: Severity::Warning,
                message: format!("{inactive} active users have an inactive telephony account"),
            });
        }

        let rules = self.db.misconfigured_rules().await?;
        if !rules.is_empty() {
            let names: Vec<&str> = rules.iter().map(|r| r.name.as_str()).collect();
            issues.push(HealthIssue {
                kind: HealthIssueKind::MisconfiguredRules,
                severity: Severity::Error,
                message: format!("{} routing rules have no usable target: {}", rules.len(), names.join(", ")),
            });
        }

        let empty = self.db.empty_groups().await?;
        if !empty.is_empty() {
            let names: Vec<&str> = empty.iter().map(|g| g.name.as_str()).collect();
            issues.push(HealthIssue {
                kind: HealthIssueKind::EmptyGroups,
                severity: Severity::Warning,
                message: format!("{} active groups have no members: {}", empty.len(), names.join(", ")),
            });
        }

        let last_24h: CallStatistics = self
            .db
            .call_counts(&StatsFilter::between(now - Duration::hours(24), now))
            .await?
            .into();
        let miss_rate = last_24h.miss_rate();
        if last_24h.total > 0 && miss_rate > self.config.miss_rate_alert_percent {
            issues.push(HealthIssue {
                kind: HealthIssueKind::HighMissRate,
                severity: Severity::Critical,
                message: format!(
                    "{miss_rate}% of {} calls in the last 24h were missed (threshold {}%)",
                    last_24h.total, self.config.miss_rate_alert_percent
                ),
            });
        }

        let severity = issues.iter().map(|i| i.severity).max().unwrap_or(Severity::Info);
        if issues.is_empty() {
            info!("✅ Health check passed");
        } else {
            for issue in &issues {
                warn!("🩺 [{}] {}", issue.severity.as_str(), issue.message);
            }
        }

        Ok(SystemHealthReport {
            generated_at: now,
            severity,
            issues,
            last_24h,
        })
    }
}
