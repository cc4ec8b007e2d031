//! # Monitoring, Statistics and Alerts
//!
//! Everything the engine reports about itself:
//!
//! - [`NotificationTrigger`]: missed-call and queue-health alerts
//! - [`Notifier`] sinks for delivering those alerts
//! - [`StatisticsService`]: call counts and rates by group, extension or
//!   date range, and the [`DailyReport`]
//! - [`HealthChecker`]: directory and traffic health in a
//!   [`SystemHealthReport`]

pub mod health;
pub mod notifications;
pub mod statistics;
pub mod trigger;

pub use health::{HealthChecker, HealthIssue, HealthIssueKind, SystemHealthReport};
pub use notifications::{
    BroadcastNotifier, CompositeNotifier, LogNotifier, Notification, NotificationKind, Notifier, Recipient,
    RecipientRole, Severity, StoreNotifier,
};
pub use statistics::{
    percent, CallStatistics, DailyReport, GroupStatistics, MemberStatistics, MissedNumber, StatisticsService,
};
pub use trigger::NotificationTrigger;
