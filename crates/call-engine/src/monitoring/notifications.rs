//! # Notification Types and Sinks
//!
//! A [`Notification`] is an alert addressed to CRM users (extension owners,
//! group managers, administrators). Delivery is pluggable through the
//! [`Notifier`] trait; the engine ships with:
//!
//! - [`LogNotifier`]: writes every notification to the tracing log
//! - [`BroadcastNotifier`]: fans out over a `tokio::sync::broadcast` channel
//!   for in-process subscribers (web sockets, e-mail workers, tests)
//! - [`StoreNotifier`]: appends to the `notification_log` table
//! - [`CompositeNotifier`]: delivers to several sinks, isolating failures

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::database::DatabaseManager;
use crate::directory::{CrmUser, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    MissedCall,
    QueueOverflow,
    AgentsUnavailable,
    LongWait,
    SystemHealth,
    DailyReport,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissedCall => "missed_call",
            Self::QueueOverflow => "queue_overflow",
            Self::AgentsUnavailable => "agents_unavailable",
            Self::LongWait => "long_wait",
            Self::SystemHealth => "system_health",
            Self::DailyReport => "daily_report",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientRole {
    ExtensionOwner,
    GroupManager,
    Administrator,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recipient {
    pub user_id: UserId,
    pub username: String,
    pub email: Option<String>,
    pub role: RecipientRole,
}

impl Recipient {
    pub fn from_user(user: &CrmUser, role: RecipientRole) -> Self {
        Self {
            user_id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            role,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub id: Uuid,
    pub kind: NotificationKind,
    pub severity: Severity,
    pub subject: String,
    pub recipients: Vec<Recipient>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(kind: NotificationKind, severity: Severity, subject: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            severity,
            subject: subject.into(),
            recipients: Vec::new(),
            payload: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Add recipients, skipping users already addressed.
    pub fn with_recipients(mut self, recipients: impl IntoIterator<Item = Recipient>) -> Self {
        for recipient in recipients {
            if !self.recipients.iter().any(|r| r.user_id == recipient.user_id) {
                self.recipients.push(recipient);
            }
        }
        self
    }
}

/// Delivery channel for notifications
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Writes notifications to the log at a level matching their severity.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, n: &Notification) -> anyhow::Result<()> {
        let to: Vec<&str> = n.recipients.iter().map(|r| r.username.as_str()).collect();
        match n.severity {
            Severity::Info => info!("🔔 [{}] {} -> {:?}", n.kind, n.subject, to),
            Severity::Warning => warn!("⚠️ [{}] {} -> {:?}", n.kind, n.subject, to),
            Severity::Error | Severity::Critical => {
                error!("🚨 [{}] {} ({}) -> {:?}", n.kind, n.subject, n.severity.as_str(), to)
            }
        }
        Ok(())
    }
}

/// In-process fan-out to any number of subscribers.
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        // No subscribers is not a failure.
        let _ = self.tx.send(notification.clone());
        Ok(())
    }
}

/// Persists notifications to `notification_log`.
pub struct StoreNotifier {
    db: DatabaseManager,
}

impl StoreNotifier {
    pub fn new(db: DatabaseManager) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Notifier for StoreNotifier {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        self.db.record_notification(notification).await?;
        Ok(())
    }
}

/// Delivers to every sink; one failing sink does not stop the others.
#[derive(Default)]
pub struct CompositeNotifier {
    sinks: Vec<Arc<dyn Notifier>>,
}

impl CompositeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn Notifier>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }
}

#[async_trait]
impl Notifier for CompositeNotifier {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        let results = join_all(self.sinks.iter().map(|sink| sink.notify(notification))).await;
        let failures: Vec<String> = results
            .into_iter()
            .filter_map(|r| r.err().map(|e| e.to_string()))
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            anyhow::bail!(
                "{} of {} notification sinks failed: {}",
                failures.len(),
                self.sinks.len(),
                failures.join("; ")
            )
        }
    }
}
