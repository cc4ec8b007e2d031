//! # Notification Trigger
//!
//! Turns call and queue events into [`Notification`]s. Delivery never sits
//! on the call path: call-driven alerts are dispatched on a spawned task and
//! any sink failure is logged and dropped.
//!
//! | Event                                   | Severity | Recipients                     |
//! |-----------------------------------------|----------|--------------------------------|
//! | call ended `busy` / `no_answer`         | info     | extension owner, group managers |
//! | queue at overflow ratio or rejected     | warning  | group managers, admins          |
//! | active group, members, none available   | critical | admins                          |
//! | one caller waiting past the threshold   | warning  | group managers                  |
//!
//! Group alerts are rate limited per (group, kind) by `alert_cooldown_secs`;
//! long-wait alerts fire once per queue entry.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use serde_json::json;
use tracing::{debug, error, warn};

use super::notifications::{Notification, NotificationKind, Notifier, Recipient, RecipientRole, Severity};
use crate::config::{NotificationConfig, QueueConfig};
use crate::database::DatabaseManager;
use crate::directory::{CallLog, Group, GroupId};
use crate::distribution::GroupDistributor;
use crate::error::Result;

const MAX_COOLDOWN_SECS: u64 = 7 * 24 * 3600;

pub struct NotificationTrigger {
    db: DatabaseManager,
    notifier: Arc<dyn Notifier>,
    distributor: Arc<GroupDistributor>,
    config: NotificationConfig,
    queue_config: QueueConfig,
    last_alert: DashMap<(GroupId, NotificationKind), DateTime<Utc>>,
    long_wait_alerted: DashSet<i64>,
}

impl NotificationTrigger {
    pub fn new(
        db: DatabaseManager,
        notifier: Arc<dyn Notifier>,
        distributor: Arc<GroupDistributor>,
        config: NotificationConfig,
        queue_config: QueueConfig,
    ) -> Self {
        Self {
            db,
            notifier,
            distributor,
            config,
            queue_config,
            last_alert: DashMap::new(),
            long_wait_alerted: DashSet::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// React to a call record that just became terminal. Returns at once;
    /// the alert is built and delivered in the background.
    pub fn on_terminal_status(self: &Arc<Self>, log: &CallLog) {
        if !self.config.enabled || !log.status.is_missed() {
            return;
        }
        let this = Arc::clone(self);
        let log = log.clone();
        tokio::spawn(async move {
            match this.missed_call(&log).await {
                Ok(Some(notification)) => this.dispatch(&notification).await,
                Ok(None) => debug!("Missed call {} has nobody to notify", log.session_id),
                Err(e) => error!("Failed to build missed-call notification for {}: {}", log.session_id, e),
            }
        });
    }

    /// React to a caller rejected because `group`'s queue is full.
    pub fn on_queue_full(self: &Arc<Self>, group: &Group) {
        if !self.config.enabled || !self.cooldown_elapsed(group.id, NotificationKind::QueueOverflow, Utc::now()) {
            return;
        }
        let this = Arc::clone(self);
        let group = group.clone();
        tokio::spawn(async move {
            match this.queue_overflow(&group, group.max_queue_size, true).await {
                Ok(notification) => this.dispatch(&notification).await,
                Err(e) => error!("Failed to build overflow notification for group {}: {}", group.name, e),
            }
        });
    }

    /// Build the missed-call alert for `log`, `None` when nobody is
    /// responsible for the extension or group it was routed to.
    pub async fn missed_call(&self, log: &CallLog) -> Result<Option<Notification>> {
        let mut recipients = Vec::new();
        if let Some(number_id) = log.routed_to_number {
            if let Some(owner) = self.db.number_owner(number_id).await? {
                if owner.active {
                    recipients.push(Recipient::from_user(&owner, RecipientRole::ExtensionOwner));
                }
            }
        }
        if let Some(group_id) = log.routed_to_group {
            recipients.extend(self.managers(group_id).await?);
        }
        if recipients.is_empty() {
            return Ok(None);
        }

        let notification = Notification::new(
            NotificationKind::MissedCall,
            Severity::Info,
            format!("Missed call from {} to {}", log.caller_id, log.called_number),
        )
        .with_recipients(recipients)
        .with_payload(json!({
            "session_id": log.session_id,
            "caller_id": log.caller_id,
            "called_number": log.called_number,
            "status": log.status.as_str(),
            "routed_to_number": log.routed_to_number,
            "routed_to_group": log.routed_to_group,
            "start_time": log.start_time,
        }));
        Ok(Some(notification))
    }

    async fn queue_overflow(&self, group: &Group, waiting: u32, rejected: bool) -> Result<Notification> {
        let mut recipients = self.managers(group.id).await?;
        recipients.extend(self.admins().await?);
        let subject = if rejected {
            format!("Queue for {} is full, callers are being turned away", group.name)
        } else {
            format!("Queue for {} is nearly full ({}/{})", group.name, waiting, group.max_queue_size)
        };
        Ok(Notification::new(NotificationKind::QueueOverflow, Severity::Warning, subject)
            .with_recipients(recipients)
            .with_payload(json!({
                "group_id": group.id,
                "group_name": group.name,
                "waiting": waiting,
                "max_queue_size": group.max_queue_size,
                "rejected": rejected,
            })))
    }

    /// Periodic queue-health pass over every active group. Returns the
    /// notifications that were dispatched.
    pub async fn check_queue_health(&self, now: DateTime<Utc>) -> Result<Vec<Notification>> {
        if !self.config.enabled {
            return Ok(Vec::new());
        }

        let mut sent = Vec::new();
        let mut still_waiting = HashSet::new();
        let long_wait = i64::from(self.queue_config.long_wait_threshold_secs);

        for group in self.db.active_groups().await? {
            let entries = self.db.waiting_entries(group.id).await?;
            let waiting = u32::try_from(entries.len()).unwrap_or(u32::MAX);

            if group.max_queue_size > 0
                && f64::from(waiting) >= self.queue_config.overflow_alert_ratio * f64::from(group.max_queue_size)
                && self.cooldown_elapsed(group.id, NotificationKind::QueueOverflow, now)
            {
                sent.push(self.queue_overflow(&group, waiting, false).await?);
            }

            let total = self.db.group_members(group.id).await?.len();
            if total > 0 {
                let available = self.distributor.available_members(group.id, &HashSet::new()).await?;
                if available.is_empty() && self.cooldown_elapsed(group.id, NotificationKind::AgentsUnavailable, now) {
                    sent.push(
                        Notification::new(
                            NotificationKind::AgentsUnavailable,
                            Severity::Critical,
                            format!("No members of {} are available", group.name),
                        )
                        .with_recipients(self.admins().await?)
                        .with_payload(json!({
                            "group_id": group.id,
                            "group_name": group.name,
                            "members": total,
                            "waiting": waiting,
                        })),
                    );
                }
            }

            for entry in &entries {
                still_waiting.insert(entry.id);
                let waited = entry.wait_secs(now);
                if waited < long_wait || !self.long_wait_alerted.insert(entry.id) {
                    continue;
                }
                sent.push(
                    Notification::new(
                        NotificationKind::LongWait,
                        Severity::Warning,
                        format!("Caller {} has waited {}s in {}", entry.caller_id, waited, group.name),
                    )
                    .with_recipients(self.managers(group.id).await?)
                    .with_payload(json!({
                        "group_id": group.id,
                        "queue_entry_id": entry.id,
                        "session_id": entry.session_id,
                        "caller_id": entry.caller_id,
                        "position": entry.position,
                        "waited_secs": waited,
                    })),
                );
            }
        }

        self.long_wait_alerted.retain(|id| still_waiting.contains(id));

        for notification in &sent {
            self.dispatch(notification).await;
        }
        Ok(sent)
    }

    /// Deliver a notification built elsewhere (health, daily report) to
    /// the administrators.
    pub async fn notify_admins(&self, notification: Notification) -> Result<Notification> {
        let notification = notification.with_recipients(self.admins().await?);
        if self.config.enabled {
            self.dispatch(&notification).await;
        }
        Ok(notification)
    }

    async fn dispatch(&self, notification: &Notification) {
        if let Err(e) = self.notifier.notify(notification).await {
            warn!("Notification {} ({}) was not fully delivered: {}", notification.id, notification.kind, e);
        }
    }

    /// Claims the alert slot for (group, kind) when the cooldown has passed.
    fn cooldown_elapsed(&self, group_id: GroupId, kind: NotificationKind, now: DateTime<Utc>) -> bool {
        let cooldown = Duration::seconds(self.config.alert_cooldown_secs.min(MAX_COOLDOWN_SECS) as i64);
        match self.last_alert.entry((group_id, kind)) {
            Entry::Occupied(mut last) => {
                if now - *last.get() < cooldown {
                    return false;
                }
                last.insert(now);
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    async fn managers(&self, group_id: GroupId) -> Result<Vec<Recipient>> {
        Ok(self
            .db
            .group_managers(group_id)
            .await?
            .iter()
            .map(|u| Recipient::from_user(u, RecipientRole::GroupManager))
            .collect())
    }

    async fn admins(&self) -> Result<Vec<Recipient>> {
        Ok(self
            .db
            .admin_users()
            .await?
            .iter()
            .map(|u| Recipient::from_user(u, RecipientRole::Administrator))
            .collect())
    }
}
