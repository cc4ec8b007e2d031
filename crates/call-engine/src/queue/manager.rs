//! # Queue Manager Implementation
//!
//! Per-group FIFO queues persisted in `queue_entries`. Every operation that
//! changes a group's waiting set (admit, drain, release) holds that group's
//! lock for its whole duration, which keeps positions contiguous and the
//! queue bound exact under concurrent callers.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::database::DatabaseManager;
use crate::directory::{Group, GroupId, NumberId, QueueEntry, QueueStatus};
use crate::distribution::{GroupDistributor, MemberSelection};
use crate::error::{CallEngineError, Result};

/// What a drain pass did to one waiting entry
#[derive(Debug, Clone, PartialEq)]
pub enum DrainAction {
    /// The entry waited longer than the group's `queue_timeout`.
    TimedOut { entry: QueueEntry, waited_secs: i64 },
    /// A member freed up; the entry is now `connecting`.
    Connect { entry: QueueEntry, selection: MemberSelection },
}

impl DrainAction {
    pub fn entry(&self) -> &QueueEntry {
        match self {
            Self::TimedOut { entry, .. } | Self::Connect { entry, .. } => entry,
        }
    }
}

/// Read-only view of one group's waiting callers
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub group_id: GroupId,
    pub group_name: String,
    pub max_queue_size: u32,
    pub waiting: Vec<QueueEntry>,
}

/// Live queue figures for one group
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStats {
    pub group_id: GroupId,
    pub waiting: u32,
    pub max_queue_size: u32,
    pub average_wait_secs: i64,
    pub longest_wait_secs: i64,
}

impl QueueStats {
    /// Fraction of the queue bound in use; a zero-size queue counts as full.
    pub fn fill_ratio(&self) -> f64 {
        if self.max_queue_size == 0 {
            return 1.0;
        }
        f64::from(self.waiting) / f64::from(self.max_queue_size)
    }
}

/// # Group Queue Manager
///
/// Admits callers when a group has no free member, hands waiting callers to
/// members as they free up, and times out callers that waited too long.
///
/// ## Examples
///
/// ```rust,ignore
/// let entry = queue.admit(&group, "+15550100", "5000", "call-1").await?;
/// println!("position {} (about {}s)", entry.position, entry.estimated_wait_secs);
///
/// for action in queue.drain(&group).await? {
///     // connect or abandon the linked call
/// }
/// ```
pub struct QueueManager {
    db: DatabaseManager,
    distributor: Arc<GroupDistributor>,
    config: QueueConfig,
    group_locks: DashMap<GroupId, Arc<Mutex<()>>>,
}

impl QueueManager {
    pub fn new(db: DatabaseManager, distributor: Arc<GroupDistributor>, config: QueueConfig) -> Self {
        Self {
            db,
            distributor,
            config,
            group_locks: DashMap::new(),
        }
    }

    async fn lock_group(&self, group_id: GroupId) -> OwnedMutexGuard<()> {
        let lock = self
            .group_locks
            .entry(group_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Admit a caller to the back of `group`'s queue.
    ///
    /// Fails with [`CallEngineError::QueueFull`] when `max_queue_size`
    /// callers are already waiting; nothing is written in that case.
    pub async fn admit(&self, group: &Group, caller_id: &str, called_number: &str, session_id: &str) -> Result<QueueEntry> {
        self.admit_at(group, caller_id, called_number, session_id, Utc::now()).await
    }

    pub async fn admit_at(
        &self,
        group: &Group,
        caller_id: &str,
        called_number: &str,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<QueueEntry> {
        let _guard = self.lock_group(group.id).await;

        let waiting = self.db.waiting_count(group.id).await?;
        if waiting >= group.max_queue_size {
            warn!(
                "🚫 Queue for group {} is full ({}/{}), rejecting {}",
                group.name, waiting, group.max_queue_size, session_id
            );
            return Err(CallEngineError::QueueFull {
                group_id: group.id,
                max_size: group.max_queue_size,
            });
        }

        let position = waiting + 1;
        let estimate = self.estimate_wait(group.id, position, now).await?;
        let entry = self
            .db
            .insert_queue_entry(group.id, caller_id, called_number, session_id, position, now, estimate)
            .await?;

        info!(
            "📋 Queued {} in group {} at position {} (estimated wait {}s)",
            session_id, group.name, position, estimate
        );
        Ok(entry)
    }

    /// `position` × mean answered talk time of the group over the history
    /// window, falling back to the configured default without history.
    pub async fn estimate_wait(&self, group_id: GroupId, position: u32, now: DateTime<Utc>) -> Result<u32> {
        let since = now - Duration::days(i64::from(self.config.history_window_days));
        let average = self
            .db
            .average_answered_duration(group_id, since)
            .await?
            .filter(|avg| *avg > 0.0)
            .unwrap_or(f64::from(self.config.default_average_call_duration_secs));
        let estimate = (f64::from(position) * average).round();
        Ok(if estimate >= f64::from(u32::MAX) { u32::MAX } else { estimate as u32 })
    }

    /// Process `group`'s waiting callers oldest first.
    pub async fn drain(&self, group: &Group) -> Result<Vec<DrainAction>> {
        self.drain_at(group, Utc::now()).await
    }

    /// Entries past `queue_timeout` are timed out; the others are handed to
    /// free members until none remain. A member is handed at most one entry
    /// per pass.
    pub async fn drain_at(&self, group: &Group, now: DateTime<Utc>) -> Result<Vec<DrainAction>> {
        let _guard = self.lock_group(group.id).await;

        let entries = self.db.waiting_entries(group.id).await?;
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut actions = Vec::new();
        let mut assigned: HashSet<NumberId> = HashSet::new();
        let mut members_exhausted = !group.active;

        for mut entry in entries {
            let waited = entry.wait_secs(now);
            if waited > i64::from(group.queue_timeout) {
                self.db.set_queue_entry_status(entry.id, QueueStatus::Timeout, now).await?;
                entry.status = QueueStatus::Timeout;
                entry.left_at = Some(now);
                info!("⏰ Queue entry {} ({}) timed out after {}s", entry.id, entry.session_id, waited);
                actions.push(DrainAction::TimedOut { entry, waited_secs: waited });
                continue;
            }

            if members_exhausted {
                continue;
            }

            let selection = self.distributor.next_member(group, &assigned).await?;
            if selection.is_none() {
                members_exhausted = true;
                continue;
            }

            self.db.set_queue_entry_status(entry.id, QueueStatus::Connecting, now).await?;
            entry.status = QueueStatus::Connecting;
            entry.left_at = Some(now);
            assigned.extend(selection.number_ids());
            debug!("Queue entry {} ({}) connecting", entry.id, entry.session_id);
            actions.push(DrainAction::Connect { entry, selection });
        }

        if !actions.is_empty() {
            self.db.recompute_queue_positions(group.id).await?;
        }
        Ok(actions)
    }

    /// Take an entry out of the queue with a terminal status.
    ///
    /// Releasing an entry that is already terminal returns it unchanged.
    pub async fn release(&self, entry_id: i64, final_status: QueueStatus) -> Result<QueueEntry> {
        if !final_status.is_terminal() {
            return Err(CallEngineError::validation(format!(
                "cannot release a queue entry as {}",
                final_status.as_str()
            )));
        }

        let entry = self
            .db
            .get_queue_entry(entry_id)
            .await?
            .ok_or_else(|| CallEngineError::not_found(format!("queue entry {entry_id}")))?;

        let _guard = self.lock_group(entry.group_id).await;
        // Re-read under the lock; a drain may have moved it meanwhile.
        let entry = self
            .db
            .get_queue_entry(entry_id)
            .await?
            .ok_or_else(|| CallEngineError::not_found(format!("queue entry {entry_id}")))?;
        if entry.status.is_terminal() {
            debug!("Queue entry {} already {}", entry_id, entry.status.as_str());
            return Ok(entry);
        }

        self.db.set_queue_entry_status(entry_id, final_status, Utc::now()).await?;
        if entry.status == QueueStatus::Waiting {
            self.db.recompute_queue_positions(entry.group_id).await?;
        }
        info!("📤 Queue entry {} ({}) released as {}", entry_id, entry.session_id, final_status.as_str());

        self.db
            .get_queue_entry(entry_id)
            .await?
            .ok_or_else(|| CallEngineError::not_found(format!("queue entry {entry_id}")))
    }

    /// Release whatever open entry `session_id` has, if any.
    pub async fn release_session(&self, session_id: &str, final_status: QueueStatus) -> Result<Option<QueueEntry>> {
        match self.db.open_queue_entry_for_session(session_id).await? {
            Some(entry) => self.release(entry.id, final_status).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn snapshot(&self, group: &Group) -> Result<QueueSnapshot> {
        Ok(QueueSnapshot {
            group_id: group.id,
            group_name: group.name.clone(),
            max_queue_size: group.max_queue_size,
            waiting: self.db.waiting_entries(group.id).await?,
        })
    }

    pub async fn stats(&self, group: &Group) -> Result<QueueStats> {
        self.stats_at(group, Utc::now()).await
    }

    pub async fn stats_at(&self, group: &Group, now: DateTime<Utc>) -> Result<QueueStats> {
        let entries = self.db.waiting_entries(group.id).await?;
        let waits: Vec<i64> = entries.iter().map(|e| e.wait_secs(now)).collect();
        let total: i64 = waits.iter().sum();
        Ok(QueueStats {
            group_id: group.id,
            waiting: u32::try_from(entries.len()).unwrap_or(u32::MAX),
            max_queue_size: group.max_queue_size,
            average_wait_secs: if waits.is_empty() { 0 } else { total / waits.len() as i64 },
            longest_wait_secs: waits.iter().copied().max().unwrap_or(0),
        })
    }

    /// Renumber every group's waiting entries by arrival. A no-op when
    /// positions are already contiguous.
    pub async fn reoptimize_positions(&self) -> Result<usize> {
        let groups = self.db.groups_with_waiting_calls().await?;
        for group_id in &groups {
            let _guard = self.lock_group(*group_id).await;
            self.db.recompute_queue_positions(*group_id).await?;
        }
        Ok(groups.len())
    }

    /// Purge terminal entries older than the retention window.
    pub async fn cleanup(&self, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = now - Duration::hours(i64::from(self.config.cleanup_retention_hours));
        let purged = self.db.purge_terminal_queue_entries(cutoff).await?;
        if purged > 0 {
            info!("🧹 Purged {} finished queue entries", purged);
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::DistributionStrategy;
    use crate::distribution::MemberAvailability;
    use crate::test_support::{Extension, Fixture};

    struct Harness {
        fx: Fixture,
        availability: Arc<MemberAvailability>,
        queue: QueueManager,
    }

    async fn harness() -> Harness {
        let fx = Fixture::new().await;
        let availability = Arc::new(MemberAvailability::new());
        let distributor = Arc::new(GroupDistributor::new(fx.db.clone(), availability.clone()));
        let queue = QueueManager::new(fx.db.clone(), distributor, QueueConfig::default());
        Harness { fx, availability, queue }
    }

    fn busy_all(h: &Harness, members: &[&Extension]) {
        for m in members {
            h.availability.mark_busy(m.number.id);
        }
    }

    #[tokio::test]
    async fn test_admit_respects_bound_and_positions() {
        let h = harness().await;
        let group = h.fx.group("Sales", DistributionStrategy::RoundRobin, &[], 2, 300).await;

        let first = h.queue.admit(&group, "+1555", "5000", "s1").await.unwrap();
        let second = h.queue.admit(&group, "+1556", "5000", "s2").await.unwrap();
        assert_eq!((first.position, second.position), (1, 2));
        assert_eq!(first.estimated_wait_secs, 180);
        assert_eq!(second.estimated_wait_secs, 360);

        let full = h.queue.admit(&group, "+1557", "5000", "s3").await;
        assert!(matches!(full, Err(CallEngineError::QueueFull { max_size: 2, .. })));
        assert_eq!(h.fx.db.waiting_count(group.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_zero_size_queue_always_full() {
        let h = harness().await;
        let group = h.fx.group("NoQueue", DistributionStrategy::RoundRobin, &[], 0, 300).await;
        assert!(matches!(
            h.queue.admit(&group, "a", "b", "s").await,
            Err(CallEngineError::QueueFull { .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_admits_never_exceed_bound() {
        let h = Arc::new(harness().await);
        let group = h.fx.group("Rush", DistributionStrategy::RoundRobin, &[], 3, 300).await;

        let mut handles = Vec::new();
        for i in 0..10 {
            let h = h.clone();
            let group = group.clone();
            handles.push(tokio::spawn(async move {
                h.queue.admit(&group, "caller", "5000", &format!("s{i}")).await.is_ok()
            }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 3);

        let positions: Vec<u32> = h.fx.db.waiting_entries(group.id).await.unwrap().iter().map(|e| e.position).collect();
        assert_eq!(positions, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_release_recompacts_positions() {
        let h = harness().await;
        let group = h.fx.group("Sales", DistributionStrategy::RoundRobin, &[], 5, 300).await;
        let mut ids = Vec::new();
        for i in 0..3 {
            ids.push(h.queue.admit(&group, "c", "5000", &format!("s{i}")).await.unwrap().id);
        }

        let released = h.queue.release(ids[0], QueueStatus::Abandoned).await.unwrap();
        assert_eq!(released.status, QueueStatus::Abandoned);
        assert!(released.left_at.is_some());

        let waiting = h.fx.db.waiting_entries(group.id).await.unwrap();
        assert_eq!(waiting.iter().map(|e| (e.id, e.position)).collect::<Vec<_>>(), vec![(ids[1], 1), (ids[2], 2)]);

        // Idempotent on terminal entries; waiting is not a release status.
        let again = h.queue.release(ids[0], QueueStatus::Timeout).await.unwrap();
        assert_eq!(again.status, QueueStatus::Abandoned);
        assert!(h.queue.release(ids[1], QueueStatus::Waiting).await.is_err());
        assert!(matches!(h.queue.release(9999, QueueStatus::Abandoned).await, Err(CallEngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_drain_connects_oldest_first_and_times_out() {
        let h = harness().await;
        let a = h.fx.extension("alice").await;
        let b = h.fx.extension("bob").await;
        let group = h.fx.group("Support", DistributionStrategy::Priority, &[&a, &b], 5, 60).await;
        busy_all(&h, &[&a, &b]);

        let start = Utc::now();
        let old = h.queue.admit_at(&group, "c0", "5000", "old", start - Duration::seconds(120)).await.unwrap();
        let first = h.queue.admit_at(&group, "c1", "5000", "first", start - Duration::seconds(30)).await.unwrap();
        let second = h.queue.admit_at(&group, "c2", "5000", "second", start - Duration::seconds(20)).await.unwrap();
        let third = h.queue.admit_at(&group, "c3", "5000", "third", start - Duration::seconds(10)).await.unwrap();

        // Nobody free: only the stale entry changes.
        let actions = h.queue.drain_at(&group, start).await.unwrap();
        assert_eq!(actions.len(), 1);
        assert!(matches!(&actions[0], DrainAction::TimedOut { entry, .. } if entry.id == old.id));

        h.availability.mark_free(a.number.id);
        h.availability.mark_free(b.number.id);
        let actions = h.queue.drain_at(&group, start).await.unwrap();
        let connected: Vec<(i64, Vec<NumberId>)> = actions
            .iter()
            .map(|a| match a {
                DrainAction::Connect { entry, selection } => (entry.id, selection.number_ids()),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(connected, vec![(first.id, vec![a.number.id]), (second.id, vec![b.number.id])]);

        let remaining = h.fx.db.waiting_entries(group.id).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!((remaining[0].id, remaining[0].position), (third.id, 1));
    }

    #[tokio::test]
    async fn test_cleanup_purges_old_terminal_entries() {
        let h = harness().await;
        let group = h.fx.group("Sales", DistributionStrategy::RoundRobin, &[], 5, 300).await;
        let entry = h.queue.admit(&group, "c", "5000", "s").await.unwrap();
        h.queue.release(entry.id, QueueStatus::Abandoned).await.unwrap();
        h.queue.admit(&group, "c", "5000", "still-waiting").await.unwrap();

        assert_eq!(h.queue.cleanup(Utc::now()).await.unwrap(), 0);
        assert_eq!(h.queue.cleanup(Utc::now() + Duration::hours(25)).await.unwrap(), 1);
        assert_eq!(h.fx.db.waiting_count(group.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stats() {
        let h = harness().await;
        let group = h.fx.group("Sales", DistributionStrategy::RoundRobin, &[], 4, 300).await;
        let now = Utc::now();
        h.queue.admit_at(&group, "c", "5000", "a", now - Duration::seconds(40)).await.unwrap();
        h.queue.admit_at(&group, "c", "5000", "b", now - Duration::seconds(20)).await.unwrap();

        let stats = h.queue.stats_at(&group, now).await.unwrap();
        assert_eq!(stats.waiting, 2);
        assert_eq!(stats.average_wait_secs, 30);
        assert_eq!(stats.longest_wait_secs, 40);
        assert!((stats.fill_ratio() - 0.5).abs() < f64::EPSILON);
    }
}
