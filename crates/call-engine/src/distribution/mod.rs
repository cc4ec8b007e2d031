//! # Group Distribution
//!
//! Picks which member of a hunt group receives the next call. A member is
//! *available* when its extension is active, bound to an active user with an
//! active account, not marked busy in [`MemberAvailability`] and not in the
//! caller's exclusion set.
//!
//! | Strategy       | Picks                                                    |
//! |----------------|----------------------------------------------------------|
//! | `round_robin`  | next available member after the persisted cursor         |
//! | `random`       | uniformly among available members                        |
//! | `priority`     | first available member in membership order               |
//! | `all_ring`     | every available member at once                           |
//! | `least_recent` | oldest last answered call; never-answered members first  |
//!
//! The round-robin cursor is the membership position of the last member
//! handed out. It lives in the `group_cursors` table and only advances when
//! a member is actually returned, so retries against an empty group do not
//! skew the rotation.

pub mod availability;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::seq::SliceRandom;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::database::DatabaseManager;
use crate::directory::{DistributionStrategy, Group, GroupId, GroupMember, NumberId};
use crate::error::Result;

pub use availability::MemberAvailability;

/// Outcome of asking a group for a member
#[derive(Debug, Clone, PartialEq)]
pub enum MemberSelection {
    Member(GroupMember),
    /// `all_ring`: every available member, in membership order.
    RingAll(Vec<GroupMember>),
    NoneAvailable,
}

impl MemberSelection {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::NoneAvailable)
    }

    /// Extensions this selection hands a call to.
    pub fn number_ids(&self) -> Vec<NumberId> {
        match self {
            Self::Member(member) => vec![member.number.id],
            Self::RingAll(members) => members.iter().map(|m| m.number.id).collect(),
            Self::NoneAvailable => Vec::new(),
        }
    }
}

/// Apply `strategy` to candidates already filtered for availability and
/// sorted by membership position.
pub fn select_member(
    strategy: DistributionStrategy,
    candidates: &[GroupMember],
    cursor: Option<i64>,
    last_answered: &HashMap<NumberId, DateTime<Utc>>,
) -> MemberSelection {
    if candidates.is_empty() {
        return MemberSelection::NoneAvailable;
    }

    let picked = match strategy {
        DistributionStrategy::AllRing => return MemberSelection::RingAll(candidates.to_vec()),
        DistributionStrategy::Priority => candidates.first(),
        DistributionStrategy::RoundRobin => {
            let after_cursor = cursor.and_then(|last| candidates.iter().find(|m| m.position > last));
            after_cursor.or_else(|| candidates.first())
        }
        DistributionStrategy::Random => candidates.choose(&mut rand::thread_rng()),
        DistributionStrategy::LeastRecent => candidates
            .iter()
            .min_by_key(|m| (last_answered.get(&m.number.id).copied(), m.position)),
    };

    picked
        .cloned()
        .map_or(MemberSelection::NoneAvailable, MemberSelection::Member)
}

/// Hunt-group distributor backed by the directory store
pub struct GroupDistributor {
    db: DatabaseManager,
    availability: Arc<MemberAvailability>,
    cursor_locks: DashMap<GroupId, Arc<Mutex<()>>>,
}

impl GroupDistributor {
    pub fn new(db: DatabaseManager, availability: Arc<MemberAvailability>) -> Self {
        Self {
            db,
            availability,
            cursor_locks: DashMap::new(),
        }
    }

    pub fn availability(&self) -> &Arc<MemberAvailability> {
        &self.availability
    }

    /// Available members of `group_id` minus `exclude`, in membership order.
    pub async fn available_members(&self, group_id: GroupId, exclude: &HashSet<NumberId>) -> Result<Vec<GroupMember>> {
        let members = self.db.available_group_members(group_id).await?;
        Ok(members
            .into_iter()
            .filter(|m| !exclude.contains(&m.number.id) && !self.availability.is_busy(m.number.id))
            .collect())
    }

    /// Choose the member(s) that should receive the next call for `group`.
    ///
    /// Selections for the same group are serialized so concurrent calls see
    /// and advance the round-robin cursor one at a time.
    pub async fn next_member(&self, group: &Group, exclude: &HashSet<NumberId>) -> Result<MemberSelection> {
        let lock = self
            .cursor_locks
            .entry(group.id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let candidates = self.available_members(group.id, exclude).await?;
        if candidates.is_empty() {
            debug!("No available members in group {} ({})", group.id, group.name);
            return Ok(MemberSelection::NoneAvailable);
        }

        let cursor = match group.strategy {
            DistributionStrategy::RoundRobin => self.db.group_cursor(group.id).await?,
            _ => None,
        };
        let last_answered = match group.strategy {
            DistributionStrategy::LeastRecent => {
                let ids: Vec<NumberId> = candidates.iter().map(|m| m.number.id).collect();
                self.db.last_answered_times(&ids).await?
            }
            _ => HashMap::new(),
        };

        let selection = select_member(group.strategy, &candidates, cursor, &last_answered);

        if let (DistributionStrategy::RoundRobin, MemberSelection::Member(member)) = (group.strategy, &selection) {
            self.db.set_group_cursor(group.id, member.position).await?;
        }

        match &selection {
            MemberSelection::Member(member) => info!(
                "🎯 Group {} ({}) -> extension {} [{}]",
                group.name, group.strategy, member.number.number, member.sip_uri
            ),
            MemberSelection::RingAll(members) => info!(
                "🔔 Group {} ringing {} members",
                group.name,
                members.len()
            ),
            MemberSelection::NoneAvailable => {}
        }
        Ok(selection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::InternalNumber;
    use crate::test_support::Fixture;
    use chrono::Duration;

    fn member(id: i64, position: i64) -> GroupMember {
        GroupMember {
            position,
            number: InternalNumber {
                id,
                server_id: 1,
                number: format!("{}", 1000 + id),
                user_id: Some(id),
                password: String::new(),
                display_name: String::new(),
                active: true,
                auto_generated: true,
            },
            sip_uri: format!("sip:{}@pbx.test", 1000 + id),
        }
    }

    fn picked(selection: MemberSelection) -> i64 {
        match selection {
            MemberSelection::Member(m) => m.number.id,
            other => panic!("expected a single member, got {other:?}"),
        }
    }

    #[test]
    fn test_round_robin_follows_cursor_and_wraps() {
        let members = vec![member(1, 1), member(2, 2), member(3, 3)];
        let none = HashMap::new();
        assert_eq!(picked(select_member(DistributionStrategy::RoundRobin, &members, None, &none)), 1);
        assert_eq!(picked(select_member(DistributionStrategy::RoundRobin, &members, Some(1), &none)), 2);
        assert_eq!(picked(select_member(DistributionStrategy::RoundRobin, &members, Some(3), &none)), 1);

        // Cursor on a member that has since gone unavailable.
        let without_two = vec![member(1, 1), member(3, 3)];
        assert_eq!(picked(select_member(DistributionStrategy::RoundRobin, &without_two, Some(2), &none)), 3);
    }

    #[test]
    fn test_priority_and_all_ring() {
        let members = vec![member(4, 1), member(5, 2)];
        let none = HashMap::new();
        assert_eq!(picked(select_member(DistributionStrategy::Priority, &members, Some(1), &none)), 4);
        match select_member(DistributionStrategy::AllRing, &members, None, &none) {
            MemberSelection::RingAll(all) => assert_eq!(all.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
        assert!(select_member(DistributionStrategy::AllRing, &[], None, &none).is_none());
    }

    #[test]
    fn test_least_recent_prefers_never_answered() {
        let members = vec![member(1, 1), member(2, 2), member(3, 3)];
        let now = Utc::now();
        let mut last = HashMap::new();
        last.insert(1, now - Duration::minutes(5));
        last.insert(2, now - Duration::minutes(50));
        assert_eq!(picked(select_member(DistributionStrategy::LeastRecent, &members, None, &last)), 3);

        last.insert(3, now);
        assert_eq!(picked(select_member(DistributionStrategy::LeastRecent, &members, None, &last)), 2);
    }

    #[test]
    fn test_random_stays_within_candidates() {
        let members = vec![member(7, 1), member(8, 2)];
        for _ in 0..20 {
            let id = picked(select_member(DistributionStrategy::Random, &members, None, &HashMap::new()));
            assert!(id == 7 || id == 8);
        }
    }

    #[tokio::test]
    async fn test_round_robin_is_fair_and_persisted() {
        let fx = Fixture::new().await;
        let a = fx.extension("alice").await;
        let b = fx.extension("bob").await;
        let c = fx.extension("carol").await;
        let group = fx.group("Sales", DistributionStrategy::RoundRobin, &[&a, &b, &c], 5, 300).await;

        let availability = Arc::new(MemberAvailability::new());
        let distributor = GroupDistributor::new(fx.db.clone(), availability.clone());

        let mut counts: HashMap<NumberId, usize> = HashMap::new();
        for _ in 0..6 {
            let id = picked(distributor.next_member(&group, &HashSet::new()).await.unwrap());
            *counts.entry(id).or_default() += 1;
        }
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&n| n == 2));

        // A fresh distributor continues from the stored cursor.
        let restarted = GroupDistributor::new(fx.db.clone(), availability);
        assert_eq!(picked(restarted.next_member(&group, &HashSet::new()).await.unwrap()), a.number.id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_round_robin_hands_out_each_member_evenly() {
        const ROUNDS: usize = 8;
        let fx = Fixture::new().await;
        let a = fx.extension("alice").await;
        let b = fx.extension("bob").await;
        let c = fx.extension("carol").await;
        let group = Arc::new(fx.group("Sales", DistributionStrategy::RoundRobin, &[&a, &b, &c], 5, 300).await);
        let distributor = Arc::new(GroupDistributor::new(fx.db.clone(), Arc::new(MemberAvailability::new())));

        let mut tasks = Vec::new();
        for _ in 0..ROUNDS * 3 {
            let distributor = distributor.clone();
            let group = group.clone();
            tasks.push(tokio::spawn(async move {
                distributor.next_member(&group, &HashSet::new()).await
            }));
        }

        let mut counts: HashMap<NumberId, usize> = HashMap::new();
        for task in tasks {
            let id = picked(task.await.unwrap().unwrap());
            *counts.entry(id).or_default() += 1;
        }
        assert_eq!(counts.len(), 3);
        for ext in [&a, &b, &c] {
            assert_eq!(counts[&ext.number.id], ROUNDS);
        }
    }

    #[tokio::test]
    async fn test_busy_and_excluded_members_skipped() {
        let fx = Fixture::new().await;
        let a = fx.extension("alice").await;
        let b = fx.extension("bob").await;
        let group = fx.group("Support", DistributionStrategy::Priority, &[&a, &b], 5, 300).await;

        let availability = Arc::new(MemberAvailability::new());
        let distributor = GroupDistributor::new(fx.db.clone(), availability.clone());

        availability.mark_busy(a.number.id);
        assert_eq!(picked(distributor.next_member(&group, &HashSet::new()).await.unwrap()), b.number.id);

        let exclude: HashSet<NumberId> = [b.number.id].into_iter().collect();
        assert!(distributor.next_member(&group, &exclude).await.unwrap().is_none());

        availability.mark_free(a.number.id);
        assert_eq!(picked(distributor.next_member(&group, &exclude).await.unwrap()), a.number.id);
    }

    #[tokio::test]
    async fn test_empty_group_leaves_cursor_untouched() {
        let fx = Fixture::new().await;
        let group = fx.group("Empty", DistributionStrategy::RoundRobin, &[], 5, 300).await;
        let distributor = GroupDistributor::new(fx.db.clone(), Arc::new(MemberAvailability::new()));

        assert!(distributor.next_member(&group, &HashSet::new()).await.unwrap().is_none());
        assert_eq!(fx.db.group_cursor(group.id).await.unwrap(), None);
    }
}
