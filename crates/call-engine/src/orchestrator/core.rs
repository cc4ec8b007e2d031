//! Call router implementation.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::lifecycle::{apply_update, derive_timings};
use super::types::{
    DirectiveAction, InboundCallEvent, RingTarget, RouteTargetType, RoutingDirective, StatusOutcome,
    StatusReport, StatusUpdate,
};
use crate::config::CallEngineConfig;
use crate::database::{DatabaseManager, NewCallLog, StatsFilter};
use crate::directory::{
    Account, CallDirection, CallLog, CallStatus, Group, GroupId, NumberId, QueueEntry, QueueStatus, RuleAction,
};
use crate::distribution::{GroupDistributor, MemberAvailability, MemberSelection};
use crate::error::{CallEngineError, Result};
use crate::monitoring::{
    CallStatistics, DailyReport, GroupStatistics, HealthChecker, MemberStatistics, Notification, NotificationKind,
    NotificationTrigger, Notifier, Severity, StatisticsService, SystemHealthReport,
};
use crate::queue::{DrainAction, QueueManager, QueueSnapshot};
use crate::routing::RuleMatcher;

/// # Call Router
///
/// Entry point for the signaling layer. Every inbound call gets a call
/// record and a [`RoutingDirective`]; every status report is merged into
/// that record.
///
/// Status updates for the same session are serialized; different sessions
/// proceed in parallel. Queue operations are serialized per group by the
/// [`QueueManager`].
///
/// ## Examples
///
/// ```rust,ignore
/// let router = CallRouter::new(db, CallEngineConfig::default(), Arc::new(LogNotifier));
///
/// let directive = router
///     .handle_inbound_call(InboundCallEvent::new("+15551230000", "100"))
///     .await?;
/// println!("{} -> {}", directive.session_id, directive.action.name());
///
/// router
///     .update_status(&directive.session_id, StatusUpdate::new(CallStatus::Answered))
///     .await?;
/// ```
pub struct CallRouter {
    db: DatabaseManager,
    config: CallEngineConfig,
    matcher: RuleMatcher,
    availability: Arc<MemberAvailability>,
    distributor: Arc<GroupDistributor>,
    queue: Arc<QueueManager>,
    trigger: Arc<NotificationTrigger>,
    statistics: StatisticsService,
    health: HealthChecker,
    session_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CallRouter {
    pub fn new(db: DatabaseManager, config: CallEngineConfig, notifier: Arc<dyn Notifier>) -> Self {
        let availability = Arc::new(MemberAvailability::new());
        let distributor = Arc::new(GroupDistributor::new(db.clone(), availability.clone()));
        let queue = Arc::new(QueueManager::new(db.clone(), distributor.clone(), config.queues.clone()));
        let trigger = Arc::new(NotificationTrigger::new(
            db.clone(),
            notifier,
            distributor.clone(),
            config.notifications.clone(),
            config.queues.clone(),
        ));

        Self {
            statistics: StatisticsService::new(db.clone()),
            health: HealthChecker::new(db.clone(), config.monitoring.clone()),
            matcher: RuleMatcher::new(),
            session_locks: DashMap::new(),
            db,
            config,
            availability,
            distributor,
            queue,
            trigger,
        }
    }

    pub fn database(&self) -> &DatabaseManager {
        &self.db
    }

    pub fn config(&self) -> &CallEngineConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<QueueManager> {
        &self.queue
    }

    pub fn distributor(&self) -> &Arc<GroupDistributor> {
        &self.distributor
    }

    pub fn availability(&self) -> &Arc<MemberAvailability> {
        &self.availability
    }

    pub fn trigger(&self) -> &Arc<NotificationTrigger> {
        &self.trigger
    }

    pub fn statistics(&self) -> &StatisticsService {
        &self.statistics
    }

    async fn lock_session(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .session_locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop per-session locks nobody holds. Returns how many remain.
    pub fn prune_session_locks(&self) -> usize {
        self.session_locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        self.session_locks.len()
    }

    fn local_time(&self, at: DateTime<Utc>) -> NaiveDateTime {
        at.naive_utc() + Duration::minutes(i64::from(self.config.general.utc_offset_minutes))
    }

    // ---- inbound -----------------------------------------------------------

    /// Create the call record for a new inbound call and decide where the
    /// call goes.
    ///
    /// A reused session id fails with [`CallEngineError::AlreadyExists`] and
    /// leaves the existing record untouched.
    pub async fn handle_inbound_call(&self, mut event: InboundCallEvent) -> Result<RoutingDirective> {
        let session_id = self.resolve_session_id(&mut event);
        event.validate()?;
        let now = event.timestamp.unwrap_or_else(Utc::now);

        let _guard = self.lock_session(&session_id).await;
        let mut log = self
            .db
            .insert_call_log(&NewCallLog {
                session_id: session_id.clone(),
                caller_id: event.caller_id.trim().to_string(),
                called_number: event.called_number.trim().to_string(),
                direction: CallDirection::Inbound,
                start_time: now,
                user_agent: event.user_agent.clone(),
            })
            .await?;
        info!("📞 Inbound call {} from {} to {}", log.session_id, log.caller_id, log.called_number);

        match self.route_new_call(&mut log, now).await {
            Ok(action) => {
                info!("➡️ Session {} -> {}", log.session_id, action.name());
                Ok(RoutingDirective::new(&log, action))
            }
            Err(e) => {
                self.close_failed_routing(&mut log, &e, now).await;
                Err(e)
            }
        }
    }

    /// The signaling layer's session id, or a generated one. The resolved
    /// id is written back so every later step reports the same id.
    fn resolve_session_id(&self, event: &mut InboundCallEvent) -> String {
        let session_id = match event.session_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => format!("{}{}", self.config.general.session_id_prefix, Uuid::new_v4()),
        };
        event.session_id = Some(session_id.clone());
        session_id
    }

    async fn route_new_call(&self, log: &mut CallLog, now: DateTime<Utc>) -> Result<DirectiveAction> {
        let rules = self.db.routable_rules().await?;
        let matched = self
            .matcher
            .match_rule(&rules, &log.caller_id, &log.called_number, self.local_time(now))
            .map(|m| (m.rule.id, m.rule.name.clone(), m.action));

        let action = match matched {
            Some((rule_id, rule_name, action)) => {
                info!("📋 Session {} matched rule {} ({})", log.session_id, rule_id, rule_name);
                log.routing_rule_id = Some(rule_id);
                match self.execute_rule(action, log).await? {
                    Some(action) => action,
                    None => self.route_direct(log, now).await?,
                }
            }
            None => self.route_direct(log, now).await?,
        };

        self.db.save_call_log(log).await?;
        if log.is_terminal() {
            self.trigger.on_terminal_status(log);
        }
        Ok(action)
    }

    /// Close a record whose routing failed half way. A failure to write the
    /// record is logged; the caller still gets the routing error.
    async fn close_failed_routing(&self, log: &mut CallLog, cause: &CallEngineError, now: DateTime<Utc>) {
        log.status = CallStatus::Failed;
        log.end_time.get_or_insert(now);
        log.notes = format!("Routing error: {cause}");
        derive_timings(log);
        if let Err(e) = self.db.save_call_log(log).await {
            error!("Failed to close call record {} after routing error: {}", log.session_id, e);
        }
        if log.queued {
            if let Err(e) = self.queue.release_session(&log.session_id, QueueStatus::Abandoned).await {
                error!("Failed to release queue entry for {}: {}", log.session_id, e);
            }
        }
    }

    /// [`handle_inbound_call`](Self::handle_inbound_call) for callers that
    /// always need a directive: failures become an `error` directive.
    pub async fn route_or_error(&self, mut event: InboundCallEvent) -> RoutingDirective {
        let session_id = self.resolve_session_id(&mut event);
        let fallback = RoutingDirective {
            session_id,
            caller_id: event.caller_id.clone(),
            called_number: event.called_number.clone(),
            action: DirectiveAction::NotFound,
        };
        match self.handle_inbound_call(event).await {
            Ok(directive) => directive,
            Err(e) => {
                if e.is_client_error() {
                    warn!("Rejected inbound call {}: {}", fallback.session_id, e);
                } else {
                    error!("Failed to route inbound call {}: {}", fallback.session_id, e);
                }
                RoutingDirective {
                    action: DirectiveAction::Error { message: e.to_string() },
                    ..fallback
                }
            }
        }
    }

    /// Carry out a matched rule. `None` means the target disappeared since
    /// the rules were loaded and the call should fall back to direct routing.
    async fn execute_rule(&self, action: RuleAction, log: &mut CallLog) -> Result<Option<DirectiveAction>> {
        let directive = match action {
            RuleAction::RouteToNumber(number_id) => {
                let Some(target) = self.db.routable_number(number_id).await? else {
                    warn!("Rule target extension {} is no longer routable", number_id);
                    return Ok(None);
                };
                log.routed_to_number = Some(number_id);
                DirectiveAction::Route {
                    target_type: RouteTargetType::Number,
                    target: target.number.number,
                    sip_uri: target.sip_uri,
                    group: None,
                    ring_timeout: None,
                }
            }
            RuleAction::RouteToGroup(group_id) => {
                let group = match self.db.get_group(group_id).await? {
                    Some(group) if group.active => group,
                    _ => {
                        warn!("Rule target group {} is no longer active", group_id);
                        return Ok(None);
                    }
                };
                log.routed_to_group = Some(group.id);
                self.route_to_group(&group, log).await?
            }
            RuleAction::ForwardExternal(target) => DirectiveAction::Forward { target },
            RuleAction::PlayAnnouncement(text) => DirectiveAction::Announcement { text },
            RuleAction::Hangup => DirectiveAction::Hangup,
        };
        Ok(Some(directive))
    }

    async fn route_to_group(&self, group: &Group, log: &mut CallLog) -> Result<DirectiveAction> {
        match self.distributor.next_member(group, &HashSet::new()).await? {
            MemberSelection::Member(member) => {
                log.routed_to_number = Some(member.number.id);
                Ok(DirectiveAction::Route {
                    target_type: RouteTargetType::GroupMember,
                    target: member.number.number,
                    sip_uri: member.sip_uri,
                    group: Some(group.name.clone()),
                    ring_timeout: Some(group.ring_timeout),
                })
            }
            MemberSelection::RingAll(members) => Ok(DirectiveAction::RingAll {
                targets: members
                    .into_iter()
                    .map(|m| RingTarget {
                        target: m.number.number,
                        sip_uri: m.sip_uri,
                    })
                    .collect(),
                group: group.name.clone(),
                ring_timeout: group.ring_timeout,
            }),
            MemberSelection::NoneAvailable => {
                match self
                    .queue
                    .admit(group, &log.caller_id, &log.called_number, &log.session_id)
                    .await
                {
                    Ok(entry) => {
                        log.queued = true;
                        Ok(DirectiveAction::Queued {
                            group: group.name.clone(),
                            position: entry.position,
                            estimated_wait_secs: entry.estimated_wait_secs,
                        })
                    }
                    Err(CallEngineError::QueueFull { max_size, .. }) => {
                        self.trigger.on_queue_full(group);
                        Ok(DirectiveAction::Busy {
                            reason: format!("queue for {} is full ({} waiting)", group.name, max_size),
                        })
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Route straight to the extension whose number was dialed. Anything
    /// but exactly one routable extension is `not_found`.
    async fn route_direct(&self, log: &mut CallLog, now: DateTime<Utc>) -> Result<DirectiveAction> {
        let mut candidates = self.db.direct_route_candidates(&log.called_number).await?;
        if candidates.len() == 1 {
            let target = candidates.remove(0);
            log.routed_to_number = Some(target.number.id);
            return Ok(DirectiveAction::Route {
                target_type: RouteTargetType::Direct,
                target: target.number.number,
                sip_uri: target.sip_uri,
                group: None,
                ring_timeout: None,
            });
        }

        log.notes = if candidates.len() > 1 {
            warn!(
                "Called number {} is ambiguous across {} servers, not routing",
                log.called_number,
                candidates.len()
            );
            format!(
                "No routing rules matched; number {} is ambiguous across {} servers",
                log.called_number,
                candidates.len()
            )
        } else {
            warn!("No routing rules matched {} and no extension answers to it", log.called_number);
            "No routing rules matched".to_string()
        };
        log.status = CallStatus::Failed;
        log.end_time = Some(now);
        derive_timings(log);
        Ok(DirectiveAction::NotFound)
    }

    // ---- status updates ----------------------------------------------------

    /// Merge a status change into the session's call record.
    ///
    /// Unknown sessions fail with [`CallEngineError::NotFound`] and nothing
    /// is created. Duplicate and out-of-order reports are absorbed; see
    /// [`Transition`](super::types::Transition).
    pub async fn update_status(&self, session_id: &str, update: StatusUpdate) -> Result<StatusOutcome> {
        let _guard = self.lock_session(session_id).await;

        let Some(current) = self.db.get_call_log(session_id).await? else {
            warn!("Status {} for unknown session {}", update.status, session_id);
            return Err(CallEngineError::not_found(format!("call session {session_id}")));
        };

        let outcome = apply_update(&current, &update, Utc::now());
        if outcome.log != current {
            self.db.save_call_log(&outcome.log).await?;
        }
        debug!("Session {}: {:?}", session_id, outcome.transition);

        if outcome.log.queued && outcome.log.status != current.status {
            let final_status = match outcome.log.status {
                CallStatus::Answered => QueueStatus::Connected,
                _ => QueueStatus::Abandoned,
            };
            self.queue.release_session(session_id, final_status).await?;
        }

        if outcome.became_terminal {
            info!(
                "📴 Session {} ended as {} ({}s talk)",
                session_id,
                outcome.log.status,
                outcome.log.duration_secs.unwrap_or(0)
            );
            self.trigger.on_terminal_status(&outcome.log);
        }
        Ok(outcome)
    }

    /// Validate a raw report from the signaling layer and apply it.
    pub async fn report_status(&self, report: StatusReport) -> Result<StatusOutcome> {
        let update = report.parse()?;
        self.update_status(report.session_id.trim(), update).await
    }

    // ---- queues ------------------------------------------------------------

    /// One drain pass over `group_id`'s queue. Returns a directive per
    /// caller that was connected (`route`/`ring_all`) or timed out (`busy`).
    pub async fn drain_group(&self, group_id: GroupId) -> Result<Vec<RoutingDirective>> {
        let group = self
            .db
            .get_group(group_id)
            .await?
            .ok_or_else(|| CallEngineError::not_found(format!("group {group_id}")))?;
        let now = Utc::now();
        let actions = self.queue.drain_at(&group, now).await?;

        let mut directives = Vec::with_capacity(actions.len());
        for action in actions {
            let session_id = action.entry().session_id.clone();
            match self.apply_drain_action(&group, action, now).await {
                Ok(Some(directive)) => directives.push(directive),
                Ok(None) => {}
                Err(CallEngineError::NotFound(_)) => {
                    warn!("Queue entry for session {} has no call record", session_id)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(directives)
    }

    async fn apply_drain_action(
        &self,
        group: &Group,
        action: DrainAction,
        now: DateTime<Utc>,
    ) -> Result<Option<RoutingDirective>> {
        match action {
            DrainAction::TimedOut { entry, waited_secs } => {
                let outcome = self
                    .update_status(&entry.session_id, StatusUpdate::new(CallStatus::Abandoned).ended_at(now))
                    .await?;
                Ok(Some(RoutingDirective::new(
                    &outcome.log,
                    DirectiveAction::Busy {
                        reason: format!("queue timeout after {waited_secs}s in {}", group.name),
                    },
                )))
            }
            DrainAction::Connect { entry, selection } => {
                let _guard = self.lock_session(&entry.session_id).await;
                let Some(mut log) = self.db.get_call_log(&entry.session_id).await? else {
                    return Err(CallEngineError::not_found(format!("call session {}", entry.session_id)));
                };
                if log.is_terminal() {
                    // Caller hung up while the drain ran.
                    self.queue.release(entry.id, QueueStatus::Abandoned).await?;
                    return Ok(None);
                }

                let action = match selection {
                    MemberSelection::Member(member) => {
                        log.routed_to_number = Some(member.number.id);
                        DirectiveAction::Route {
                            target_type: RouteTargetType::GroupMember,
                            target: member.number.number,
                            sip_uri: member.sip_uri,
                            group: Some(group.name.clone()),
                            ring_timeout: Some(group.ring_timeout),
                        }
                    }
                    MemberSelection::RingAll(members) => DirectiveAction::RingAll {
                        targets: members
                            .into_iter()
                            .map(|m| RingTarget {
                                target: m.number.number,
                                sip_uri: m.sip_uri,
                            })
                            .collect(),
                        group: group.name.clone(),
                        ring_timeout: group.ring_timeout,
                    },
                    MemberSelection::NoneAvailable => return Ok(None),
                };
                if log.queue_exit_time.is_none() {
                    log.queue_exit_time = Some(now);
                }
                derive_timings(&mut log);
                self.db.save_call_log(&log).await?;
                info!("🔗 Session {} leaves queue {} -> {}", log.session_id, group.name, action.name());
                Ok(Some(RoutingDirective::new(&log, action)))
            }
        }
    }

    /// Drain every group that has waiting callers. A failing group is
    /// logged and skipped.
    pub async fn drain_all(&self) -> Result<Vec<RoutingDirective>> {
        let mut directives = Vec::new();
        for group_id in self.db.groups_with_waiting_calls().await? {
            match self.drain_group(group_id).await {
                Ok(mut d) => directives.append(&mut d),
                Err(e) => error!("Failed to drain queue for group {}: {}", group_id, e),
            }
        }
        Ok(directives)
    }

    /// Take a session out of its queue, e.g. when the caller hangs up while
    /// waiting. The call record is closed as `abandoned` unless it already
    /// moved on.
    pub async fn release_queued_call(&self, session_id: &str, final_status: QueueStatus) -> Result<QueueEntry> {
        let entry = self
            .db
            .open_queue_entry_for_session(session_id)
            .await?
            .ok_or_else(|| CallEngineError::not_found(format!("open queue entry for session {session_id}")))?;
        let released = self.queue.release(entry.id, final_status).await?;

        if matches!(final_status, QueueStatus::Abandoned | QueueStatus::Timeout) {
            let update = StatusUpdate::new(CallStatus::Abandoned).ended_at(released.left_at.unwrap_or_else(Utc::now));
            match self.update_status(session_id, update).await {
                Ok(_) | Err(CallEngineError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        } else if let Some(left_at) = released.left_at {
            self.db.mark_queue_exit(session_id, left_at).await?;
        }
        Ok(released)
    }

    /// Waiting callers of one group, or of every active group.
    pub async fn queue_snapshot(&self, group_id: Option<GroupId>) -> Result<Vec<QueueSnapshot>> {
        let groups = match group_id {
            Some(id) => vec![self
                .db
                .get_group(id)
                .await?
                .ok_or_else(|| CallEngineError::not_found(format!("group {id}")))?],
            None => self.db.active_groups().await?,
        };
        let mut snapshots = Vec::with_capacity(groups.len());
        for group in &groups {
            snapshots.push(self.queue.snapshot(group).await?);
        }
        Ok(snapshots)
    }

    // ---- member signals ----------------------------------------------------

    /// The signaling layer reports the extension is on a call.
    pub fn mark_member_busy(&self, number_id: NumberId) {
        self.availability.mark_busy(number_id);
    }

    /// The extension is free again; waiting callers can be drained to it.
    pub fn mark_member_free(&self, number_id: NumberId) {
        self.availability.mark_free(number_id);
    }

    /// Account of the extension, if it may place external or bulk calls.
    pub async fn authorize_external_call(&self, number_id: NumberId) -> Result<Account> {
        let account = self
            .db
            .account_for_number(number_id)
            .await?
            .ok_or_else(|| CallEngineError::not_found(format!("account for extension {number_id}")))?;
        if !account.may_dial_external() {
            return Err(CallEngineError::validation(format!(
                "extension {number_id} may not place external calls"
            )));
        }
        Ok(account)
    }

    // ---- reporting ---------------------------------------------------------

    pub async fn call_statistics(&self, filter: &StatsFilter) -> Result<CallStatistics> {
        self.statistics.overall(filter).await
    }

    pub async fn group_statistics(&self, filter: &StatsFilter) -> Result<Vec<GroupStatistics>> {
        self.statistics.by_group(filter).await
    }

    pub async fn member_statistics(&self, filter: &StatsFilter) -> Result<Vec<MemberStatistics>> {
        self.statistics.by_member(filter).await
    }

    /// Build the health report and alert administrators when it carries an
    /// error or worse.
    pub async fn health_report(&self) -> Result<SystemHealthReport> {
        let report = self.health.check().await?;
        if report.severity >= Severity::Error {
            let notification = Notification::new(
                NotificationKind::SystemHealth,
                report.severity,
                format!("System health: {} issue(s)", report.issues.len()),
            )
            .with_payload(serde_json::to_value(&report).unwrap_or_default());
            if let Err(e) = self.trigger.notify_admins(notification).await {
                warn!("Could not send health alert: {}", e);
            }
        }
        Ok(report)
    }

    /// Build the report for `date` and send it to administrators.
    pub async fn daily_report(&self, date: NaiveDate) -> Result<DailyReport> {
        let report = self
            .statistics
            .daily_report(date, self.config.general.utc_offset_minutes)
            .await?;
        let notification = Notification::new(
            NotificationKind::DailyReport,
            Severity::Info,
            format!(
                "Daily report {}: {} calls, {}% answered",
                report.date, report.totals.total, report.totals.answer_rate
            ),
        )
        .with_payload(serde_json::to_value(&report).unwrap_or_default());
        if let Err(e) = self.trigger.notify_admins(notification).await {
            warn!("Could not send daily report: {}", e);
        }
        Ok(report)
    }

    /// Housekeeping: purge old queue entries, renumber queues and drop idle
    /// session locks. Returns the number of purged entries.
    pub async fn run_maintenance(&self) -> Result<u64> {
        let purged = self.queue.cleanup(Utc::now()).await?;
        let groups = self.queue.reoptimize_positions().await?;
        let locks = self.prune_session_locks();
        debug!("Maintenance: {} entries purged, {} queues renumbered, {} session locks held", purged, groups, locks);
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{
        DistributionStrategy, NewAccount, NewInternalNumber, NewRoutingRule, NewSipServer, NewUser, RuleActionKind,
    };
    use crate::monitoring::BroadcastNotifier;
    use crate::orchestrator::Transition;
    use crate::test_support::Fixture;
    use tokio::sync::broadcast;

    struct Harness {
        fx: Fixture,
        router: CallRouter,
        notifications: broadcast::Receiver<Notification>,
    }

    async fn harness() -> Harness {
        let fx = Fixture::new().await;
        let broadcast = Arc::new(BroadcastNotifier::new(32));
        let notifications = broadcast.subscribe();
        let router = CallRouter::new(fx.db.clone(), CallEngineConfig::default(), broadcast);
        Harness {
            fx,
            router,
            notifications,
        }
    }

    async fn next_notification(rx: &mut broadcast::Receiver<Notification>) -> Notification {
        tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("no notification")
            .unwrap()
    }

    fn call(caller: &str, called: &str) -> InboundCallEvent {
        InboundCallEvent::new(caller, called)
    }

    #[tokio::test]
    async fn test_route_to_number_rule() {
        let h = harness().await;
        let user = h.fx.db.create_user(NewUser::new("desk", "Front Desk")).await.unwrap();
        let number = h
            .fx
            .db
            .create_internal_number(NewInternalNumber::new(h.fx.server.id, "100").for_user(user.id), 1000)
            .await
            .unwrap();
        h.fx.db.create_account(NewAccount::new(user.id, number.id)).await.unwrap();
        let rule = h
            .fx
            .db
            .create_routing_rule(NewRoutingRule::route_to_number("desk", 10, number.id).with_called_pattern("^100$"))
            .await
            .unwrap();

        let directive = h.router.handle_inbound_call(call("+15551230000", "100")).await.unwrap();
        assert!(directive.session_id.starts_with("call-"));
        match &directive.action {
            DirectiveAction::Route { target_type, target, sip_uri, .. } => {
                assert_eq!(*target_type, RouteTargetType::Number);
                assert_eq!(target, "100");
                assert_eq!(sip_uri, "sip:100@pbx.test");
            }
            other => panic!("unexpected {other:?}"),
        }

        let log = h.fx.db.get_call_log(&directive.session_id).await.unwrap().unwrap();
        assert_eq!(log.status, CallStatus::Ringing);
        assert_eq!(log.routed_to_number, Some(number.id));
        assert_eq!(log.routing_rule_id, Some(rule.id));
    }

    #[tokio::test]
    async fn test_lowest_priority_value_wins() {
        let h = harness().await;
        h.fx.db
            .create_routing_rule(NewRoutingRule::forward_external("late", 20, "+15559990000"))
            .await
            .unwrap();
        h.fx.db
            .create_routing_rule(NewRoutingRule::announcement("early", 5, "We are closed").with_caller_pattern(r"^\+1"))
            .await
            .unwrap();

        let us = h.router.handle_inbound_call(call("+15551234567", "500")).await.unwrap();
        assert_eq!(us.action, DirectiveAction::Announcement { text: "We are closed".into() });

        let uk = h.router.handle_inbound_call(call("+442012345678", "500")).await.unwrap();
        assert_eq!(uk.action, DirectiveAction::Forward { target: "+15559990000".into() });

        h.fx.db
            .create_routing_rule(NewRoutingRule::new("drop", 1, RuleActionKind::Hangup))
            .await
            .unwrap();
        let dropped = h.router.handle_inbound_call(call("+15551234567", "500")).await.unwrap();
        assert_eq!(dropped.action, DirectiveAction::Hangup);
    }

    #[tokio::test]
    async fn test_direct_routing_and_not_found() {
        let h = harness().await;
        let alice = h.fx.extension("alice").await;

        let direct = h.router.handle_inbound_call(call("+1555", &alice.number.number)).await.unwrap();
        assert!(matches!(
            direct.action,
            DirectiveAction::Route { target_type: RouteTargetType::Direct, .. }
        ));

        let missing = h.router.handle_inbound_call(call("+1555", "9999")).await.unwrap();
        assert_eq!(missing.action, DirectiveAction::NotFound);
        let log = h.fx.db.get_call_log(&missing.session_id).await.unwrap().unwrap();
        assert_eq!(log.status, CallStatus::Failed);
        assert_eq!(log.duration_secs, Some(0));
        assert_eq!(log.notes, "No routing rules matched");

        // Inactive account: no longer directly reachable.
        h.fx.db.set_account_active(alice.account.id, false).await.unwrap();
        let inactive = h.router.handle_inbound_call(call("+1555", &alice.number.number)).await.unwrap();
        assert_eq!(inactive.action, DirectiveAction::NotFound);
    }

    #[tokio::test]
    async fn test_session_id_collision_rejected() {
        let h = harness().await;
        h.router
            .handle_inbound_call(call("+1555", "100").with_session_id("dup"))
            .await
            .unwrap();
        let again = h.router.handle_inbound_call(call("+1666", "200").with_session_id("dup")).await;
        assert!(matches!(again, Err(CallEngineError::AlreadyExists(_))));

        let log = h.fx.db.get_call_log("dup").await.unwrap().unwrap();
        assert_eq!(log.caller_id, "+1555");

        let directive = h.router.route_or_error(call("+1666", "200").with_session_id("dup")).await;
        assert!(matches!(directive.action, DirectiveAction::Error { .. }));
        assert_eq!(directive.session_id, "dup");
    }

    #[tokio::test]
    async fn test_ambiguous_called_number_is_not_found() {
        let h = harness().await;
        let backup = h
            .fx
            .db
            .create_sip_server(NewSipServer::new("backup", "pbx2.test"))
            .await
            .unwrap();
        for (username, server_id) in [("front", h.fx.server.id), ("back", backup.id)] {
            let user = h.fx.db.create_user(NewUser::new(username, username)).await.unwrap();
            let number = h
                .fx
                .db
                .create_internal_number(NewInternalNumber::new(server_id, "700").for_user(user.id), 1000)
                .await
                .unwrap();
            h.fx.db.create_account(NewAccount::new(user.id, number.id)).await.unwrap();
        }

        let directive = h.router.handle_inbound_call(call("+1555", "700")).await.unwrap();
        assert_eq!(directive.action, DirectiveAction::NotFound);
        let log = h.fx.db.get_call_log(&directive.session_id).await.unwrap().unwrap();
        assert_eq!(log.status, CallStatus::Failed);
        assert!(log.notes.starts_with("No routing rules matched"));
        assert!(log.notes.contains("ambiguous across 2 servers"));
    }

    #[tokio::test]
    async fn test_store_error_mid_routing_closes_record() {
        let h = harness().await;
        h.fx.db
            .create_routing_rule(NewRoutingRule::announcement("hello", 10, "Welcome"))
            .await
            .unwrap();
        sqlx::query("ALTER TABLE routing_rules RENAME TO routing_rules_retired")
            .execute(h.fx.db.pool())
            .await
            .unwrap();

        let directive = h.router.route_or_error(call("+1555", "100")).await;
        assert!(matches!(directive.action, DirectiveAction::Error { .. }));
        assert!(directive.session_id.starts_with("call-"));
        let log = h.fx.db.get_call_log(&directive.session_id).await.unwrap().unwrap();
        assert_eq!(log.status, CallStatus::Failed);
        assert!(log.end_time.is_some());
        assert_eq!(log.duration_secs, Some(0));
        assert!(log.notes.starts_with("Routing error: "));

        let direct = h
            .router
            .handle_inbound_call(call("+1666", "100").with_session_id("broken"))
            .await;
        assert!(direct.is_err());
        let log = h.fx.db.get_call_log("broken").await.unwrap().unwrap();
        assert_eq!(log.status, CallStatus::Failed);
    }

    #[tokio::test]
    async fn test_invalid_call_keeps_resolved_session_id() {
        let h = harness().await;
        let directive = h.router.route_or_error(call("  ", "100")).await;
        assert!(matches!(directive.action, DirectiveAction::Error { .. }));
        assert!(directive.session_id.starts_with("call-"));
        assert!(h.fx.db.get_call_log(&directive.session_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_group_routing_queue_and_overflow() {
        let mut h = harness().await;
        let a = h.fx.extension("alice").await;
        let b = h.fx.extension("bob").await;
        h.fx.db.create_user(NewUser::new("root", "Admin").admin()).await.unwrap();
        let sales = h.fx.group("Sales", DistributionStrategy::RoundRobin, &[&a, &b], 1, 300).await;
        h.fx.db
            .create_routing_rule(NewRoutingRule::route_to_group("sales", 10, sales.id).with_called_pattern("^5000$"))
            .await
            .unwrap();

        let first = h.router.handle_inbound_call(call("+1555", "5000")).await.unwrap();
        match &first.action {
            DirectiveAction::Route { target_type, target, group, ring_timeout, .. } => {
                assert_eq!(*target_type, RouteTargetType::GroupMember);
                assert_eq!(target, &a.number.number);
                assert_eq!(group.as_deref(), Some("Sales"));
                assert_eq!(*ring_timeout, Some(30));
            }
            other => panic!("unexpected {other:?}"),
        }

        h.router.mark_member_busy(a.number.id);
        h.router.mark_member_busy(b.number.id);

        let second = h.router.handle_inbound_call(call("+1556", "5000")).await.unwrap();
        assert!(matches!(second.action, DirectiveAction::Queued { position: 1, .. }));
        let log = h.fx.db.get_call_log(&second.session_id).await.unwrap().unwrap();
        assert!(log.queued);
        assert_eq!(log.routed_to_group, Some(sales.id));

        let third = h.router.handle_inbound_call(call("+1557", "5000")).await.unwrap();
        assert!(matches!(third.action, DirectiveAction::Busy { .. }));
        let overflow = next_notification(&mut h.notifications).await;
        assert_eq!(overflow.kind, NotificationKind::QueueOverflow);
        assert_eq!(overflow.payload["rejected"], true);

        // Bob frees up; the queued caller is handed to him.
        h.router.mark_member_free(b.number.id);
        let drained = h.router.drain_group(sales.id).await.unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].session_id, second.session_id);
        assert!(matches!(&drained[0].action, DirectiveAction::Route { target, .. } if target == &b.number.number));

        let log = h.fx.db.get_call_log(&second.session_id).await.unwrap().unwrap();
        assert_eq!(log.routed_to_number, Some(b.number.id));
        assert!(log.queue_exit_time.is_some());

        h.router
            .update_status(&second.session_id, StatusUpdate::new(CallStatus::Answered))
            .await
            .unwrap();
        assert!(h.fx.db.open_queue_entry_for_session(&second.session_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_group_without_members_queues_then_busy() {
        let h = harness().await;
        let empty = h.fx.group("Ghost", DistributionStrategy::Priority, &[], 1, 300).await;
        h.fx.db
            .create_routing_rule(NewRoutingRule::route_to_group("ghost", 1, empty.id))
            .await
            .unwrap();

        let queued = h.router.handle_inbound_call(call("+1555", "777")).await.unwrap();
        assert!(matches!(queued.action, DirectiveAction::Queued { .. }));
        let busy = h.router.handle_inbound_call(call("+1556", "777")).await.unwrap();
        assert!(matches!(busy.action, DirectiveAction::Busy { .. }));
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_created() {
        let h = harness().await;
        let result = h.router.update_status("nope", StatusUpdate::new(CallStatus::Answered)).await;
        assert!(matches!(result, Err(CallEngineError::NotFound(_))));
        assert!(h.fx.db.get_call_log("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_terminal_status_notifies_once() {
        let mut h = harness().await;
        let alice = h.fx.extension("alice").await;
        let directive = h.router.handle_inbound_call(call("+1555", &alice.number.number)).await.unwrap();

        let first = h
            .router
            .update_status(&directive.session_id, StatusUpdate::new(CallStatus::NoAnswer))
            .await
            .unwrap();
        assert!(first.became_terminal);
        let second = h
            .router
            .update_status(&directive.session_id, StatusUpdate::new(CallStatus::NoAnswer))
            .await
            .unwrap();
        assert_eq!(second.transition, Transition::Unchanged);
        assert_eq!(second.log.duration_secs, first.log.duration_secs);

        let missed = next_notification(&mut h.notifications).await;
        assert_eq!(missed.kind, NotificationKind::MissedCall);
        assert_eq!(missed.recipients[0].user_id, alice.user.id);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(h.notifications.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_terminal_reports_close_once() {
        let mut h = harness().await;
        let alice = h.fx.extension("alice").await;
        let directive = h.router.handle_inbound_call(call("+1555", &alice.number.number)).await.unwrap();
        let session_id = directive.session_id;
        let router = Arc::new(h.router);

        let answered = Utc::now();
        let mut tasks = Vec::new();
        for i in 0..16 {
            let router = router.clone();
            let session_id = session_id.clone();
            let update = if i % 2 == 0 {
                StatusUpdate::new(CallStatus::NoAnswer)
            } else {
                StatusUpdate::new(CallStatus::Answered)
                    .answered_at(answered)
                    .ended_at(answered + Duration::seconds(30))
            };
            tasks.push(tokio::spawn(async move { router.update_status(&session_id, update).await }));
        }
        let mut outcomes = Vec::new();
        for task in tasks {
            outcomes.push(task.await.unwrap().unwrap());
        }

        assert_eq!(outcomes.iter().filter(|o| o.became_terminal).count(), 1);
        let stored = h.fx.db.get_call_log(&session_id).await.unwrap().unwrap();
        assert!(stored.is_terminal());
        let expected = if stored.status == CallStatus::NoAnswer { 0 } else { 30 };
        assert_eq!(stored.duration_secs, Some(expected));
        for outcome in &outcomes {
            assert_eq!(outcome.log.duration_secs, stored.duration_secs);
            assert_eq!(outcome.log.end_time, stored.end_time);
        }

        if stored.status == CallStatus::NoAnswer {
            let missed = next_notification(&mut h.notifications).await;
            assert_eq!(missed.kind, NotificationKind::MissedCall);
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(h.notifications.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_queue_timeout_abandons_call() {
        let h = harness().await;
        let a = h.fx.extension("alice").await;
        let group = h.fx.group("Support", DistributionStrategy::Priority, &[&a], 5, 60).await;
        h.fx.db
            .create_routing_rule(NewRoutingRule::route_to_group("support", 1, group.id))
            .await
            .unwrap();
        h.router.mark_member_busy(a.number.id);

        let queued = h
            .router
            .handle_inbound_call(call("+1555", "600").at(Utc::now() - Duration::seconds(120)))
            .await
            .unwrap();
        // Entry wait starts at admission; push it into the past.
        sqlx::query("UPDATE queue_entries SET wait_start_time = ? WHERE session_id = ?")
            .bind(Utc::now() - Duration::seconds(120))
            .bind(&queued.session_id)
            .execute(h.fx.db.pool())
            .await
            .unwrap();

        let drained = h.router.drain_all().await.unwrap();
        assert_eq!(drained.len(), 1);
        assert!(matches!(drained[0].action, DirectiveAction::Busy { .. }));

        let log = h.fx.db.get_call_log(&queued.session_id).await.unwrap().unwrap();
        assert_eq!(log.status, CallStatus::Abandoned);
        assert!(log.queue_wait_secs.unwrap() >= 120);
        assert_eq!(log.duration_secs, Some(0));
    }

    #[tokio::test]
    async fn test_caller_hangs_up_in_queue() {
        let h = harness().await;
        let group = h.fx.group("Empty", DistributionStrategy::RoundRobin, &[], 3, 300).await;
        h.fx.db
            .create_routing_rule(NewRoutingRule::route_to_group("q", 1, group.id))
            .await
            .unwrap();
        let one = h.router.handle_inbound_call(call("+1", "1")).await.unwrap();
        let two = h.router.handle_inbound_call(call("+2", "1")).await.unwrap();

        let released = h.router.release_queued_call(&one.session_id, QueueStatus::Abandoned).await.unwrap();
        assert_eq!(released.status, QueueStatus::Abandoned);
        let log = h.fx.db.get_call_log(&one.session_id).await.unwrap().unwrap();
        assert_eq!(log.status, CallStatus::Abandoned);

        let snapshot = h.router.queue_snapshot(Some(group.id)).await.unwrap();
        assert_eq!(snapshot[0].waiting.len(), 1);
        assert_eq!(snapshot[0].waiting[0].session_id, two.session_id);
        assert_eq!(snapshot[0].waiting[0].position, 1);
    }

    #[tokio::test]
    async fn test_external_call_authorization() {
        let h = harness().await;
        let a = h.fx.extension("alice").await;
        let account = h.router.authorize_external_call(a.number.id).await.unwrap();
        assert_eq!(account.id, a.account.id);

        h.fx.db.set_account_active(a.account.id, false).await.unwrap();
        assert!(matches!(
            h.router.authorize_external_call(a.number.id).await,
            Err(CallEngineError::Validation(_))
        ));
        assert!(matches!(
            h.router.authorize_external_call(4242).await,
            Err(CallEngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_session_locks_are_pruned() {
        let h = harness().await;
        for i in 0..3 {
            h.router
                .handle_inbound_call(call("+1", "1").with_session_id(format!("s{i}")))
                .await
                .unwrap();
        }
        assert_eq!(h.router.prune_session_locks(), 0);
    }
}
