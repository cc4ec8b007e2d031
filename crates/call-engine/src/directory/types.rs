use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CallEngineError;

pub type ServerId = i64;
pub type UserId = i64;
pub type NumberId = i64;
pub type AccountId = i64;
pub type GroupId = i64;
pub type RuleId = i64;

/// CRM user that can own an extension and receive notifications
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrmUser {
    pub id: UserId,
    pub username: String,
    pub full_name: String,
    pub email: Option<String>,
    pub active: bool,
    pub is_admin: bool,
}

/// A SIP registrar/proxy the extensions register against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SipServer {
    pub id: ServerId,
    pub name: String,
    pub host: String,
    pub websocket_uri: String,
    pub realm: Option<String>,
    pub proxy: Option<String>,
    /// Registration expiry in seconds.
    pub register_expires: u32,
    pub active: bool,
}

impl SipServer {
    /// Domain part used in SIP URIs: the realm when set, otherwise the host.
    pub fn sip_domain(&self) -> &str {
        match self.realm.as_deref() {
            Some(realm) if !realm.is_empty() => realm,
            _ => &self.host,
        }
    }
}

/// An extension on a SIP server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InternalNumber {
    pub id: NumberId,
    pub server_id: ServerId,
    pub number: String,
    pub user_id: Option<UserId>,
    #[serde(skip_serializing)]
    pub password: String,
    pub display_name: String,
    pub active: bool,
    pub auto_generated: bool,
}

impl InternalNumber {
    pub fn sip_uri(&self, server: &SipServer) -> String {
        sip_uri(&self.number, server.sip_domain())
    }
}

/// `sip:<number>@<domain>`
pub fn sip_uri(number: &str, domain: &str) -> String {
    format!("sip:{}@{}", number, domain)
}

/// An extension resolved together with the URI the signaling layer dials.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutableNumber {
    pub number: InternalNumber,
    pub sip_uri: String,
}

/// Per-user telephony settings binding a user to exactly one extension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub user_id: UserId,
    pub internal_number_id: NumberId,
    pub external_caller_id: Option<String>,
    pub can_make_external_calls: bool,
    pub can_receive_external_calls: bool,
    pub call_recording_enabled: bool,
    pub voicemail_enabled: bool,
    pub voicemail_email: Option<String>,
    pub max_concurrent_calls: u32,
    pub active: bool,
}

impl Account {
    /// Whether this account may be offered for outbound or forward legs.
    pub fn may_dial_external(&self) -> bool {
        self.active && self.can_make_external_calls
    }
}

/// How a group picks the member that receives the next call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionStrategy {
    RoundRobin,
    Random,
    Priority,
    AllRing,
    LeastRecent,
}

impl DistributionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::Random => "random",
            Self::Priority => "priority",
            Self::AllRing => "all_ring",
            Self::LeastRecent => "least_recent",
        }
    }
}

impl Default for DistributionStrategy {
    fn default() -> Self {
        Self::RoundRobin
    }
}

impl fmt::Display for DistributionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DistributionStrategy {
    type Err = CallEngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Self::RoundRobin),
            "random" => Ok(Self::Random),
            "priority" => Ok(Self::Priority),
            "all_ring" => Ok(Self::AllRing),
            "least_recent" => Ok(Self::LeastRecent),
            other => Err(CallEngineError::validation(format!(
                "unknown distribution strategy: {other}"
            ))),
        }
    }
}

/// A hunt group of extensions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub description: String,
    pub server_id: ServerId,
    pub strategy: DistributionStrategy,
    /// Seconds each member rings; advisory to the signaling layer.
    pub ring_timeout: u32,
    /// Waiting calls allowed at once. Zero disables queueing.
    pub max_queue_size: u32,
    /// Seconds a caller may wait before the entry times out.
    pub queue_timeout: u32,
    pub active: bool,
}

/// A group member in membership order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupMember {
    pub position: i64,
    pub number: InternalNumber,
    pub sip_uri: String,
}

/// Stored kind of a routing rule's action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleActionKind {
    RouteToNumber,
    RouteToGroup,
    ForwardExternal,
    PlayAnnouncement,
    Hangup,
}

impl RuleActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RouteToNumber => "route_to_number",
            Self::RouteToGroup => "route_to_group",
            Self::ForwardExternal => "forward_external",
            Self::PlayAnnouncement => "play_announcement",
            Self::Hangup => "hangup",
        }
    }
}

impl FromStr for RuleActionKind {
    type Err = CallEngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "route_to_number" => Ok(Self::RouteToNumber),
            "route_to_group" => Ok(Self::RouteToGroup),
            "forward_external" => Ok(Self::ForwardExternal),
            "play_announcement" => Ok(Self::PlayAnnouncement),
            "hangup" => Ok(Self::Hangup),
            other => Err(CallEngineError::validation(format!("unknown rule action: {other}"))),
        }
    }
}

/// A rule action together with the one target it needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "target", rename_all = "snake_case")]
pub enum RuleAction {
    RouteToNumber(NumberId),
    RouteToGroup(GroupId),
    ForwardExternal(String),
    PlayAnnouncement(String),
    Hangup,
}

/// Prioritized routing rule
///
/// Lower `priority` is evaluated first. The targets are stored flat; only the
/// one matching `action` is meaningful, see [`RoutingRule::action`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: RuleId,
    pub name: String,
    pub description: String,
    pub priority: i64,
    pub caller_id_pattern: Option<String>,
    pub called_number_pattern: Option<String>,
    pub time_condition: Option<String>,
    pub action: RuleActionKind,
    pub target_number_id: Option<NumberId>,
    pub target_group_id: Option<GroupId>,
    pub target_external: Option<String>,
    pub announcement_text: Option<String>,
    pub active: bool,
}

impl RoutingRule {
    /// The executable action, or `None` when the target the action needs is
    /// missing.
    pub fn action(&self) -> Option<RuleAction> {
        match self.action {
            RuleActionKind::RouteToNumber => self.target_number_id.map(RuleAction::RouteToNumber),
            RuleActionKind::RouteToGroup => self.target_group_id.map(RuleAction::RouteToGroup),
            RuleActionKind::ForwardExternal => non_blank(&self.target_external)
                .map(|target| RuleAction::ForwardExternal(target.to_string())),
            RuleActionKind::PlayAnnouncement => non_blank(&self.announcement_text)
                .map(|text| RuleAction::PlayAnnouncement(text.to_string())),
            RuleActionKind::Hangup => Some(RuleAction::Hangup),
        }
    }

    pub fn is_actionable(&self) -> bool {
        self.action().is_some()
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Lifecycle status of a queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Waiting,
    Connecting,
    Connected,
    Abandoned,
    Timeout,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Abandoned => "abandoned",
            Self::Timeout => "timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Connected | Self::Abandoned | Self::Timeout)
    }
}

impl FromStr for QueueStatus {
    type Err = CallEngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "connecting" => Ok(Self::Connecting),
            "connected" => Ok(Self::Connected),
            "abandoned" => Ok(Self::Abandoned),
            "timeout" => Ok(Self::Timeout),
            other => Err(CallEngineError::validation(format!("unknown queue status: {other}"))),
        }
    }
}

/// A caller waiting in a group's queue
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueEntry {
    pub id: i64,
    pub group_id: GroupId,
    pub caller_id: String,
    pub called_number: String,
    pub session_id: String,
    /// 1-based, contiguous among the group's waiting entries.
    pub position: u32,
    pub wait_start_time: DateTime<Utc>,
    pub estimated_wait_secs: u32,
    pub status: QueueStatus,
    pub left_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    pub fn wait_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.wait_start_time).num_seconds().max(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Inbound,
    Outbound,
    Internal,
}

impl CallDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
            Self::Internal => "internal",
        }
    }
}

impl FromStr for CallDirection {
    type Err = CallEngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(Self::Inbound),
            "outbound" => Ok(Self::Outbound),
            "internal" => Ok(Self::Internal),
            other => Err(CallEngineError::validation(format!("unknown call direction: {other}"))),
        }
    }
}

/// Status of a call record
///
/// `Ringing` is the only initial state. `Answered` is followed by the end
/// of the call (an `end_time`); every other status is terminal on arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Ringing,
    Answered,
    Busy,
    NoAnswer,
    Failed,
    Abandoned,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ringing => "ringing",
            Self::Answered => "answered",
            Self::Busy => "busy",
            Self::NoAnswer => "no_answer",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }

    /// Statuses that close the call on their own.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Busy | Self::NoAnswer | Self::Failed | Self::Abandoned)
    }

    /// Calls that reached nobody; these raise missed-call notifications.
    pub fn is_missed(&self) -> bool {
        matches!(self, Self::Busy | Self::NoAnswer)
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallStatus {
    type Err = CallEngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ringing" => Ok(Self::Ringing),
            "answered" => Ok(Self::Answered),
            "busy" => Ok(Self::Busy),
            "no_answer" => Ok(Self::NoAnswer),
            "failed" => Ok(Self::Failed),
            "abandoned" => Ok(Self::Abandoned),
            other => Err(CallEngineError::validation(format!("unknown call status: {other}"))),
        }
    }
}

/// Durable record of one inbound call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallLog {
    pub id: i64,
    pub session_id: String,
    pub caller_id: String,
    pub called_number: String,
    pub direction: CallDirection,
    pub routed_to_number: Option<NumberId>,
    pub routed_to_group: Option<GroupId>,
    pub routing_rule_id: Option<RuleId>,
    pub start_time: DateTime<Utc>,
    pub answer_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Set when the call was admitted to a group queue.
    pub queued: bool,
    /// When the call left the queue (connected, timed out or released).
    pub queue_exit_time: Option<DateTime<Utc>>,
    pub status: CallStatus,
    /// Talk time in seconds; zero for calls that were never answered.
    pub duration_secs: Option<i64>,
    pub queue_wait_secs: Option<i64>,
    pub user_agent: Option<String>,
    pub codec: Option<String>,
    pub recording_file: Option<String>,
    pub notes: String,
}

impl CallLog {
    /// Terminal once a final status arrived or an answered call ended.
    pub fn is_terminal(&self) -> bool {
        self.status.is_final() || (self.status == CallStatus::Answered && self.end_time.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(realm: Option<&str>) -> SipServer {
        SipServer {
            id: 1,
            name: "pbx".into(),
            host: "pbx.example.com".into(),
            websocket_uri: "wss://pbx.example.com/ws".into(),
            realm: realm.map(Into::into),
            proxy: None,
            register_expires: 600,
            active: true,
        }
    }

    fn rule(action: RuleActionKind) -> RoutingRule {
        RoutingRule {
            id: 1,
            name: "r".into(),
            description: String::new(),
            priority: 10,
            caller_id_pattern: None,
            called_number_pattern: None,
            time_condition: None,
            action,
            target_number_id: None,
            target_group_id: None,
            target_external: None,
            announcement_text: None,
            active: true,
        }
    }

    #[test]
    fn test_sip_domain_prefers_realm() {
        assert_eq!(server(Some("crm.example.com")).sip_domain(), "crm.example.com");
        assert_eq!(server(Some("")).sip_domain(), "pbx.example.com");
        assert_eq!(server(None).sip_domain(), "pbx.example.com");
        assert_eq!(sip_uri("1001", "pbx.example.com"), "sip:1001@pbx.example.com");
    }

    #[test]
    fn test_rule_without_target_is_not_actionable() {
        let mut r = rule(RuleActionKind::RouteToGroup);
        assert!(!r.is_actionable());
        r.target_group_id = Some(4);
        assert_eq!(r.action(), Some(RuleAction::RouteToGroup(4)));

        let mut forward = rule(RuleActionKind::ForwardExternal);
        forward.target_external = Some("   ".into());
        assert!(forward.action().is_none());

        assert_eq!(rule(RuleActionKind::Hangup).action(), Some(RuleAction::Hangup));
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("no_answer".parse::<CallStatus>().unwrap(), CallStatus::NoAnswer);
        assert!("ringing-ish".parse::<CallStatus>().is_err());
        assert!(CallStatus::Busy.is_missed());
        assert!(!CallStatus::Abandoned.is_missed());
        assert!(QueueStatus::Timeout.is_terminal());
        assert!(!QueueStatus::Connecting.is_terminal());
    }
}
