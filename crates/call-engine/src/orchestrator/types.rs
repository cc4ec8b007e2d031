//! Events consumed from and directives handed to the signaling layer.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::directory::{CallLog, CallStatus};
use crate::error::{CallEngineError, Result};

/// A new inbound call as normalized by the signaling layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundCallEvent {
    pub caller_id: String,
    pub called_number: String,
    /// Generated when absent.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Defaults to the time the event is handled.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl InboundCallEvent {
    pub fn new(caller_id: impl Into<String>, called_number: impl Into<String>) -> Self {
        Self {
            caller_id: caller_id.into(),
            called_number: called_number.into(),
            session_id: None,
            timestamp: None,
            user_agent: None,
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.caller_id.trim().is_empty() {
            return Err(CallEngineError::validation("inbound call without caller id"));
        }
        if self.called_number.trim().is_empty() {
            return Err(CallEngineError::validation("inbound call without called number"));
        }
        Ok(())
    }
}

/// How a `route` directive's target was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteTargetType {
    /// A rule pointed at the extension.
    Number,
    /// A group's distribution strategy picked the extension.
    GroupMember,
    /// No rule matched; the called number is the extension itself.
    Direct,
}

/// One leg of an `all_ring` directive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RingTarget {
    pub target: String,
    pub sip_uri: String,
}

/// What the signaling layer should do with the call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DirectiveAction {
    Route {
        #[serde(rename = "targetType")]
        target_type: RouteTargetType,
        target: String,
        #[serde(rename = "sipUri")]
        sip_uri: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group: Option<String>,
        /// Seconds to ring before giving up; group routes only.
        #[serde(rename = "ringTimeout", default, skip_serializing_if = "Option::is_none")]
        ring_timeout: Option<u32>,
    },
    /// Ring every target at once; the first to answer takes the call.
    RingAll {
        targets: Vec<RingTarget>,
        group: String,
        #[serde(rename = "ringTimeout")]
        ring_timeout: u32,
    },
    /// The caller is waiting in a group queue.
    Queued {
        group: String,
        position: u32,
        #[serde(rename = "estimatedWait")]
        estimated_wait_secs: u32,
    },
    Forward {
        target: String,
    },
    Announcement {
        text: String,
    },
    Hangup,
    Busy {
        reason: String,
    },
    NotFound,
    Error {
        message: String,
    },
}

impl DirectiveAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Route { .. } => "route",
            Self::RingAll { .. } => "ring_all",
            Self::Queued { .. } => "queued",
            Self::Forward { .. } => "forward",
            Self::Announcement { .. } => "announcement",
            Self::Hangup => "hangup",
            Self::Busy { .. } => "busy",
            Self::NotFound => "not_found",
            Self::Error { .. } => "error",
        }
    }
}

/// Instruction returned to the signaling layer for one call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingDirective {
    pub session_id: String,
    pub caller_id: String,
    pub called_number: String,
    #[serde(flatten)]
    pub action: DirectiveAction,
}

impl RoutingDirective {
    pub fn new(log: &CallLog, action: DirectiveAction) -> Self {
        Self {
            session_id: log.session_id.clone(),
            caller_id: log.caller_id.clone(),
            called_number: log.called_number.clone(),
            action,
        }
    }
}

/// Raw status report as received from the signaling layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub session_id: String,
    pub status: String,
    #[serde(default)]
    pub answer_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub codec: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub recording_file: Option<String>,
}

impl StatusReport {
    /// Validate and convert. An unknown status is rejected; a timestamp that
    /// does not parse is logged and dropped.
    pub fn parse(&self) -> Result<StatusUpdate> {
        if self.session_id.trim().is_empty() {
            return Err(CallEngineError::validation("status report without session id"));
        }
        let status = self.status.trim().to_ascii_lowercase().parse::<CallStatus>()?;
        Ok(StatusUpdate {
            status,
            answer_time: self.timestamp("answerTime", &self.answer_time),
            end_time: self.timestamp("endTime", &self.end_time),
            codec: self.codec.clone(),
            user_agent: self.user_agent.clone(),
            notes: self.notes.clone(),
            recording_file: self.recording_file.clone(),
        })
    }

    fn timestamp(&self, field: &str, raw: &Option<String>) -> Option<DateTime<Utc>> {
        let raw = raw.as_deref().map(str::trim).filter(|r| !r.is_empty())?;
        let parsed = parse_timestamp(raw);
        if parsed.is_none() {
            warn!("Ignoring malformed {} {:?} for session {}", field, raw, self.session_id);
        }
        parsed
    }
}

/// RFC 3339, or `YYYY-MM-DD HH:MM:SS` taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

/// A validated status change for one call
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: CallStatus,
    pub answer_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub codec: Option<String>,
    pub user_agent: Option<String>,
    pub notes: Option<String>,
    pub recording_file: Option<String>,
}

impl StatusUpdate {
    pub fn new(status: CallStatus) -> Self {
        Self {
            status,
            answer_time: None,
            end_time: None,
            codec: None,
            user_agent: None,
            notes: None,
            recording_file: None,
        }
    }

    pub fn answered_at(mut self, at: DateTime<Utc>) -> Self {
        self.answer_time = Some(at);
        self
    }

    pub fn ended_at(mut self, at: DateTime<Utc>) -> Self {
        self.end_time = Some(at);
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn with_recording(mut self, path: impl Into<String>) -> Self {
        self.recording_file = Some(path.into());
        self
    }

    pub fn with_codec(mut self, codec: impl Into<String>) -> Self {
        self.codec = Some(codec.into());
        self
    }
}

/// How a status update changed the call record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Transition {
    /// The status moved forward.
    Advanced { from: CallStatus, to: CallStatus },
    /// An answered call ended.
    Completed,
    /// Same status again; at most notes or recording changed.
    Unchanged,
    /// A move the call state machine does not allow; nothing but notes or
    /// recording was applied.
    Ignored { current: CallStatus, requested: CallStatus },
}

/// Result of applying a status update
#[derive(Debug, Clone, PartialEq)]
pub struct StatusOutcome {
    pub log: CallLog,
    pub transition: Transition,
    /// This update closed the call.
    pub became_terminal: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directive_wire_format() {
        let directive = RoutingDirective {
            session_id: "call-1".into(),
            caller_id: "+15551230000".into(),
            called_number: "100".into(),
            action: DirectiveAction::Route {
                target_type: RouteTargetType::Number,
                target: "100".into(),
                sip_uri: "sip:100@pbx.test".into(),
                group: None,
                ring_timeout: None,
            },
        };
        let json = serde_json::to_value(&directive).unwrap();
        assert_eq!(json["action"], "route");
        assert_eq!(json["targetType"], "number");
        assert_eq!(json["sipUri"], "sip:100@pbx.test");
        assert_eq!(json["sessionId"], "call-1");
        assert!(json.get("group").is_none());

        let busy = serde_json::to_value(DirectiveAction::Busy { reason: "full".into() }).unwrap();
        assert_eq!(busy, serde_json::json!({ "action": "busy", "reason": "full" }));
        let not_found = serde_json::to_value(DirectiveAction::NotFound).unwrap();
        assert_eq!(not_found, serde_json::json!({ "action": "not_found" }));
    }

    #[test]
    fn test_status_report_parsing() {
        let report: StatusReport = serde_json::from_value(serde_json::json!({
            "sessionId": "call-9",
            "status": "ANSWERED",
            "answerTime": "2024-05-01T10:00:00Z",
            "endTime": "yesterday-ish",
            "codec": "opus"
        }))
        .unwrap();
        let update = report.parse().unwrap();
        assert_eq!(update.status, CallStatus::Answered);
        assert_eq!(update.answer_time, parse_timestamp("2024-05-01 10:00:00"));
        assert!(update.answer_time.is_some());
        assert!(update.end_time.is_none());
        assert_eq!(update.codec.as_deref(), Some("opus"));

        let unknown = StatusReport {
            session_id: "call-9".into(),
            status: "on_hold".into(),
            ..StatusReport::default()
        };
        assert!(matches!(unknown.parse(), Err(CallEngineError::Validation(_))));
    }

    #[test]
    fn test_inbound_validation() {
        assert!(InboundCallEvent::new("+1555", "100").validate().is_ok());
        assert!(InboundCallEvent::new(" ", "100").validate().is_err());
        assert!(InboundCallEvent::new("+1555", "").validate().is_err());
    }
}
