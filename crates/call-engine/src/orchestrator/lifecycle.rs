//! Call record state machine.
//!
//! ```text
//! ringing ──► answered ──(end_time)──► complete
//!    │
//!    └──► busy | no_answer | failed | abandoned
//! ```
//!
//! Updates merge monotonically: a report can only move a call forward, so
//! late or duplicated events from the signaling layer are harmless. Notes
//! and the recording path stay editable after the call is closed.

use chrono::{DateTime, Utc};
use tracing::warn;

use super::types::{StatusOutcome, StatusUpdate, Transition};
use crate::directory::{CallLog, CallStatus};

/// Merge `update` into `current`. `now` stands in for missing answer and
/// end times.
pub fn apply_update(current: &CallLog, update: &StatusUpdate, now: DateTime<Utc>) -> StatusOutcome {
    let mut log = current.clone();
    let was_terminal = current.is_terminal();

    if let Some(notes) = &update.notes {
        log.notes = notes.clone();
    }
    if let Some(path) = &update.recording_file {
        log.recording_file = Some(path.clone());
    }
    if !was_terminal {
        if update.codec.is_some() {
            log.codec = update.codec.clone();
        }
        if update.user_agent.is_some() {
            log.user_agent = update.user_agent.clone();
        }
    }

    let transition = match (current.status, update.status) {
        _ if was_terminal => {
            if update.status == current.status {
                Transition::Unchanged
            } else {
                ignored(current, update)
            }
        }
        (CallStatus::Ringing, CallStatus::Ringing) => Transition::Unchanged,
        (CallStatus::Ringing, CallStatus::Answered) => {
            log.status = CallStatus::Answered;
            log.answer_time = Some(update.answer_time.unwrap_or(now));
            if let Some(end) = update.end_time {
                log.end_time = Some(end);
            }
            Transition::Advanced {
                from: CallStatus::Ringing,
                to: CallStatus::Answered,
            }
        }
        (CallStatus::Ringing, to) => {
            log.status = to;
            log.end_time = Some(update.end_time.unwrap_or(now));
            Transition::Advanced {
                from: CallStatus::Ringing,
                to,
            }
        }
        (CallStatus::Answered, CallStatus::Answered) => match update.end_time {
            Some(end) => {
                log.end_time = Some(end);
                Transition::Completed
            }
            None => Transition::Unchanged,
        },
        _ => ignored(current, update),
    };

    derive_timings(&mut log);
    StatusOutcome {
        became_terminal: !was_terminal && log.is_terminal(),
        log,
        transition,
    }
}

fn ignored(current: &CallLog, update: &StatusUpdate) -> Transition {
    warn!(
        "Ignoring {} -> {} for session {}",
        current.status,
        update.status,
        current.session_id
    );
    Transition::Ignored {
        current: current.status,
        requested: update.status,
    }
}

/// Fill the derived fields from the timestamps.
///
/// Talk time runs from answer to end and is zero for unanswered calls.
/// Queue wait runs from arrival to leaving the queue for queued calls, and
/// from arrival to answer otherwise.
pub fn derive_timings(log: &mut CallLog) {
    if log.queued && log.queue_exit_time.is_none() && log.status != CallStatus::Ringing {
        log.queue_exit_time = log.answer_time.or(log.end_time);
    }

    log.queue_wait_secs = if log.queued {
        log.queue_exit_time.map(|exit| seconds_between(log.start_time, exit))
    } else {
        log.answer_time.map(|answer| seconds_between(log.start_time, answer))
    };

    if let Some(end) = log.end_time {
        log.duration_secs = Some(match (log.status, log.answer_time) {
            (CallStatus::Answered, Some(answer)) => seconds_between(answer, end),
            _ => 0,
        });
    }
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_seconds().max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::CallDirection;
    use chrono::Duration;

    fn ringing(start: DateTime<Utc>) -> CallLog {
        CallLog {
            id: 1,
            session_id: "call-1".into(),
            caller_id: "+15550100".into(),
            called_number: "100".into(),
            direction: CallDirection::Inbound,
            routed_to_number: Some(3),
            routed_to_group: None,
            routing_rule_id: None,
            start_time: start,
            answer_time: None,
            end_time: None,
            queued: false,
            queue_exit_time: None,
            status: CallStatus::Ringing,
            duration_secs: None,
            queue_wait_secs: None,
            user_agent: None,
            codec: None,
            recording_file: None,
            notes: String::new(),
        }
    }

    #[test]
    fn test_answer_then_end_computes_durations() {
        let start = Utc::now();
        let answered = apply_update(
            &ringing(start),
            &StatusUpdate::new(CallStatus::Answered).answered_at(start + Duration::seconds(5)),
            start,
        );
        assert!(!answered.became_terminal);
        assert_eq!(answered.log.queue_wait_secs, Some(5));
        assert_eq!(answered.log.duration_secs, None);

        let ended = apply_update(
            &answered.log,
            &StatusUpdate::new(CallStatus::Answered).ended_at(start + Duration::seconds(65)),
            start,
        );
        assert_eq!(ended.transition, Transition::Completed);
        assert!(ended.became_terminal);
        assert_eq!(ended.log.duration_secs, Some(60));

        // A repeated end report changes nothing.
        let again = apply_update(
            &ended.log,
            &StatusUpdate::new(CallStatus::Answered).ended_at(start + Duration::seconds(99)),
            start,
        );
        assert_eq!(again.transition, Transition::Unchanged);
        assert!(!again.became_terminal);
        assert_eq!(again.log, ended.log);
    }

    #[test]
    fn test_terminal_status_is_idempotent() {
        let start = Utc::now();
        let first = apply_update(&ringing(start), &StatusUpdate::new(CallStatus::NoAnswer), start + Duration::seconds(30));
        assert!(first.became_terminal);
        assert_eq!(first.log.duration_secs, Some(0));
        assert_eq!(first.log.end_time, Some(start + Duration::seconds(30)));

        let second = apply_update(&first.log, &StatusUpdate::new(CallStatus::NoAnswer), start + Duration::seconds(90));
        assert_eq!(second.transition, Transition::Unchanged);
        assert!(!second.became_terminal);
        assert_eq!(second.log, first.log);
    }

    #[test]
    fn test_backward_and_late_updates_ignored() {
        let start = Utc::now();
        let busy = apply_update(&ringing(start), &StatusUpdate::new(CallStatus::Busy), start).log;

        let late_answer = apply_update(&busy, &StatusUpdate::new(CallStatus::Answered).with_notes("call back"), start);
        assert!(matches!(late_answer.transition, Transition::Ignored { .. }));
        assert_eq!(late_answer.log.status, CallStatus::Busy);
        assert_eq!(late_answer.log.notes, "call back");

        let answered = apply_update(&ringing(start), &StatusUpdate::new(CallStatus::Answered), start).log;
        let back = apply_update(&answered, &StatusUpdate::new(CallStatus::Ringing), start);
        assert!(matches!(back.transition, Transition::Ignored { .. }));
        assert_eq!(back.log.status, CallStatus::Answered);
    }

    #[test]
    fn test_queue_wait_for_queued_calls() {
        let start = Utc::now();
        let mut log = ringing(start);
        log.queued = true;

        let answered = apply_update(
            &log,
            &StatusUpdate::new(CallStatus::Answered).answered_at(start + Duration::seconds(42)),
            start,
        );
        assert_eq!(answered.log.queue_exit_time, Some(start + Duration::seconds(42)));
        assert_eq!(answered.log.queue_wait_secs, Some(42));

        log.queue_exit_time = Some(start + Duration::seconds(20));
        let abandoned = apply_update(
            &log,
            &StatusUpdate::new(CallStatus::Abandoned).ended_at(start + Duration::seconds(50)),
            start,
        );
        assert_eq!(abandoned.log.queue_wait_secs, Some(20));
        assert_eq!(abandoned.log.duration_secs, Some(0));
    }
}
