//! Admin write payloads for the directory.
//!
//! Each `New*` struct carries the defaults the CRM admin screens use and a
//! `validate` that rejects records the routing path could not use safely.

use serde::{Deserialize, Serialize};

use super::types::{DistributionStrategy, GroupId, NumberId, RuleActionKind, ServerId, UserId};
use crate::error::{CallEngineError, Result};
use crate::routing::{compile_pattern, TimeCondition};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewUser {
    pub username: String,
    pub full_name: String,
    pub email: Option<String>,
    pub is_admin: bool,
}

impl NewUser {
    pub fn new(username: impl Into<String>, full_name: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            full_name: full_name.into(),
            email: None,
            is_admin: false,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn admin(mut self) -> Self {
        self.is_admin = true;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.username.trim().is_empty() {
            return Err(CallEngineError::validation("username cannot be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSipServer {
    pub name: String,
    pub host: String,
    pub websocket_uri: String,
    pub realm: Option<String>,
    pub proxy: Option<String>,
    pub register_expires: u32,
}

impl NewSipServer {
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        let host = host.into();
        Self {
            name: name.into(),
            websocket_uri: format!("wss://{}/ws", host),
            host,
            realm: None,
            proxy: None,
            register_expires: 600,
        }
    }

    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = Some(realm.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(CallEngineError::validation("SIP server host cannot be empty"));
        }
        if self.register_expires == 0 {
            return Err(CallEngineError::validation("register_expires must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewInternalNumber {
    pub server_id: ServerId,
    /// `None` asks the allocator for the next free extension.
    pub number: Option<String>,
    pub user_id: Option<UserId>,
    pub password: String,
    pub display_name: String,
}

impl NewInternalNumber {
    pub fn new(server_id: ServerId, number: impl Into<String>) -> Self {
        Self {
            server_id,
            number: Some(number.into()),
            user_id: None,
            password: String::new(),
            display_name: String::new(),
        }
    }

    /// Extension chosen by the allocator.
    pub fn allocated(server_id: ServerId) -> Self {
        Self {
            server_id,
            number: None,
            user_id: None,
            password: String::new(),
            display_name: String::new(),
        }
    }

    pub fn for_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(number) = &self.number {
            if number.trim().is_empty() {
                return Err(CallEngineError::validation("extension number cannot be empty"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAccount {
    pub user_id: UserId,
    pub internal_number_id: NumberId,
    pub external_caller_id: Option<String>,
    pub can_make_external_calls: bool,
    pub can_receive_external_calls: bool,
    pub call_recording_enabled: bool,
    pub voicemail_enabled: bool,
    pub voicemail_email: Option<String>,
    pub max_concurrent_calls: u32,
}

impl NewAccount {
    pub fn new(user_id: UserId, internal_number_id: NumberId) -> Self {
        Self {
            user_id,
            internal_number_id,
            external_caller_id: None,
            can_make_external_calls: true,
            can_receive_external_calls: true,
            call_recording_enabled: false,
            voicemail_enabled: true,
            voicemail_email: None,
            max_concurrent_calls: 2,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_calls == 0 {
            return Err(CallEngineError::validation("max_concurrent_calls must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewGroup {
    pub name: String,
    pub description: String,
    pub server_id: ServerId,
    pub strategy: DistributionStrategy,
    pub ring_timeout: u32,
    pub max_queue_size: u32,
    pub queue_timeout: u32,
}

impl NewGroup {
    pub fn new(name: impl Into<String>, server_id: ServerId) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            server_id,
            strategy: DistributionStrategy::RoundRobin,
            ring_timeout: 30,
            max_queue_size: 10,
            queue_timeout: 300,
        }
    }

    pub fn with_strategy(mut self, strategy: DistributionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_queue(mut self, max_queue_size: u32, queue_timeout: u32) -> Self {
        self.max_queue_size = max_queue_size;
        self.queue_timeout = queue_timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CallEngineError::validation("group name cannot be empty"));
        }
        if self.ring_timeout == 0 {
            return Err(CallEngineError::validation("ring_timeout must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRoutingRule {
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

impl NewRoutingRule {
    pub fn new(name: impl Into<String>, priority: i64, action: RuleActionKind) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            priority,
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

    pub fn route_to_number(name: impl Into<String>, priority: i64, number_id: NumberId) -> Self {
        let mut rule = Self::new(name, priority, RuleActionKind::RouteToNumber);
        rule.target_number_id = Some(number_id);
        rule
    }

    pub fn route_to_group(name: impl Into<String>, priority: i64, group_id: GroupId) -> Self {
        let mut rule = Self::new(name, priority, RuleActionKind::RouteToGroup);
        rule.target_group_id = Some(group_id);
        rule
    }

    pub fn forward_external(name: impl Into<String>, priority: i64, target: impl Into<String>) -> Self {
        let mut rule = Self::new(name, priority, RuleActionKind::ForwardExternal);
        rule.target_external = Some(target.into());
        rule
    }

    pub fn announcement(name: impl Into<String>, priority: i64, text: impl Into<String>) -> Self {
        let mut rule = Self::new(name, priority, RuleActionKind::PlayAnnouncement);
        rule.announcement_text = Some(text.into());
        rule
    }

    pub fn with_caller_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.caller_id_pattern = Some(pattern.into());
        self
    }

    pub fn with_called_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.called_number_pattern = Some(pattern.into());
        self
    }

    pub fn with_time_condition(mut self, condition: impl Into<String>) -> Self {
        self.time_condition = Some(condition.into());
        self
    }

    /// Rejects patterns and time conditions that could never be evaluated.
    ///
    /// A missing action target is accepted: such rules are stored, skipped
    /// while routing and reported by the health check.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CallEngineError::validation("rule name cannot be empty"));
        }
        for pattern in [&self.caller_id_pattern, &self.called_number_pattern]
            .into_iter()
            .flatten()
        {
            if !pattern.is_empty() {
                compile_pattern(pattern).map_err(|e| {
                    CallEngineError::validation(format!("invalid pattern {pattern:?}: {e}"))
                })?;
            }
        }
        if let Some(condition) = self.time_condition.as_deref().filter(|c| !c.trim().is_empty()) {
            TimeCondition::parse(condition)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_validation() {
        let ok = NewRoutingRule::route_to_group("vip", 1, 3)
            .with_caller_pattern(r"^\+1")
            .with_time_condition("weekdays 09:00-17:00");
        assert!(ok.validate().is_ok());

        let bad_regex = NewRoutingRule::route_to_group("broken", 1, 3).with_caller_pattern("([");
        assert!(matches!(bad_regex.validate(), Err(CallEngineError::Validation(_))));

        let bad_time = NewRoutingRule::route_to_group("late", 1, 3).with_time_condition("whenever");
        assert!(bad_time.validate().is_err());

        // Missing target is stored and flagged later.
        assert!(NewRoutingRule::new("orphan", 5, RuleActionKind::RouteToNumber).validate().is_ok());
    }

    #[test]
    fn test_group_defaults() {
        let group = NewGroup::new("Sales", 1);
        assert_eq!(group.ring_timeout, 30);
        assert_eq!(group.max_queue_size, 10);
        assert_eq!(group.queue_timeout, 300);
        assert_eq!(group.strategy, DistributionStrategy::RoundRobin);
    }
}
