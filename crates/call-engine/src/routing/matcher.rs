use std::collections::HashMap;

use chrono::NaiveDateTime;
use parking_lot::RwLock;
use regex::Regex;
use tracing::{debug, warn};

use super::time_condition::TimeCondition;
use crate::directory::{RoutingRule, RuleAction};

/// Compile a rule pattern. Patterns are anchored at the start of the input
/// only, so `^\+1` and `\+1` behave the same and `555` does not match
/// `+1555...`.
pub fn compile_pattern(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{})", pattern))
}

/// The rule selected for a call and the action to execute
#[derive(Debug, Clone, PartialEq)]
pub struct RuleMatch<'a> {
    pub rule: &'a RoutingRule,
    pub action: RuleAction,
}

/// Selects the first applicable routing rule for a call
///
/// Evaluation has no side effects on the rules; compiled patterns and parsed
/// time conditions are memoized by their source text. Patterns or conditions
/// that fail to compile never match.
#[derive(Debug, Default)]
pub struct RuleMatcher {
    patterns: RwLock<HashMap<String, Option<Regex>>>,
    conditions: RwLock<HashMap<String, Option<TimeCondition>>>,
}

impl RuleMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// First active rule, by ascending priority (id breaks ties), whose
    /// conditions all hold and whose action has a usable target.
    ///
    /// `now` is local wall-clock time for the time condition.
    pub fn match_rule<'a>(
        &self,
        rules: &'a [RoutingRule],
        caller_id: &str,
        called_number: &str,
        now: NaiveDateTime,
    ) -> Option<RuleMatch<'a>> {
        let mut ordered: Vec<&RoutingRule> = rules.iter().filter(|r| r.active).collect();
        ordered.sort_by_key(|r| (r.priority, r.id));

        for rule in ordered {
            if !self.conditions_hold(rule, caller_id, called_number, now) {
                continue;
            }
            match rule.action() {
                Some(action) => {
                    debug!("Rule {} ({}) matched {} -> {}", rule.id, rule.name, caller_id, called_number);
                    return Some(RuleMatch { rule, action });
                }
                None => {
                    warn!(
                        "Rule {} ({}) matched but its {} target is missing or inactive, skipping",
                        rule.id,
                        rule.name,
                        rule.action.as_str()
                    );
                }
            }
        }
        None
    }

    /// Whether every condition configured on `rule` holds. Empty or absent
    /// conditions are ignored.
    pub fn conditions_hold(
        &self,
        rule: &RoutingRule,
        caller_id: &str,
        called_number: &str,
        now: NaiveDateTime,
    ) -> bool {
        if let Some(pattern) = non_empty(&rule.caller_id_pattern) {
            if !self.pattern_matches(pattern, caller_id) {
                return false;
            }
        }
        if let Some(pattern) = non_empty(&rule.called_number_pattern) {
            if !self.pattern_matches(pattern, called_number) {
                return false;
            }
        }
        if let Some(condition) = non_empty(&rule.time_condition) {
            if !self.condition_holds(condition, now) {
                return false;
            }
        }
        true
    }

    fn pattern_matches(&self, pattern: &str, input: &str) -> bool {
        if let Some(compiled) = self.patterns.read().get(pattern) {
            return compiled.as_ref().map_or(false, |re| re.is_match(input));
        }

        let compiled = match compile_pattern(pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!("Invalid rule pattern {:?}, treating as non-matching: {}", pattern, e);
                None
            }
        };
        let matched = compiled.as_ref().map_or(false, |re| re.is_match(input));
        self.patterns.write().insert(pattern.to_string(), compiled);
        matched
    }

    fn condition_holds(&self, condition: &str, now: NaiveDateTime) -> bool {
        if let Some(parsed) = self.conditions.read().get(condition) {
            return parsed.map_or(false, |c| c.holds_at(now));
        }

        let parsed = match TimeCondition::parse(condition) {
            Ok(c) => Some(c),
            Err(e) => {
                warn!("Unparseable time condition, rule will not match: {}", e);
                None
            }
        };
        let holds = parsed.map_or(false, |c| c.holds_at(now));
        self.conditions.write().insert(condition.to_string(), parsed);
        holds
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::RuleActionKind;
    use chrono::NaiveDate;

    fn monday_at(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(hour, 0, 0).unwrap()
    }

    fn group_rule(id: i64, priority: i64, group: i64) -> RoutingRule {
        RoutingRule {
            id,
            name: format!("rule-{id}"),
            description: String::new(),
            priority,
            caller_id_pattern: None,
            called_number_pattern: None,
            time_condition: None,
            action: RuleActionKind::RouteToGroup,
            target_number_id: None,
            target_group_id: Some(group),
            target_external: None,
            announcement_text: None,
            active: true,
        }
    }

    #[test]
    fn test_lowest_priority_value_wins() {
        let matcher = RuleMatcher::new();
        let rules = vec![group_rule(1, 20, 100), group_rule(2, 5, 200), group_rule(3, 5, 300)];
        let hit = matcher.match_rule(&rules, "+15550001", "1000", monday_at(10)).unwrap();
        assert_eq!(hit.rule.id, 2);
        assert_eq!(hit.action, RuleAction::RouteToGroup(200));
    }

    #[test]
    fn test_adding_higher_priority_rule_changes_result() {
        let matcher = RuleMatcher::new();
        let mut rules = vec![group_rule(1, 10, 100)];
        assert_eq!(matcher.match_rule(&rules, "a", "b", monday_at(10)).unwrap().rule.id, 1);

        rules.push(group_rule(2, 1, 200));
        assert_eq!(matcher.match_rule(&rules, "a", "b", monday_at(10)).unwrap().rule.id, 2);
    }

    #[test]
    fn test_pattern_anchored_at_start() {
        let matcher = RuleMatcher::new();
        let mut rule = group_rule(1, 1, 100);
        rule.caller_id_pattern = Some(r"^\+1".to_string());
        let rules = vec![rule];

        assert!(matcher.match_rule(&rules, "+15551234", "1000", monday_at(10)).is_some());
        assert!(matcher.match_rule(&rules, "+445551234", "1000", monday_at(10)).is_none());

        let mut unanchored = group_rule(2, 1, 100);
        unanchored.called_number_pattern = Some("555".to_string());
        let rules = vec![unanchored];
        assert!(matcher.match_rule(&rules, "x", "5550000", monday_at(10)).is_some());
        assert!(matcher.match_rule(&rules, "x", "+15550000", monday_at(10)).is_none());
    }

    #[test]
    fn test_empty_caller_only_matches_empty_pattern() {
        let matcher = RuleMatcher::new();
        let mut rule = group_rule(1, 1, 100);
        rule.caller_id_pattern = Some(String::new());
        assert!(matcher.match_rule(&[rule], "", "1000", monday_at(10)).is_some());

        let mut rule = group_rule(1, 1, 100);
        rule.caller_id_pattern = Some(r"\d+".to_string());
        assert!(matcher.match_rule(&[rule], "", "1000", monday_at(10)).is_none());
    }

    #[test]
    fn test_invalid_pattern_never_matches() {
        let matcher = RuleMatcher::new();
        let mut broken = group_rule(1, 1, 100);
        broken.caller_id_pattern = Some("([".to_string());
        let fallback = group_rule(2, 2, 200);
        let rules = vec![broken, fallback];
        // Evaluated twice to exercise the memoized failure.
        for _ in 0..2 {
            assert_eq!(matcher.match_rule(&rules, "+1", "1", monday_at(10)).unwrap().rule.id, 2);
        }
    }

    #[test]
    fn test_time_condition_fails_closed() {
        let matcher = RuleMatcher::new();
        let mut hours = group_rule(1, 1, 100);
        hours.time_condition = Some("weekdays 09:00-17:00".to_string());
        let mut garbled = group_rule(2, 2, 200);
        garbled.time_condition = Some("business hours".to_string());
        let rules = vec![hours, garbled];

        assert_eq!(matcher.match_rule(&rules, "a", "b", monday_at(10)).unwrap().rule.id, 1);
        assert!(matcher.match_rule(&rules, "a", "b", monday_at(20)).is_none());
    }

    #[test]
    fn test_skips_rule_without_target_and_inactive_rules() {
        let matcher = RuleMatcher::new();
        let mut orphan = group_rule(1, 1, 0);
        orphan.target_group_id = None;
        let mut disabled = group_rule(2, 2, 200);
        disabled.active = false;
        let live = group_rule(3, 3, 300);
        let rules = vec![orphan, disabled, live];

        assert_eq!(matcher.match_rule(&rules, "a", "b", monday_at(10)).unwrap().rule.id, 3);
    }
}
