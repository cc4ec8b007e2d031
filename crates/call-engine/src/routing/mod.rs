//! # Call Routing Rules
//!
//! This module decides which routing rule, if any, applies to an inbound
//! call. Rules are evaluated in ascending `priority` order and the first
//! rule whose conditions all hold wins; later rules are not consulted.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Incoming Call                            │
//! │        (caller id, called number, local time)               │
//! └─────────────────────────┬───────────────────────────────────┘
//!                           │
//! ┌─────────────────────────▼───────────────────────────────────┐
//! │                    Rule Matcher                             │
//! │  - active rules, ascending priority                         │
//! │  - caller / called patterns (anchored at start)             │
//! │  - day-of-week / time-of-day window                         │
//! │  - rules without a usable target are skipped                │
//! └─────────────────────────┬───────────────────────────────────┘
//!                           │
//!           ┌───────────────┼───────────────┐
//!           │               │               │
//! ┌─────────▼─────────┐ ┌───▼──────────┐ ┌──▼──────────────┐
//! │ Extension / Group │ │  External    │ │ Announcement /  │
//! │                   │ │  forward     │ │ Hangup          │
//! └───────────────────┘ └──────────────┘ └─────────────────┘
//! ```
//!
//! When no rule applies the [`CallRouter`](crate::orchestrator::CallRouter)
//! falls back to direct routing on the dialed extension.
//!
//! ## Conditions
//!
//! - **Caller pattern** / **called pattern**: regular expressions matched
//!   from the first character of the input. Empty patterns are ignored.
//! - **Time condition**: see [`TimeCondition`] for the grammar. Anything
//!   that does not parse makes the rule non-matching.

pub mod matcher;
pub mod time_condition;

pub use matcher::{compile_pattern, RuleMatch, RuleMatcher};
pub use time_condition::TimeCondition;
