//! # Call Queue Management
//!
//! Callers routed to a group with no free member wait in that group's
//! queue. The queue is strictly FIFO by arrival, bounded by the group's
//! `max_queue_size`, and each waiting caller carries a 1-based position and
//! an estimated wait.
//!
//! ```text
//!  admit ──► waiting ──► connecting ──► connected
//!               │
//!               ├──► timeout     (waited past queue_timeout)
//!               └──► abandoned   (caller hung up)
//! ```
//!
//! The [`CallRouter`](crate::orchestrator::CallRouter) owns the call-record
//! side of these transitions; this module only moves queue entries.

pub mod manager;

pub use manager::{DrainAction, QueueManager, QueueSnapshot, QueueStats};
