//! # Call Orchestration
//!
//! The [`CallRouter`] ties the engine together. For each inbound call it
//!
//! 1. opens a call record in `ringing`,
//! 2. evaluates the active routing rules in priority order,
//! 3. carries out the matched rule (extension, group, external forward,
//!    announcement or hangup) or falls back to direct routing on the
//!    called number, and
//! 4. hands a [`RoutingDirective`] back to the signaling layer.
//!
//! Group routes go through the [`GroupDistributor`](crate::distribution::GroupDistributor);
//! when no member is free the caller is admitted to the group queue, or
//! turned away with `busy` when the queue is full.
//!
//! Status reports coming back from the signaling layer are merged into the
//! call record by [`lifecycle::apply_update`]. The merge only moves a call
//! forward, so duplicated or late reports leave the record and its
//! statistics unchanged and missed-call alerts fire once.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use crm_call_engine::prelude::*;
//!
//! # async fn example() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! let db = DatabaseManager::new_in_memory().await?;
//! let router = CallRouter::new(db, CallEngineConfig::default(), Arc::new(LogNotifier));
//!
//! let directive = router
//!     .handle_inbound_call(InboundCallEvent::new("+15551230000", "100"))
//!     .await?;
//! println!("{}", serde_json::to_string(&directive)?);
//!
//! router
//!     .update_status(&directive.session_id, StatusUpdate::new(CallStatus::NoAnswer))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod lifecycle;
pub mod types;

pub use core::CallRouter;
pub use lifecycle::{apply_update, derive_timings};
pub use types::{
    parse_timestamp, DirectiveAction, InboundCallEvent, RingTarget, RouteTargetType, RoutingDirective, StatusOutcome,
    StatusReport, StatusUpdate, Transition,
};
