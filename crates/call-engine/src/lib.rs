//! # CRM Call Engine
//!
//! Inbound call routing, hunt-group distribution and queueing for a CRM
//! telephony stack. The engine sits behind the SIP signaling layer: the
//! signaling layer reports new calls and status changes, the engine answers
//! with routing directives and keeps the call records, queues and
//! statistics.
//!
//! ## Components
//!
//! - [`directory`]: servers, extensions, accounts, groups and routing rules
//! - [`routing`]: first-match rule evaluation with caller/called patterns
//!   and time-of-day windows
//! - [`distribution`]: picking a free group member per strategy
//!   (round robin, random, priority, all ring)
//! - [`queue`]: per-group FIFO queues with wait estimates and timeouts
//! - [`orchestrator`]: the [`CallRouter`] and the call record state machine
//! - [`monitoring`]: notifications, statistics and health reports
//! - [`server`]: the router with its background loops
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use crm_call_engine::prelude::*;
//!
//! # async fn example() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! let mut server = CallEngineServerBuilder::new()
//!     .with_config(CallEngineConfig::default())
//!     .with_database_url("sqlite://call_engine.db")
//!     .build()
//!     .await?;
//! server.start().await?;
//!
//! let router = server.router();
//! let directive = router
//!     .handle_inbound_call(InboundCallEvent::new("+15551230000", "5000"))
//!     .await?;
//! println!("{} -> {}", directive.session_id, directive.action.name());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod database;
pub mod directory;
pub mod distribution;
pub mod error;
pub mod logging;
pub mod monitoring;
pub mod orchestrator;
pub mod queue;
pub mod routing;
pub mod server;

#[cfg(test)]
mod test_support;

pub use config::CallEngineConfig;
pub use database::DatabaseManager;
pub use error::{CallEngineError, Result};
pub use orchestrator::CallRouter;
pub use server::{CallEngineServer, CallEngineServerBuilder};

pub mod prelude {
    pub use crate::config::CallEngineConfig;
    pub use crate::database::{DatabaseManager, StatsFilter};
    pub use crate::directory::{
        CallLog, CallStatus, DistributionStrategy, NewAccount, NewGroup, NewInternalNumber, NewRoutingRule,
        NewSipServer, NewUser, QueueStatus,
    };
    pub use crate::error::{CallEngineError, Result};
    pub use crate::monitoring::{
        BroadcastNotifier, LogNotifier, Notification, NotificationKind, Notifier, Severity,
    };
    pub use crate::orchestrator::{
        CallRouter, DirectiveAction, InboundCallEvent, RoutingDirective, StatusReport, StatusUpdate,
    };
    pub use crate::server::{CallEngineServer, CallEngineServerBuilder};
}

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
