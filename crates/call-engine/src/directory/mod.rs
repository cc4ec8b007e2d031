//! # Directory Model
//!
//! Entities the routing path reads: SIP servers, extensions
//! ([`InternalNumber`]), the per-user [`Account`] binding, hunt groups and
//! their members, routing rules, queue entries and call records.
//!
//! Records are loaded and written through
//! [`DatabaseManager`](crate::database::DatabaseManager); this module only
//! holds the types, admin write payloads and the extension allocator.

pub mod allocator;
pub mod inputs;
pub mod types;

pub use allocator::next_extension;
pub use inputs::{NewAccount, NewGroup, NewInternalNumber, NewRoutingRule, NewSipServer, NewUser};
pub use types::*;
