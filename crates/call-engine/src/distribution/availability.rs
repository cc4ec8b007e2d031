use dashmap::DashSet;
use tracing::debug;

use crate::directory::NumberId;

/// Device-state view fed by the signaling layer
///
/// Extensions marked busy here are skipped by every distribution strategy
/// and by queue drains until they are marked free again. Nothing is
/// persisted: after a restart every extension starts out free.
#[derive(Debug, Default)]
pub struct MemberAvailability {
    busy: DashSet<NumberId>,
}

impl MemberAvailability {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_busy(&self, number_id: NumberId) {
        if self.busy.insert(number_id) {
            debug!("Extension {} marked busy", number_id);
        }
    }

    pub fn mark_free(&self, number_id: NumberId) {
        if self.busy.remove(&number_id).is_some() {
            debug!("Extension {} marked free", number_id);
        }
    }

    pub fn is_busy(&self, number_id: NumberId) -> bool {
        self.busy.contains(&number_id)
    }

    pub fn busy_count(&self) -> usize {
        self.busy.len()
    }
}
