//! Per-instance refire suppression

use cm_core::TriggerMapping;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Last activation time of each trigger instance
///
/// Owned by the [`ProfileManager`](crate::ProfileManager) and cleared when
/// profiles reload.
#[derive(Debug, Default)]
pub struct CooldownTable {
    last: DashMap<TriggerMapping, Instant>,
}

impl CooldownTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `mapping` may fire now; if so, start its window
    ///
    /// A suppressed fire does not extend the window.
    pub fn check_and_mark(&self, mapping: &TriggerMapping, window: Duration) -> bool {
        let now = Instant::now();
        match self.last.entry(mapping.clone()) {
            Entry::Occupied(mut last) => {
                if now.duration_since(*last.get()) < window {
                    trace!(mapping = %mapping, "Suppressed by cooldown");
                    false
                } else {
                    last.insert(now);
                    true
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    pub fn remove(&self, mapping: &TriggerMapping) -> bool {
        self.last.remove(mapping).is_some()
    }

    pub fn clear(&self) {
        self.last.clear();
    }

    pub fn len(&self) -> usize {
        self.last.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}
