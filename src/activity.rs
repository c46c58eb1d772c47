//! Activity monitor
//!
//! Tracks user activity through the presence registry and runs the periodic
//! idle sweep. The sweep is the only automatic status mutation in the
//! system: it demotes idle plain-Online users to Away and never touches
//! Offline, Busy or DoNotDisturb users.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::delivery::DeliveryCoordinator;
use crate::presence::PresenceRegistry;

/// Activity monitor for a single cablegram node
pub struct ActivityMonitor {
    presence: Arc<PresenceRegistry>,
    delivery: Arc<DeliveryCoordinator>,
    idle_after: chrono::Duration,
}

impl ActivityMonitor {
    pub fn new(
        presence: Arc<PresenceRegistry>,
        delivery: Arc<DeliveryCoordinator>,
        idle_after_secs: u64,
    ) -> Self {
        Self {
            presence,
            delivery,
            idle_after: chrono::Duration::seconds(idle_after_secs as i64),
        }
    }

    /// Record user activity; promotes Away users back to Online and
    /// broadcasts the transition.
    pub fn record_activity(&self, user_id: &str) {
        if let Some(change) = self.presence.record_activity(user_id) {
            self.delivery.deliver_status_change(&change);
        }
    }

    /// Run one idle sweep, broadcasting every demotion.
    pub fn sweep(&self) {
        let changes = self.presence.sweep_idle(self.idle_after);
        for change in &changes {
            self.delivery.deliver_status_change(change);
        }
        if !changes.is_empty() {
            debug!(demoted = changes.len(), "idle sweep demoted users");
        }
    }
}

/// Spawn the periodic idle sweep task
pub fn spawn_sweep_task(monitor: Arc<ActivityMonitor>, check_interval: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(check_interval);
        loop {
            interval.tick().await;
            monitor.sweep();
        }
    });
}
