//! User presence registry.
//!
//! Owns the per-user status state machine and the index of live connections.
//! A user is Online iff at least one connection is registered, unless
//! explicitly overridden to Busy/DoNotDisturb; a user with zero connections
//! is always Offline.
//!
//! Mutations return [`StatusChange`] values instead of performing I/O; the
//! caller broadcasts them. Every mutation for one user happens under that
//! user's map entry guard, so the "was this the last connection?" check is
//! atomic with the removal itself.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::debug;

use crate::model::{ConnId, UserId, UserStatus};

/// A status transition to broadcast to all connected clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub user_id: UserId,
    pub status: UserStatus,
}

/// Per-user presence state. Created lazily on first connection, retained as
/// Offline after the last disconnect.
#[derive(Debug)]
struct PresenceEntry {
    status: UserStatus,
    connections: HashSet<ConnId>,
    last_seen: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

impl PresenceEntry {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            status: UserStatus::Offline,
            connections: HashSet::new(),
            last_seen: now,
            last_activity: now,
        }
    }
}

/// Presence store for a single cablegram node
pub struct PresenceRegistry {
    /// user -> presence entry
    entries: DashMap<UserId, PresenceEntry>,
    /// conn -> owning user (for unregister by connection id)
    owners: DashMap<ConnId, UserId>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            owners: DashMap::new(),
        }
    }

    /// Register a live connection for a user.
    ///
    /// Returns `Some(StatusChange)` when this is the user's first active
    /// connection (Offline → Online); a second device produces no event.
    pub fn register(&self, conn_id: ConnId, user_id: &str) -> Option<StatusChange> {
        self.owners.insert(conn_id, user_id.to_string());

        let now = Utc::now();
        let mut entry = self
            .entries
            .entry(user_id.to_string())
            .or_insert_with(|| PresenceEntry::new(now));

        entry.connections.insert(conn_id);
        entry.last_seen = now;
        entry.last_activity = now;

        if entry.status == UserStatus::Offline {
            entry.status = UserStatus::Online;
            debug!(conn_id, user_id, "first connection, user online");
            Some(StatusChange {
                user_id: user_id.to_string(),
                status: UserStatus::Online,
            })
        } else {
            debug!(conn_id, user_id, "additional connection registered");
            None
        }
    }

    /// Remove a live connection.
    ///
    /// Returns `Some(StatusChange)` when this was the user's last connection
    /// (any status → Offline); otherwise the status is left untouched.
    pub fn unregister(&self, conn_id: ConnId) -> Option<StatusChange> {
        let (_, user_id) = self.owners.remove(&conn_id)?;
        let mut entry = self.entries.get_mut(&user_id)?;

        entry.connections.remove(&conn_id);

        if entry.connections.is_empty() && entry.status != UserStatus::Offline {
            entry.status = UserStatus::Offline;
            entry.last_seen = Utc::now();
            debug!(conn_id, user_id, "last connection closed, user offline");
            Some(StatusChange {
                user_id: user_id.clone(),
                status: UserStatus::Offline,
            })
        } else {
            debug!(conn_id, user_id, "connection closed, other devices remain");
            None
        }
    }

    /// Explicit status override from the user.
    ///
    /// Only Online, Busy and DoNotDisturb are valid explicit targets; Away is
    /// reserved for the idle sweep and Offline for the connection lifecycle.
    /// Ignored entirely while the user has no live connections (Offline wins
    /// on an empty connection set).
    pub fn set_status(&self, user_id: &str, status: UserStatus) -> Option<StatusChange> {
        if matches!(status, UserStatus::Offline | UserStatus::Away) {
            debug!(user_id, ?status, "ignoring invalid explicit status");
            return None;
        }

        let mut entry = self.entries.get_mut(user_id)?;
        if entry.connections.is_empty() {
            debug!(user_id, ?status, "ignoring status push for disconnected user");
            return None;
        }

        let now = Utc::now();
        entry.status = status;
        entry.last_seen = now;
        entry.last_activity = now;

        Some(StatusChange {
            user_id: user_id.to_string(),
            status,
        })
    }

    /// Record user activity.
    ///
    /// Refreshes the activity timestamp and promotes Away back to Online.
    /// Sticky statuses are not touched.
    pub fn record_activity(&self, user_id: &str) -> Option<StatusChange> {
        let mut entry = self.entries.get_mut(user_id)?;
        entry.last_activity = Utc::now();

        if entry.status == UserStatus::Away {
            entry.status = UserStatus::Online;
            entry.last_seen = entry.last_activity;
            debug!(user_id, "activity resumed, user online");
            return Some(StatusChange {
                user_id: user_id.to_string(),
                status: UserStatus::Online,
            });
        }

        None
    }

    /// Demote idle Online users to Away, returning the transitions.
    ///
    /// Only plain Online users are examined; Offline, Busy and DoNotDisturb
    /// are never touched here.
    pub fn sweep_idle(&self, idle_after: Duration) -> Vec<StatusChange> {
        let now = Utc::now();
        let mut changes = Vec::new();

        for mut entry in self.entries.iter_mut() {
            if entry.status == UserStatus::Online && now - entry.last_activity >= idle_after {
                entry.status = UserStatus::Away;
                changes.push(StatusChange {
                    user_id: entry.key().clone(),
                    status: UserStatus::Away,
                });
            }
        }

        changes
    }

    /// Current status for a user; unknown users resolve to Offline.
    pub fn get_status(&self, user_id: &str) -> UserStatus {
        self.entries
            .get(user_id)
            .map(|entry| entry.status)
            .unwrap_or(UserStatus::Offline)
    }

    /// Statuses for a set of users; unknown ids resolve to Offline rather
    /// than failing.
    pub fn batch_get_status(&self, user_ids: &[UserId]) -> HashMap<UserId, UserStatus> {
        user_ids
            .iter()
            .map(|id| (id.clone(), self.get_status(id)))
            .collect()
    }

    /// Number of live connections for a user.
    pub fn connection_count(&self, user_id: &str) -> usize {
        self.entries
            .get(user_id)
            .map(|entry| entry.connections.len())
            .unwrap_or(0)
    }

    /// Backdate a user's activity timestamp (sweep tests).
    #[cfg(test)]
    pub(crate) fn backdate_activity(&self, user_id: &str, secs: i64) {
        if let Some(mut entry) = self.entries.get_mut(user_id) {
            entry.last_activity = entry.last_activity - Duration::seconds(secs);
        }
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_connection_goes_online() {
        let registry = PresenceRegistry::new();

        let change = registry.register(1, "user_42");
        assert_eq!(
            change,
            Some(StatusChange {
                user_id: "user_42".to_string(),
                status: UserStatus::Online,
            })
        );
        assert_eq!(registry.get_status("user_42"), UserStatus::Online);
    }

    #[test]
    fn test_multi_device_scenario() {
        let registry = PresenceRegistry::new();

        // conn1 connects: one Online broadcast
        assert!(registry.register(1, "user_42").is_some());
        // conn2 connects: no duplicate broadcast
        assert!(registry.register(2, "user_42").is_none());
        // conn1 disconnects: still Online, no broadcast
        assert!(registry.unregister(1).is_none());
        assert_eq!(registry.get_status("user_42"), UserStatus::Online);
        // conn2 disconnects: Offline broadcast once
        let change = registry.unregister(2).unwrap();
        assert_eq!(change.status, UserStatus::Offline);
        assert_eq!(registry.get_status("user_42"), UserStatus::Offline);
    }

    #[test]
    fn test_online_iff_connections_nonempty() {
        let registry = PresenceRegistry::new();

        for round in 0..3u64 {
            let conn = round + 1;
            registry.register(conn, "user_42");
            assert_eq!(registry.get_status("user_42"), UserStatus::Online);
            assert_eq!(registry.connection_count("user_42"), 1);
            registry.unregister(conn);
            assert_eq!(registry.get_status("user_42"), UserStatus::Offline);
            assert_eq!(registry.connection_count("user_42"), 0);
        }
    }

    #[test]
    fn test_sticky_status_survives_other_devices() {
        let registry = PresenceRegistry::new();

        registry.register(1, "user_42");
        registry.register(2, "user_42");
        registry.set_status("user_42", UserStatus::DoNotDisturb).unwrap();

        // Another device connects and disconnects: DND survives
        assert!(registry.register(3, "user_42").is_none());
        assert!(registry.unregister(3).is_none());
        assert_eq!(registry.get_status("user_42"), UserStatus::DoNotDisturb);

        // Last connection closes: Offline wins over DND
        registry.unregister(1);
        let change = registry.unregister(2).unwrap();
        assert_eq!(change.status, UserStatus::Offline);
    }

    #[test]
    fn test_explicit_busy_then_back_online() {
        let registry = PresenceRegistry::new();
        registry.register(1, "user_42");

        let change = registry.set_status("user_42", UserStatus::Busy).unwrap();
        assert_eq!(change.status, UserStatus::Busy);

        let change = registry.set_status("user_42", UserStatus::Online).unwrap();
        assert_eq!(change.status, UserStatus::Online);
    }

    #[test]
    fn test_status_push_ignored_when_disconnected() {
        let registry = PresenceRegistry::new();
        registry.register(1, "user_42");
        registry.unregister(1);

        assert!(registry.set_status("user_42", UserStatus::Busy).is_none());
        assert_eq!(registry.get_status("user_42"), UserStatus::Offline);
    }

    #[test]
    fn test_explicit_away_and_offline_rejected() {
        let registry = PresenceRegistry::new();
        registry.register(1, "user_42");

        assert!(registry.set_status("user_42", UserStatus::Away).is_none());
        assert!(registry.set_status("user_42", UserStatus::Offline).is_none());
        assert_eq!(registry.get_status("user_42"), UserStatus::Online);
    }

    #[test]
    fn test_idle_sweep_demotes_only_online() {
        let registry = PresenceRegistry::new();

        registry.register(1, "idler");
        registry.register(2, "busy_bee");
        registry.set_status("busy_bee", UserStatus::Busy);
        registry.register(3, "active");

        registry.backdate_activity("idler", 600);
        registry.backdate_activity("busy_bee", 600);

        let changes = registry.sweep_idle(Duration::seconds(300));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].user_id, "idler");
        assert_eq!(changes[0].status, UserStatus::Away);

        assert_eq!(registry.get_status("idler"), UserStatus::Away);
        assert_eq!(registry.get_status("busy_bee"), UserStatus::Busy);
        assert_eq!(registry.get_status("active"), UserStatus::Online);
    }

    #[test]
    fn test_activity_promotes_away_back() {
        let registry = PresenceRegistry::new();
        registry.register(1, "user_42");
        registry.backdate_activity("user_42", 600);
        registry.sweep_idle(Duration::seconds(300));
        assert_eq!(registry.get_status("user_42"), UserStatus::Away);

        let change = registry.record_activity("user_42").unwrap();
        assert_eq!(change.status, UserStatus::Online);

        // Fresh activity: next sweep leaves the user alone
        assert!(registry.sweep_idle(Duration::seconds(300)).is_empty());
    }

    #[test]
    fn test_activity_does_not_disturb_sticky() {
        let registry = PresenceRegistry::new();
        registry.register(1, "user_42");
        registry.set_status("user_42", UserStatus::DoNotDisturb);

        assert!(registry.record_activity("user_42").is_none());
        assert_eq!(registry.get_status("user_42"), UserStatus::DoNotDisturb);
    }

    #[test]
    fn test_unknown_users_resolve_offline() {
        let registry = PresenceRegistry::new();
        registry.register(1, "known");

        assert_eq!(registry.get_status("stranger"), UserStatus::Offline);

        let statuses = registry.batch_get_status(&[
            "known".to_string(),
            "stranger".to_string(),
        ]);
        assert_eq!(statuses["known"], UserStatus::Online);
        assert_eq!(statuses["stranger"], UserStatus::Offline);
    }

    #[test]
    fn test_unregister_unknown_connection() {
        let registry = PresenceRegistry::new();
        assert!(registry.unregister(999).is_none());
    }
}
