//! Session gateway
//!
//! Central manager for live connections. Authenticates a connection before
//! admission, registers it with the presence registry, and exposes the only
//! push primitives the rest of the core may use to reach clients:
//! `send_to_user`, `send_to_group` and `broadcast_all`.
//!
//! Pushes are best-effort fire-and-forget: each connection owns an unbounded
//! outbound channel drained by the host's writer task, so one slow or broken
//! connection never stalls delivery to others.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::auth::{AuthError, TokenVerifier};
use crate::membership::ChatMembershipIndex;
use crate::model::{ChatId, ConnId, UserId};
use crate::presence::{PresenceRegistry, StatusChange};
use crate::protocol::{ServerEvent, encode_event};

/// A live, authenticated connection
pub struct Connection {
    pub conn_id: ConnId,
    pub user_id: UserId,
    pub connected_at: DateTime<Utc>,
    /// Outbound payloads, drained by the host's writer task
    sender: mpsc::UnboundedSender<Vec<u8>>,
}

/// Session gateway for a single cablegram node
pub struct SessionGateway {
    verifier: TokenVerifier,
    presence: Arc<PresenceRegistry>,
    membership: Arc<ChatMembershipIndex>,
    /// All connections by connection ID
    connections: DashMap<ConnId, Connection>,
    /// User to connection IDs (for multi-device)
    by_user: DashMap<UserId, Vec<ConnId>>,
    next_conn_id: AtomicU64,
}

impl SessionGateway {
    pub fn new(
        verifier: TokenVerifier,
        presence: Arc<PresenceRegistry>,
        membership: Arc<ChatMembershipIndex>,
    ) -> Self {
        Self {
            verifier,
            presence,
            membership,
            connections: DashMap::new(),
            by_user: DashMap::new(),
            next_conn_id: AtomicU64::new(0),
        }
    }

    /// Authenticate and admit a connection.
    ///
    /// Returns the allocated connection id, the authenticated user, and the
    /// presence transition to broadcast (Some only for the user's first
    /// connection).
    pub fn connect(
        &self,
        token: &str,
        sender: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<(ConnId, UserId, Option<StatusChange>), AuthError> {
        let user_id = self.verifier.verify(token)?;
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;

        self.connections.insert(
            conn_id,
            Connection {
                conn_id,
                user_id: user_id.clone(),
                connected_at: Utc::now(),
                sender,
            },
        );
        self.by_user.entry(user_id.clone()).or_default().push(conn_id);

        let change = self.presence.register(conn_id, &user_id);
        debug!(conn_id, user_id, "connection admitted");

        Ok((conn_id, user_id, change))
    }

    /// Tear down a connection (clean close or abrupt transport loss).
    ///
    /// Returns the presence transition to broadcast (Some only when this was
    /// the user's last connection).
    pub fn disconnect(&self, conn_id: ConnId) -> Option<StatusChange> {
        self.membership.remove_connection(conn_id);

        if let Some((_, connection)) = self.connections.remove(&conn_id) {
            if let Some(mut conns) = self.by_user.get_mut(&connection.user_id) {
                conns.retain(|&id| id != conn_id);
            }
            self.by_user
                .remove_if(&connection.user_id, |_, conns| conns.is_empty());
            debug!(conn_id, user_id = %connection.user_id, "connection removed");
        }

        self.presence.unregister(conn_id)
    }

    /// The user owning a connection, if it is still live.
    pub fn connection_user(&self, conn_id: ConnId) -> Option<UserId> {
        self.connections
            .get(&conn_id)
            .map(|conn| conn.user_id.clone())
    }

    /// Push an event to one connection.
    pub fn send_to_conn(&self, conn_id: ConnId, event: &ServerEvent) {
        self.push(conn_id, encode_event(event));
    }

    /// Push an event to every live connection of one user.
    pub fn send_to_user(&self, user_id: &str, event: &ServerEvent) {
        let Some(conns) = self.by_user.get(user_id).map(|c| c.clone()) else {
            return;
        };

        let payload = encode_event(event);
        for conn_id in conns {
            self.push(conn_id, payload.clone());
        }
    }

    /// Push an event to every connection subscribed to a chat's group,
    /// optionally excluding one user's connections (typically the sender).
    pub fn send_to_group(&self, chat_id: ChatId, event: &ServerEvent, exclude_user: Option<&str>) {
        let subscribers = self.membership.group_connections(chat_id);
        if subscribers.is_empty() {
            return;
        }

        let payload = encode_event(event);
        let mut receivers = 0;
        for (conn_id, user_id) in subscribers {
            if exclude_user.is_some_and(|excluded| excluded == user_id) {
                continue;
            }
            self.push(conn_id, payload.clone());
            receivers += 1;
        }

        debug!(chat_id, receivers, "group push sent");
    }

    /// Push an event to every live connection, unscoped.
    pub fn broadcast_all(&self, event: &ServerEvent) {
        let payload = encode_event(event);
        for connection in self.connections.iter() {
            if connection.sender.send(payload.clone()).is_err() {
                debug!(conn_id = connection.conn_id, "push to closed connection dropped");
            }
        }
    }

    /// Connection count across all users.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn push(&self, conn_id: ConnId, payload: Vec<u8>) {
        if let Some(connection) = self.connections.get(&conn_id)
            && connection.sender.send(payload).is_err()
        {
            // Receiver already dropped; the reader task will run disconnect
            debug!(conn_id, "push to closed connection dropped");
        }
    }
}

impl std::fmt::Debug for SessionGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGateway")
            .field("connections", &self.connections.len())
            .field("users", &self.by_user.len())
            .finish()
    }
}
