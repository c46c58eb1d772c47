//! Chat membership index and live group subscriptions.
//!
//! Authoritative for two questions: which users belong to a chat (cached
//! from the store for the lifetime of active subscriptions), and which
//! connections currently want live updates for a chat. Message fan-out
//! security rests on `join_group` validating membership instead of assuming
//! it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::model::{ChatId, ConnId, UserId};
use crate::store::{ChatStore, StoreError};

/// Chat membership index for a single cablegram node
pub struct ChatMembershipIndex {
    store: Arc<dyn ChatStore>,
    /// chat -> cached participant set
    members: DashMap<ChatId, Arc<HashSet<UserId>>>,
    /// chat -> (conn -> owning user) live subscriptions
    groups: DashMap<ChatId, HashMap<ConnId, UserId>>,
    /// conn -> chats it subscribed to (for disconnect cleanup)
    conn_chats: DashMap<ConnId, HashSet<ChatId>>,
}

impl ChatMembershipIndex {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self {
            store,
            members: DashMap::new(),
            groups: DashMap::new(),
            conn_chats: DashMap::new(),
        }
    }

    /// Participant set of a chat, from cache or the store.
    pub async fn members(&self, chat_id: ChatId) -> Result<Arc<HashSet<UserId>>, StoreError> {
        if let Some(cached) = self.members.get(&chat_id) {
            return Ok(cached.clone());
        }

        let list = self.store.load_chat_members(chat_id).await?;
        let set: Arc<HashSet<UserId>> = Arc::new(list.into_iter().collect());
        self.members.insert(chat_id, set.clone());
        Ok(set)
    }

    /// Drop the cached participant set (membership change hook).
    pub fn invalidate(&self, chat_id: ChatId) {
        self.members.remove(&chat_id);
    }

    /// Subscribe a connection to a chat's live-update group.
    ///
    /// Validates that the connection's user is a member; a non-member join
    /// is a silent no-op and returns `false`. An unknown chat behaves the
    /// same way.
    pub async fn join_group(
        &self,
        conn_id: ConnId,
        user_id: &str,
        chat_id: ChatId,
    ) -> Result<bool, StoreError> {
        let members = match self.members(chat_id).await {
            Ok(members) => members,
            Err(StoreError::NotFound { .. }) => {
                debug!(conn_id, user_id, chat_id, "join refused, unknown chat");
                return Ok(false);
            }
            Err(err) => return Err(err),
        };

        if !members.contains(user_id) {
            debug!(conn_id, user_id, chat_id, "join refused, not a member");
            return Ok(false);
        }

        self.groups
            .entry(chat_id)
            .or_default()
            .insert(conn_id, user_id.to_string());
        self.conn_chats.entry(conn_id).or_default().insert(chat_id);

        debug!(conn_id, user_id, chat_id, "joined chat group");
        Ok(true)
    }

    /// Remove a connection's subscription to one chat.
    pub fn leave_group(&self, conn_id: ConnId, chat_id: ChatId) {
        if let Some(mut group) = self.groups.get_mut(&chat_id) {
            group.remove(&conn_id);
        }
        if let Some(mut chats) = self.conn_chats.get_mut(&conn_id) {
            chats.remove(&chat_id);
        }

        self.cleanup_group(chat_id);
        debug!(conn_id, chat_id, "left chat group");
    }

    /// Remove every subscription of a connection (disconnect path).
    pub fn remove_connection(&self, conn_id: ConnId) {
        let Some((_, chats)) = self.conn_chats.remove(&conn_id) else {
            return;
        };

        for chat_id in chats {
            if let Some(mut group) = self.groups.get_mut(&chat_id) {
                group.remove(&conn_id);
            }
            self.cleanup_group(chat_id);
        }

        debug!(conn_id, "removed all group subscriptions");
    }

    /// Whether a user has at least one connection subscribed to the chat's
    /// group. Drives smart-notification suppression.
    pub fn is_user_active_in_chat(&self, user_id: &str, chat_id: ChatId) -> bool {
        self.groups
            .get(&chat_id)
            .map(|group| group.values().any(|u| u == user_id))
            .unwrap_or(false)
    }

    /// Live subscriber connections of a chat with their owning users.
    pub fn group_connections(&self, chat_id: ChatId) -> Vec<(ConnId, UserId)> {
        self.groups
            .get(&chat_id)
            .map(|group| {
                group
                    .iter()
                    .map(|(conn_id, user_id)| (*conn_id, user_id.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Subscriber count for a chat's group.
    pub fn subscriber_count(&self, chat_id: ChatId) -> usize {
        self.groups
            .get(&chat_id)
            .map(|group| group.len())
            .unwrap_or(0)
    }

    /// Drop empty group entries and their member cache.
    fn cleanup_group(&self, chat_id: ChatId) {
        let emptied = self
            .groups
            .remove_if(&chat_id, |_, group| group.is_empty())
            .is_some();
        if emptied {
            // No live subscribers left, the cache has no lifetime to track
            self.members.remove(&chat_id);
            debug!(chat_id, "removed empty chat group");
        }
    }
}
