//! Persistence collaborator boundary.
//!
//! The delivery core reads and writes chats, messages, notifications and
//! notification settings through this trait; everything else about storage
//! (schema, pooling, migrations) stays behind it.
//!
//! # Features
//!
//! Exactly one backend must be enabled at compile time:
//!
//! - `memory` - In-memory store for single-node/development (default)
//! - `postgres` - PostgreSQL-backed store

#[cfg(feature = "postgres")]
mod postgres;

#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

#[cfg(feature = "memory")]
mod memory;

#[cfg(feature = "memory")]
pub use memory::MemoryStore;

use async_trait::async_trait;

use crate::model::{
    Chat, ChatId, Message, MessageId, NewMessage, NewNotification, Notification, NotificationId,
    NotificationSettings, UserId,
};

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

#[cfg(feature = "postgres")]
impl From<tokio_postgres::Error> for StoreError {
    fn from(err: tokio_postgres::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Persistence operations required by the delivery core.
///
/// Boolean-returning mutations report whether the call changed anything;
/// repeating them is always safe and never errors (idempotent against
/// duplicate delivery).
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Ensure a user row exists. Called on gateway admission.
    async fn upsert_user(&self, user_id: &UserId) -> Result<(), StoreError>;

    /// Find or create the unique private chat for an unordered user pair.
    ///
    /// Fails with `NotFound` if either user is unknown.
    async fn get_or_create_private_chat(
        &self,
        user_a: &UserId,
        user_b: &UserId,
    ) -> Result<Chat, StoreError>;

    /// Load a chat with its participant list.
    async fn load_chat(&self, chat_id: ChatId) -> Result<Chat, StoreError>;

    /// Load just the participant ids of a chat.
    async fn load_chat_members(&self, chat_id: ChatId) -> Result<Vec<UserId>, StoreError>;

    /// Persist a new message and bump the chat's `updated_at`.
    async fn save_message(&self, new: NewMessage) -> Result<Message, StoreError>;

    /// Messages of a chat, newest first, excluding soft-deleted ones.
    async fn messages_for(
        &self,
        chat_id: ChatId,
        skip: usize,
        take: usize,
    ) -> Result<Vec<Message>, StoreError>;

    /// Replace a message's content. Only the sender may edit; deleted
    /// messages cannot be edited. Returns whether anything changed.
    async fn update_message(
        &self,
        user_id: &UserId,
        message_id: MessageId,
        content: String,
    ) -> Result<bool, StoreError>;

    /// Soft-delete a message. Only the sender may delete.
    async fn delete_message(
        &self,
        user_id: &UserId,
        message_id: MessageId,
    ) -> Result<bool, StoreError>;

    /// Record a read receipt. Returns `true` only on the first transition;
    /// re-reading, reading your own message or an unknown id is a no-op.
    async fn mark_message_read(
        &self,
        user_id: &UserId,
        message_id: MessageId,
    ) -> Result<bool, StoreError>;

    /// Persist a new notification.
    async fn save_notification(&self, new: NewNotification) -> Result<Notification, StoreError>;

    /// A user's notifications, newest first.
    async fn notifications_for(
        &self,
        user_id: &UserId,
        skip: usize,
        take: usize,
    ) -> Result<Vec<Notification>, StoreError>;

    /// Mark one notification read. Recipient-scoped and idempotent.
    async fn mark_notification_read(
        &self,
        user_id: &UserId,
        notification_id: NotificationId,
    ) -> Result<bool, StoreError>;

    /// Mark all of a user's notifications read, returning how many changed.
    async fn mark_all_notifications_read(&self, user_id: &UserId) -> Result<u64, StoreError>;

    /// Count of unread notifications for a user.
    async fn unread_notification_count(&self, user_id: &UserId) -> Result<u64, StoreError>;

    /// Delete one notification. Recipient-scoped.
    async fn delete_notification(
        &self,
        user_id: &UserId,
        notification_id: NotificationId,
    ) -> Result<bool, StoreError>;

    /// Notification settings for a user, created lazily with defaults.
    async fn load_notification_settings(
        &self,
        user_id: &UserId,
    ) -> Result<NotificationSettings, StoreError>;

    /// Persist notification settings.
    async fn save_notification_settings(
        &self,
        settings: NotificationSettings,
    ) -> Result<(), StoreError>;
}
