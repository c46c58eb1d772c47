//! Domain model shared across the delivery core.
//!
//! Persisted entities (chats, messages, notifications) are owned by the
//! [`crate::store::ChatStore`] backend; presence entries live only in the
//! [`crate::presence::PresenceRegistry`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque user identifier, issued by the external auth collaborator.
pub type UserId = String;
/// Chat identifier, allocated by the store.
pub type ChatId = i64;
/// Message identifier, allocated by the store. Ascending within a chat.
pub type MessageId = i64;
/// Notification identifier, allocated by the store.
pub type NotificationId = i64;
/// Connection identifier, allocated by the session gateway. Unique per
/// physical channel for the lifetime of the process.
pub type ConnId = u64;

/// Maximum message content length in characters.
pub const MAX_MESSAGE_CHARS: usize = 2000;

/// User availability status.
///
/// `Busy` and `DoNotDisturb` are "sticky": they can only be entered and left
/// explicitly, never by the idle sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UserStatus {
    Offline,
    Online,
    Away,
    Busy,
    DoNotDisturb,
}

impl UserStatus {
    /// Whether this status survives the idle sweep and incidental activity.
    pub fn is_sticky(self) -> bool {
        matches!(self, UserStatus::Busy | UserStatus::DoNotDisturb)
    }
}

/// Message content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Text,
    Image,
    File,
    Video,
    Audio,
}

impl Default for MessageKind {
    fn default() -> Self {
        MessageKind::Text
    }
}

/// Chat type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    Private,
    Group,
}

/// A chat with its participant list.
///
/// A private chat has exactly two distinct participants and is unique per
/// unordered pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: ChatId,
    pub kind: ChatKind,
    pub name: Option<String>,
    pub image: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Participant user ids, most recently joined first.
    pub members: Vec<UserId>,
}

/// A persisted chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
    pub sent_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub edited_at: Option<DateTime<Utc>>,
    pub edited: bool,
    pub deleted: bool,
}

/// Input for [`crate::store::ChatStore::save_message`].
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
}

impl NewMessage {
    /// Plain text message with no file attachment.
    pub fn text(chat_id: ChatId, sender_id: impl Into<UserId>, content: impl Into<String>) -> Self {
        Self {
            chat_id,
            sender_id: sender_id.into(),
            content: content.into(),
            kind: MessageKind::Text,
            file_url: None,
            file_name: None,
            file_size: None,
        }
    }
}

/// A persisted notification for one recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub user_id: UserId,
    pub title: String,
    pub body: String,
    /// Type tag, e.g. "message" or "system".
    pub kind: String,
    /// Opaque payload forwarded to the client verbatim.
    pub data: Option<serde_json::Value>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

/// Input for [`crate::store::ChatStore::save_notification`].
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub user_id: UserId,
    pub title: String,
    pub body: String,
    pub kind: String,
    pub data: Option<serde_json::Value>,
}

/// Per-user notification preferences. Created lazily with all flags enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationSettings {
    pub user_id: UserId,
    pub enable_notifications: bool,
    pub enable_sound: bool,
    pub show_banner: bool,
    pub smart_notifications: bool,
}

impl NotificationSettings {
    /// Default settings for a user that has never saved any.
    pub fn defaults_for(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            enable_notifications: true,
            enable_sound: true,
            show_banner: true,
            smart_notifications: true,
        }
    }
}
