//! In-memory store backend.
//!
//! Single-node only, no persistence across restarts. Ideal for development
//! and tests; the delivery core cannot tell it apart from a real database.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::model::{
    Chat, ChatId, ChatKind, Message, MessageId, NewMessage, NewNotification, Notification,
    NotificationId, NotificationSettings, UserId, MAX_MESSAGE_CHARS,
};
use crate::store::{ChatStore, StoreError};

/// In-memory chat store
pub struct MemoryStore {
    users: DashMap<UserId, DateTime<Utc>>,
    chats: DashMap<ChatId, Chat>,
    messages: DashMap<MessageId, Message>,
    notifications: DashMap<NotificationId, Notification>,
    settings: DashMap<UserId, NotificationSettings>,
    next_chat_id: AtomicI64,
    next_message_id: AtomicI64,
    next_notification_id: AtomicI64,
    /// Serializes private-chat lookup+create so a concurrent pair of sends
    /// cannot create two chats for the same user pair.
    chat_create_lock: Mutex<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
            chats: DashMap::new(),
            messages: DashMap::new(),
            notifications: DashMap::new(),
            settings: DashMap::new(),
            next_chat_id: AtomicI64::new(0),
            next_message_id: AtomicI64::new(0),
            next_notification_id: AtomicI64::new(0),
            chat_create_lock: Mutex::new(()),
        }
    }

    fn find_private_chat(&self, user_a: &UserId, user_b: &UserId) -> Option<Chat> {
        self.chats
            .iter()
            .find(|chat| {
                chat.kind == ChatKind::Private
                    && chat.members.len() == 2
                    && chat.members.contains(user_a)
                    && chat.members.contains(user_b)
            })
            .map(|chat| chat.clone())
    }

    fn validate_content(content: &str) -> Result<(), StoreError> {
        if content.is_empty() {
            return Err(StoreError::Validation("empty message content".to_string()));
        }
        if content.chars().count() > MAX_MESSAGE_CHARS {
            return Err(StoreError::Validation(format!(
                "message content exceeds {} characters",
                MAX_MESSAGE_CHARS
            )));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn upsert_user(&self, user_id: &UserId) -> Result<(), StoreError> {
        self.users.entry(user_id.clone()).or_insert_with(Utc::now);
        Ok(())
    }

    async fn get_or_create_private_chat(
        &self,
        user_a: &UserId,
        user_b: &UserId,
    ) -> Result<Chat, StoreError> {
        if user_a == user_b {
            return Err(StoreError::Validation(
                "private chat requires two distinct users".to_string(),
            ));
        }
        for user in [user_a, user_b] {
            if !self.users.contains_key(user) {
                return Err(StoreError::not_found("user", user));
            }
        }

        let _guard = self.chat_create_lock.lock().await;

        if let Some(existing) = self.find_private_chat(user_a, user_b) {
            return Ok(existing);
        }

        let now = Utc::now();
        let chat = Chat {
            id: self.next_chat_id.fetch_add(1, Ordering::Relaxed) + 1,
            kind: ChatKind::Private,
            name: None,
            image: None,
            created_at: now,
            updated_at: now,
            members: vec![user_a.clone(), user_b.clone()],
        };
        self.chats.insert(chat.id, chat.clone());
        debug!(chat_id = chat.id, user_a, user_b, "private chat created");

        Ok(chat)
    }

    async fn load_chat(&self, chat_id: ChatId) -> Result<Chat, StoreError> {
        self.chats
            .get(&chat_id)
            .map(|chat| chat.clone())
            .ok_or_else(|| StoreError::not_found("chat", chat_id))
    }

    async fn load_chat_members(&self, chat_id: ChatId) -> Result<Vec<UserId>, StoreError> {
        self.chats
            .get(&chat_id)
            .map(|chat| chat.members.clone())
            .ok_or_else(|| StoreError::not_found("chat", chat_id))
    }

    async fn save_message(&self, new: NewMessage) -> Result<Message, StoreError> {
        Self::validate_content(&new.content)?;

        let mut chat = self
            .chats
            .get_mut(&new.chat_id)
            .ok_or_else(|| StoreError::not_found("chat", new.chat_id))?;

        let now = Utc::now();
        let message = Message {
            id: self.next_message_id.fetch_add(1, Ordering::Relaxed) + 1,
            chat_id: new.chat_id,
            sender_id: new.sender_id,
            content: new.content,
            kind: new.kind,
            file_url: new.file_url,
            file_name: new.file_name,
            file_size: new.file_size,
            sent_at: now,
            delivered_at: Some(now),
            read_at: None,
            edited_at: None,
            edited: false,
            deleted: false,
        };

        chat.updated_at = now;
        self.messages.insert(message.id, message.clone());

        Ok(message)
    }

    async fn messages_for(
        &self,
        chat_id: ChatId,
        skip: usize,
        take: usize,
    ) -> Result<Vec<Message>, StoreError> {
        if !self.chats.contains_key(&chat_id) {
            return Err(StoreError::not_found("chat", chat_id));
        }

        let mut messages: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| m.chat_id == chat_id && !m.deleted)
            .map(|m| m.clone())
            .collect();

        // Newest first; id breaks sent_at ties
        messages.sort_by(|a, b| b.sent_at.cmp(&a.sent_at).then(b.id.cmp(&a.id)));

        Ok(messages.into_iter().skip(skip).take(take).collect())
    }

    async fn update_message(
        &self,
        user_id: &UserId,
        message_id: MessageId,
        content: String,
    ) -> Result<bool, StoreError> {
        Self::validate_content(&content)?;

        let Some(mut message) = self.messages.get_mut(&message_id) else {
            return Ok(false);
        };
        if message.sender_id != *user_id || message.deleted {
            return Ok(false);
        }

        message.content = content;
        message.edited = true;
        message.edited_at = Some(Utc::now());
        Ok(true)
    }

    async fn delete_message(
        &self,
        user_id: &UserId,
        message_id: MessageId,
    ) -> Result<bool, StoreError> {
        let Some(mut message) = self.messages.get_mut(&message_id) else {
            return Ok(false);
        };
        if message.sender_id != *user_id {
            return Ok(false);
        }

        message.deleted = true;
        Ok(true)
    }

    async fn mark_message_read(
        &self,
        user_id: &UserId,
        message_id: MessageId,
    ) -> Result<bool, StoreError> {
        let Some(mut message) = self.messages.get_mut(&message_id) else {
            return Ok(false);
        };
        if message.sender_id == *user_id || message.read_at.is_some() {
            return Ok(false);
        }

        message.read_at = Some(Utc::now());
        Ok(true)
    }

    async fn save_notification(&self, new: NewNotification) -> Result<Notification, StoreError> {
        let notification = Notification {
            id: self.next_notification_id.fetch_add(1, Ordering::Relaxed) + 1,
            user_id: new.user_id,
            title: new.title,
            body: new.body,
            kind: new.kind,
            data: new.data,
            is_read: false,
            created_at: Utc::now(),
        };
        self.notifications.insert(notification.id, notification.clone());
        Ok(notification)
    }

    async fn notifications_for(
        &self,
        user_id: &UserId,
        skip: usize,
        take: usize,
    ) -> Result<Vec<Notification>, StoreError> {
        let mut notifications: Vec<Notification> = self
            .notifications
            .iter()
            .filter(|n| n.user_id == *user_id)
            .map(|n| n.clone())
            .collect();

        notifications.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        Ok(notifications.into_iter().skip(skip).take(take).collect())
    }

    async fn mark_notification_read(
        &self,
        user_id: &UserId,
        notification_id: NotificationId,
    ) -> Result<bool, StoreError> {
        let Some(mut notification) = self.notifications.get_mut(&notification_id) else {
            return Ok(false);
        };
        if notification.user_id != *user_id || notification.is_read {
            return Ok(false);
        }

        notification.is_read = true;
        Ok(true)
    }

    async fn mark_all_notifications_read(&self, user_id: &UserId) -> Result<u64, StoreError> {
        let mut changed = 0;
        for mut notification in self.notifications.iter_mut() {
            if notification.user_id == *user_id && !notification.is_read {
                notification.is_read = true;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn unread_notification_count(&self, user_id: &UserId) -> Result<u64, StoreError> {
        Ok(self
            .notifications
            .iter()
            .filter(|n| n.user_id == *user_id && !n.is_read)
            .count() as u64)
    }

    async fn delete_notification(
        &self,
        user_id: &UserId,
        notification_id: NotificationId,
    ) -> Result<bool, StoreError> {
        let removed = self
            .notifications
            .remove_if(&notification_id, |_, n| n.user_id == *user_id);
        Ok(removed.is_some())
    }

    async fn load_notification_settings(
        &self,
        user_id: &UserId,
    ) -> Result<NotificationSettings, StoreError> {
        let settings = self
            .settings
            .entry(user_id.clone())
            .or_insert_with(|| NotificationSettings::defaults_for(user_id.clone()));
        Ok(settings.clone())
    }

    async fn save_notification_settings(
        &self,
        settings: NotificationSettings,
    ) -> Result<(), StoreError> {
        self.settings.insert(settings.user_id.clone(), settings);
        Ok(())
    }
}
