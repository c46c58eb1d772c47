//! PostgreSQL store backend.
//!
//! A single connection guarded by a mutex; statements never interleave, so
//! multi-statement operations (chat creation, message save + chat touch) stay
//! consistent without explicit transactions.

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls, Row};
use tracing::debug;

use crate::model::{
    Chat, ChatId, ChatKind, MAX_MESSAGE_CHARS, Message, MessageId, MessageKind, NewMessage,
    NewNotification, Notification, NotificationId, NotificationSettings, UserId,
};
use crate::store::{ChatStore, StoreError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id          TEXT PRIMARY KEY,
    created_at  TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS chats (
    id          BIGSERIAL PRIMARY KEY,
    kind        TEXT NOT NULL,
    name        TEXT,
    image       TEXT,
    created_at  TIMESTAMPTZ NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS chat_members (
    chat_id     BIGINT NOT NULL REFERENCES chats(id),
    user_id     TEXT NOT NULL REFERENCES users(id),
    joined_at   TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (chat_id, user_id)
);
CREATE TABLE IF NOT EXISTS messages (
    id           BIGSERIAL PRIMARY KEY,
    chat_id      BIGINT NOT NULL REFERENCES chats(id),
    sender_id    TEXT NOT NULL REFERENCES users(id),
    content      TEXT NOT NULL,
    kind         TEXT NOT NULL,
    file_url     TEXT,
    file_name    TEXT,
    file_size    BIGINT,
    sent_at      TIMESTAMPTZ NOT NULL,
    delivered_at TIMESTAMPTZ,
    read_at      TIMESTAMPTZ,
    edited_at    TIMESTAMPTZ,
    edited       BOOLEAN NOT NULL DEFAULT FALSE,
    deleted      BOOLEAN NOT NULL DEFAULT FALSE
);
CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages (chat_id, sent_at DESC, id DESC);
CREATE TABLE IF NOT EXISTS notifications (
    id          BIGSERIAL PRIMARY KEY,
    user_id     TEXT NOT NULL REFERENCES users(id),
    title       TEXT NOT NULL,
    body        TEXT NOT NULL,
    kind        TEXT NOT NULL,
    data        JSONB,
    is_read     BOOLEAN NOT NULL DEFAULT FALSE,
    created_at  TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications (user_id, created_at DESC);
CREATE TABLE IF NOT EXISTS notification_settings (
    user_id              TEXT PRIMARY KEY REFERENCES users(id),
    enable_notifications BOOLEAN NOT NULL,
    enable_sound         BOOLEAN NOT NULL,
    show_banner          BOOLEAN NOT NULL,
    smart_notifications  BOOLEAN NOT NULL
);
";

/// PostgreSQL-backed chat store
pub struct PostgresStore {
    client: Mutex<Client>,
}

impl PostgresStore {
    /// Connect and ensure the schema exists
    ///
    /// # Arguments
    /// * `database_url` - PostgreSQL connection string
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls).await?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("store connection error: {}", e);
            }
        });

        client.batch_execute(SCHEMA).await?;
        debug!("store schema ensured");

        Ok(Self {
            client: Mutex::new(client),
        })
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

    async fn load_chat_with(client: &Client, chat_id: ChatId) -> Result<Chat, StoreError> {
        let row = client
            .query_opt(
                "SELECT id, kind, name, image, created_at, updated_at FROM chats WHERE id = $1",
                &[&chat_id],
            )
            .await?
            .ok_or_else(|| StoreError::not_found("chat", chat_id))?;

        let members = client
            .query(
                "SELECT user_id FROM chat_members WHERE chat_id = $1 ORDER BY joined_at DESC",
                &[&chat_id],
            )
            .await?
            .into_iter()
            .map(|r| r.get(0))
            .collect();

        Ok(Chat {
            id: row.get(0),
            kind: chat_kind_from_str(row.get(1))?,
            name: row.get(2),
            image: row.get(3),
            created_at: row.get(4),
            updated_at: row.get(5),
            members,
        })
    }
}

fn chat_kind_to_str(kind: ChatKind) -> &'static str {
    match kind {
        ChatKind::Private => "private",
        ChatKind::Group => "group",
    }
}

fn chat_kind_from_str(raw: &str) -> Result<ChatKind, StoreError> {
    match raw {
        "private" => Ok(ChatKind::Private),
        "group" => Ok(ChatKind::Group),
        other => Err(StoreError::Backend(format!("unknown chat kind: {}", other))),
    }
}

fn message_kind_to_str(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Text => "text",
        MessageKind::Image => "image",
        MessageKind::File => "file",
        MessageKind::Video => "video",
        MessageKind::Audio => "audio",
    }
}

fn message_kind_from_str(raw: &str) -> Result<MessageKind, StoreError> {
    match raw {
        "text" => Ok(MessageKind::Text),
        "image" => Ok(MessageKind::Image),
        "file" => Ok(MessageKind::File),
        "video" => Ok(MessageKind::Video),
        "audio" => Ok(MessageKind::Audio),
        other => Err(StoreError::Backend(format!(
            "unknown message kind: {}",
            other
        ))),
    }
}

fn message_from_row(row: &Row) -> Result<Message, StoreError> {
    Ok(Message {
        id: row.get(0),
        chat_id: row.get(1),
        sender_id: row.get(2),
        content: row.get(3),
        kind: message_kind_from_str(row.get(4))?,
        file_url: row.get(5),
        file_name: row.get(6),
        file_size: row.get(7),
        sent_at: row.get(8),
        delivered_at: row.get(9),
        read_at: row.get(10),
        edited_at: row.get(11),
        edited: row.get(12),
        deleted: row.get(13),
    })
}

const MESSAGE_COLUMNS: &str = "id, chat_id, sender_id, content, kind, file_url, file_name, \
                               file_size, sent_at, delivered_at, read_at, edited_at, edited, deleted";

fn notification_from_row(row: &Row) -> Notification {
    Notification {
        id: row.get(0),
        user_id: row.get(1),
        title: row.get(2),
        body: row.get(3),
        kind: row.get(4),
        data: row.get(5),
        is_read: row.get(6),
        created_at: row.get(7),
    }
}

const NOTIFICATION_COLUMNS: &str = "id, user_id, title, body, kind, data, is_read, created_at";

#[async_trait]
impl ChatStore for PostgresStore {
    async fn upsert_user(&self, user_id: &UserId) -> Result<(), StoreError> {
        let client = self.client.lock().await;
        client
            .execute(
                "INSERT INTO users (id, created_at) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING",
                &[user_id, &Utc::now()],
            )
            .await?;
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

        let client = self.client.lock().await;

        for user in [user_a, user_b] {
            let known = client
                .query_opt("SELECT 1 FROM users WHERE id = $1", &[user])
                .await?
                .is_some();
            if !known {
                return Err(StoreError::not_found("user", user));
            }
        }

        let existing = client
            .query_opt(
                "SELECT c.id FROM chats c \
                 JOIN chat_members m1 ON m1.chat_id = c.id AND m1.user_id = $1 \
                 JOIN chat_members m2 ON m2.chat_id = c.id AND m2.user_id = $2 \
                 WHERE c.kind = 'private'",
                &[user_a, user_b],
            )
            .await?;

        if let Some(row) = existing {
            return Self::load_chat_with(&client, row.get(0)).await;
        }

        let now = Utc::now();
        let chat_id: ChatId = client
            .query_one(
                "INSERT INTO chats (kind, created_at, updated_at) VALUES ($1, $2, $2) RETURNING id",
                &[&chat_kind_to_str(ChatKind::Private), &now],
            )
            .await?
            .get(0);

        for user in [user_a, user_b] {
            client
                .execute(
                    "INSERT INTO chat_members (chat_id, user_id, joined_at) VALUES ($1, $2, $3)",
                    &[&chat_id, user, &now],
                )
                .await?;
        }
        debug!(chat_id, user_a, user_b, "private chat created");

        Self::load_chat_with(&client, chat_id).await
    }

    async fn load_chat(&self, chat_id: ChatId) -> Result<Chat, StoreError> {
        let client = self.client.lock().await;
        Self::load_chat_with(&client, chat_id).await
    }

    async fn load_chat_members(&self, chat_id: ChatId) -> Result<Vec<UserId>, StoreError> {
        let client = self.client.lock().await;

        let exists = client
            .query_opt("SELECT 1 FROM chats WHERE id = $1", &[&chat_id])
            .await?
            .is_some();
        if !exists {
            return Err(StoreError::not_found("chat", chat_id));
        }

        let members = client
            .query(
                "SELECT user_id FROM chat_members WHERE chat_id = $1 ORDER BY joined_at DESC",
                &[&chat_id],
            )
            .await?
            .into_iter()
            .map(|r| r.get(0))
            .collect();
        Ok(members)
    }

    async fn save_message(&self, new: NewMessage) -> Result<Message, StoreError> {
        Self::validate_content(&new.content)?;

        let client = self.client.lock().await;

        let now = Utc::now();
        let touched = client
            .execute(
                "UPDATE chats SET updated_at = $1 WHERE id = $2",
                &[&now, &new.chat_id],
            )
            .await?;
        if touched == 0 {
            return Err(StoreError::not_found("chat", new.chat_id));
        }

        let row = client
            .query_one(
                &format!(
                    "INSERT INTO messages \
                     (chat_id, sender_id, content, kind, file_url, file_name, file_size, \
                      sent_at, delivered_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8) \
                     RETURNING {MESSAGE_COLUMNS}"
                ),
                &[
                    &new.chat_id,
                    &new.sender_id,
                    &new.content,
                    &message_kind_to_str(new.kind),
                    &new.file_url,
                    &new.file_name,
                    &new.file_size,
                    &now,
                ],
            )
            .await?;

        message_from_row(&row)
    }

    async fn messages_for(
        &self,
        chat_id: ChatId,
        skip: usize,
        take: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let client = self.client.lock().await;

        let exists = client
            .query_opt("SELECT 1 FROM chats WHERE id = $1", &[&chat_id])
            .await?
            .is_some();
        if !exists {
            return Err(StoreError::not_found("chat", chat_id));
        }

        let rows = client
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages \
                     WHERE chat_id = $1 AND deleted = FALSE \
                     ORDER BY sent_at DESC, id DESC OFFSET $2 LIMIT $3"
                ),
                &[&chat_id, &(skip as i64), &(take as i64)],
            )
            .await?;

        rows.iter().map(message_from_row).collect()
    }

    async fn update_message(
        &self,
        user_id: &UserId,
        message_id: MessageId,
        content: String,
    ) -> Result<bool, StoreError> {
        Self::validate_content(&content)?;

        let client = self.client.lock().await;
        let changed = client
            .execute(
                "UPDATE messages SET content = $1, edited = TRUE, edited_at = $2 \
                 WHERE id = $3 AND sender_id = $4 AND deleted = FALSE",
                &[&content, &Utc::now(), &message_id, user_id],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn delete_message(
        &self,
        user_id: &UserId,
        message_id: MessageId,
    ) -> Result<bool, StoreError> {
        let client = self.client.lock().await;
        let changed = client
            .execute(
                "UPDATE messages SET deleted = TRUE WHERE id = $1 AND sender_id = $2",
                &[&message_id, user_id],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn mark_message_read(
        &self,
        user_id: &UserId,
        message_id: MessageId,
    ) -> Result<bool, StoreError> {
        let client = self.client.lock().await;
        let changed = client
            .execute(
                "UPDATE messages SET read_at = $1 \
                 WHERE id = $2 AND sender_id <> $3 AND read_at IS NULL",
                &[&Utc::now(), &message_id, user_id],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn save_notification(&self, new: NewNotification) -> Result<Notification, StoreError> {
        let client = self.client.lock().await;
        let row = client
            .query_one(
                &format!(
                    "INSERT INTO notifications (user_id, title, body, kind, data, created_at) \
                     VALUES ($1, $2, $3, $4, $5, $6) RETURNING {NOTIFICATION_COLUMNS}"
                ),
                &[
                    &new.user_id,
                    &new.title,
                    &new.body,
                    &new.kind,
                    &new.data,
                    &Utc::now(),
                ],
            )
            .await?;
        Ok(notification_from_row(&row))
    }

    async fn notifications_for(
        &self,
        user_id: &UserId,
        skip: usize,
        take: usize,
    ) -> Result<Vec<Notification>, StoreError> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                &format!(
                    "SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE user_id = $1 \
                     ORDER BY created_at DESC, id DESC OFFSET $2 LIMIT $3"
                ),
                &[user_id, &(skip as i64), &(take as i64)],
            )
            .await?;
        Ok(rows.iter().map(notification_from_row).collect())
    }

    async fn mark_notification_read(
        &self,
        user_id: &UserId,
        notification_id: NotificationId,
    ) -> Result<bool, StoreError> {
        let client = self.client.lock().await;
        let changed = client
            .execute(
                "UPDATE notifications SET is_read = TRUE \
                 WHERE id = $1 AND user_id = $2 AND is_read = FALSE",
                &[&notification_id, user_id],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn mark_all_notifications_read(&self, user_id: &UserId) -> Result<u64, StoreError> {
        let client = self.client.lock().await;
        let changed = client
            .execute(
                "UPDATE notifications SET is_read = TRUE WHERE user_id = $1 AND is_read = FALSE",
                &[user_id],
            )
            .await?;
        Ok(changed)
    }

    async fn unread_notification_count(&self, user_id: &UserId) -> Result<u64, StoreError> {
        let client = self.client.lock().await;
        let count: i64 = client
            .query_one(
                "SELECT count(*) FROM notifications WHERE user_id = $1 AND is_read = FALSE",
                &[user_id],
            )
            .await?
            .get(0);
        Ok(count as u64)
    }

    async fn delete_notification(
        &self,
        user_id: &UserId,
        notification_id: NotificationId,
    ) -> Result<bool, StoreError> {
        let client = self.client.lock().await;
        let deleted = client
            .execute(
                "DELETE FROM notifications WHERE id = $1 AND user_id = $2",
                &[&notification_id, user_id],
            )
            .await?;
        Ok(deleted > 0)
    }

    async fn load_notification_settings(
        &self,
        user_id: &UserId,
    ) -> Result<NotificationSettings, StoreError> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                "SELECT enable_notifications, enable_sound, show_banner, smart_notifications \
                 FROM notification_settings WHERE user_id = $1",
                &[user_id],
            )
            .await?;

        match row {
            Some(row) => Ok(NotificationSettings {
                user_id: user_id.clone(),
                enable_notifications: row.get(0),
                enable_sound: row.get(1),
                show_banner: row.get(2),
                smart_notifications: row.get(3),
            }),
            None => {
                // Created lazily on first load
                let defaults = NotificationSettings::defaults_for(user_id.clone());
                client
                    .execute(
                        "INSERT INTO notification_settings \
                         (user_id, enable_notifications, enable_sound, show_banner, smart_notifications) \
                         VALUES ($1, $2, $3, $4, $5) ON CONFLICT (user_id) DO NOTHING",
                        &[
                            user_id,
                            &defaults.enable_notifications,
                            &defaults.enable_sound,
                            &defaults.show_banner,
                            &defaults.smart_notifications,
                        ],
                    )
                    .await?;
                Ok(defaults)
            }
        }
    }

    async fn save_notification_settings(
        &self,
        settings: NotificationSettings,
    ) -> Result<(), StoreError> {
        let client = self.client.lock().await;
        client
            .execute(
                "INSERT INTO notification_settings \
                 (user_id, enable_notifications, enable_sound, show_banner, smart_notifications) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (user_id) DO UPDATE SET \
                 enable_notifications = EXCLUDED.enable_notifications, \
                 enable_sound = EXCLUDED.enable_sound, \
                 show_banner = EXCLUDED.show_banner, \
                 smart_notifications = EXCLUDED.smart_notifications",
                &[
                    &settings.user_id,
                    &settings.enable_notifications,
                    &settings.enable_sound,
                    &settings.show_banner,
                    &settings.smart_notifications,
                ],
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mappings_roundtrip() {
        for kind in [
            MessageKind::Text,
            MessageKind::Image,
            MessageKind::File,
            MessageKind::Video,
            MessageKind::Audio,
        ] {
            assert_eq!(message_kind_from_str(message_kind_to_str(kind)).unwrap(), kind);
        }
        for kind in [ChatKind::Private, ChatKind::Group] {
            assert_eq!(chat_kind_from_str(chat_kind_to_str(kind)).unwrap(), kind);
        }
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!(message_kind_from_str("hologram").is_err());
        assert!(chat_kind_from_str("broadcast").is_err());
    }
}
