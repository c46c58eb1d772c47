//! Delivery coordinator
//!
//! Receives persisted messages and notification events and fans them out to
//! the right live connections. Persistence failures abort the operation;
//! live-push and notification failures after a successful persist are logged
//! and swallowed - the data is durable, only the real-time nudge is lost.
//!
//! Fan-out for one chat happens under that chat's ordering lock, held across
//! persist + push, so recipients observe messages in commit order. The
//! pushes themselves are non-blocking channel sends.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::gateway::SessionGateway;
use crate::membership::ChatMembershipIndex;
use crate::model::{
    ChatId, Message, MessageId, NewMessage, NewNotification, Notification, UserId,
};
use crate::presence::StatusChange;
use crate::protocol::ServerEvent;
use crate::store::{ChatStore, StoreError};

/// Notification body previews are cut at this many characters.
pub const PREVIEW_MAX_CHARS: usize = 100;

/// Delivery errors surfaced to the sending client
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("user is not a member of chat {chat_id}")]
    NotAMember { chat_id: ChatId },
}

impl DeliveryError {
    /// Stable error code for the client-facing `error` event.
    pub fn code(&self) -> &'static str {
        match self {
            DeliveryError::Store(StoreError::NotFound { .. }) => "not_found",
            DeliveryError::Store(StoreError::Validation(_)) => "validation_failed",
            DeliveryError::Store(StoreError::Backend(_)) => "storage",
            DeliveryError::NotAMember { .. } => "forbidden",
        }
    }
}

/// Delivery coordinator for a single cablegram node
pub struct DeliveryCoordinator {
    store: Arc<dyn ChatStore>,
    gateway: Arc<SessionGateway>,
    membership: Arc<ChatMembershipIndex>,
    /// Per-chat ordering locks, created on first send
    chat_locks: DashMap<ChatId, Arc<Mutex<()>>>,
}

impl DeliveryCoordinator {
    pub fn new(
        store: Arc<dyn ChatStore>,
        gateway: Arc<SessionGateway>,
        membership: Arc<ChatMembershipIndex>,
    ) -> Self {
        Self {
            store,
            gateway,
            membership,
            chat_locks: DashMap::new(),
        }
    }

    /// Validate, persist and fan out a message.
    ///
    /// The sender must be a member of the chat. Returns the persisted
    /// message; push failures do not fail the send.
    pub async fn send_message(&self, new: NewMessage) -> Result<Message, DeliveryError> {
        let chat_id = new.chat_id;
        let members = self.membership.members(chat_id).await?;
        if !members.contains(&new.sender_id) {
            return Err(DeliveryError::NotAMember { chat_id });
        }

        // Commit order is observation order for this chat
        let lock = self.chat_lock(chat_id);
        let _guard = lock.lock().await;

        let message = self.store.save_message(new).await?;
        self.deliver_message(&message, &members).await;

        Ok(message)
    }

    /// Fan out an already-persisted message to its recipients.
    ///
    /// Pushes the payload to every group-subscribed connection except the
    /// sender's, then creates a notification for each recipient that is not
    /// actively viewing the chat (subject to their settings). Never notifies
    /// the sender; never fails the send.
    pub async fn deliver_message(&self, message: &Message, members: &HashSet<UserId>) {
        let event = ServerEvent::ReceiveMessage {
            message: message.into(),
        };
        self.gateway
            .send_to_group(message.chat_id, &event, Some(&message.sender_id));

        for recipient in members.iter().filter(|user| **user != message.sender_id) {
            if self
                .membership
                .is_user_active_in_chat(recipient, message.chat_id)
            {
                debug!(
                    recipient,
                    chat_id = message.chat_id,
                    "recipient active in chat, notification suppressed"
                );
                continue;
            }

            if let Err(err) = self.notify_recipient(recipient, message).await {
                warn!(
                    recipient,
                    chat_id = message.chat_id,
                    error = %err,
                    "notification creation failed"
                );
            }
        }
    }

    /// Broadcast a presence transition to every live connection, unscoped.
    pub fn deliver_status_change(&self, change: &StatusChange) {
        self.gateway.broadcast_all(&ServerEvent::UserStatusChanged {
            user_id: change.user_id.clone(),
            status: change.status,
        });
    }

    /// Push a notification to its recipient's live connections.
    pub fn deliver_notification(&self, user_id: &str, notification: &Notification) {
        self.gateway.send_to_user(
            user_id,
            &ServerEvent::ReceiveNotification {
                notification: notification.into(),
            },
        );
    }

    /// Relay a typing indicator to the chat group, excluding the sender.
    /// Nothing is persisted or retained; lossy by design.
    pub fn deliver_typing(&self, sender: &str, chat_id: ChatId, is_typing: bool) {
        self.gateway.send_to_group(
            chat_id,
            &ServerEvent::UserTyping {
                user_id: sender.to_string(),
                chat_id,
                is_typing,
            },
            Some(sender),
        );
    }

    /// Record a read receipt and, on the first transition, broadcast it to
    /// the chat group.
    pub async fn mark_message_read(
        &self,
        user_id: &str,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<bool, DeliveryError> {
        let user = user_id.to_string();
        let newly_read = self.store.mark_message_read(&user, message_id).await?;

        if newly_read {
            self.gateway.send_to_group(
                chat_id,
                &ServerEvent::MessageRead {
                    chat_id,
                    message_id,
                    user_id: user,
                },
                None,
            );
        }

        Ok(newly_read)
    }

    async fn notify_recipient(
        &self,
        recipient: &UserId,
        message: &Message,
    ) -> Result<(), StoreError> {
        let settings = self.store.load_notification_settings(recipient).await?;
        if !settings.enable_notifications {
            return Ok(());
        }

        let body = preview(&message.content);
        let data = json!({
            "chat_id": message.chat_id,
            "message_id": message.id,
            "sender_id": message.sender_id,
        });

        let notification = self
            .store
            .save_notification(NewNotification {
                user_id: recipient.clone(),
                title: format!("New message from {}", message.sender_id),
                body: body.clone(),
                kind: "message".to_string(),
                data: Some(data.clone()),
            })
            .await?;

        self.deliver_notification(recipient, &notification);

        if settings.show_banner {
            self.gateway.send_to_user(
                recipient,
                &ServerEvent::ShowBrowserNotification {
                    title: notification.title.clone(),
                    body,
                    data,
                },
            );
        }

        Ok(())
    }

    fn chat_lock(&self, chat_id: ChatId) -> Arc<Mutex<()>> {
        self.chat_locks
            .entry(chat_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Cut a notification body preview at [`PREVIEW_MAX_CHARS`] characters,
/// ellipsis-suffixed. Operates on characters, never splitting a scalar.
fn preview(content: &str) -> String {
    if content.chars().count() > PREVIEW_MAX_CHARS {
        let cut: String = content.chars().take(PREVIEW_MAX_CHARS).collect();
        format!("{}...", cut)
    } else {
        content.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tokio::sync::mpsc;

    use crate::auth::{TokenClaims, TokenVerifier};
    use crate::model::{ConnId, NotificationSettings, UserStatus};
    use crate::presence::PresenceRegistry;
    use crate::store::MemoryStore;

    const SECRET: &str = "delivery-test-secret";

    struct Harness {
        store: Arc<MemoryStore>,
        membership: Arc<ChatMembershipIndex>,
        gateway: Arc<SessionGateway>,
        delivery: DeliveryCoordinator,
    }

    async fn harness(users: &[&str]) -> Harness {
        let store = Arc::new(MemoryStore::new());
        for user in users {
            store.upsert_user(&user.to_string()).await.unwrap();
        }
        let membership = Arc::new(ChatMembershipIndex::new(store.clone()));
        let gateway = Arc::new(SessionGateway::new(
            TokenVerifier::new(SECRET),
            Arc::new(PresenceRegistry::new()),
            membership.clone(),
        ));
        let delivery =
            DeliveryCoordinator::new(store.clone(), gateway.clone(), membership.clone());
        Harness {
            store,
            membership,
            gateway,
            delivery,
        }
    }

    impl Harness {
        fn connect(&self, user: &str) -> (ConnId, mpsc::UnboundedReceiver<Vec<u8>>) {
            let token = TokenVerifier::new(SECRET)
                .sign(&TokenClaims {
                    sub: user.to_string(),
                    exp: None,
                })
                .unwrap();
            let (tx, rx) = mpsc::unbounded_channel();
            let (conn_id, _, _) = self.gateway.connect(&token, tx).unwrap();
            (conn_id, rx)
        }

        async fn private_chat(&self, a: &str, b: &str) -> ChatId {
            self.store
                .get_or_create_private_chat(&a.to_string(), &b.to_string())
                .await
                .unwrap()
                .id
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<Value> {
        let mut events = Vec::new();
        while let Ok(payload) = rx.try_recv() {
            events.push(serde_json::from_slice(&payload).unwrap());
        }
        events
    }

    fn events_of(events: &[Value], name: &str) -> usize {
        events.iter().filter(|e| e["event"] == name).count()
    }

    #[tokio::test]
    async fn test_fan_out_excludes_sender() {
        let h = harness(&["alice", "bob"]).await;
        let chat_id = h.private_chat("alice", "bob").await;

        let (alice_conn, mut alice_rx) = h.connect("alice");
        let (bob_conn, mut bob_rx) = h.connect("bob");
        h.membership.join_group(alice_conn, "alice", chat_id).await.unwrap();
        h.membership.join_group(bob_conn, "bob", chat_id).await.unwrap();

        h.delivery
            .send_message(NewMessage::text(chat_id, "alice", "hi"))
            .await
            .unwrap();

        let bob_events = drain(&mut bob_rx);
        assert_eq!(events_of(&bob_events, "receive_message"), 1);
        assert_eq!(bob_events[0]["message"]["content"], "hi");
        assert_eq!(bob_events[0]["message"]["sender_id"], "alice");

        let alice_events = drain(&mut alice_rx);
        assert_eq!(events_of(&alice_events, "receive_message"), 0);
    }

    #[tokio::test]
    async fn test_fan_out_reaches_every_device() {
        let h = harness(&["alice", "bob"]).await;
        let chat_id = h.private_chat("alice", "bob").await;

        let (conn1, mut rx1) = h.connect("bob");
        let (conn2, mut rx2) = h.connect("bob");
        h.membership.join_group(conn1, "bob", chat_id).await.unwrap();
        h.membership.join_group(conn2, "bob", chat_id).await.unwrap();

        h.delivery
            .send_message(NewMessage::text(chat_id, "alice", "hi"))
            .await
            .unwrap();

        assert_eq!(events_of(&drain(&mut rx1), "receive_message"), 1);
        assert_eq!(events_of(&drain(&mut rx2), "receive_message"), 1);
    }

    #[tokio::test]
    async fn test_active_recipient_suppresses_notification() {
        let h = harness(&["alice", "bob"]).await;
        let chat_id = h.private_chat("alice", "bob").await;

        let (bob_conn, _bob_rx) = h.connect("bob");
        h.membership.join_group(bob_conn, "bob", chat_id).await.unwrap();

        h.delivery
            .send_message(NewMessage::text(chat_id, "alice", "hi"))
            .await
            .unwrap();

        let notifications = h
            .store
            .notifications_for(&"bob".to_string(), 0, 10)
            .await
            .unwrap();
        assert!(notifications.is_empty());
    }

    #[tokio::test]
    async fn test_inactive_recipient_gets_notification() {
        let h = harness(&["alice", "bob"]).await;
        let chat_id = h.private_chat("alice", "bob").await;

        // Bob is connected but not viewing the chat
        let (_bob_conn, mut bob_rx) = h.connect("bob");

        h.delivery
            .send_message(NewMessage::text(chat_id, "alice", "hi"))
            .await
            .unwrap();

        let notifications = h
            .store
            .notifications_for(&"bob".to_string(), 0, 10)
            .await
            .unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].body, "hi");
        assert_eq!(notifications[0].title, "New message from alice");

        let events = drain(&mut bob_rx);
        assert_eq!(events_of(&events, "receive_message"), 0);
        assert_eq!(events_of(&events, "receive_notification"), 1);
        // Banner enabled by default
        assert_eq!(events_of(&events, "show_browser_notification"), 1);
    }

    #[tokio::test]
    async fn test_offline_recipient_still_gets_notification_row() {
        let h = harness(&["alice", "bob"]).await;
        let chat_id = h.private_chat("alice", "bob").await;

        h.delivery
            .send_message(NewMessage::text(chat_id, "alice", "hi"))
            .await
            .unwrap();

        let notifications = h
            .store
            .notifications_for(&"bob".to_string(), 0, 10)
            .await
            .unwrap();
        assert_eq!(notifications.len(), 1);
    }

    #[tokio::test]
    async fn test_notifications_disabled_creates_nothing() {
        let h = harness(&["alice", "bob"]).await;
        let chat_id = h.private_chat("alice", "bob").await;

        let mut settings = NotificationSettings::defaults_for("bob");
        settings.enable_notifications = false;
        h.store.save_notification_settings(settings).await.unwrap();

        h.delivery
            .send_message(NewMessage::text(chat_id, "alice", "hi"))
            .await
            .unwrap();

        assert!(h
            .store
            .notifications_for(&"bob".to_string(), 0, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_banner_disabled_skips_browser_push() {
        let h = harness(&["alice", "bob"]).await;
        let chat_id = h.private_chat("alice", "bob").await;

        let mut settings = NotificationSettings::defaults_for("bob");
        settings.show_banner = false;
        h.store.save_notification_settings(settings).await.unwrap();

        let (_bob_conn, mut bob_rx) = h.connect("bob");

        h.delivery
            .send_message(NewMessage::text(chat_id, "alice", "hi"))
            .await
            .unwrap();

        let events = drain(&mut bob_rx);
        assert_eq!(events_of(&events, "receive_notification"), 1);
        assert_eq!(events_of(&events, "show_browser_notification"), 0);
    }

    #[tokio::test]
    async fn test_preview_truncated_to_100_chars() {
        let h = harness(&["alice", "bob"]).await;
        let chat_id = h.private_chat("alice", "bob").await;

        let content = "x".repeat(101);
        h.delivery
            .send_message(NewMessage::text(chat_id, "alice", content))
            .await
            .unwrap();

        let notifications = h
            .store
            .notifications_for(&"bob".to_string(), 0, 10)
            .await
            .unwrap();
        assert_eq!(notifications.len(), 1);
        let expected = format!("{}...", "x".repeat(100));
        assert_eq!(notifications[0].body, expected);
    }

    #[tokio::test]
    async fn test_short_content_not_truncated() {
        assert_eq!(preview("hello"), "hello");
        assert_eq!(preview(&"y".repeat(100)), "y".repeat(100));
    }

    #[tokio::test]
    async fn test_multibyte_preview_counts_chars() {
        let content = "ß".repeat(150);
        let cut = preview(&content);
        assert_eq!(cut.chars().count(), 103);
        assert!(cut.ends_with("..."));
    }

    #[tokio::test]
    async fn test_send_from_non_member_rejected() {
        let h = harness(&["alice", "bob", "eve"]).await;
        let chat_id = h.private_chat("alice", "bob").await;

        let err = h
            .delivery
            .send_message(NewMessage::text(chat_id, "eve", "let me in"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "forbidden");
        assert!(matches!(err, DeliveryError::NotAMember { .. }));
    }

    #[tokio::test]
    async fn test_send_to_unknown_chat_rejected() {
        let h = harness(&["alice"]).await;
        let result = h
            .delivery
            .send_message(NewMessage::text(404, "alice", "hi"))
            .await;
        assert_eq!(result.unwrap_err().code(), "not_found");
    }

    #[tokio::test]
    async fn test_mark_read_broadcasts_once() {
        let h = harness(&["alice", "bob"]).await;
        let chat_id = h.private_chat("alice", "bob").await;

        let (alice_conn, mut alice_rx) = h.connect("alice");
        h.membership.join_group(alice_conn, "alice", chat_id).await.unwrap();

        let message = h
            .delivery
            .send_message(NewMessage::text(chat_id, "alice", "hi"))
            .await
            .unwrap();

        assert!(h
            .delivery
            .mark_message_read("bob", chat_id, message.id)
            .await
            .unwrap());
        assert!(!h
            .delivery
            .mark_message_read("bob", chat_id, message.id)
            .await
            .unwrap());

        let events = drain(&mut alice_rx);
        assert_eq!(events_of(&events, "message_read"), 1);
    }

    #[tokio::test]
    async fn test_typing_relay_excludes_sender() {
        let h = harness(&["alice", "bob"]).await;
        let chat_id = h.private_chat("alice", "bob").await;

        let (alice_conn, mut alice_rx) = h.connect("alice");
        let (bob_conn, mut bob_rx) = h.connect("bob");
        h.membership.join_group(alice_conn, "alice", chat_id).await.unwrap();
        h.membership.join_group(bob_conn, "bob", chat_id).await.unwrap();

        h.delivery.deliver_typing("alice", chat_id, true);

        let bob_events = drain(&mut bob_rx);
        assert_eq!(events_of(&bob_events, "user_typing"), 1);
        assert_eq!(bob_events[0]["is_typing"], true);
        assert!(drain(&mut alice_rx).is_empty());
    }

    #[tokio::test]
    async fn test_status_change_broadcast_unscoped() {
        let h = harness(&["alice", "bob"]).await;

        let (_a, mut alice_rx) = h.connect("alice");
        let (_b, mut bob_rx) = h.connect("bob");

        h.delivery.deliver_status_change(&StatusChange {
            user_id: "alice".to_string(),
            status: UserStatus::DoNotDisturb,
        });

        for rx in [&mut alice_rx, &mut bob_rx] {
            let events = drain(rx);
            assert_eq!(events_of(&events, "user_status_changed"), 1);
            assert_eq!(events[0]["status"], "DoNotDisturb");
        }
    }
}
