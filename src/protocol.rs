//! Session protocol: client commands and server events.
//!
//! ## Client Commands
//! - `send_message`: persist and fan out a message to a chat
//! - `join_chat` / `leave_chat`: subscribe to a chat's live-update group
//! - `update_status`: explicit presence override
//! - `mark_read`: read receipt for one message
//! - `typing`: ephemeral typing indicator, relayed without persistence
//! - `get_statuses`: presence snapshot for a set of users
//! - `update_activity`: bare activity ping
//!
//! ## Server Events
//! - `receive_message`: a new message in a subscribed chat
//! - `user_status_changed`: presence broadcast
//! - `receive_notification` / `show_browser_notification`: notification pushes
//! - `user_typing`, `message_read`, `user_statuses`, `ping`, `error`

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{
    ChatId, Message, MessageId, MessageKind, Notification, NotificationId, UserId, UserStatus,
};

/// Client-to-server commands
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ClientCommand {
    SendMessage {
        chat_id: ChatId,
        content: String,
        #[serde(default)]
        kind: MessageKind,
        #[serde(default)]
        file_url: Option<String>,
        #[serde(default)]
        file_name: Option<String>,
        #[serde(default)]
        file_size: Option<i64>,
    },
    JoinChat {
        chat_id: ChatId,
    },
    LeaveChat {
        chat_id: ChatId,
    },
    UpdateStatus {
        status: UserStatus,
    },
    MarkRead {
        chat_id: ChatId,
        message_id: MessageId,
    },
    Typing {
        chat_id: ChatId,
        is_typing: bool,
    },
    GetStatuses {
        user_ids: Vec<UserId>,
    },
    UpdateActivity,
}

/// Message payload as pushed to clients
#[derive(Debug, Clone, Serialize)]
pub struct MessagePayload {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    pub sent_at: DateTime<Utc>,
}

impl From<&Message> for MessagePayload {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id,
            chat_id: message.chat_id,
            sender_id: message.sender_id.clone(),
            content: message.content.clone(),
            kind: message.kind,
            file_url: message.file_url.clone(),
            file_name: message.file_name.clone(),
            file_size: message.file_size,
            sent_at: message.sent_at,
        }
    }
}

/// Notification payload as pushed to clients
#[derive(Debug, Clone, Serialize)]
pub struct NotificationPayload {
    pub id: NotificationId,
    pub title: String,
    pub body: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&Notification> for NotificationPayload {
    fn from(notification: &Notification) -> Self {
        Self {
            id: notification.id,
            title: notification.title.clone(),
            body: notification.body.clone(),
            kind: notification.kind.clone(),
            data: notification.data.clone(),
            is_read: notification.is_read,
            created_at: notification.created_at,
        }
    }
}

/// Server-to-client events
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    ReceiveMessage {
        message: MessagePayload,
    },
    UserStatusChanged {
        user_id: UserId,
        status: UserStatus,
    },
    ReceiveNotification {
        notification: NotificationPayload,
    },
    ShowBrowserNotification {
        title: String,
        body: String,
        data: Value,
    },
    UserTyping {
        user_id: UserId,
        chat_id: ChatId,
        is_typing: bool,
    },
    MessageRead {
        chat_id: ChatId,
        message_id: MessageId,
        user_id: UserId,
    },
    UserStatuses {
        statuses: HashMap<UserId, UserStatus>,
    },
    Ping {
        timestamp: i64,
    },
    Error {
        code: &'static str,
        message: String,
    },
}

/// Parse a client command from raw payload bytes
pub fn parse_command(data: &[u8]) -> Result<ClientCommand, ProtocolError> {
    serde_json::from_slice(data).map_err(ProtocolError::Parse)
}

/// Encode a server event to bytes
pub fn encode_event(event: &ServerEvent) -> Vec<u8> {
    // Serialization of our own event types cannot fail
    serde_json::to_vec(event).unwrap()
}

/// Protocol errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to parse command: {0}")]
    Parse(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_send_message() {
        let json = br#"{"command":"send_message","chat_id":7,"content":"hi"}"#;
        let cmd = parse_command(json).unwrap();
        match cmd {
            ClientCommand::SendMessage {
                chat_id,
                content,
                kind,
                ..
            } => {
                assert_eq!(chat_id, 7);
                assert_eq!(content, "hi");
                assert_eq!(kind, MessageKind::Text);
            }
            _ => panic!("expected SendMessage"),
        }
    }

    #[test]
    fn test_parse_send_message_with_file() {
        let json = br#"{"command":"send_message","chat_id":7,"content":"photo","kind":"Image","file_url":"/up/1.png","file_name":"1.png","file_size":2048}"#;
        let cmd = parse_command(json).unwrap();
        match cmd {
            ClientCommand::SendMessage {
                kind,
                file_url,
                file_size,
                ..
            } => {
                assert_eq!(kind, MessageKind::Image);
                assert_eq!(file_url.as_deref(), Some("/up/1.png"));
                assert_eq!(file_size, Some(2048));
            }
            _ => panic!("expected SendMessage"),
        }
    }

    #[test]
    fn test_parse_join_and_leave() {
        let join = parse_command(br#"{"command":"join_chat","chat_id":3}"#).unwrap();
        assert!(matches!(join, ClientCommand::JoinChat { chat_id: 3 }));

        let leave = parse_command(br#"{"command":"leave_chat","chat_id":3}"#).unwrap();
        assert!(matches!(leave, ClientCommand::LeaveChat { chat_id: 3 }));
    }

    #[test]
    fn test_parse_update_status() {
        let cmd = parse_command(br#"{"command":"update_status","status":"Busy"}"#).unwrap();
        match cmd {
            ClientCommand::UpdateStatus { status } => assert_eq!(status, UserStatus::Busy),
            _ => panic!("expected UpdateStatus"),
        }
    }

    #[test]
    fn test_parse_typing() {
        let cmd = parse_command(br#"{"command":"typing","chat_id":3,"is_typing":true}"#).unwrap();
        match cmd {
            ClientCommand::Typing {
                chat_id, is_typing, ..
            } => {
                assert_eq!(chat_id, 3);
                assert!(is_typing);
            }
            _ => panic!("expected Typing"),
        }
    }

    #[test]
    fn test_parse_get_statuses() {
        let cmd =
            parse_command(br#"{"command":"get_statuses","user_ids":["a","b"]}"#).unwrap();
        match cmd {
            ClientCommand::GetStatuses { user_ids } => {
                assert_eq!(user_ids, vec!["a".to_string(), "b".to_string()]);
            }
            _ => panic!("expected GetStatuses"),
        }
    }

    #[test]
    fn test_parse_update_activity() {
        let cmd = parse_command(br#"{"command":"update_activity"}"#).unwrap();
        assert!(matches!(cmd, ClientCommand::UpdateActivity));
    }

    #[test]
    fn test_unknown_command_rejected() {
        let result = parse_command(br#"{"command":"self_destruct"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_message_kind_rejected() {
        let result =
            parse_command(br#"{"command":"send_message","chat_id":1,"content":"x","kind":"Hologram"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_encode_status_changed() {
        let event = ServerEvent::UserStatusChanged {
            user_id: "user_42".to_string(),
            status: UserStatus::Online,
        };
        let json: Value = serde_json::from_slice(&encode_event(&event)).unwrap();
        assert_eq!(json["event"], "user_status_changed");
        assert_eq!(json["user_id"], "user_42");
        assert_eq!(json["status"], "Online");
    }

    #[test]
    fn test_encode_error() {
        let event = ServerEvent::Error {
            code: "not_found",
            message: "chat 9 not found".to_string(),
        };
        let json: Value = serde_json::from_slice(&encode_event(&event)).unwrap();
        assert_eq!(json["event"], "error");
        assert_eq!(json["code"], "not_found");
    }

    #[test]
    fn test_encode_user_typing() {
        let event = ServerEvent::UserTyping {
            user_id: "user_42".to_string(),
            chat_id: 3,
            is_typing: false,
        };
        let json: Value = serde_json::from_slice(&encode_event(&event)).unwrap();
        assert_eq!(json["event"], "user_typing");
        assert_eq!(json["chat_id"], 3);
        assert_eq!(json["is_typing"], false);
    }
}
