use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Message;

/// Events sent FROM server TO client over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid, username: String },

    /// Full message history for a chat, sent to the joining connection only
    ChatMessages { chat_id: Uuid, messages: Vec<Message> },

    /// A new message was appended to a chat
    NewMessage { message: Message },

    /// A user acknowledged reading a set of messages
    ReadUpdate {
        chat_id: Uuid,
        message_ids: Vec<Uuid>,
        user_id: Uuid,
    },

    /// A user came online or went offline
    Presence {
        user_id: Uuid,
        username: String,
        online: bool,
    },
}

impl ServerEvent {
    /// Returns the chat_id if this event is scoped to a specific chat.
    /// Events that return `None` are global and go to every connection;
    /// presence deliberately reaches users who share no chat.
    pub fn chat_id(&self) -> Option<Uuid> {
        match self {
            Self::ChatMessages { chat_id, .. } => Some(*chat_id),
            Self::NewMessage { message } => Some(message.chat_id),
            Self::ReadUpdate { chat_id, .. } => Some(*chat_id),
            Self::Ready { .. } | Self::Presence { .. } => None,
        }
    }
}

/// Commands sent FROM client TO server over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },

    /// Open (or create) the private chat with another user
    JoinPrivateChat { other_user_id: Uuid },

    /// Subscribe to an existing chat by id (e.g. a group chat)
    JoinChat { chat_id: Uuid },

    /// Append a message; at least one of text / file_url must be set
    SendMessage {
        chat_id: Uuid,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        file_url: Option<String>,
    },

    /// Mark messages as read by this user
    ReadMessages {
        chat_id: Uuid,
        message_ids: Vec<Uuid>,
    },

    /// Unsubscribe from a chat without disconnecting
    Leave { chat_id: Uuid },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presence_is_global() {
        let event = ServerEvent::Presence {
            user_id: Uuid::new_v4(),
            username: "ada".into(),
            online: true,
        };
        assert_eq!(event.chat_id(), None);
    }

    #[test]
    fn new_message_is_chat_scoped() {
        let chat_id = Uuid::new_v4();
        let event = ServerEvent::NewMessage {
            message: Message {
                id: Uuid::new_v4(),
                chat_id,
                sender_id: Uuid::new_v4(),
                sender_username: "ada".into(),
                text: Some("hi".into()),
                file_url: None,
                timestamp: chrono::Utc::now(),
                read_by: vec![],
            },
        };
        assert_eq!(event.chat_id(), Some(chat_id));
    }

    #[test]
    fn commands_use_tagged_wire_format() {
        let cmd: ClientCommand = serde_json::from_str(
            r#"{"type":"SendMessage","data":{"chat_id":"00000000-0000-0000-0000-000000000001","text":"hello"}}"#,
        )
        .unwrap();
        match cmd {
            ClientCommand::SendMessage { text, file_url, .. } => {
                assert_eq!(text.as_deref(), Some("hello"));
                assert!(file_url.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
