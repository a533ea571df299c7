//! Action and event types for the Confab protocol.
//!
//! Clients send [`ClientAction`] frames; the gateway answers with
//! [`ServerEvent`] frames, either to the caller alone or broadcast to every
//! connection joined to the conversation's group.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{Message, NewContent};

/// An action a connected client may request.
///
/// Everything except `Authenticate` and `Ping` requires the connection to be
/// authenticated first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientAction {
    /// Establish identity for this connection.
    Authenticate {
        /// Opaque token resolved by the identity collaborator.
        token: String,
        /// Major protocol version the client speaks; omitted means
        /// "whatever the server runs".
        #[serde(default, skip_serializing_if = "Option::is_none")]
        protocol_version: Option<u8>,
    },

    /// Join a conversation's event group.
    JoinConversation { conversation_id: Uuid },

    /// Leave a conversation's event group.
    LeaveConversation { conversation_id: Uuid },

    /// Send a message into a conversation.
    SendMessage {
        conversation_id: Uuid,
        /// Text body; may be absent when `contents` is non-empty.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        /// Ordered content parts.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        contents: Vec<NewContent>,
        /// Message in the same conversation this one replies to.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<Uuid>,
    },

    /// Replace the text of a message this user sent.
    EditMessage { message_id: Uuid, text: String },

    /// Soft-delete a message this user sent.
    DeleteMessage { message_id: Uuid },

    /// Mark a single message as read by this user.
    MarkMessageAsRead { message_id: Uuid },

    /// Mark every message in a conversation not authored by this user as read.
    MarkAllMessagesAsRead { conversation_id: Uuid },

    /// Ephemeral typing signal, best-effort.
    StartTyping { conversation_id: Uuid },

    /// Ephemeral stopped-typing signal, best-effort.
    StopTyping { conversation_id: Uuid },

    /// Keepalive.
    Ping,
}

/// An event the gateway pushes to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Identity established; sent to the caller only.
    Authenticated {
        user_id: i64,
        display_name: String,
        protocol_version: u8,
        /// Recommended keepalive interval in milliseconds.
        heartbeat_ms: u32,
    },

    /// A user joined the conversation's group.
    UserJoined { conversation_id: Uuid, user_id: i64 },

    /// A user left the conversation's group.
    UserLeft { conversation_id: Uuid, user_id: i64 },

    /// A new message was persisted.
    ReceiveMessage { message: Message },

    /// A message was edited.
    MessageEdited { message: Message },

    /// A message was soft-deleted.
    MessageDeleted {
        conversation_id: Uuid,
        message_id: Uuid,
    },

    /// One message was marked read by a recipient.
    MessageRead {
        conversation_id: Uuid,
        message_id: Uuid,
        reader_id: i64,
    },

    /// A whole conversation was marked read by a recipient.
    MessagesMarkedAsRead {
        conversation_id: Uuid,
        reader_id: i64,
    },

    /// A user is typing.
    UserTyping { conversation_id: Uuid, user_id: i64 },

    /// A user stopped typing.
    UserStoppedTyping { conversation_id: Uuid, user_id: i64 },

    /// The assistant started or finished composing a reply.
    AssistantTyping { conversation_id: Uuid, typing: bool },

    /// An action failed; scoped to the caller unless noted otherwise.
    Error { message: String },

    /// Keepalive response.
    Pong,
}

impl ServerEvent {
    /// Create an `Error` event.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }

    /// Create a `ReceiveMessage` event.
    #[must_use]
    pub fn receive_message(message: Message) -> Self {
        ServerEvent::ReceiveMessage { message }
    }

    /// Create an `AssistantTyping` event.
    #[must_use]
    pub fn assistant_typing(conversation_id: Uuid, typing: bool) -> Self {
        ServerEvent::AssistantTyping {
            conversation_id,
            typing,
        }
    }

    /// Create a `UserJoined` event.
    #[must_use]
    pub fn user_joined(conversation_id: Uuid, user_id: i64) -> Self {
        ServerEvent::UserJoined {
            conversation_id,
            user_id,
        }
    }

    /// Create a `UserLeft` event.
    #[must_use]
    pub fn user_left(conversation_id: Uuid, user_id: i64) -> Self {
        ServerEvent::UserLeft {
            conversation_id,
            user_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;

    #[test]
    fn test_action_roundtrip() {
        let action = ClientAction::SendMessage {
            conversation_id: Uuid::now_v7(),
            text: Some("hello".to_string()),
            contents: vec![NewContent::text("hello")],
            reply_to: None,
        };
        let encoded = codec::encode(&action).unwrap();
        let decoded: ClientAction = codec::decode(&encoded).unwrap();
        assert_eq!(action, decoded);
    }

    #[test]
    fn test_event_helpers() {
        let id = Uuid::now_v7();
        assert!(matches!(
            ServerEvent::assistant_typing(id, true),
            ServerEvent::AssistantTyping { typing: true, .. }
        ));
        assert!(matches!(
            ServerEvent::error("nope"),
            ServerEvent::Error { .. }
        ));
    }
}
