//! Persisted entity shapes for Confab.
//!
//! These are pure data contracts: the store owns all creation and mutation,
//! and the gateway ships them to clients inside [`crate::events::ServerEvent`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum length of a message text body, in characters.
pub const MAX_TEXT_LENGTH: usize = 4000;

/// Maximum length of an assistant system prompt, in characters.
pub const MAX_SYSTEM_PROMPT_LENGTH: usize = 2000;

/// Maximum number of content parts a single message may carry.
pub const MAX_CONTENT_PARTS: usize = 16;

/// The two shapes a conversation can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    /// Two human participants.
    UserToUser,
    /// One human participant plus the automated assistant.
    UserToAssistant,
}

impl ConversationKind {
    /// Database/text representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationKind::UserToUser => "user_to_user",
            ConversationKind::UserToAssistant => "user_to_assistant",
        }
    }
}

impl std::str::FromStr for ConversationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user_to_user" => Ok(ConversationKind::UserToUser),
            "user_to_assistant" => Ok(ConversationKind::UserToAssistant),
            other => Err(format!("unknown conversation kind: {other}")),
        }
    }
}

/// A persistent container for an ordered exchange of messages between
/// exactly two parties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub kind: ConversationKind,
    /// For [`ConversationKind::UserToUser`] this is the smaller id of the
    /// canonical pair; for assistant conversations, the sole owner.
    pub user1_id: i64,
    /// Always `None` for assistant conversations.
    pub user2_id: Option<i64>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Conversation {
    /// Order a user pair deterministically so that (a, b) and (b, a) key the
    /// same conversation row.
    #[must_use]
    pub fn canonical_pair(a: i64, b: i64) -> (i64, i64) {
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }

    /// Whether `user_id` may access this conversation.
    #[must_use]
    pub fn is_participant(&self, user_id: i64) -> bool {
        match self.kind {
            ConversationKind::UserToUser => {
                self.user1_id == user_id || self.user2_id == Some(user_id)
            }
            ConversationKind::UserToAssistant => self.user1_id == user_id,
        }
    }
}

/// Typed payload unit within a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Text,
    Image,
    File,
    System,
}

impl ContentKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Text => "text",
            ContentKind::Image => "image",
            ContentKind::File => "file",
            ContentKind::System => "system",
        }
    }
}

impl std::str::FromStr for ContentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(ContentKind::Text),
            "image" => Ok(ContentKind::Image),
            "file" => Ok(ContentKind::File),
            "system" => Ok(ContentKind::System),
            other => Err(format!("unknown content kind: {other}")),
        }
    }
}

/// One stored content part of a message.
///
/// `position` values within a message form a contiguous sequence from 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
    pub id: Uuid,
    pub message_id: Uuid,
    pub kind: ContentKind,
    pub position: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
}

/// Input shape for one content part of a message about to be appended.
///
/// The store assigns ids and positions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewContent {
    pub kind: ContentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
}

impl Default for ContentKind {
    fn default() -> Self {
        ContentKind::Text
    }
}

impl NewContent {
    /// A text content part.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: ContentKind::Text,
            text_content: Some(text.into()),
            ..Self::default()
        }
    }

    /// An image content part.
    #[must_use]
    pub fn image(url: impl Into<String>, width: i64, height: i64) -> Self {
        Self {
            kind: ContentKind::Image,
            file_url: Some(url.into()),
            width: Some(width),
            height: Some(height),
            ..Self::default()
        }
    }

    /// A file attachment content part.
    #[must_use]
    pub fn file(url: impl Into<String>, name: impl Into<String>, size: i64) -> Self {
        Self {
            kind: ContentKind::File,
            file_url: Some(url.into()),
            file_name: Some(name.into()),
            file_size: Some(size),
            ..Self::default()
        }
    }

    /// Whether this part carries any payload at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text_content.as_deref().map_or(true, str::is_empty) && self.file_url.is_none()
    }
}

/// A chat message, with its ordered content parts loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    /// `None` when the message was authored by the assistant.
    pub sender_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<Uuid>,
    pub is_edited: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub contents: Vec<MessageContent>,
}

impl Message {
    /// Whether the message was authored by the assistant.
    #[must_use]
    pub fn is_assistant(&self) -> bool {
        self.sender_id.is_none()
    }
}

/// Input shape for a message about to be appended.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    /// `None` for assistant-authored messages.
    pub sender_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub contents: Vec<NewContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Uuid>,
}

impl NewMessage {
    /// A plain text message from a user.
    #[must_use]
    pub fn text(sender_id: i64, text: impl Into<String>) -> Self {
        Self {
            sender_id: Some(sender_id),
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// An assistant-authored text message.
    #[must_use]
    pub fn from_assistant(text: impl Into<String>) -> Self {
        Self {
            sender_id: None,
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// Attach a content part.
    #[must_use]
    pub fn with_content(mut self, content: NewContent) -> Self {
        self.contents.push(content);
        self
    }

    /// Mark this message as a reply to an earlier one.
    #[must_use]
    pub fn in_reply_to(mut self, message_id: Uuid) -> Self {
        self.reply_to = Some(message_id);
        self
    }
}

/// Per-recipient delivery state of a message, monotonically advancing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum ReadState {
    Sent = 0,
    Delivered = 1,
    Read = 2,
}

impl ReadState {
    /// Numeric rank used for the monotonic upsert.
    #[must_use]
    pub fn rank(&self) -> u8 {
        *self as u8
    }
}

impl From<ReadState> for u8 {
    fn from(state: ReadState) -> u8 {
        state as u8
    }
}

impl TryFrom<u8> for ReadState {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ReadState::Sent),
            1 => Ok(ReadState::Delivered),
            2 => Ok(ReadState::Read),
            other => Err(format!("unknown read state rank: {other}")),
        }
    }
}

/// Read status row for one (message, reader) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadStatus {
    pub message_id: Uuid,
    pub user_id: i64,
    pub state: ReadState,
    pub updated_at: DateTime<Utc>,
}

/// Assistant-side context, one-to-one with a
/// [`ConversationKind::UserToAssistant`] conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantContext {
    pub conversation_id: Uuid,
    pub system_prompt: String,
    pub last_interaction_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_pair_is_order_independent() {
        assert_eq!(Conversation::canonical_pair(1, 2), (1, 2));
        assert_eq!(Conversation::canonical_pair(2, 1), (1, 2));
        assert_eq!(Conversation::canonical_pair(7, 7), (7, 7));
    }

    #[test]
    fn test_participant_check() {
        let now = Utc::now();
        let pair = Conversation {
            id: Uuid::now_v7(),
            kind: ConversationKind::UserToUser,
            user1_id: 1,
            user2_id: Some(2),
            is_active: true,
            created_at: now,
            last_activity_at: now,
        };
        assert!(pair.is_participant(1));
        assert!(pair.is_participant(2));
        assert!(!pair.is_participant(3));

        let solo = Conversation {
            kind: ConversationKind::UserToAssistant,
            user2_id: None,
            ..pair
        };
        assert!(solo.is_participant(1));
        assert!(!solo.is_participant(2));
    }

    #[test]
    fn test_read_state_is_ordered() {
        assert!(ReadState::Sent < ReadState::Delivered);
        assert!(ReadState::Delivered < ReadState::Read);
        assert_eq!(ReadState::try_from(2), Ok(ReadState::Read));
        assert!(ReadState::try_from(3).is_err());
    }

    #[test]
    fn test_conversation_kind_roundtrip() {
        for kind in [ConversationKind::UserToUser, ConversationKind::UserToAssistant] {
            assert_eq!(kind.as_str().parse::<ConversationKind>(), Ok(kind));
        }
        assert!("group".parse::<ConversationKind>().is_err());
    }

    #[test]
    fn test_empty_content_part() {
        assert!(NewContent::default().is_empty());
        assert!(!NewContent::text("hi").is_empty());
        assert!(!NewContent::image("https://cdn/x.png", 64, 64).is_empty());
    }
}
