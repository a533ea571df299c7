//! The chat orchestrator.
//!
//! Enforces authorization and business rules and sequences the multi-step
//! send/receive workflow. Persistence goes through the store; generation
//! goes through the assistant collaborator. The orchestrator never touches
//! live connections; broadcasting is the gateway's job.

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use confab_protocol::model::{
    Conversation, ConversationKind, Message, NewContent, NewMessage, ReadState,
};
use confab_store::{ConversationStore, GetOrCreate, MessagePage};

use crate::assistant::{AssistantClient, AssistantTurn, TurnRole};
use crate::error::ServiceError;

/// Messages of history handed to the assistant per turn.
const DEFAULT_HISTORY_WINDOW: u32 = 20;

/// Outcome of a successful send.
///
/// The conversation kind tells the gateway whether to schedule an assistant
/// turn; the orchestrator itself never blocks on generation.
#[derive(Debug)]
pub struct Posted {
    pub message: Message,
    pub kind: ConversationKind,
}

impl Posted {
    /// Whether the gateway should schedule an assistant turn.
    #[must_use]
    pub fn needs_assistant_turn(&self) -> bool {
        self.kind == ConversationKind::UserToAssistant
    }
}

/// The business-logic layer over store and assistant.
#[derive(Clone)]
pub struct ChatService {
    store: ConversationStore,
    assistant: Arc<dyn AssistantClient>,
    history_window: u32,
}

impl ChatService {
    /// Create a service over a store and a generation collaborator.
    #[must_use]
    pub fn new(store: ConversationStore, assistant: Arc<dyn AssistantClient>) -> Self {
        Self {
            store,
            assistant,
            history_window: DEFAULT_HISTORY_WINDOW,
        }
    }

    /// Override the assistant history window.
    #[must_use]
    pub fn with_history_window(mut self, window: u32) -> Self {
        self.history_window = window.max(1);
        self
    }

    /// Access the underlying store.
    #[must_use]
    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    /// Whether `user_id` may access the conversation.
    ///
    /// # Errors
    ///
    /// `NotFound` if the conversation does not exist.
    pub async fn can_access(
        &self,
        conversation_id: Uuid,
        user_id: i64,
    ) -> Result<bool, ServiceError> {
        let conversation = self.store.conversation(conversation_id).await?;
        Ok(conversation.is_participant(user_id))
    }

    /// Find or create the conversation between `user_id` and `peer`
    /// (or the assistant when `kind` says so and `peer` is `None`).
    ///
    /// # Errors
    ///
    /// Propagates store validation failures.
    pub async fn open_conversation(
        &self,
        user_id: i64,
        peer: Option<i64>,
        kind: ConversationKind,
    ) -> Result<GetOrCreate, ServiceError> {
        Ok(self
            .store
            .get_or_create_conversation(user_id, peer, kind)
            .await?)
    }

    /// Persist a user message.
    ///
    /// # Errors
    ///
    /// `Forbidden` for non-participants; store errors pass through.
    pub async fn send_message(
        &self,
        conversation_id: Uuid,
        user_id: i64,
        text: Option<String>,
        contents: Vec<NewContent>,
        reply_to: Option<Uuid>,
    ) -> Result<Posted, ServiceError> {
        let conversation = self.authorize(conversation_id, user_id).await?;

        let message = self
            .store
            .append_message(
                conversation_id,
                NewMessage {
                    sender_id: Some(user_id),
                    text,
                    contents,
                    reply_to,
                },
            )
            .await?;

        debug!(
            conversation = %conversation_id,
            message = %message.id,
            sender = user_id,
            "Message persisted"
        );

        Ok(Posted {
            message,
            kind: conversation.kind,
        })
    }

    /// Produce an assistant reply for the conversation's current state.
    ///
    /// Loads the bounded history window plus the context's system prompt
    /// and invokes the generation collaborator. This call has no side
    /// effects of its own: persisting the reply is a separate step, so a
    /// transient generation failure never leaves an orphaned message.
    ///
    /// # Errors
    ///
    /// `AssistantUnavailable` when the collaborator fails or times out.
    pub async fn get_assistant_response(
        &self,
        conversation_id: Uuid,
    ) -> Result<String, ServiceError> {
        let context = self.store.assistant_context(conversation_id).await?;
        let history = self
            .store
            .recent_messages(conversation_id, self.history_window)
            .await?;

        let turns: Vec<AssistantTurn> = history
            .iter()
            .filter_map(|message| {
                message.text_content.as_ref().map(|text| AssistantTurn {
                    role: if message.is_assistant() {
                        TurnRole::Assistant
                    } else {
                        TurnRole::User
                    },
                    text: text.clone(),
                })
            })
            .collect();

        let text = self
            .assistant
            .generate(conversation_id, &turns, &context.system_prompt)
            .await?;
        Ok(text)
    }

    /// Persist an assistant-authored reply and bump the context clock.
    ///
    /// # Errors
    ///
    /// Store errors pass through.
    pub async fn send_assistant_message(
        &self,
        conversation_id: Uuid,
        text: impl Into<String>,
    ) -> Result<Message, ServiceError> {
        let message = self
            .store
            .append_message(conversation_id, NewMessage::from_assistant(text.into()))
            .await?;
        self.store.touch_assistant_context(conversation_id).await?;
        Ok(message)
    }

    /// Mark one message as read by `user_id`.
    ///
    /// Returns the message so the caller knows which group to notify.
    ///
    /// # Errors
    ///
    /// `Forbidden` for non-participants.
    pub async fn mark_as_read(
        &self,
        message_id: Uuid,
        user_id: i64,
    ) -> Result<Message, ServiceError> {
        let message = self.store.get_message(message_id).await?;
        self.authorize(message.conversation_id, user_id).await?;
        self.store
            .set_read_status(message_id, user_id, ReadState::Read)
            .await?;
        Ok(message)
    }

    /// Mark every message in the conversation not authored by `user_id` as
    /// read. Idempotent.
    ///
    /// # Errors
    ///
    /// `Forbidden` for non-participants.
    pub async fn mark_all_as_read(
        &self,
        conversation_id: Uuid,
        user_id: i64,
    ) -> Result<u64, ServiceError> {
        self.authorize(conversation_id, user_id).await?;
        Ok(self
            .store
            .mark_conversation_read(conversation_id, user_id)
            .await?)
    }

    /// Replace the text of a message. Restricted to the original sender.
    ///
    /// # Errors
    ///
    /// `Forbidden` when `user_id` did not author the message.
    pub async fn edit_message(
        &self,
        message_id: Uuid,
        user_id: i64,
        new_text: &str,
    ) -> Result<Message, ServiceError> {
        let message = self.store.get_message(message_id).await?;
        self.authorize(message.conversation_id, user_id).await?;
        if message.sender_id != Some(user_id) {
            warn!(message = %message_id, user = user_id, "Edit denied: not the sender");
            return Err(ServiceError::forbidden(
                "only the original sender may edit a message",
            ));
        }
        Ok(self.store.edit_message(message_id, new_text).await?)
    }

    /// Soft-delete a message. Restricted to the original sender.
    ///
    /// Returns the pre-deletion message so the caller knows which group to
    /// notify.
    ///
    /// # Errors
    ///
    /// `Forbidden` when `user_id` did not author the message.
    pub async fn delete_message(
        &self,
        message_id: Uuid,
        user_id: i64,
    ) -> Result<Message, ServiceError> {
        let message = self.store.get_message(message_id).await?;
        self.authorize(message.conversation_id, user_id).await?;
        if message.sender_id != Some(user_id) {
            warn!(message = %message_id, user = user_id, "Delete denied: not the sender");
            return Err(ServiceError::forbidden(
                "only the original sender may delete a message",
            ));
        }
        self.store.delete_message(message_id).await?;
        Ok(message)
    }

    /// One authorization-checked page of history.
    ///
    /// # Errors
    ///
    /// `Forbidden` for non-participants.
    pub async fn history(
        &self,
        conversation_id: Uuid,
        user_id: i64,
        page: u32,
        page_size: u32,
    ) -> Result<MessagePage, ServiceError> {
        self.authorize(conversation_id, user_id).await?;
        Ok(self
            .store
            .get_messages_page(conversation_id, page, page_size)
            .await?)
    }

    /// Search the caller's conversations.
    ///
    /// # Errors
    ///
    /// `Forbidden` when narrowing to a conversation the caller is not in.
    pub async fn search(
        &self,
        user_id: i64,
        query: &str,
        conversation_id: Option<Uuid>,
    ) -> Result<Vec<Message>, ServiceError> {
        if let Some(id) = conversation_id {
            self.authorize(id, user_id).await?;
        }
        Ok(self
            .store
            .search_messages(user_id, query, conversation_id)
            .await?)
    }

    async fn authorize(
        &self,
        conversation_id: Uuid,
        user_id: i64,
    ) -> Result<Conversation, ServiceError> {
        let conversation = self.store.conversation(conversation_id).await?;
        if !conversation.is_participant(user_id) {
            warn!(conversation = %conversation_id, user = user_id, "Access denied: not a participant");
            return Err(ServiceError::forbidden(
                "not a participant in this conversation",
            ));
        }
        Ok(conversation)
    }
}
