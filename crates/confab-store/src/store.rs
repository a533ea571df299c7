//! The conversation store.
//!
//! Owns all creation and mutation of persisted chat entities. The store is
//! authorization-agnostic: participant checks live in the orchestrator, and
//! everything here validates shape, not permission.

use chrono::Utc;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use confab_protocol::model::{
    AssistantContext, ContentKind, Conversation, ConversationKind, Message, MessageContent,
    NewMessage, ReadState, ReadStatus, MAX_CONTENT_PARTS, MAX_SYSTEM_PROMPT_LENGTH,
    MAX_TEXT_LENGTH,
};

use crate::error::StoreError;
use crate::schema::SCHEMA;

/// System prompt given to a fresh assistant conversation.
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant embedded in a two-party chat. Keep replies short and conversational.";

/// Cap on search results.
const SEARCH_LIMIT: i64 = 100;

const CONVERSATION_COLS: &str =
    "id, kind, user1_id, user2_id, is_active, created_at, last_activity_at";
const MESSAGE_COLS: &str =
    "id, conversation_id, sender_id, text_content, reply_to_id, is_edited, edited_at, is_deleted, created_at";

/// Result of a get-or-create lookup.
///
/// Concurrent callers racing to create the same conversation converge on a
/// single row: exactly one observes `Created`, the rest `Existing`.
#[derive(Debug)]
pub enum GetOrCreate {
    Created(Conversation),
    Existing(Conversation),
}

impl GetOrCreate {
    /// The conversation, regardless of which side won.
    #[must_use]
    pub fn into_inner(self) -> Conversation {
        match self {
            GetOrCreate::Created(c) | GetOrCreate::Existing(c) => c,
        }
    }

    /// Borrow the conversation.
    #[must_use]
    pub fn conversation(&self) -> &Conversation {
        match self {
            GetOrCreate::Created(c) | GetOrCreate::Existing(c) => c,
        }
    }

    /// Whether this call inserted the row.
    #[must_use]
    pub fn was_created(&self) -> bool {
        matches!(self, GetOrCreate::Created(_))
    }
}

/// One page of conversation history, newest first.
#[derive(Debug, Clone)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    /// Total messages in the conversation, for pagination math.
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
}

impl MessagePage {
    /// Number of pages at this page size.
    #[must_use]
    pub fn total_pages(&self) -> u32 {
        if self.total == 0 {
            0
        } else {
            ((self.total - 1) / i64::from(self.page_size) + 1) as u32
        }
    }
}

/// SQLite-backed store for the five chat entities.
#[derive(Clone)]
pub struct ConversationStore {
    pool: SqlitePool,
}

impl ConversationStore {
    /// Wrap an existing pool.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes if they do not exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if any DDL statement fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Conversation store schema ready");
        Ok(())
    }

    /// Find or create the single conversation for a participant pair.
    ///
    /// For `UserToUser` the pair is canonicalized (smaller id first) before
    /// lookup and insert; for `UserToAssistant` the key is `user1_id` alone
    /// and the matching [`AssistantContext`] is created in the same
    /// transaction. Losing the uniqueness race resolves to `Existing`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed participant set.
    pub async fn get_or_create_conversation(
        &self,
        user1_id: i64,
        user2_id: Option<i64>,
        kind: ConversationKind,
    ) -> Result<GetOrCreate, StoreError> {
        let (u1, u2) = match kind {
            ConversationKind::UserToUser => {
                let other = user2_id.ok_or_else(|| {
                    StoreError::validation("user-to-user conversation needs two participants")
                })?;
                if other == user1_id {
                    return Err(StoreError::validation(
                        "cannot open a conversation with yourself",
                    ));
                }
                let (a, b) = Conversation::canonical_pair(user1_id, other);
                (a, Some(b))
            }
            ConversationKind::UserToAssistant => {
                if user2_id.is_some() {
                    return Err(StoreError::validation(
                        "assistant conversation has a single human participant",
                    ));
                }
                (user1_id, None)
            }
        };

        if let Some(existing) = self.find_conversation(u1, u2, kind).await? {
            return Ok(GetOrCreate::Existing(existing));
        }

        let id = Uuid::now_v7();
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO conversations (id, kind, user1_id, user2_id, is_active, created_at, last_activity_at)
             VALUES (?, ?, ?, ?, 1, ?, ?) ON CONFLICT DO NOTHING",
        )
        .bind(id.to_string())
        .bind(kind.as_str())
        .bind(u1)
        .bind(u2)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 1 {
            if kind == ConversationKind::UserToAssistant {
                sqlx::query(
                    "INSERT INTO assistant_contexts (conversation_id, system_prompt, last_interaction_at)
                     VALUES (?, ?, ?)",
                )
                .bind(id.to_string())
                .bind(DEFAULT_SYSTEM_PROMPT)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            debug!(conversation = %id, kind = kind.as_str(), "Created conversation");
            return Ok(GetOrCreate::Created(Conversation {
                id,
                kind,
                user1_id: u1,
                user2_id: u2,
                is_active: true,
                created_at: now,
                last_activity_at: now,
            }));
        }

        // Lost the uniqueness race: a concurrent caller inserted first.
        tx.rollback().await?;
        self.find_conversation(u1, u2, kind)
            .await?
            .map(GetOrCreate::Existing)
            .ok_or_else(|| {
                StoreError::Conflict("conversation uniqueness race could not be resolved".into())
            })
    }

    /// Load a conversation.
    ///
    /// # Errors
    ///
    /// `NotFound` if the id is unknown.
    pub async fn conversation(&self, conversation_id: Uuid) -> Result<Conversation, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLS} FROM conversations WHERE id = ?"
        ))
        .bind(conversation_id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("conversation"))?;
        map_conversation(&row)
    }

    /// Conversations a user participates in, most recently active first.
    pub async fn conversations_for_user(
        &self,
        user_id: i64,
    ) -> Result<Vec<Conversation>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLS} FROM conversations
             WHERE user1_id = ? OR user2_id = ?
             ORDER BY last_activity_at DESC"
        ))
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_conversation).collect()
    }

    /// Deactivate a conversation. Conversations are never hard-deleted.
    ///
    /// # Errors
    ///
    /// `NotFound` if the id is unknown.
    pub async fn deactivate_conversation(&self, conversation_id: Uuid) -> Result<(), StoreError> {
        let affected = sqlx::query("UPDATE conversations SET is_active = 0 WHERE id = ?")
            .bind(conversation_id.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(StoreError::not_found("conversation"));
        }
        Ok(())
    }

    /// Append a message to a conversation.
    ///
    /// Content parts get contiguous positions from 0 in the order supplied;
    /// the conversation's `last_activity_at` is bumped in the same
    /// transaction, which also serializes concurrent senders to one
    /// conversation at the database.
    ///
    /// # Errors
    ///
    /// `Validation` on an empty payload, oversized text, or a reply target
    /// in another conversation; `NotFound` if the conversation or reply
    /// target is absent.
    pub async fn append_message(
        &self,
        conversation_id: Uuid,
        new: NewMessage,
    ) -> Result<Message, StoreError> {
        validate_new_message(&new)?;

        let mut tx = self.pool.begin().await?;

        let conversation = sqlx::query("SELECT is_active FROM conversations WHERE id = ?")
            .bind(conversation_id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::not_found("conversation"))?;
        if !conversation.try_get::<bool, _>("is_active")? {
            return Err(StoreError::validation("conversation is deactivated"));
        }

        if let Some(reply_to) = new.reply_to {
            let target = sqlx::query("SELECT conversation_id FROM messages WHERE id = ?")
                .bind(reply_to.to_string())
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| StoreError::not_found("reply target"))?;
            let target_conversation = parse_uuid(&target.try_get::<String, _>("conversation_id")?)?;
            if target_conversation != conversation_id {
                return Err(StoreError::validation(
                    "reply target is in another conversation",
                ));
            }
        }

        let id = Uuid::now_v7();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO messages (id, conversation_id, sender_id, text_content, reply_to_id, is_edited, is_deleted, created_at)
             VALUES (?, ?, ?, ?, ?, 0, 0, ?)",
        )
        .bind(id.to_string())
        .bind(conversation_id.to_string())
        .bind(new.sender_id)
        .bind(&new.text)
        .bind(new.reply_to.map(|u| u.to_string()))
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let mut contents = Vec::with_capacity(new.contents.len());
        for (position, part) in new.contents.iter().enumerate() {
            let content_id = Uuid::now_v7();
            sqlx::query(
                "INSERT INTO message_contents
                 (id, message_id, kind, position, text_content, file_url, file_name, mime_type, file_size, width, height, thumbnail_url)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(content_id.to_string())
            .bind(id.to_string())
            .bind(part.kind.as_str())
            .bind(position as i64)
            .bind(&part.text_content)
            .bind(&part.file_url)
            .bind(&part.file_name)
            .bind(&part.mime_type)
            .bind(part.file_size)
            .bind(part.width)
            .bind(part.height)
            .bind(&part.thumbnail_url)
            .execute(&mut *tx)
            .await?;

            contents.push(MessageContent {
                id: content_id,
                message_id: id,
                kind: part.kind,
                position: position as i64,
                text_content: part.text_content.clone(),
                file_url: part.file_url.clone(),
                file_name: part.file_name.clone(),
                mime_type: part.mime_type.clone(),
                file_size: part.file_size,
                width: part.width,
                height: part.height,
                thumbnail_url: part.thumbnail_url.clone(),
            });
        }

        sqlx::query("UPDATE conversations SET last_activity_at = ? WHERE id = ?")
            .bind(now)
            .bind(conversation_id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(Message {
            id,
            conversation_id,
            sender_id: new.sender_id,
            text_content: new.text,
            reply_to_id: new.reply_to,
            is_edited: false,
            edited_at: None,
            is_deleted: false,
            created_at: now,
            contents,
        })
    }

    /// Load a message with its content parts.
    ///
    /// # Errors
    ///
    /// `NotFound` if the id is unknown.
    pub async fn get_message(&self, message_id: Uuid) -> Result<Message, StoreError> {
        let row = sqlx::query(&format!("SELECT {MESSAGE_COLS} FROM messages WHERE id = ?"))
            .bind(message_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("message"))?;
        let mut message = map_message(&row)?;
        message.contents = self.load_contents(message_id).await?;
        Ok(message)
    }

    /// Replace a message's text. Authorization-agnostic; the orchestrator
    /// enforces that only the original sender edits.
    ///
    /// # Errors
    ///
    /// `NotFound` if absent; `Validation` for deleted messages or an
    /// empty/oversized replacement.
    pub async fn edit_message(
        &self,
        message_id: Uuid,
        new_text: &str,
    ) -> Result<Message, StoreError> {
        if new_text.trim().is_empty() {
            return Err(StoreError::validation("replacement text cannot be empty"));
        }
        if new_text.chars().count() > MAX_TEXT_LENGTH {
            return Err(StoreError::validation(format!(
                "message text exceeds {MAX_TEXT_LENGTH} characters"
            )));
        }

        let current = self.get_message(message_id).await?;
        if current.is_deleted {
            return Err(StoreError::validation("cannot edit a deleted message"));
        }

        let now = Utc::now();
        sqlx::query("UPDATE messages SET text_content = ?, is_edited = 1, edited_at = ? WHERE id = ?")
            .bind(new_text)
            .bind(now)
            .bind(message_id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(Message {
            text_content: Some(new_text.to_string()),
            is_edited: true,
            edited_at: Some(now),
            ..current
        })
    }

    /// Soft-delete a message: text and contents are cleared, the row stays
    /// so reply references remain resolvable.
    ///
    /// # Errors
    ///
    /// `NotFound` if the id is unknown.
    pub async fn delete_message(&self, message_id: Uuid) -> Result<(), StoreError> {
        // Existence check doubles as the NotFound path.
        let _ = self.get_message(message_id).await?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE messages SET text_content = NULL, is_deleted = 1 WHERE id = ?")
            .bind(message_id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM message_contents WHERE message_id = ?")
            .bind(message_id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// One page of a conversation's history, newest first with a stable id
    /// tiebreak. Page numbering starts at 0.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown conversation, `Validation` for a zero page
    /// size.
    pub async fn get_messages_page(
        &self,
        conversation_id: Uuid,
        page: u32,
        page_size: u32,
    ) -> Result<MessagePage, StoreError> {
        if page_size == 0 {
            return Err(StoreError::validation("page size must be positive"));
        }
        let _ = self.conversation(conversation_id).await?;

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE conversation_id = ?")
            .bind(conversation_id.to_string())
            .fetch_one(&self.pool)
            .await?;

        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLS} FROM messages WHERE conversation_id = ?
             ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?"
        ))
        .bind(conversation_id.to_string())
        .bind(i64::from(page_size))
        .bind(i64::from(page) * i64::from(page_size))
        .fetch_all(&self.pool)
        .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut message = map_message(row)?;
            message.contents = self.load_contents(message.id).await?;
            messages.push(message);
        }

        Ok(MessagePage {
            messages,
            total,
            page,
            page_size,
        })
    }

    /// The most recent `limit` messages of a conversation, oldest first.
    /// Used to assemble assistant history windows.
    pub async fn recent_messages(
        &self,
        conversation_id: Uuid,
        limit: u32,
    ) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLS} FROM messages
             WHERE conversation_id = ? AND is_deleted = 0
             ORDER BY created_at DESC, id DESC LIMIT ?"
        ))
        .bind(conversation_id.to_string())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows.iter().rev() {
            let mut message = map_message(row)?;
            message.contents = self.load_contents(message.id).await?;
            messages.push(message);
        }
        Ok(messages)
    }

    /// Upsert a (message, reader) read status. Monotonic: a transition that
    /// would move the state backward is silently ignored. Marking one's own
    /// message is a no-op.
    ///
    /// # Errors
    ///
    /// `NotFound` if the message is absent.
    pub async fn set_read_status(
        &self,
        message_id: Uuid,
        user_id: i64,
        state: ReadState,
    ) -> Result<(), StoreError> {
        let row = sqlx::query("SELECT sender_id FROM messages WHERE id = ?")
            .bind(message_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("message"))?;
        if row.try_get::<Option<i64>, _>("sender_id")? == Some(user_id) {
            return Ok(());
        }

        sqlx::query(
            "INSERT INTO message_read_status (message_id, user_id, state, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(message_id, user_id) DO UPDATE SET
                 updated_at = CASE WHEN excluded.state > state THEN excluded.updated_at ELSE updated_at END,
                 state = MAX(state, excluded.state)",
        )
        .bind(message_id.to_string())
        .bind(user_id)
        .bind(i64::from(state.rank()))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark every message in a conversation not authored by `user_id` as
    /// read. Idempotent; the monotonic upsert never regresses a state.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown conversation.
    pub async fn mark_conversation_read(
        &self,
        conversation_id: Uuid,
        user_id: i64,
    ) -> Result<u64, StoreError> {
        let _ = self.conversation(conversation_id).await?;

        let affected = sqlx::query(
            "INSERT INTO message_read_status (message_id, user_id, state, updated_at)
             SELECT id, ?, ?, ? FROM messages
                 WHERE conversation_id = ? AND (sender_id IS NULL OR sender_id <> ?)
             ON CONFLICT(message_id, user_id) DO UPDATE SET
                 updated_at = CASE WHEN excluded.state > state THEN excluded.updated_at ELSE updated_at END,
                 state = MAX(state, excluded.state)",
        )
        .bind(user_id)
        .bind(i64::from(ReadState::Read.rank()))
        .bind(Utc::now())
        .bind(conversation_id.to_string())
        .bind(user_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(affected)
    }

    /// Read status for one (message, reader) pair, if any was recorded.
    pub async fn read_status(
        &self,
        message_id: Uuid,
        user_id: i64,
    ) -> Result<Option<ReadStatus>, StoreError> {
        let row = sqlx::query(
            "SELECT message_id, user_id, state, updated_at FROM message_read_status
             WHERE message_id = ? AND user_id = ?",
        )
        .bind(message_id.to_string())
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(map_read_status).transpose()
    }

    /// Search non-deleted message text across the conversations `user_id`
    /// participates in, optionally narrowed to one conversation. Newest
    /// matches first.
    ///
    /// # Errors
    ///
    /// `Validation` for an empty query.
    pub async fn search_messages(
        &self,
        user_id: i64,
        query: &str,
        conversation_id: Option<Uuid>,
    ) -> Result<Vec<Message>, StoreError> {
        if query.trim().is_empty() {
            return Err(StoreError::validation("search query cannot be empty"));
        }

        let mut sql = format!(
            "SELECT m.id, m.conversation_id, m.sender_id, m.text_content, m.reply_to_id,
                    m.is_edited, m.edited_at, m.is_deleted, m.created_at
             FROM messages m JOIN conversations c ON c.id = m.conversation_id
             WHERE m.is_deleted = 0
               AND m.text_content LIKE ? ESCAPE '\\'
               AND (c.user1_id = ? OR c.user2_id = ?)"
        );
        if conversation_id.is_some() {
            sql.push_str(" AND m.conversation_id = ?");
        }
        sql.push_str(" ORDER BY m.created_at DESC, m.id DESC LIMIT ?");

        let mut q = sqlx::query(&sql)
            .bind(like_pattern(query))
            .bind(user_id)
            .bind(user_id);
        if let Some(id) = conversation_id {
            q = q.bind(id.to_string());
        }
        let rows = q.bind(SEARCH_LIMIT).fetch_all(&self.pool).await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut message = map_message(row)?;
            message.contents = self.load_contents(message.id).await?;
            messages.push(message);
        }
        Ok(messages)
    }

    /// Load the assistant context of a conversation.
    ///
    /// # Errors
    ///
    /// `NotFound` if the conversation has no context (not assistant-kind).
    pub async fn assistant_context(
        &self,
        conversation_id: Uuid,
    ) -> Result<AssistantContext, StoreError> {
        let row = sqlx::query(
            "SELECT conversation_id, system_prompt, last_interaction_at
             FROM assistant_contexts WHERE conversation_id = ?",
        )
        .bind(conversation_id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("assistant context"))?;

        Ok(AssistantContext {
            conversation_id: parse_uuid(&row.try_get::<String, _>("conversation_id")?)?,
            system_prompt: row.try_get("system_prompt")?,
            last_interaction_at: row.try_get("last_interaction_at")?,
        })
    }

    /// Bump `last_interaction_at` after an assistant turn.
    ///
    /// # Errors
    ///
    /// `NotFound` if the conversation has no context.
    pub async fn touch_assistant_context(&self, conversation_id: Uuid) -> Result<(), StoreError> {
        let affected =
            sqlx::query("UPDATE assistant_contexts SET last_interaction_at = ? WHERE conversation_id = ?")
                .bind(Utc::now())
                .bind(conversation_id.to_string())
                .execute(&self.pool)
                .await?
                .rows_affected();
        if affected == 0 {
            return Err(StoreError::not_found("assistant context"));
        }
        Ok(())
    }

    /// Replace the system prompt of an assistant conversation.
    ///
    /// # Errors
    ///
    /// `Validation` for an oversized prompt, `NotFound` without a context.
    pub async fn set_system_prompt(
        &self,
        conversation_id: Uuid,
        prompt: &str,
    ) -> Result<(), StoreError> {
        if prompt.chars().count() > MAX_SYSTEM_PROMPT_LENGTH {
            return Err(StoreError::validation(format!(
                "system prompt exceeds {MAX_SYSTEM_PROMPT_LENGTH} characters"
            )));
        }
        let affected =
            sqlx::query("UPDATE assistant_contexts SET system_prompt = ? WHERE conversation_id = ?")
                .bind(prompt)
                .bind(conversation_id.to_string())
                .execute(&self.pool)
                .await?
                .rows_affected();
        if affected == 0 {
            return Err(StoreError::not_found("assistant context"));
        }
        Ok(())
    }

    async fn find_conversation(
        &self,
        user1_id: i64,
        user2_id: Option<i64>,
        kind: ConversationKind,
    ) -> Result<Option<Conversation>, StoreError> {
        let row = match user2_id {
            Some(u2) => {
                sqlx::query(&format!(
                    "SELECT {CONVERSATION_COLS} FROM conversations
                     WHERE kind = ? AND user1_id = ? AND user2_id = ?"
                ))
                .bind(kind.as_str())
                .bind(user1_id)
                .bind(u2)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {CONVERSATION_COLS} FROM conversations
                     WHERE kind = ? AND user1_id = ?"
                ))
                .bind(kind.as_str())
                .bind(user1_id)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        row.as_ref().map(map_conversation).transpose()
    }

    async fn load_contents(&self, message_id: Uuid) -> Result<Vec<MessageContent>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, message_id, kind, position, text_content, file_url, file_name,
                    mime_type, file_size, width, height, thumbnail_url
             FROM message_contents WHERE message_id = ? ORDER BY position",
        )
        .bind(message_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_content).collect()
    }
}

fn validate_new_message(new: &NewMessage) -> Result<(), StoreError> {
    if new.contents.iter().any(|part| part.is_empty()) {
        return Err(StoreError::validation("content part carries no payload"));
    }
    let has_text = new.text.as_deref().map_or(false, |t| !t.trim().is_empty());
    if !has_text && new.contents.is_empty() {
        return Err(StoreError::validation(
            "message needs text or at least one content part",
        ));
    }
    if let Some(text) = &new.text {
        if text.chars().count() > MAX_TEXT_LENGTH {
            return Err(StoreError::validation(format!(
                "message text exceeds {MAX_TEXT_LENGTH} characters"
            )));
        }
    }
    if new.contents.len() > MAX_CONTENT_PARTS {
        return Err(StoreError::validation(format!(
            "message carries more than {MAX_CONTENT_PARTS} content parts"
        )));
    }
    Ok(())
}

fn like_pattern(query: &str) -> String {
    let escaped = query
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Corrupt(format!("bad uuid {s}: {e}")))
}

fn map_conversation(row: &SqliteRow) -> Result<Conversation, StoreError> {
    let kind: String = row.try_get("kind")?;
    Ok(Conversation {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        kind: kind.parse().map_err(StoreError::Corrupt)?,
        user1_id: row.try_get("user1_id")?,
        user2_id: row.try_get("user2_id")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        last_activity_at: row.try_get("last_activity_at")?,
    })
}

fn map_message(row: &SqliteRow) -> Result<Message, StoreError> {
    let reply_to: Option<String> = row.try_get("reply_to_id")?;
    Ok(Message {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        conversation_id: parse_uuid(&row.try_get::<String, _>("conversation_id")?)?,
        sender_id: row.try_get("sender_id")?,
        text_content: row.try_get("text_content")?,
        reply_to_id: reply_to.as_deref().map(parse_uuid).transpose()?,
        is_edited: row.try_get("is_edited")?,
        edited_at: row.try_get("edited_at")?,
        is_deleted: row.try_get("is_deleted")?,
        created_at: row.try_get("created_at")?,
        contents: Vec::new(),
    })
}

fn map_content(row: &SqliteRow) -> Result<MessageContent, StoreError> {
    let kind: String = row.try_get("kind")?;
    Ok(MessageContent {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        message_id: parse_uuid(&row.try_get::<String, _>("message_id")?)?,
        kind: kind.parse::<ContentKind>().map_err(StoreError::Corrupt)?,
        position: row.try_get("position")?,
        text_content: row.try_get("text_content")?,
        file_url: row.try_get("file_url")?,
        file_name: row.try_get("file_name")?,
        mime_type: row.try_get("mime_type")?,
        file_size: row.try_get("file_size")?,
        width: row.try_get("width")?,
        height: row.try_get("height")?,
        thumbnail_url: row.try_get("thumbnail_url")?,
    })
}

fn map_read_status(row: &SqliteRow) -> Result<ReadStatus, StoreError> {
    let rank: i64 = row.try_get("state")?;
    let state = ReadState::try_from(rank as u8).map_err(StoreError::Corrupt)?;
    Ok(ReadStatus {
        message_id: parse_uuid(&row.try_get::<String, _>("message_id")?)?,
        user_id: row.try_get("user_id")?,
        state,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use confab_protocol::model::NewContent;
    use sqlx::sqlite::SqlitePoolOptions;

    // A single pooled connection: every `sqlite::memory:` connection is its
    // own database, so the pool must not open a second one.
    async fn mem_store() -> ConversationStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = ConversationStore::new(pool);
        store.migrate().await.unwrap();
        store
    }

    async fn user_pair(store: &ConversationStore) -> Conversation {
        store
            .get_or_create_conversation(1, Some(2), ConversationKind::UserToUser)
            .await
            .unwrap()
            .into_inner()
    }

    #[tokio::test]
    async fn test_pair_conversation_is_canonical() {
        let store = mem_store().await;

        let first = store
            .get_or_create_conversation(1, Some(2), ConversationKind::UserToUser)
            .await
            .unwrap();
        assert!(first.was_created());

        // Reversed pair resolves to the same row.
        let second = store
            .get_or_create_conversation(2, Some(1), ConversationKind::UserToUser)
            .await
            .unwrap();
        assert!(!second.was_created());
        assert_eq!(first.conversation().id, second.conversation().id);
        assert_eq!(second.conversation().user1_id, 1);
        assert_eq!(second.conversation().user2_id, Some(2));
    }

    #[tokio::test]
    async fn test_one_assistant_conversation_per_user() {
        let store = mem_store().await;

        let first = store
            .get_or_create_conversation(7, None, ConversationKind::UserToAssistant)
            .await
            .unwrap();
        assert!(first.was_created());

        let second = store
            .get_or_create_conversation(7, None, ConversationKind::UserToAssistant)
            .await
            .unwrap();
        assert!(!second.was_created());
        assert_eq!(first.conversation().id, second.conversation().id);

        // Context was created alongside and starts with the default prompt.
        let context = store
            .assistant_context(first.conversation().id)
            .await
            .unwrap();
        assert_eq!(context.system_prompt, DEFAULT_SYSTEM_PROMPT);
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_converges() {
        let store = mem_store().await;

        let (a, b) = tokio::join!(
            store.get_or_create_conversation(3, Some(4), ConversationKind::UserToUser),
            store.get_or_create_conversation(4, Some(3), ConversationKind::UserToUser),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.conversation().id, b.conversation().id);
        assert_eq!(
            [a.was_created(), b.was_created()].iter().filter(|c| **c).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_conversation_pair_validation() {
        let store = mem_store().await;

        assert!(matches!(
            store
                .get_or_create_conversation(1, None, ConversationKind::UserToUser)
                .await,
            Err(StoreError::Validation(_))
        ));
        assert!(matches!(
            store
                .get_or_create_conversation(1, Some(1), ConversationKind::UserToUser)
                .await,
            Err(StoreError::Validation(_))
        ));
        assert!(matches!(
            store
                .get_or_create_conversation(1, Some(2), ConversationKind::UserToAssistant)
                .await,
            Err(StoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_append_requires_payload() {
        let store = mem_store().await;
        let conversation = user_pair(&store).await;

        let empty = NewMessage {
            sender_id: Some(1),
            ..NewMessage::default()
        };
        assert!(matches!(
            store.append_message(conversation.id, empty).await,
            Err(StoreError::Validation(_))
        ));

        // Text alone is enough.
        let text_only = store
            .append_message(conversation.id, NewMessage::text(1, "hi"))
            .await
            .unwrap();
        assert_eq!(text_only.text_content.as_deref(), Some("hi"));
        assert_eq!(text_only.sender_id, Some(1));

        // Contents alone are enough.
        let content_only = NewMessage {
            sender_id: Some(1),
            ..NewMessage::default()
        }
        .with_content(NewContent::image("https://cdn/pic.png", 640, 480));
        let message = store
            .append_message(conversation.id, content_only)
            .await
            .unwrap();
        assert!(message.text_content.is_none());
        assert_eq!(message.contents.len(), 1);
    }

    #[tokio::test]
    async fn test_append_to_unknown_conversation() {
        let store = mem_store().await;
        assert!(matches!(
            store
                .append_message(Uuid::now_v7(), NewMessage::text(1, "hi"))
                .await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_content_positions_are_contiguous() {
        let store = mem_store().await;
        let conversation = user_pair(&store).await;

        let new = NewMessage::text(1, "three parts")
            .with_content(NewContent::text("a"))
            .with_content(NewContent::image("https://cdn/b.png", 1, 1))
            .with_content(NewContent::file("https://cdn/c.pdf", "c.pdf", 1024));
        let message = store.append_message(conversation.id, new).await.unwrap();

        let loaded = store.get_message(message.id).await.unwrap();
        let positions: Vec<i64> = loaded.contents.iter().map(|c| c.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_append_bumps_last_activity() {
        let store = mem_store().await;
        let conversation = user_pair(&store).await;

        store
            .append_message(conversation.id, NewMessage::text(1, "hi"))
            .await
            .unwrap();
        let reloaded = store.conversation(conversation.id).await.unwrap();
        assert!(reloaded.last_activity_at >= conversation.last_activity_at);
    }

    #[tokio::test]
    async fn test_reply_must_stay_in_conversation() {
        let store = mem_store().await;
        let here = user_pair(&store).await;
        let elsewhere = store
            .get_or_create_conversation(1, Some(3), ConversationKind::UserToUser)
            .await
            .unwrap()
            .into_inner();

        let original = store
            .append_message(elsewhere.id, NewMessage::text(1, "over here"))
            .await
            .unwrap();

        let cross = NewMessage::text(1, "replying").in_reply_to(original.id);
        assert!(matches!(
            store.append_message(here.id, cross).await,
            Err(StoreError::Validation(_))
        ));

        let dangling = NewMessage::text(1, "replying").in_reply_to(Uuid::now_v7());
        assert!(matches!(
            store.append_message(here.id, dangling).await,
            Err(StoreError::NotFound(_))
        ));

        // Within the same conversation it sticks.
        let fine = store
            .append_message(elsewhere.id, NewMessage::text(3, "ack").in_reply_to(original.id))
            .await
            .unwrap();
        assert_eq!(fine.reply_to_id, Some(original.id));
    }

    #[tokio::test]
    async fn test_read_status_is_monotonic() {
        let store = mem_store().await;
        let conversation = user_pair(&store).await;
        let message = store
            .append_message(conversation.id, NewMessage::text(1, "hi"))
            .await
            .unwrap();

        store
            .set_read_status(message.id, 2, ReadState::Read)
            .await
            .unwrap();
        // A later Delivered must not regress the state.
        store
            .set_read_status(message.id, 2, ReadState::Delivered)
            .await
            .unwrap();

        let status = store.read_status(message.id, 2).await.unwrap().unwrap();
        assert_eq!(status.state, ReadState::Read);
    }

    #[tokio::test]
    async fn test_read_status_skips_own_message() {
        let store = mem_store().await;
        let conversation = user_pair(&store).await;
        let message = store
            .append_message(conversation.id, NewMessage::text(1, "hi"))
            .await
            .unwrap();

        store
            .set_read_status(message.id, 1, ReadState::Read)
            .await
            .unwrap();
        assert!(store.read_status(message.id, 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_conversation_read_excludes_author() {
        let store = mem_store().await;
        let conversation = user_pair(&store).await;

        let first = store
            .append_message(conversation.id, NewMessage::text(2, "one"))
            .await
            .unwrap();
        let second = store
            .append_message(conversation.id, NewMessage::text(2, "two"))
            .await
            .unwrap();
        let own = store
            .append_message(conversation.id, NewMessage::text(1, "mine"))
            .await
            .unwrap();

        store.mark_conversation_read(conversation.id, 1).await.unwrap();

        for id in [first.id, second.id] {
            let status = store.read_status(id, 1).await.unwrap().unwrap();
            assert_eq!(status.state, ReadState::Read);
        }
        assert!(store.read_status(own.id, 1).await.unwrap().is_none());

        // Second pass is a no-op: states are already Read and stay there.
        store.mark_conversation_read(conversation.id, 1).await.unwrap();
        let status = store.read_status(first.id, 1).await.unwrap().unwrap();
        assert_eq!(status.state, ReadState::Read);
    }

    #[tokio::test]
    async fn test_pagination_newest_first() {
        let store = mem_store().await;
        let conversation = user_pair(&store).await;

        for i in 0..5 {
            store
                .append_message(conversation.id, NewMessage::text(1, format!("m{i}")))
                .await
                .unwrap();
        }

        let page = store.get_messages_page(conversation.id, 0, 2).await.unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.total_pages(), 3);
        assert_eq!(page.messages.len(), 2);
        assert_eq!(page.messages[0].text_content.as_deref(), Some("m4"));
        assert_eq!(page.messages[1].text_content.as_deref(), Some("m3"));

        let last = store.get_messages_page(conversation.id, 2, 2).await.unwrap();
        assert_eq!(last.messages.len(), 1);
        assert_eq!(last.messages[0].text_content.as_deref(), Some("m0"));
    }

    #[tokio::test]
    async fn test_edit_and_soft_delete() {
        let store = mem_store().await;
        let conversation = user_pair(&store).await;
        let message = store
            .append_message(
                conversation.id,
                NewMessage::text(1, "tpyo").with_content(NewContent::text("extra")),
            )
            .await
            .unwrap();

        let edited = store.edit_message(message.id, "typo").await.unwrap();
        assert!(edited.is_edited);
        assert!(edited.edited_at.is_some());
        assert_eq!(edited.text_content.as_deref(), Some("typo"));

        store.delete_message(message.id).await.unwrap();
        let deleted = store.get_message(message.id).await.unwrap();
        assert!(deleted.is_deleted);
        assert!(deleted.text_content.is_none());
        assert!(deleted.contents.is_empty());

        // Deleted messages cannot be edited again.
        assert!(matches!(
            store.edit_message(message.id, "nope").await,
            Err(StoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_keeps_reply_reference_resolvable() {
        let store = mem_store().await;
        let conversation = user_pair(&store).await;
        let original = store
            .append_message(conversation.id, NewMessage::text(1, "original"))
            .await
            .unwrap();
        let reply = store
            .append_message(
                conversation.id,
                NewMessage::text(2, "reply").in_reply_to(original.id),
            )
            .await
            .unwrap();

        store.delete_message(original.id).await.unwrap();

        let reloaded = store.get_message(reply.id).await.unwrap();
        assert_eq!(reloaded.reply_to_id, Some(original.id));
        // The target still resolves, as an emptied shell.
        let shell = store.get_message(original.id).await.unwrap();
        assert!(shell.is_deleted);
    }

    #[tokio::test]
    async fn test_search_is_scoped_to_participants() {
        let store = mem_store().await;
        let ours = user_pair(&store).await;
        let theirs = store
            .get_or_create_conversation(3, Some(4), ConversationKind::UserToUser)
            .await
            .unwrap()
            .into_inner();

        store
            .append_message(ours.id, NewMessage::text(1, "the launch code is blue"))
            .await
            .unwrap();
        store
            .append_message(theirs.id, NewMessage::text(3, "blue is my favorite"))
            .await
            .unwrap();

        let hits = store.search_messages(1, "blue", None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].conversation_id, ours.id);

        // LIKE metacharacters in the query are literal.
        let none = store.search_messages(1, "100%", None).await.unwrap();
        assert!(none.is_empty());

        assert!(matches!(
            store.search_messages(1, "   ", None).await,
            Err(StoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_deactivated_conversation_rejects_messages() {
        let store = mem_store().await;
        let conversation = user_pair(&store).await;

        store.deactivate_conversation(conversation.id).await.unwrap();
        assert!(matches!(
            store
                .append_message(conversation.id, NewMessage::text(1, "hi"))
                .await,
            Err(StoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_assistant_context_lifecycle() {
        let store = mem_store().await;
        let conversation = store
            .get_or_create_conversation(9, None, ConversationKind::UserToAssistant)
            .await
            .unwrap()
            .into_inner();

        let before = store.assistant_context(conversation.id).await.unwrap();
        store.touch_assistant_context(conversation.id).await.unwrap();
        let after = store.assistant_context(conversation.id).await.unwrap();
        assert!(after.last_interaction_at >= before.last_interaction_at);

        store
            .set_system_prompt(conversation.id, "Answer in haiku.")
            .await
            .unwrap();
        let updated = store.assistant_context(conversation.id).await.unwrap();
        assert_eq!(updated.system_prompt, "Answer in haiku.");

        // A user-to-user conversation has no context.
        let pair = user_pair(&store).await;
        assert!(matches!(
            store.assistant_context(pair.id).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
