//! Schema bootstrap for the conversation store.
//!
//! Tables are created idempotently at startup. The two partial unique
//! indexes carry the structural invariants: one UserToUser conversation per
//! canonical pair, one UserToAssistant conversation per user.

/// DDL statements, executed in order by [`crate::ConversationStore::migrate`].
pub const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS conversations (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        user1_id INTEGER NOT NULL,
        user2_id INTEGER,
        is_active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        last_activity_at TEXT NOT NULL
    )",
    // Canonical-pair uniqueness: user1_id holds the smaller id of the pair.
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_pair
        ON conversations (user1_id, user2_id) WHERE kind = 'user_to_user'",
    // At most one assistant conversation per user.
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_assistant
        ON conversations (user1_id) WHERE kind = 'user_to_assistant'",
    "CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        conversation_id TEXT NOT NULL REFERENCES conversations(id),
        sender_id INTEGER,
        text_content TEXT,
        reply_to_id TEXT REFERENCES messages(id),
        is_edited INTEGER NOT NULL DEFAULT 0,
        edited_at TEXT,
        is_deleted INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_messages_conversation
        ON messages (conversation_id, created_at)",
    "CREATE TABLE IF NOT EXISTS message_contents (
        id TEXT PRIMARY KEY,
        message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
        kind TEXT NOT NULL,
        position INTEGER NOT NULL,
        text_content TEXT,
        file_url TEXT,
        file_name TEXT,
        mime_type TEXT,
        file_size INTEGER,
        width INTEGER,
        height INTEGER,
        thumbnail_url TEXT,
        UNIQUE (message_id, position)
    )",
    "CREATE TABLE IF NOT EXISTS message_read_status (
        message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
        user_id INTEGER NOT NULL,
        state INTEGER NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (message_id, user_id)
    )",
    "CREATE TABLE IF NOT EXISTS assistant_contexts (
        conversation_id TEXT PRIMARY KEY REFERENCES conversations(id) ON DELETE CASCADE,
        system_prompt TEXT NOT NULL,
        last_interaction_at TEXT NOT NULL
    )",
];
