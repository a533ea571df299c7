//! # confab-store
//!
//! SQLite persistence for Confab conversations and messages.
//!
//! The store exclusively owns creation and mutation of the five persisted
//! entities (conversations, messages, content parts, read status, assistant
//! contexts). It is authorization-agnostic: the orchestrator decides who may
//! do what, the store decides what is structurally valid.
//!
//! ## Invariants enforced here
//!
//! - One `UserToUser` conversation per unordered user pair, stored in
//!   canonical order (partial unique index).
//! - One `UserToAssistant` conversation per user, context created in the
//!   same transaction.
//! - Content part positions are contiguous from 0 within a message.
//! - Read status never regresses (monotonic upsert).
//! - Replies stay inside their conversation (checked at write time).

pub mod error;
pub mod schema;
pub mod store;

pub use error::StoreError;
pub use store::{ConversationStore, GetOrCreate, MessagePage, DEFAULT_SYSTEM_PROMPT};
