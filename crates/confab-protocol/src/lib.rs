//! # confab-protocol
//!
//! Wire protocol and entity model for the Confab messaging core.
//!
//! This crate defines the data contracts shared across the system:
//!
//! - **Model** - Persisted entity shapes (conversations, messages, content
//!   parts, read status, assistant context)
//! - **Events** - Client actions and server events
//! - **Codec** - Length-prefixed MessagePack framing
//! - **Version** - Protocol version negotiation
//!
//! ## Example
//!
//! ```rust
//! use confab_protocol::{codec, ClientAction};
//!
//! let action = ClientAction::Ping;
//!
//! // Encode and decode
//! let encoded = codec::encode(&action).unwrap();
//! let decoded: ClientAction = codec::decode(&encoded).unwrap();
//! assert_eq!(action, decoded);
//! ```

pub mod codec;
pub mod events;
pub mod model;
pub mod version;

pub use codec::{decode, encode, ProtocolError};
pub use events::{ClientAction, ServerEvent};
pub use model::{
    AssistantContext, ContentKind, Conversation, ConversationKind, Message, MessageContent,
    NewContent, NewMessage, ReadState, ReadStatus,
};
pub use version::{Version, PROTOCOL_VERSION};
