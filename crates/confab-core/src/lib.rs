//! # confab-core
//!
//! Session registry and group fan-out for the Confab messaging core.
//!
//! This crate provides the in-memory connection layer:
//!
//! - **ConnectionId** - Identity for a live connection
//! - **Group** - Per-conversation set of joined connections with broadcast
//! - **SessionRegistry** - Two-level connection/group arena
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────────┐     ┌─────────────┐
//! │  Connection │────▶│  SessionRegistry │────▶│    Group    │
//! └─────────────┘     └──────────────────┘     └─────────────┘
//!                                                     │
//!                                                     ▼
//!                                          broadcast to members
//! ```
//!
//! The registry holds no source of truth: it is rebuilt from zero on process
//! restart and clients re-join their conversations after reconnecting.

pub mod connection;
pub mod group;
pub mod registry;

pub use connection::ConnectionId;
pub use group::Group;
pub use registry::{RegistryConfig, RegistryError, RegistryStats, SessionRegistry};
