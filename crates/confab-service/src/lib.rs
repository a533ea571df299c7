//! # confab-service
//!
//! Chat orchestration and collaborator contracts for Confab.
//!
//! The orchestrator is the business-logic layer between the real-time
//! gateway and persistence:
//!
//! - **ChatService** - Authorization checks and workflow sequencing
//! - **AssistantClient** - Generation collaborator contract + HTTP impl
//! - **Authenticator** - Identity collaborator contract
//!
//! The send workflow is deliberately split: `send_message` persists and
//! returns immediately, `get_assistant_response` is side-effect free, and
//! `send_assistant_message` persists the reply. The gateway composes these
//! into the detached assistant turn.

pub mod assistant;
pub mod auth;
pub mod error;
pub mod orchestrator;

pub use assistant::{AssistantClient, AssistantError, AssistantTurn, HttpAssistant, TurnRole};
pub use auth::{Authenticator, StaticAuthenticator, UserIdentity};
pub use error::ServiceError;
pub use orchestrator::{ChatService, Posted};
