//! Assistant-generation collaborator.
//!
//! Generation is a slow, fallible external call. The orchestrator passes a
//! bounded history window plus the conversation's system prompt and gets
//! back a reply string or a failure; no retry is built in here.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Failures of the generation collaborator.
#[derive(Debug, Error)]
pub enum AssistantError {
    /// No response within the configured deadline.
    #[error("generation timed out after {0:?}")]
    Timeout(Duration),

    /// Transport or server-side failure.
    #[error("generation request failed: {0}")]
    Request(String),

    /// The collaborator answered with something unusable.
    #[error("generation returned an unusable response: {0}")]
    BadResponse(String),
}

/// Which side authored a history turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
}

/// One item of the history window handed to the generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantTurn {
    pub role: TurnRole,
    pub text: String,
}

impl AssistantTurn {
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            text: text.into(),
        }
    }

    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            text: text.into(),
        }
    }
}

/// The generation collaborator contract.
#[async_trait]
pub trait AssistantClient: Send + Sync {
    /// Generate a reply for the given conversation history.
    ///
    /// # Errors
    ///
    /// Returns an error when the collaborator fails or times out; the
    /// caller maps this to `AssistantUnavailable`.
    async fn generate(
        &self,
        conversation_id: Uuid,
        history: &[AssistantTurn],
        system_prompt: &str,
    ) -> Result<String, AssistantError>;
}

/// HTTP-backed assistant client.
///
/// Posts the history window as JSON to a configured endpoint and expects
/// `{"text": "..."}` back. The deadline covers the whole exchange.
pub struct HttpAssistant {
    endpoint: String,
    client: reqwest::Client,
    timeout: Duration,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    conversation_id: Uuid,
    system_prompt: &'a str,
    history: &'a [AssistantTurn],
}

#[derive(Deserialize)]
struct GenerateResponse {
    text: String,
}

impl HttpAssistant {
    /// Create a client for the given endpoint.
    #[must_use]
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl AssistantClient for HttpAssistant {
    async fn generate(
        &self,
        conversation_id: Uuid,
        history: &[AssistantTurn],
        system_prompt: &str,
    ) -> Result<String, AssistantError> {
        let request = GenerateRequest {
            conversation_id,
            system_prompt,
            history,
        };

        let exchange = async {
            let response = self
                .client
                .post(&self.endpoint)
                .json(&request)
                .send()
                .await
                .map_err(|e| AssistantError::Request(e.to_string()))?
                .error_for_status()
                .map_err(|e| AssistantError::Request(e.to_string()))?;
            response
                .json::<GenerateResponse>()
                .await
                .map_err(|e| AssistantError::BadResponse(e.to_string()))
        };

        let reply = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| AssistantError::Timeout(self.timeout))??;

        if reply.text.trim().is_empty() {
            return Err(AssistantError::BadResponse("empty reply".into()));
        }

        debug!(conversation = %conversation_id, chars = reply.text.len(), "Assistant reply received");
        Ok(reply.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_constructors() {
        assert_eq!(AssistantTurn::user("hi").role, TurnRole::User);
        assert_eq!(AssistantTurn::assistant("hello").role, TurnRole::Assistant);
    }
}
