//! Identity collaborator.
//!
//! Given the token a connection presents, the authenticator yields a stable
//! user id and display name, or nothing. The gateway fails closed on
//! nothing: the connection stays unauthenticated and every action is
//! rejected.

use std::collections::HashMap;

use async_trait::async_trait;

/// A resolved connection identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub user_id: i64,
    pub display_name: String,
}

/// The identity collaborator contract.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Resolve a token to an identity, or `None` if it does not check out.
    async fn authenticate(&self, token: &str) -> Option<UserIdentity>;
}

/// Fixed token table, for development and tests.
#[derive(Debug, Default)]
pub struct StaticAuthenticator {
    tokens: HashMap<String, UserIdentity>,
}

impl StaticAuthenticator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token.
    #[must_use]
    pub fn with_token(
        mut self,
        token: impl Into<String>,
        user_id: i64,
        display_name: impl Into<String>,
    ) -> Self {
        self.tokens.insert(
            token.into(),
            UserIdentity {
                user_id,
                display_name: display_name.into(),
            },
        );
        self
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(&self, token: &str) -> Option<UserIdentity> {
        self.tokens.get(token).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_authenticator() {
        let auth = StaticAuthenticator::new().with_token("alice-token", 1, "Alice");

        let identity = auth.authenticate("alice-token").await.unwrap();
        assert_eq!(identity.user_id, 1);
        assert_eq!(identity.display_name, "Alice");

        assert!(auth.authenticate("mallory-token").await.is_none());
    }
}
