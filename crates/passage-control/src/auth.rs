//! Authentication interface consumed by the control plane.
//!
//! Token issuance and verification mechanics live with the embedding
//! layer; the core only needs "which owner does this token belong to".
//! Validation must be cryptographic or constant-time — a cache hit is
//! never an authentication result.

use async_trait::async_trait;
use passage_engine::SecretToken;
use passage_proto::OwnerId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid token")]
    InvalidToken,

    #[error("authentication unavailable: {0}")]
    Unavailable(String),
}

/// Resolves a presented token to the owner it authenticates.
#[async_trait]
pub trait TokenAuthenticator: Send + Sync {
    async fn validate_token(&self, token: &str) -> Result<OwnerId, AuthError>;
}

/// Fixed token table; constant-time comparison per entry. Suited to
/// tests and small static deployments.
#[derive(Debug, Default)]
pub struct StaticTokenAuthenticator {
    tokens: Vec<(SecretToken, OwnerId)>,
}

impl StaticTokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: SecretToken, owner: OwnerId) -> Self {
        self.tokens.push((token, owner));
        self
    }
}

#[async_trait]
impl TokenAuthenticator for StaticTokenAuthenticator {
    async fn validate_token(&self, token: &str) -> Result<OwnerId, AuthError> {
        // Check every entry so timing does not reveal which one matched.
        let mut found = None;
        for (expected, owner) in &self.tokens {
            if expected.matches(token) {
                found = Some(*owner);
            }
        }
        found.ok_or(AuthError::InvalidToken)
    }
}
