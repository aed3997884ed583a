//! Handshake authentication.
//!
//! A connection presents an HS256 JWT either as `Authorization: Bearer`
//! or, for browsers that cannot set upgrade headers, as `?token=`. The
//! header wins when both are present. The token's `sub` must name a user
//! the identity store knows.

mod identity;

pub use identity::{HttpIdentityStore, IdentityError, IdentityStore, InMemoryIdentityStore};

use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::sync::UserId;

/// Why a handshake was refused
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthError {
    #[error("No token supplied")]
    MissingToken,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token expired")]
    Expired,

    #[error("Unknown user: {0}")]
    UnknownSubject(String),

    #[error("Identity service unavailable: {0}")]
    IdentityUnavailable(String),
}

/// Claims carried by a session token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    /// Expiry (seconds since epoch)
    pub exp: i64,
    /// Issued at (seconds since epoch)
    pub iat: i64,
}

/// Raw credentials taken from the upgrade request
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    /// Value of the `Authorization` header
    pub authorization: Option<String>,
    /// Value of the `token` query parameter
    pub query_token: Option<String>,
}

impl Handshake {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            authorization: Some(format!("Bearer {}", token.into())),
            query_token: None,
        }
    }

    pub fn query(token: impl Into<String>) -> Self {
        Self {
            authorization: None,
            query_token: Some(token.into()),
        }
    }

    /// The credential to validate, header first
    pub fn token(&self) -> Option<&str> {
        let from_header = self.authorization.as_deref().map(|value| {
            let value = value.trim_start();
            value
                .strip_prefix("Bearer ")
                .or_else(|| value.strip_prefix("bearer "))
                .unwrap_or(value)
                .trim()
        });

        from_header
            .filter(|t| !t.is_empty())
            .or_else(|| self.query_token.as_deref().map(str::trim).filter(|t| !t.is_empty()))
    }
}

/// Validates handshake tokens and resolves them to users
pub struct ConnectionAuthenticator {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    identity: Arc<dyn IdentityStore>,
}

impl ConnectionAuthenticator {
    pub fn new(secret: &[u8], identity: Arc<dyn IdentityStore>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            identity,
        }
    }

    pub fn identity(&self) -> &Arc<dyn IdentityStore> {
        &self.identity
    }

    /// Resolve a handshake to a user id. No retries.
    pub async fn authenticate(&self, handshake: &Handshake) -> Result<UserId, AuthError> {
        let token = handshake.token().ok_or(AuthError::MissingToken)?;

        let claims = decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidToken(e.to_string()),
            })?
            .claims;

        let exists = self.identity.user_exists(&claims.sub).await.map_err(|e| {
            warn!("Identity lookup for {} failed: {}", claims.sub, e);
            AuthError::IdentityUnavailable(e.to_string())
        })?;
        if !exists {
            return Err(AuthError::UnknownSubject(claims.sub));
        }

        debug!("Authenticated user {}", claims.sub);
        Ok(claims.sub)
    }

    /// Mint a token for `user_id` valid for `ttl`
    pub fn issue_token(&self, user_id: &str, ttl: Duration) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            iat: now,
            exp: now + ttl.as_secs() as i64,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"test-secret";

    fn authenticator() -> ConnectionAuthenticator {
        let identity = Arc::new(InMemoryIdentityStore::with_users(["alice", "bob"]));
        ConnectionAuthenticator::new(SECRET, identity)
    }

    fn token_with_exp(sub: &str, exp: i64) -> String {
        let claims = Claims {
            sub: sub.to_string(),
            exp,
            iat: exp - 60,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET)).unwrap()
    }

    #[tokio::test]
    async fn test_valid_bearer_token() {
        let auth = authenticator();
        let token = auth.issue_token("alice", Duration::from_secs(60)).unwrap();

        let user = auth.authenticate(&Handshake::bearer(token)).await.unwrap();
        assert_eq!(user, "alice");
    }

    #[tokio::test]
    async fn test_query_token() {
        let auth = authenticator();
        let token = auth.issue_token("bob", Duration::from_secs(60)).unwrap();

        let user = auth.authenticate(&Handshake::query(token)).await.unwrap();
        assert_eq!(user, "bob");
    }

    #[tokio::test]
    async fn test_header_wins_over_query() {
        let auth = authenticator();
        let handshake = Handshake {
            authorization: Some(format!(
                "Bearer {}",
                auth.issue_token("alice", Duration::from_secs(60)).unwrap()
            )),
            query_token: Some(auth.issue_token("bob", Duration::from_secs(60)).unwrap()),
        };

        assert_eq!(auth.authenticate(&handshake).await.unwrap(), "alice");
    }

    #[tokio::test]
    async fn test_missing_token() {
        let auth = authenticator();

        assert_eq!(
            auth.authenticate(&Handshake::default()).await,
            Err(AuthError::MissingToken)
        );
        assert_eq!(
            auth.authenticate(&Handshake::bearer("  ")).await,
            Err(AuthError::MissingToken)
        );
    }

    #[tokio::test]
    async fn test_garbage_and_wrong_secret() {
        let auth = authenticator();

        let result = auth.authenticate(&Handshake::bearer("not.a.jwt")).await;
        assert!(matches!(result, Err(AuthError::InvalidToken(_))));

        let other = ConnectionAuthenticator::new(b"other-secret", auth.identity().clone());
        let forged = other.issue_token("alice", Duration::from_secs(60)).unwrap();
        let result = auth.authenticate(&Handshake::bearer(forged)).await;
        assert!(matches!(result, Err(AuthError::InvalidToken(_))));
    }

    #[tokio::test]
    async fn test_expired_token() {
        let auth = authenticator();
        let token = token_with_exp("alice", Utc::now().timestamp() - 3600);

        assert_eq!(
            auth.authenticate(&Handshake::bearer(token)).await,
            Err(AuthError::Expired)
        );
    }

    #[tokio::test]
    async fn test_unknown_subject() {
        let auth = authenticator();
        let token = auth.issue_token("mallory", Duration::from_secs(60)).unwrap();

        assert_eq!(
            auth.authenticate(&Handshake::bearer(token)).await,
            Err(AuthError::UnknownSubject("mallory".to_string()))
        );
    }
}
