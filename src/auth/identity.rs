//! Identity and access lookups.
//!
//! The session engine never stores users or permissions itself; it asks an
//! `IdentityStore` whether a user exists and whether they may open a
//! document.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use reqwest::{Client, StatusCode, Url};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::sync::{DocumentId, UserId};

/// Errors from an identity backend
#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Identity service request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Identity service returned status {0}")]
    UnexpectedStatus(u16),

    #[error("Invalid identity service URL: {0}")]
    InvalidUrl(String),
}

/// External source of users and document access
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Whether `user_id` is a known user
    async fn user_exists(&self, user_id: &str) -> Result<bool, IdentityError>;

    /// Whether `user_id` may join the room of `document_id`
    async fn can_join(&self, user_id: &str, document_id: &str) -> Result<bool, IdentityError>;
}

/// Process-local identity store.
///
/// A document without an access list is open to every known user.
#[derive(Debug, Default)]
pub struct InMemoryIdentityStore {
    users: DashSet<UserId>,
    access: DashMap<DocumentId, HashSet<UserId>>,
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users<I, S>(users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = Self::new();
        for user in users {
            store.add_user(user);
        }
        store
    }

    pub fn add_user(&self, user_id: impl Into<String>) {
        self.users.insert(user_id.into());
    }

    /// Restrict a document to an explicit set of users
    pub fn grant(&self, document_id: impl Into<String>, user_id: impl Into<String>) {
        self.access
            .entry(document_id.into())
            .or_default()
            .insert(user_id.into());
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

#[async_trait]
impl IdentityStore for InMemoryIdentityStore {
    async fn user_exists(&self, user_id: &str) -> Result<bool, IdentityError> {
        Ok(self.users.contains(user_id))
    }

    async fn can_join(&self, user_id: &str, document_id: &str) -> Result<bool, IdentityError> {
        if !self.users.contains(user_id) {
            return Ok(false);
        }
        Ok(self
            .access
            .get(document_id)
            .map(|allowed| allowed.contains(user_id))
            .unwrap_or(true))
    }
}

/// Identity store backed by the user service's REST API.
///
/// - `GET {base}/users/{user}`
/// - `GET {base}/documents/{document}/members/{user}`
///
/// 2xx means yes, 403 and 404 mean no; anything else is an error.
#[derive(Debug, Clone)]
pub struct HttpIdentityStore {
    client: Client,
    base_url: Url,
}

impl HttpIdentityStore {
    pub fn new(base_url: impl Into<String>) -> Result<Self, IdentityError> {
        let raw = base_url.into();
        let base_url =
            Url::parse(&raw).map_err(|e| IdentityError::InvalidUrl(format!("{}: {}", raw, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(IdentityError::InvalidUrl(raw));
        }

        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self { client, base_url })
    }

    /// Append path segments to the base URL, percent-encoding each one
    fn endpoint(&self, segments: &[&str]) -> Result<Url, IdentityError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| IdentityError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn check(&self, url: Url) -> Result<bool, IdentityError> {
        let status = self.client.get(url.clone()).send().await?.status();
        debug!("Identity lookup {} -> {}", url, status);
        interpret_status(status)
    }
}

fn interpret_status(status: StatusCode) -> Result<bool, IdentityError> {
    if status.is_success() {
        Ok(true)
    } else if status == StatusCode::NOT_FOUND || status == StatusCode::FORBIDDEN {
        Ok(false)
    } else {
        Err(IdentityError::UnexpectedStatus(status.as_u16()))
    }
}

#[async_trait]
impl IdentityStore for HttpIdentityStore {
    async fn user_exists(&self, user_id: &str) -> Result<bool, IdentityError> {
        self.check(self.endpoint(&["users", user_id])?).await
    }

    async fn can_join(&self, user_id: &str, document_id: &str) -> Result<bool, IdentityError> {
        self.check(self.endpoint(&["documents", document_id, "members", user_id])?)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_user() {
        let store = InMemoryIdentityStore::with_users(["alice"]);

        assert!(store.user_exists("alice").await.unwrap());
        assert!(!store.user_exists("mallory").await.unwrap());
        assert!(!store.can_join("mallory", "doc-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_open_and_restricted_documents() {
        let store = InMemoryIdentityStore::with_users(["alice", "bob"]);
        store.grant("secret", "alice");

        assert!(store.can_join("bob", "doc-1").await.unwrap());
        assert!(store.can_join("alice", "secret").await.unwrap());
        assert!(!store.can_join("bob", "secret").await.unwrap());
    }

    #[test]
    fn test_added_user_becomes_known() {
        let store = InMemoryIdentityStore::new();
        assert!(!tokio_test::block_on(store.user_exists("carol")).unwrap());

        store.add_user("carol");
        assert!(tokio_test::block_on(store.user_exists("carol")).unwrap());
        assert_eq!(store.user_count(), 1);
    }

    #[test]
    fn test_status_mapping() {
        assert!(interpret_status(StatusCode::OK).unwrap());
        assert!(interpret_status(StatusCode::NO_CONTENT).unwrap());
        assert!(!interpret_status(StatusCode::NOT_FOUND).unwrap());
        assert!(!interpret_status(StatusCode::FORBIDDEN).unwrap());
        assert!(matches!(
            interpret_status(StatusCode::BAD_GATEWAY),
            Err(IdentityError::UnexpectedStatus(502))
        ));
    }

    #[test]
    fn test_http_store_endpoints() {
        let store = HttpIdentityStore::new("http://users.local/api/").unwrap();
        assert_eq!(
            store.endpoint(&["users", "alice"]).unwrap().as_str(),
            "http://users.local/api/users/alice"
        );

        let store = HttpIdentityStore::new("http://users.local/api").unwrap();
        assert_eq!(
            store.endpoint(&["users", "alice"]).unwrap().as_str(),
            "http://users.local/api/users/alice"
        );
    }

    #[test]
    fn test_http_store_escapes_path_segments() {
        let store = HttpIdentityStore::new("http://users.local/api").unwrap();

        let url = store
            .endpoint(&["documents", "../users/x?admin=1#frag", "members", "alice"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://users.local/api/documents/..%2Fusers%2Fx%3Fadmin=1%23frag/members/alice"
        );
        assert_eq!(url.query(), None);
        assert_eq!(url.fragment(), None);
        assert_eq!(url.path_segments().unwrap().count(), 5);
    }

    #[test]
    fn test_http_store_rejects_bad_base_url() {
        assert!(matches!(
            HttpIdentityStore::new("not a url"),
            Err(IdentityError::InvalidUrl(_))
        ));
        assert!(matches!(
            HttpIdentityStore::new("mailto:users@example.com"),
            Err(IdentityError::InvalidUrl(_))
        ));
    }
}
