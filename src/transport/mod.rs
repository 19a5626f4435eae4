//! Transport and credential collaborators
//!
//! The engine never talks HTTP directly. Everything goes through the
//! [`Transport`] trait so the fetch pipeline can run against the reqwest
//! backed [`HttpTransport`] in production and an in-memory double in tests.

pub mod http;

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::upload::UploadFile;

pub use http::HttpTransport;

/// Failures that happen before a status line was obtained
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// Connection, TLS or protocol failure
    #[error("Network error: {0}")]
    Network(String),

    /// The request did not complete in time
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// The request could not be built
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Raw response from the upstream service
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn ok(body: impl Into<String>) -> Self {
        Self::new(200, body)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// An opaque bearer token for one logical account
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    account: String,
    token: String,
}

impl Credential {
    pub fn new(account: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            token: token.into(),
        }
    }

    /// Identity used in cache keys; never the token itself
    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("account", &self.account)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// HTTP capability consumed by the fetch pipeline and the upload monitor.
///
/// Both methods return `Ok` for any response that carried a status line,
/// including non-2xx ones; interpreting the status is the caller's job.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, path: &str, credential: &Credential) -> TransportResult<TransportResponse>;

    async fn post_multipart(
        &self,
        path: &str,
        credential: &Credential,
        file: &UploadFile,
    ) -> TransportResult<TransportResponse>;
}

/// Supplies a credential per logical account
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credential(&self, account: &str) -> Option<Credential>;
}

/// Fixed account → token table
#[derive(Default)]
pub struct StaticCredentials {
    tokens: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, account: impl Into<String>, token: impl Into<String>) -> Self {
        self.tokens.insert(account.into(), token.into());
        self
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn credential(&self, account: &str) -> Option<Credential> {
        self.tokens
            .get(account)
            .map(|token| Credential::new(account, token.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_debug_redacts_token() {
        let cred = Credential::new("agency-1", "s3cret");
        let printed = format!("{:?}", cred);
        assert!(printed.contains("agency-1"));
        assert!(!printed.contains("s3cret"));
        assert_eq!(cred.bearer(), "Bearer s3cret");
    }

    #[test]
    fn test_response_success_range() {
        assert!(TransportResponse::ok("[]").is_success());
        assert!(TransportResponse::new(204, "").is_success());
        assert!(!TransportResponse::new(429, "slow down").is_success());
    }

    #[tokio::test]
    async fn test_static_credentials() {
        let provider = StaticCredentials::new().with_token("main", "abc");
        assert_eq!(provider.credential("main").await, Some(Credential::new("main", "abc")));
        assert!(provider.credential("other").await.is_none());
    }
}
