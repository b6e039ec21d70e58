//! Bearer tokens and the provider seam.

use async_trait::async_trait;
use axum::http::HeaderValue;

use crate::auth::AuthResult;

/// An opaque bearer credential.
///
/// `Debug` never prints the token itself.
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken(String);

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `Bearer <token>` as a header value marked sensitive.
    ///
    /// Returns `None` if the token contains bytes not allowed in a header.
    pub fn header_value(&self) -> Option<HeaderValue> {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", self.0)).ok()?;
        value.set_sensitive(true);
        Some(value)
    }
}

impl std::fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BearerToken(<{} bytes>)", self.0.len())
    }
}

/// Source of the credential attached to every forwarded request.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Obtain the current token. May perform network calls.
    async fn fetch_token(&self) -> AuthResult<BearerToken>;
}

/// A provider that always hands out the same token.
#[derive(Debug, Clone)]
pub struct StaticToken(BearerToken);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(BearerToken::new(token))
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn fetch_token(&self) -> AuthResult<BearerToken> {
        Ok(self.0.clone())
    }
}
