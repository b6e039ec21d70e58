//! Identity token acquisition for a service account.
//!
//! # Responsibilities
//! - Parse the stored service account key
//! - Sign a short-lived RS256 assertion whose `target_audience` is the
//!   gateway's OAuth client id
//! - Exchange the assertion at the token endpoint for an identity token

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::auth::store::SecretStore;
use crate::auth::token::{BearerToken, TokenProvider};
use crate::auth::{AuthError, AuthResult};

/// OAuth grant type for signed JWT assertions.
pub const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Token endpoint used when the key does not name one.
pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Lifetime of a signed assertion.
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// Timeout for the token exchange.
const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

/// The fields of a service account key file the proxy needs.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl ServiceAccountKey {
    /// Parse a key file's JSON contents.
    pub fn from_json(data: &[u8]) -> AuthResult<Self> {
        serde_json::from_slice(data).map_err(|e| AuthError::InvalidKey(e.to_string()))
    }
}

impl std::fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("private_key_id", &self.private_key_id)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

/// Claims of the signed assertion.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssertionClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    pub target_audience: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    id_token: Option<String>,
}

/// Fetches identity tokens for the gateway's client id.
pub struct ServiceAccountTokenProvider {
    key: ServiceAccountKey,
    encoding_key: EncodingKey,
    audience: String,
    http: reqwest::Client,
}

impl ServiceAccountTokenProvider {
    /// Create a provider for `audience` (the gateway's OAuth client id).
    pub fn new(key: ServiceAccountKey, audience: impl Into<String>) -> AuthResult<Self> {
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| AuthError::InvalidKey(format!("private_key: {}", e)))?;
        let http = reqwest::Client::builder()
            .timeout(TOKEN_REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            key,
            encoding_key,
            audience: audience.into(),
            http,
        })
    }

    /// Load the key stored under `credential_key` and build a provider.
    pub fn from_store(
        store: &dyn SecretStore,
        credential_key: &str,
        audience: impl Into<String>,
    ) -> AuthResult<Self> {
        let data = store
            .get(credential_key)?
            .ok_or_else(|| AuthError::MissingCredentials(credential_key.to_string()))?;
        let key = ServiceAccountKey::from_json(&data)?;
        Self::new(key, audience)
    }

    /// Claims for an assertion issued at `now` (unix seconds).
    pub fn claims(&self, now: i64) -> AssertionClaims {
        AssertionClaims {
            iss: self.key.client_email.clone(),
            sub: self.key.client_email.clone(),
            aud: self.key.token_uri.clone(),
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
            target_audience: self.audience.clone(),
        }
    }

    /// Signed assertion issued at `now`.
    pub fn assertion(&self, now: i64) -> AuthResult<String> {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key.private_key_id.clone();
        Ok(jsonwebtoken::encode(&header, &self.claims(now), &self.encoding_key)?)
    }
}

#[async_trait]
impl TokenProvider for ServiceAccountTokenProvider {
    async fn fetch_token(&self) -> AuthResult<BearerToken> {
        let assertion = self.assertion(chrono::Utc::now().timestamp())?;

        tracing::debug!(
            client_email = %self.key.client_email,
            token_uri = %self.key.token_uri,
            "Requesting identity token"
        );

        let response = self
            .http
            .post(&self.key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = response.json().await?;
        match token.id_token {
            Some(id_token) if !id_token.is_empty() => {
                tracing::info!(client_email = %self.key.client_email, "Identity token obtained");
                Ok(BearerToken::new(id_token))
            }
            _ => Err(AuthError::MissingIdToken),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{DecodingKey, Validation};

    const PRIVATE_KEY: &str = include_str!("../../tests/fixtures/service_account_key.pem");
    const PUBLIC_KEY: &str = include_str!("../../tests/fixtures/service_account_pub.pem");

    fn key() -> ServiceAccountKey {
        ServiceAccountKey {
            client_email: "proxy@project.iam.gserviceaccount.com".to_string(),
            private_key: PRIVATE_KEY.to_string(),
            private_key_id: Some("kid-1".to_string()),
            token_uri: DEFAULT_TOKEN_URI.to_string(),
        }
    }

    #[test]
    fn parses_key_file_with_default_token_uri() {
        let json = serde_json::json!({
            "type": "service_account",
            "client_email": "proxy@project.iam.gserviceaccount.com",
            "private_key": "pem",
        });
        let key = ServiceAccountKey::from_json(json.to_string().as_bytes()).unwrap();
        assert_eq!(key.token_uri, DEFAULT_TOKEN_URI);
        assert!(key.private_key_id.is_none());
    }

    #[test]
    fn rejects_key_file_without_email() {
        let err = ServiceAccountKey::from_json(br#"{"private_key":"pem"}"#).unwrap_err();
        assert!(matches!(err, AuthError::InvalidKey(_)));
    }

    #[test]
    fn debug_hides_private_key() {
        let printed = format!("{:?}", key());
        assert!(!printed.contains("PRIVATE KEY"));
    }

    #[test]
    fn rejects_malformed_private_key() {
        let mut bad = key();
        bad.private_key = "not a pem".to_string();
        assert!(matches!(
            ServiceAccountTokenProvider::new(bad, "client-id"),
            Err(AuthError::InvalidKey(_))
        ));
    }

    #[test]
    fn assertion_is_signed_with_expected_claims() {
        let provider = ServiceAccountTokenProvider::new(key(), "client-id.apps.example.com").unwrap();
        let now = chrono::Utc::now().timestamp();
        let jwt = provider.assertion(now).unwrap();

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[DEFAULT_TOKEN_URI]);
        let decoded = jsonwebtoken::decode::<AssertionClaims>(
            &jwt,
            &DecodingKey::from_rsa_pem(PUBLIC_KEY.as_bytes()).unwrap(),
            &validation,
        )
        .unwrap();

        assert_eq!(decoded.header.kid.as_deref(), Some("kid-1"));
        assert_eq!(decoded.claims, provider.claims(now));
        assert_eq!(decoded.claims.exp - decoded.claims.iat, ASSERTION_LIFETIME_SECS);
        assert_eq!(decoded.claims.target_audience, "client-id.apps.example.com");
    }

    #[test]
    fn missing_stored_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let store = crate::auth::FileSecretStore::new(dir.path());
        let err = ServiceAccountTokenProvider::from_store(&store, "Proxy_Credentials", "aud")
            .err()
            .unwrap();
        assert!(matches!(err, AuthError::MissingCredentials(_)));
    }
}
