//! Credential subsystem.
//!
//! # Data Flow
//! ```text
//! Import mode (--cred <file>):
//!     service account JSON on disk
//!     → import_credentials()
//!     → store.rs (persist under the credential key)
//!     → process exits, no listener bound
//!
//! Serving mode:
//!     store.rs (load service account JSON)
//!     → service_account.rs (signed assertion → token endpoint)
//!     → token.rs (BearerToken snapshot)
//!     → held by the forwarding handler for the process lifetime
//! ```
//!
//! # Design Decisions
//! - The token is fetched once, before the listener binds
//! - Providers sit behind a trait so the handler never sees where a token came from

pub mod service_account;
pub mod store;
pub mod token;

use std::path::Path;
use thiserror::Error;

pub use service_account::{ServiceAccountKey, ServiceAccountTokenProvider};
pub use store::{FileSecretStore, SecretStore, StoreError};
pub use token::{BearerToken, StaticToken, TokenProvider};

/// Errors raised while obtaining a bearer token.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No stored credentials were found.
    #[error("No stored credentials under '{0}'; import them with --cred first")]
    MissingCredentials(String),

    /// Secret store could not be read.
    #[error("Secret store error: {0}")]
    Store(#[from] StoreError),

    /// Stored credentials are not a usable service account key.
    #[error("Invalid service account key: {0}")]
    InvalidKey(String),

    /// Signing the assertion failed.
    #[error("Failed to sign assertion: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),

    /// Token endpoint could not be reached.
    #[error("Token request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Token endpoint rejected the assertion.
    #[error("Token endpoint returned {status}: {body}")]
    Rejected { status: u16, body: String },

    /// Token endpoint answered without an identity token.
    #[error("Token response did not contain an id_token")]
    MissingIdToken,
}

/// Result type for credential operations.
pub type AuthResult<T> = Result<T, AuthError>;

/// Errors raised by the one-shot credential import.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Read a credential file and persist it under `key`.
pub fn import_credentials(
    store: &dyn SecretStore,
    key: &str,
    path: &Path,
) -> Result<(), ImportError> {
    let data = std::fs::read(path).map_err(|source| ImportError::Read {
        path: path.display().to_string(),
        source,
    })?;

    store.put(key, &data)?;

    tracing::info!(key = %key, bytes = data.len(), "Credentials imported");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn import_stores_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSecretStore::new(dir.path().join("store"));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{\"client_email\":\"sa@example.com\"}").unwrap();

        import_credentials(&store, "Proxy_Credentials", file.path()).unwrap();

        assert_eq!(
            store.get("Proxy_Credentials").unwrap().unwrap(),
            b"{\"client_email\":\"sa@example.com\"}"
        );
    }

    #[test]
    fn import_reports_unreadable_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSecretStore::new(dir.path().join("store"));

        let err = import_credentials(&store, "Proxy_Credentials", &dir.path().join("missing.json"))
            .unwrap_err();

        assert!(matches!(err, ImportError::Read { .. }));
        assert!(store.get("Proxy_Credentials").unwrap().is_none());
    }
}
