//! Startup orchestration.
//!
//! # Responsibilities
//! - Persist credentials in import mode, then stop
//! - Fetch the bearer token before anything is bound
//! - Build the immutable forwarding configuration
//! - Start the metrics exporter when enabled
//! - Bind the listener and serve until shutdown

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::net::TcpListener;

use crate::auth::{
    import_credentials, AuthError, FileSecretStore, ImportError, ServiceAccountTokenProvider,
    StoreError, TokenProvider,
};
use crate::config::{ConfigError, ProxyConfig};
use crate::http::{ForwardConfig, HttpServer, SetupError};
use crate::lifecycle::Shutdown;
use crate::observability::metrics;

/// Anything that stops the process before or while serving.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("Error initializing secret store: {0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Import(#[from] ImportError),

    #[error("Failed to obtain token: {0}")]
    Auth(#[from] AuthError),

    #[error("Invalid forwarding setup: {0}")]
    Setup(#[from] SetupError),

    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// Import mode: store the credential file and return the store location.
pub fn import(config: &ProxyConfig, path: &Path) -> Result<PathBuf, StartupError> {
    let store = FileSecretStore::open(&config.credentials.service)?;
    import_credentials(&store, &config.credentials.key, path)?;
    Ok(store.dir().to_path_buf())
}

/// What import mode tells the operator once the key is stored.
pub fn import_notice(path: &Path) -> String {
    format!("Credentials saved to keyring. Please delete {}", path.display())
}

/// Serving mode with the stored service account credentials.
pub async fn serve(config: ProxyConfig, shutdown: Shutdown) -> Result<(), StartupError> {
    let store = FileSecretStore::open(&config.credentials.service)?;
    let provider = ServiceAccountTokenProvider::from_store(
        &store,
        &config.credentials.key,
        config.credentials.client_id.clone(),
    )?;
    serve_with(config, &provider, shutdown).await
}

/// Serving mode with an explicit token provider.
pub async fn serve_with(
    config: ProxyConfig,
    provider: &dyn TokenProvider,
    shutdown: Shutdown,
) -> Result<(), StartupError> {
    let token = provider.fetch_token().await?;
    let forward = ForwardConfig::from_config(&config, &token)?;

    tracing::info!(
        backend = %forward.backend(),
        bind_address = %config.listener.bind_address,
        authorization = ?config.credentials.authorization,
        upstream_timeout_secs = ?config.timeouts.upstream_secs,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = TcpListener::bind(&config.listener.bind_address)
        .await
        .map_err(|source| StartupError::Bind {
            address: config.listener.bind_address.clone(),
            source,
        })?;

    HttpServer::new(forward)
        .run(listener, shutdown.subscribe())
        .await?;
    Ok(())
}
