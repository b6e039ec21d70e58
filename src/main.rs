//! IAP proxy.
//!
//! Listens locally and forwards every request to a backend protected by an
//! identity-aware access gateway, authenticating with a service account.
//!
//! ```text
//!     Client ──▶ 127.0.0.1:8080 ──▶ rewrite + Bearer token ──▶ IAP_HOST
//!     Client ◀── status, headers, streamed body ◀────────────── backend
//! ```
//!
//! Import the service account key once, then run without `--cred`:
//!
//! ```text
//! iap-proxy --cred service-account.json
//! IAP_HOST=https://app.example.com IAP_CLIENT_ID=<client id> iap-proxy --addr 127.0.0.1:8080
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

use iap_proxy::config::{loader::read_config, resolve_config, Overrides, ProxyConfig};
use iap_proxy::lifecycle::{self, signals, Shutdown, StartupError};
use iap_proxy::observability::logging;

#[derive(Parser)]
#[command(name = "iap-proxy")]
#[command(about = "Forward local HTTP requests to a service behind an identity-aware proxy", long_about = None)]
struct Cli {
    /// The addr of the application [default: 127.0.0.1:8080]
    #[arg(long)]
    addr: Option<String>,

    /// Path to a service account key to import, then exit
    #[arg(long, value_name = "FILE")]
    cred: Option<PathBuf>,

    /// Optional TOML configuration file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Backend URL behind the gateway
    #[arg(long, env = "IAP_HOST")]
    iap_host: Option<String>,

    /// OAuth client id of the gateway
    #[arg(long, env = "IAP_CLIENT_ID")]
    client_id: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), StartupError> {
    if let Some(cred) = cli.cred {
        // Import only needs the store settings, so skip serving validation.
        let config = match cli.config.as_deref() {
            Some(path) => read_config(path)?,
            None => ProxyConfig::default(),
        };
        logging::init_logging(&config.observability.log_level);

        let location = lifecycle::import(&config, &cred)?;
        tracing::info!(path = ?location, "Credentials stored");
        println!("{}", lifecycle::import_notice(&cred));
        return Ok(());
    }

    let overrides = Overrides {
        bind_address: cli.addr,
        backend_url: cli.iap_host,
        client_id: cli.client_id,
    };
    let config = resolve_config(cli.config.as_deref(), overrides)?;
    logging::init_logging(&config.observability.log_level);

    tracing::info!("iap-proxy v{} starting", env!("CARGO_PKG_VERSION"));

    let shutdown = Shutdown::new();
    signals::spawn_ctrl_c_handler(shutdown.clone());

    lifecycle::serve(config, shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
