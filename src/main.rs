//! PASS wallet enclave entrypoint.
//!
//! Launches the framed-JSON command service over a loopback TCP listener
//! (the vsock deployment sits behind the same framing).
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `ENCLAVE_SECRET` seeds the key-encryption key (required)
//! - `HOST`, `HTTP_PORT` control the bind address (default 127.0.0.1:5000)
//! - `FRAMING` selects `newline` or `length-prefixed` frames
//! - `LOCK_WAIT_SECS` bounds per-wallet lock waits
//! - `RUST_LOG` controls tracing output

use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use pass_enclave::config::Config;
use pass_enclave::dispatch::Dispatcher;
use pass_enclave::keystore::KeyManager;
use pass_enclave::registry::WalletRegistry;
use pass_enclave::server;
use pass_enclave::shutdown;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env variables
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::load();

    let keystore = Arc::new(KeyManager::new(config.enclave_secret.expose()));
    let registry = Arc::new(WalletRegistry::new(
        keystore.clone(),
        Duration::from_secs(config.lock_wait_secs),
    ));
    let dispatcher = Arc::new(Dispatcher::new(keystore, registry));

    let addr = SocketAddr::new(config.host, config.port);
    tracing::info!(%addr, framing = ?config.framing, "starting enclave service");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        });

    let shutdown = shutdown::shutdown_token()?;
    server::serve(listener, dispatcher, config.framing, shutdown).await?;

    tracing::info!("enclave service stopped");
    Ok(())
}
