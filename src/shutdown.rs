//! Shutdown signal wiring for the enclave service.
//!
//! A signal never interrupts a wallet mutation: cancellation only stops the
//! accept loop and the per-connection read loops, and the transport drains
//! in-flight commands before the process exits. Any wallet lock already
//! acquired runs its operation to completion.

use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

/// Registers SIGTERM/SIGINT handlers and returns the token they cancel.
///
/// The watcher task logs which signal ended the service, then cancels;
/// [`crate::server::serve`] observes the token and drains its connections.
pub fn shutdown_token() -> Result<CancellationToken, std::io::Error> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        let received = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        };
        tracing::info!(signal = received, "shutdown requested; draining connections");
        trigger.cancel();
    });
    Ok(token)
}
