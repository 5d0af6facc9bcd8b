pub mod config;
pub mod error;
pub mod interpreter;
pub mod markers;
pub mod prober;
pub mod protocol;
pub mod pty;
pub mod registry;
pub mod server;
pub mod session;
pub mod shell_integration;

use std::sync::Arc;

use config::Config;
use registry::Registry;

/// Builds a registry, seeds it with one session (a freshly attached client
/// must always find something already running — spec.md's registry is never
/// observably empty outside `Dispose`), and serves the REST/WS surface until
/// the process is killed.
pub async fn run() -> std::io::Result<()> {
    let config = Config::from_env();
    let registry = Registry::new(config.clone());

    if let Err(e) = registry.create() {
        log::error!("failed to create initial session: {e}");
    }

    let port = server::serve(Arc::clone(&registry), &config).await?;
    log::info!("tabminal ready on port {port}");

    wait_for_shutdown_signal().await;
    log::info!("shutting down, disposing {} session(s)", registry.len());
    registry.dispose().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut int = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    tokio::select! {
        _ = term.recv() => {}
        _ = int.recv() => {}
    }
}

#[cfg(windows)]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
