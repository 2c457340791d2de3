use std::sync::Arc;

use anyhow::Context;
use puck_runtime::{ContainerRuntime, PodmanRuntime};
use puckd::{Config, Daemon};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = Config::default();

    let runtime = PodmanRuntime::connect(cfg.podman_socket.as_deref())
        .context("connecting to container runtime")?;
    runtime
        .ping()
        .await
        .context("container runtime is not responding")?;
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(runtime);

    let daemon = Arc::new(Daemon::new(cfg, runtime).await?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    daemon.run(shutdown_rx).await?;
    Ok(())
}
