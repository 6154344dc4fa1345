//! `avalink serve`: run the bridge with the admin API in front of it.

use anyhow::{Context, Result};
use avaconf::BridgeConfig;
use tracing::{info, warn};

use crate::api;
use crate::bridge::Bridge;

pub async fn run(config: BridgeConfig) -> Result<()> {
    let admin = config.admin.clone();
    let bridge = Bridge::new(config).context("Failed to build bridge")?;

    let started = bridge.start().await;
    if started.success {
        info!("{}", started.message);
    } else {
        // The admin API can still start it later, and auto-retry may be running.
        warn!("bridge did not start: {}", started.message);
    }

    if admin.enabled {
        let listener = tokio::net::TcpListener::bind(&admin.bind)
            .await
            .with_context(|| format!("Failed to bind admin API to {}", admin.bind))?;
        info!("admin API: http://{}", admin.bind);
        info!("   events: GET http://{}/events", admin.bind);

        axum::serve(listener, api::router(bridge.clone()))
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("Admin API server error")?;
    } else {
        shutdown_signal().await;
    }

    if bridge.local_port().await.is_some() {
        let stopped = bridge.stop().await;
        info!("{}", stopped.message);
    }
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down...");
        }
        _ = terminate() => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("cannot listen for SIGTERM: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
