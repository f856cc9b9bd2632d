//! envoyage control plane.
//!
//! Long-running process joining the three subsystems: the service registry
//! (fed by the management API and the Docker watcher), the snapshot
//! builder, and the xDS gRPC server that both managed Envoys subscribe to.

mod api;
mod config;
mod docker;

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use envoyage_registry::ServiceRegistry;
use envoyage_xds::{SnapshotBuilder, XdsServer};

use crate::config::{parse_listen_addr, Config};
use crate::docker::DockerWatcher;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = Config::load();
    info!(
        xds_addr = %cfg.xds_addr,
        api_addr = %cfg.api_addr,
        home_node = %cfg.home_node_id,
        vps_node = %cfg.vps_node_id,
        home_envoy_ingress = %cfg.home_envoy_ingress(),
        "config loaded"
    );

    let xds_addr = parse_listen_addr(&cfg.xds_addr)?;
    let api_addr = parse_listen_addr(&cfg.api_addr)?;

    let registry = Arc::new(ServiceRegistry::new());

    let builder = SnapshotBuilder::new(
        &cfg.home_node_id,
        &cfg.vps_node_id,
        cfg.home_envoy_ingress(),
    );
    let server = XdsServer::new(Arc::clone(&registry), builder);
    // Every managed node must hold a valid snapshot before the first
    // data plane connects; failing here aborts startup.
    server.seed()?;

    match DockerWatcher::connect(Arc::clone(&registry)) {
        Ok(watcher) => {
            tokio::spawn(async move {
                if let Err(e) = watcher.run().await {
                    error!(error = %e, "docker watcher error");
                }
            });
        }
        Err(e) => {
            warn!(error = %e, "docker watcher unavailable, falling back to manual API only");
        }
    }

    let app = api::router(Arc::clone(&registry));
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(api_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(addr = %api_addr, error = %e, "management API failed to bind");
                return;
            }
        };
        info!(addr = %api_addr, "management API listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "management API failed");
        }
    });

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("received shutdown signal");
        let _ = shutdown_tx.send(());
    });

    server.serve(xds_addr, shutdown_rx).await?;
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    error!(error = %e, "failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
