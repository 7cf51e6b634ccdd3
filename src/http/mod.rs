//! HTTP surfaces.
//!
//! - [`health`]: worker liveness/readiness and metrics snapshot
//! - [`ingest`]: event submission API

pub mod health;
pub mod ingest;

use axum::Router;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Bind `addr` and serve `router` until `shutdown` is cancelled.
///
/// Returns the bound address (useful with port 0) and the serving task.
pub async fn serve(
    name: &'static str,
    addr: SocketAddr,
    router: Router,
    shutdown: CancellationToken,
) -> std::io::Result<(SocketAddr, tokio::task::JoinHandle<std::io::Result<()>>)> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(server = name, address = %local_addr, "HTTP server listening");

    let task = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                tracing::info!(server = name, "HTTP server shutting down");
            })
            .await
    });

    Ok((local_addr, task))
}
