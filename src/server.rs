//! Axum integration
//!
//! Mounts the upgrade handler and the health endpoint, and runs the server
//! with a shutdown sequence that closes every tunnel with 1001.

use crate::connection_manager::{ConnectionManager, TunnelStats, UpgradeRequest};
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Query, State},
    http::HeaderMap,
    response::Response,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Query parameters accepted on the upgrade route.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpgradeQuery {
    pub token: Option<String>,
    /// `deflate` opts in to compressed frames
    pub compression: Option<String>,
}

/// Builds the router: `GET <config.path>` upgrades, `GET /health` reports
/// [`TunnelStats`].
///
/// The upgrade handler reads the peer address, so serve the router with
/// `into_make_service_with_connect_info::<SocketAddr>()`.
pub fn router(manager: ConnectionManager) -> Router {
    let path = manager.config().path.clone();
    Router::new()
        .route(&path, get(upgrade_handler))
        .route("/health", get(health_handler))
        .with_state(manager)
}

async fn upgrade_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<UpgradeQuery>,
    headers: HeaderMap,
    State(manager): State<ConnectionManager>,
) -> Response {
    let request = UpgradeRequest {
        query_token: query.token,
        compression: query.compression,
        headers,
        peer_addr: Some(addr),
    };
    manager.handle_upgrade(ws, request).await
}

async fn health_handler(State(manager): State<ConnectionManager>) -> Json<TunnelStats> {
    Json(manager.stats())
}

/// Serves `manager` on `listener` until `signal` resolves, then closes every
/// open connection with "Server shutting down" before returning.
pub async fn serve_with_shutdown<F>(
    listener: TcpListener,
    manager: ConnectionManager,
    signal: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(manager.clone());
    serve_router_with_shutdown(listener, app, manager, signal).await
}

/// Like [`serve_with_shutdown`], for an `app` that already merges
/// [`router`] with other routes or layers.
pub async fn serve_router_with_shutdown<F>(
    listener: TcpListener,
    app: Router,
    manager: ConnectionManager,
    signal: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("Tunnel server listening on {}", addr);
    }

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        signal.await;
        info!("Shutdown signal received, closing tunnels");
        manager.close_all_connections("Server shutting down").await;
        manager.heartbeat().stop_all();
        manager.compression().log_stats();
    })
    .await
}

/// Resolves on Ctrl+C.
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
