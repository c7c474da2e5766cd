//! Tunnel server example
//!
//! Accepts tunnels on `/tunnel`, authenticates them with a fixed token table
//! and answers every request envelope with its own payload.
//!
//! ```text
//! cargo run --example tunnel_server
//! websocat "ws://127.0.0.1:3000/tunnel?token=demo-token"
//! {"type":"request","requestId":"1","payload":{"hello":"world"},"timestamp":0}
//! ```

use anyhow::Result;
use async_trait::async_trait;
use axum::{routing::get, Router};
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;
use websocket_tunnel::{
    router, serve_router_with_shutdown, shutdown_signal, AllowAllRateLimiter, ConnectionManager,
    HeartbeatConfig, RequestForwarder, SocketHandle, StaticTokenAuthenticator, TunnelMessage,
};

/// Sends the request payload straight back.
#[derive(Debug)]
struct EchoForwarder;

#[async_trait]
impl RequestForwarder for EchoForwarder {
    async fn forward(&self, socket: &SocketHandle, message: TunnelMessage) -> Result<()> {
        info!(connection_id = %socket.id(), request_id = ?message.request_id, "Echoing request");
        socket.send_message(&TunnelMessage::response(
            message.request_id,
            message.payload.unwrap_or(Value::Null),
        ))?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,websocket_tunnel=debug")),
        )
        .init();

    let manager = ConnectionManager::builder(
        StaticTokenAuthenticator::new().with_token("demo-token", "demo-user", "free"),
        AllowAllRateLimiter,
    )
    .with_heartbeat(HeartbeatConfig::fast())
    .with_forwarder(EchoForwarder)
    .build();

    let app = Router::new()
        .route(
            "/",
            get(|| async { "Tunnel server - connect to /tunnel?token=demo-token" }),
        )
        .merge(router(manager.clone()))
        .layer(TraceLayer::new_for_http());

    let addr = "127.0.0.1:3000";
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Connect to ws://{addr}/tunnel?token=demo-token");

    serve_router_with_shutdown(listener, app, manager, shutdown_signal()).await?;

    Ok(())
}
