//! Connection lifecycle orchestration
//!
//! The [`ConnectionManager`] admits upgrade requests, owns the connection
//! table and wires the heartbeat, frame-size, compression and close managers
//! into one reader loop per socket.

use crate::close_code::CloseCode;
use crate::compression::{
    CompressionError, CompressionManager, CompressionStats, COMPRESSION_HEADER,
};
use crate::config::{CompressionConfig, FrameSizeConfig, HeartbeatConfig, TunnelConfig};
use crate::connection::{
    client_ip, extract_token, timestamp, Connection, ConnectionId, ConnectionIdGenerator,
    HealthStatus, SessionInfo,
};
use crate::error::UpgradeRejection;
use crate::frame_size::{FrameSizeStats, FrameSizeValidator};
use crate::graceful_close::{CloseOptions, CloseStats, GracefulCloseManager};
use crate::heartbeat::{
    HeartbeatManager, HeartbeatStats, TimeoutHandler, HEARTBEAT_TIMEOUT_REASON,
};
use crate::message::{MessageType, TunnelMessage};
use crate::services::{Authenticator, RateLimiter, RequestForwarder, UnroutableForwarder};
use crate::socket::{spawn_writer, SocketHandle};
use crate::websocket_trait::{
    AxumWebSocket, WebSocketConnection, WsError, WsMessage, WsStream,
};
use axum::extract::ws::WebSocketUpgrade;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::response::{IntoResponse, Response};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Everything the admission checks need from an upgrade request.
#[derive(Debug, Clone, Default)]
pub struct UpgradeRequest {
    /// `token` query parameter
    pub query_token: Option<String>,
    /// `compression` query parameter
    pub compression: Option<String>,
    pub headers: HeaderMap,
    pub peer_addr: Option<SocketAddr>,
}

/// One thing that happened on a socket, as seen by the reader loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Message { data: Vec<u8>, binary: bool },
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    /// Close code and reason. A stream that ended without a close frame is
    /// reported as 1006.
    Close(u16, String),
    Error(String),
}

impl ConnectionEvent {
    pub fn from_frame(frame: Option<Result<WsMessage, WsError>>) -> Self {
        match frame {
            Some(Ok(WsMessage::Text(text))) => Self::Message {
                data: text.into_bytes(),
                binary: false,
            },
            Some(Ok(WsMessage::Binary(data))) => Self::Message { data, binary: true },
            Some(Ok(WsMessage::Ping(data))) => Self::Ping(data),
            Some(Ok(WsMessage::Pong(data))) => Self::Pong(data),
            Some(Ok(WsMessage::Close(Some((code, reason))))) => Self::Close(code, reason),
            Some(Ok(WsMessage::Close(None))) => {
                Self::Close(CloseCode::NoStatusReceived.as_u16(), String::new())
            }
            Some(Err(e)) => Self::Error(e.to_string()),
            None => Self::Close(CloseCode::AbnormalClosure.as_u16(), String::new()),
        }
    }
}

/// Snapshot of every manager's statistics, served on the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStats {
    pub health: HealthStatus,
    pub frames: FrameSizeStats,
    pub compression: CompressionStats,
    pub heartbeat: HeartbeatStats,
    pub closes: CloseStats,
}

#[derive(Debug)]
struct TrackedConnection {
    socket: SocketHandle,
    meta: Connection,
}

#[derive(Debug)]
struct ManagerInner {
    config: TunnelConfig,
    authenticator: Arc<dyn Authenticator>,
    rate_limiter: Arc<dyn RateLimiter>,
    forwarder: Arc<dyn RequestForwarder>,
    heartbeat: HeartbeatManager,
    frame_validator: FrameSizeValidator,
    compression: Arc<CompressionManager>,
    graceful_close: GracefulCloseManager,
    ids: ConnectionIdGenerator,
    connections: Mutex<HashMap<ConnectionId, TrackedConnection>>,
}

/// Builder for [`ConnectionManager`].
///
/// # Example
/// ```
/// use websocket_tunnel::{
///     AllowAllRateLimiter, ConnectionManager, HeartbeatConfig, StaticTokenAuthenticator,
/// };
///
/// let manager = ConnectionManager::builder(
///     StaticTokenAuthenticator::new().with_token("secret", "alice", "pro"),
///     AllowAllRateLimiter,
/// )
/// .with_heartbeat(HeartbeatConfig::fast())
/// .with_channel_size(256)
/// .build();
///
/// assert_eq!(manager.connection_count(), 0);
/// ```
#[derive(Debug)]
pub struct ConnectionManagerBuilder {
    config: TunnelConfig,
    authenticator: Arc<dyn Authenticator>,
    rate_limiter: Arc<dyn RateLimiter>,
    forwarder: Arc<dyn RequestForwarder>,
}

impl ConnectionManagerBuilder {
    /// Creates a builder with the default [`TunnelConfig`]. Requests are
    /// answered with an error until a forwarder is configured.
    pub fn new<A, R>(authenticator: A, rate_limiter: R) -> Self
    where
        A: Authenticator + 'static,
        R: RateLimiter + 'static,
    {
        Self {
            config: TunnelConfig::default(),
            authenticator: Arc::new(authenticator),
            rate_limiter: Arc::new(rate_limiter),
            forwarder: Arc::new(UnroutableForwarder),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: TunnelConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.config.heartbeat = heartbeat;
        self
    }

    #[must_use]
    pub fn with_frame_size(mut self, frame_size: FrameSizeConfig) -> Self {
        self.config.frame_size = frame_size;
        self
    }

    #[must_use]
    pub fn with_compression(mut self, compression: CompressionConfig) -> Self {
        self.config.compression = compression;
        self
    }

    #[must_use]
    pub fn with_forwarder<F: RequestForwarder + 'static>(mut self, forwarder: F) -> Self {
        self.forwarder = Arc::new(forwarder);
        self
    }

    #[must_use]
    pub fn with_arc_forwarder(mut self, forwarder: Arc<dyn RequestForwarder>) -> Self {
        self.forwarder = forwarder;
        self
    }

    /// Sets the outbound queue depth per connection.
    #[must_use]
    pub fn with_channel_size(mut self, size: usize) -> Self {
        self.config.channel_size = size;
        self
    }

    #[must_use]
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.config.close_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn build(self) -> ConnectionManager {
        let graceful_close = GracefulCloseManager::new();
        let close_timeout = self.config.close_timeout();
        let heartbeat = HeartbeatManager::new(self.config.heartbeat)
            .with_close_manager(graceful_close.clone(), close_timeout);
        let frame_validator = FrameSizeValidator::new(self.config.frame_size)
            .with_close_manager(graceful_close.clone(), close_timeout);
        let compression = Arc::new(CompressionManager::new(self.config.compression));

        ConnectionManager {
            inner: Arc::new(ManagerInner {
                config: self.config,
                authenticator: self.authenticator,
                rate_limiter: self.rate_limiter,
                forwarder: self.forwarder,
                heartbeat,
                frame_validator,
                compression,
                graceful_close,
                ids: ConnectionIdGenerator::new(),
                connections: Mutex::new(HashMap::new()),
            }),
        }
    }
}

/// Cheap to clone; all clones share the same connection table and managers.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn builder<A, R>(authenticator: A, rate_limiter: R) -> ConnectionManagerBuilder
    where
        A: Authenticator + 'static,
        R: RateLimiter + 'static,
    {
        ConnectionManagerBuilder::new(authenticator, rate_limiter)
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.inner.config
    }

    pub fn heartbeat(&self) -> &HeartbeatManager {
        &self.inner.heartbeat
    }

    pub fn frame_validator(&self) -> &FrameSizeValidator {
        &self.inner.frame_validator
    }

    pub fn compression(&self) -> &CompressionManager {
        &self.inner.compression
    }

    pub fn graceful_close(&self) -> &GracefulCloseManager {
        &self.inner.graceful_close
    }

    /// Runs the admission checks for an upgrade request: token presence,
    /// token validity, user context and the connect-time rate limit.
    ///
    /// Every outcome is reported to [`Authenticator::log_auth_attempt`].
    pub async fn authorize_upgrade(
        &self,
        request: &UpgradeRequest,
    ) -> Result<SessionInfo, UpgradeRejection> {
        let auth = &self.inner.authenticator;
        let ip = client_ip(&request.headers, request.peer_addr);

        let Some(token) = extract_token(request.query_token.as_deref(), &request.headers) else {
            warn!(event = "upgrade_rejected", ip = %ip, reason = "missing_token", "Upgrade without token");
            auth.log_auth_attempt(None, false, UpgradeRejection::MissingToken.code())
                .await;
            return Err(UpgradeRejection::MissingToken);
        };

        let validation = auth.validate_token(&token).await;
        if !validation.valid {
            let rejection = if validation.is_expired() {
                UpgradeRejection::ExpiredToken
            } else {
                UpgradeRejection::InvalidToken(
                    validation
                        .error
                        .clone()
                        .unwrap_or_else(|| "Invalid token".to_string()),
                )
            };
            warn!(
                event = "upgrade_rejected",
                ip = %ip,
                reason = rejection.code(),
                "Token rejected"
            );
            auth.log_auth_attempt(validation.user_id.as_deref(), false, rejection.code())
                .await;
            return Err(rejection);
        }

        let context = match auth.user_context(&token).await {
            Ok(context) => context,
            Err(e) => {
                error!(ip = %ip, error = %e, "Failed to resolve user context");
                let rejection = UpgradeRejection::ContextUnavailable;
                auth.log_auth_attempt(validation.user_id.as_deref(), false, rejection.code())
                    .await;
                return Err(rejection);
            }
        };

        let decision = self
            .inner
            .rate_limiter
            .check_limit(&context.user_id, &ip)
            .await;
        if !decision.allowed {
            let rejection = UpgradeRejection::RateLimited {
                retry_after: decision.retry_after,
            };
            warn!(
                event = "upgrade_rejected",
                ip = %ip,
                user_id = %context.user_id,
                reason = rejection.code(),
                retry_after = ?decision.retry_after,
                "Connection rate limited"
            );
            auth.log_auth_attempt(Some(&context.user_id), false, rejection.code())
                .await;
            return Err(rejection);
        }

        let requested = request
            .headers
            .get(COMPRESSION_HEADER)
            .and_then(|value| value.to_str().ok())
            .or(request.compression.as_deref());
        let compression = self.inner.compression.negotiate(requested);

        auth.log_auth_attempt(Some(&context.user_id), true, "connection_established")
            .await;

        Ok(SessionInfo {
            user_id: context.user_id,
            tier: context.tier,
            remote_address: ip,
            compression,
        })
    }

    /// Axum entry point: admits the request and either completes the upgrade
    /// or answers with a 401/429 without switching protocols.
    pub async fn handle_upgrade(&self, ws: WebSocketUpgrade, request: UpgradeRequest) -> Response {
        let session = match self.authorize_upgrade(&request).await {
            Ok(session) => session,
            Err(rejection) => return rejection.into_response(),
        };

        let compression = session.compression;
        let manager = self.clone();
        let mut response = ws.on_upgrade(move |socket| async move {
            manager
                .handle_connection(AxumWebSocket::new(socket), session)
                .await;
        });

        if compression {
            response.headers_mut().insert(
                HeaderName::from_static(COMPRESSION_HEADER),
                HeaderValue::from_static("deflate"),
            );
        }
        response
    }

    /// Serves one upgraded socket until it closes.
    pub async fn handle_connection<W>(&self, socket: W, session: SessionInfo)
    where
        W: WebSocketConnection,
        W::Sink: 'static,
    {
        let id = self.inner.ids.next_id();
        let (sink, mut stream) = socket.split();
        let compression = session
            .compression
            .then(|| Arc::clone(&self.inner.compression));
        let (handle, outbound) =
            SocketHandle::new(id.clone(), self.inner.config.channel_size, compression);
        let writer = spawn_writer(&handle, sink, outbound);

        self.inner.connections.lock().insert(
            id.clone(),
            TrackedConnection {
                socket: handle.clone(),
                meta: Connection::new(id.clone(), &session),
            },
        );

        info!(
            event = "connection_established",
            connection_id = %id,
            user_id = %session.user_id,
            tier = %session.tier,
            ip = %session.remote_address,
            compression = session.compression,
            timestamp = %timestamp(),
            "WebSocket connection established"
        );

        self.start_heartbeat(&handle);

        let (code, reason) = self.read_loop(&handle, &mut stream).await;
        self.handle_disconnect(&id, code, &reason);

        drop(handle);
        if let Err(e) = writer.await {
            error!(connection_id = %id, error = %e, "Writer task failed");
        }
    }

    async fn read_loop<S: WsStream>(&self, socket: &SocketHandle, stream: &mut S) -> (u16, String) {
        loop {
            let frame = tokio::select! {
                biased;

                _ = socket.terminated() => {
                    debug!(connection_id = %socket.id(), "Socket terminated, leaving read loop");
                    return (CloseCode::AbnormalClosure.as_u16(), "Terminated".to_string());
                }

                frame = stream.next() => frame,
            };

            if let ControlFlow::Break(close) = self
                .dispatch(socket, ConnectionEvent::from_frame(frame))
                .await
            {
                return close;
            }
        }
    }

    /// Routes one event. Breaks with the close code and reason once the
    /// socket is closed.
    pub async fn dispatch(
        &self,
        socket: &SocketHandle,
        event: ConnectionEvent,
    ) -> ControlFlow<(u16, String)> {
        match event {
            ConnectionEvent::Message { data, binary } => {
                self.handle_message(socket, data, binary).await;
            }
            ConnectionEvent::Ping(_) => {
                trace!(connection_id = %socket.id(), "Ping frame received");
                self.update_connection(socket.id(), Connection::touch);
            }
            ConnectionEvent::Pong(_) => {
                let latency = self.inner.heartbeat.handle_pong(socket.id());
                self.update_connection(socket.id(), |meta| meta.record_pong(latency));
            }
            ConnectionEvent::Error(e) => {
                warn!(
                    event = "connection_error",
                    connection_id = %socket.id(),
                    error = %e,
                    timestamp = %timestamp(),
                    "Transport error"
                );
                self.update_connection(socket.id(), Connection::mark_unhealthy);
            }
            ConnectionEvent::Close(code, reason) => {
                // Peer-initiated close: answer it so the handshake completes.
                if socket.is_open() && code != CloseCode::AbnormalClosure.as_u16() {
                    let echo = match CloseCode::from_u16(code) {
                        Some(CloseCode::NoStatusReceived) => CloseCode::Normal.as_u16(),
                        _ => code,
                    };
                    if let Err(e) = socket.close(echo, reason.clone()) {
                        trace!(connection_id = %socket.id(), error = %e, "Could not echo close frame");
                    }
                }
                socket.mark_closed(Some((code, reason.clone())));
                return ControlFlow::Break((code, reason));
            }
        }
        ControlFlow::Continue(())
    }

    /// Processes one inbound data frame.
    pub async fn handle_message(&self, socket: &SocketHandle, data: Vec<u8>, binary: bool) {
        let id = socket.id();
        let Some((user_id, ip)) = self.with_connection(id, |meta| {
            (meta.user_or_anonymous().to_string(), meta.remote_address.clone())
        }) else {
            error!(connection_id = %id, "Message for untracked connection");
            self.spawn_close(socket, CloseOptions::new(CloseCode::InternalError));
            return;
        };

        if !self.inner.frame_validator.validate_and_handle(
            socket,
            data.len(),
            Some(&user_id),
            Some(id.as_str()),
        ) {
            return;
        }

        // Compressed frames are held to the same limit once inflated.
        let data = if binary && socket.compression_enabled() {
            let limit = self.inner.frame_validator.max_frame_size();
            match self.inner.compression.decompress_bounded(&data, limit) {
                Ok(inflated) => inflated,
                Err(CompressionError::TooLarge(_)) => {
                    self.inner.frame_validator.validate_and_handle(
                        socket,
                        limit.saturating_add(1),
                        Some(&user_id),
                        Some(id.as_str()),
                    );
                    return;
                }
                Err(e) => {
                    warn!(connection_id = %id, error = %e, "Failed to inflate frame");
                    self.reply(socket, &TunnelMessage::error("Failed to decompress message"));
                    return;
                }
            }
        } else {
            data
        };

        self.update_connection(id, Connection::record_message);

        let decision = self.inner.rate_limiter.check_limit(&user_id, &ip).await;
        if !decision.allowed {
            warn!(
                event = "message_rate_limited",
                connection_id = %id,
                user_id = %user_id,
                retry_after = ?decision.retry_after,
                "Message rate limited"
            );
            self.reply(socket, &TunnelMessage::rate_limited(decision.retry_after));
            return;
        }
        self.inner.rate_limiter.record_request(&user_id, &ip).await;

        // The connection may have been torn down while the limiter ran.
        if !self.is_tracked(id) {
            debug!(connection_id = %id, "Connection closed during rate check, dropping message");
            return;
        }

        let message = match TunnelMessage::parse(&data) {
            Ok(message) => message,
            Err(e) => {
                warn!(connection_id = %id, error = %e, "Invalid message format");
                self.reply(socket, &TunnelMessage::error("Invalid message format"));
                return;
            }
        };

        trace!(connection_id = %id, kind = ?message.kind, request_id = ?message.request_id, "Message received");

        match message.kind {
            MessageType::Ping => {
                if let Err(e) = self.inner.heartbeat.handle_ping_message(socket, &message) {
                    debug!(connection_id = %id, error = %e, "Failed to answer ping");
                }
            }
            MessageType::Pong => {
                let latency = self.inner.heartbeat.handle_pong_message(socket);
                self.update_connection(id, |meta| meta.record_pong(latency));
            }
            MessageType::Request => self.spawn_forward(socket, message),
            MessageType::Close => {
                self.spawn_close(
                    socket,
                    CloseOptions::new(CloseCode::Normal).with_reason("Client requested close"),
                );
            }
            MessageType::Response | MessageType::Error | MessageType::Unknown => {
                warn!(
                    connection_id = %id,
                    kind = ?message.kind,
                    "Unsupported message type, dropping"
                );
            }
        }
    }

    /// Forgets a closed connection. Calling it again is a no-op.
    pub fn handle_disconnect(&self, id: &ConnectionId, code: u16, reason: &str) {
        let Some(tracked) = self.inner.connections.lock().remove(id) else {
            return;
        };
        self.inner.heartbeat.stop_heartbeat(id);

        let duration = tracked.meta.duration();
        info!(
            event = "connection_closed",
            connection_id = %id,
            user_id = tracked.meta.user_or_anonymous(),
            code,
            reason,
            duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            message_count = tracked.meta.message_count,
            unsent_frames = tracked.socket.pending(),
            timestamp = %timestamp(),
            "WebSocket connection closed"
        );
    }

    /// A connection is healthy only while its socket is open and it was
    /// never flagged unhealthy.
    pub fn check_connection_health(&self) -> HealthStatus {
        let connections = self.inner.connections.lock();
        let healthy = connections
            .values()
            .filter(|tracked| tracked.socket.is_open() && tracked.meta.is_healthy)
            .count();
        let latencies: Vec<u64> = connections
            .values()
            .filter_map(|tracked| tracked.meta.latency_ms)
            .filter(|latency| *latency > 0)
            .collect();

        HealthStatus {
            active_connections: connections.len(),
            healthy_connections: healthy,
            unhealthy_connections: connections.len() - healthy,
            average_latency: if latencies.is_empty() {
                0.0
            } else {
                latencies.iter().sum::<u64>() as f64 / latencies.len() as f64
            },
        }
    }

    /// Closes every open connection with 1001, concurrently, giving each peer
    /// the shutdown grace period to acknowledge.
    pub async fn close_all_connections(&self, reason: &str) {
        let sockets: Vec<SocketHandle> = self
            .inner
            .connections
            .lock()
            .values()
            .filter(|tracked| tracked.socket.is_open())
            .map(|tracked| tracked.socket.clone())
            .collect();

        info!(
            event = "closing_all_connections",
            count = sockets.len(),
            reason,
            timestamp = %timestamp(),
            "Closing all connections"
        );

        let options = CloseOptions::new(CloseCode::GoingAway)
            .with_reason(reason)
            .with_timeout(self.inner.config.shutdown_grace());
        self.inner.graceful_close.close_all(&sockets, options).await;
    }

    pub fn stats(&self) -> TunnelStats {
        TunnelStats {
            health: self.check_connection_health(),
            frames: self.inner.frame_validator.get_stats(),
            compression: self.inner.compression.get_stats(),
            heartbeat: self.inner.heartbeat.stats(),
            closes: self.inner.graceful_close.stats(),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }

    pub fn connection(&self, id: &ConnectionId) -> Option<Connection> {
        self.with_connection(id, Connection::clone)
    }

    pub fn connections(&self) -> Vec<Connection> {
        let mut connections: Vec<Connection> = self
            .inner
            .connections
            .lock()
            .values()
            .map(|tracked| tracked.meta.clone())
            .collect();
        connections.sort_by(|a, b| a.connected_at.cmp(&b.connected_at).then(a.id.cmp(&b.id)));
        connections
    }

    pub fn socket(&self, id: &ConnectionId) -> Option<SocketHandle> {
        self.inner
            .connections
            .lock()
            .get(id)
            .map(|tracked| tracked.socket.clone())
    }

    fn is_tracked(&self, id: &ConnectionId) -> bool {
        self.inner.connections.lock().contains_key(id)
    }

    fn with_connection<T>(&self, id: &ConnectionId, f: impl FnOnce(&Connection) -> T) -> Option<T> {
        self.inner
            .connections
            .lock()
            .get(id)
            .map(|tracked| f(&tracked.meta))
    }

    fn update_connection(&self, id: &ConnectionId, f: impl FnOnce(&mut Connection)) {
        if let Some(tracked) = self.inner.connections.lock().get_mut(id) {
            f(&mut tracked.meta);
        }
    }

    fn reply(&self, socket: &SocketHandle, message: &TunnelMessage) {
        if let Err(e) = socket.send_message(message) {
            debug!(connection_id = %socket.id(), error = %e, "Failed to send reply");
        }
    }

    fn start_heartbeat(&self, socket: &SocketHandle) {
        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let on_timeout: TimeoutHandler = Box::new(move |socket: SocketHandle| {
            let Some(inner) = weak.upgrade() else {
                socket.terminate();
                return;
            };
            let manager = ConnectionManager { inner };
            manager.update_connection(socket.id(), Connection::mark_unhealthy);
            manager.spawn_close(
                &socket,
                CloseOptions::new(CloseCode::GoingAway).with_reason(HEARTBEAT_TIMEOUT_REASON),
            );
        });
        self.inner
            .heartbeat
            .start_heartbeat(socket.clone(), Some(on_timeout));
    }

    /// Graceful closes wait for the peer's close event, which arrives through
    /// the reader loop, so they never run inline in it.
    fn spawn_close(&self, socket: &SocketHandle, options: CloseOptions) {
        let options = options.with_timeout(self.inner.config.close_timeout());
        if !self.inner.graceful_close.spawn_close(socket, options) {
            debug!(connection_id = %socket.id(), "Socket already closing");
        }
    }

    fn spawn_forward(&self, socket: &SocketHandle, message: TunnelMessage) {
        let forwarder = Arc::clone(&self.inner.forwarder);
        let socket = socket.clone();
        tokio::spawn(async move {
            let request_id = message.request_id.clone();
            if let Err(e) = forwarder.forward(&socket, message).await {
                error!(
                    connection_id = %socket.id(),
                    request_id = ?request_id,
                    error = %e,
                    "Request forwarding failed"
                );
                let reply = TunnelMessage::error(format!("Request failed: {e}"))
                    .with_request_id(request_id);
                if let Err(e) = socket.send_message(&reply) {
                    debug!(connection_id = %socket.id(), error = %e, "Failed to send error reply");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{RateLimitDecision, TokenValidation, UserContext};
    use crate::websocket_trait::mock::create_mock_websocket;
    use anyhow::Result;
    use async_trait::async_trait;
    use axum::http::header::AUTHORIZATION;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    type AuditLog = Arc<Mutex<Vec<(Option<String>, bool, String)>>>;

    #[derive(Debug, Default)]
    struct TestAuth {
        audit: AuditLog,
    }

    #[async_trait]
    impl Authenticator for TestAuth {
        async fn validate_token(&self, token: &str) -> TokenValidation {
            match token {
                "good" | "no-context" => TokenValidation::valid("alice"),
                "stale" => TokenValidation::invalid("Token expired"),
                _ => TokenValidation::invalid("bad signature"),
            }
        }

        async fn user_context(&self, token: &str) -> Result<UserContext> {
            if token == "no-context" {
                anyhow::bail!("user store unavailable");
            }
            Ok(UserContext {
                user_id: "alice".into(),
                tier: "pro".into(),
            })
        }

        async fn log_auth_attempt(&self, user_id: Option<&str>, success: bool, reason: &str) {
            self.audit
                .lock()
                .push((user_id.map(ToString::to_string), success, reason.to_string()));
        }
    }

    #[derive(Debug, Clone, Default)]
    struct TestLimiter {
        deny: Arc<AtomicBool>,
        checks: Arc<AtomicUsize>,
        recorded: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RateLimiter for TestLimiter {
        async fn check_limit(&self, _user_id: &str, _ip: &str) -> RateLimitDecision {
            self.checks.fetch_add(1, Ordering::SeqCst);
            if self.deny.load(Ordering::SeqCst) {
                RateLimitDecision::deny(Some(30))
            } else {
                RateLimitDecision::allow()
            }
        }

        async fn record_request(&self, _user_id: &str, _ip: &str) {
            self.recorded.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Debug)]
    struct EchoForwarder;

    #[async_trait]
    impl RequestForwarder for EchoForwarder {
        async fn forward(&self, socket: &SocketHandle, message: TunnelMessage) -> Result<()> {
            socket.send_message(&TunnelMessage::response(
                message.request_id,
                message.payload.unwrap_or(Value::Null),
            ))?;
            Ok(())
        }
    }

    fn manager_with(limiter: TestLimiter) -> ConnectionManager {
        ConnectionManager::builder(TestAuth::default(), limiter)
            .with_forwarder(EchoForwarder)
            .build()
    }

    fn session(compression: bool) -> SessionInfo {
        SessionInfo {
            user_id: "alice".into(),
            tier: "pro".into(),
            remote_address: "10.0.0.1".into(),
            compression,
        }
    }

    struct Client {
        id: ConnectionId,
        sink_rx: mpsc::Receiver<WsMessage>,
        stream_tx: mpsc::Sender<Result<WsMessage, WsError>>,
        task: JoinHandle<()>,
    }

    impl Client {
        async fn send_text(&self, text: impl Into<String>) {
            self.stream_tx
                .send(Ok(WsMessage::Text(text.into())))
                .await
                .unwrap();
        }

        /// Next frame that is not a heartbeat ping.
        async fn next_frame(&mut self) -> WsMessage {
            loop {
                let frame = tokio::time::timeout(Duration::from_secs(10), self.sink_rx.recv())
                    .await
                    .expect("timed out waiting for frame")
                    .expect("sink closed");
                if !matches!(frame, WsMessage::Ping(_)) {
                    return frame;
                }
            }
        }

        async fn next_envelope(&mut self) -> Value {
            match self.next_frame().await {
                WsMessage::Text(text) => serde_json::from_str(&text).unwrap(),
                other => panic!("expected text frame, got {other:?}"),
            }
        }

        async fn expect_silence(&mut self) {
            let waited = tokio::time::timeout(Duration::from_millis(100), self.next_frame()).await;
            assert!(waited.is_err(), "unexpected frame: {waited:?}");
        }
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    async fn connect(manager: &ConnectionManager, compression: bool) -> Client {
        let known: Vec<ConnectionId> = manager.connections().into_iter().map(|c| c.id).collect();
        let (socket, sink_rx, stream_tx) = create_mock_websocket();
        let task = tokio::spawn({
            let manager = manager.clone();
            async move { manager.handle_connection(socket, session(compression)).await }
        });
        wait_until(|| manager.connection_count() > known.len()).await;
        let id = manager
            .connections()
            .into_iter()
            .map(|c| c.id)
            .find(|id| !known.contains(id))
            .unwrap();
        Client {
            id,
            sink_rx,
            stream_tx,
            task,
        }
    }

    #[test]
    fn test_event_from_frame() {
        assert_eq!(
            ConnectionEvent::from_frame(Some(Ok(WsMessage::Text("hi".into())))),
            ConnectionEvent::Message {
                data: b"hi".to_vec(),
                binary: false
            }
        );
        assert_eq!(
            ConnectionEvent::from_frame(Some(Ok(WsMessage::Close(None)))),
            ConnectionEvent::Close(1005, String::new())
        );
        assert_eq!(
            ConnectionEvent::from_frame(None),
            ConnectionEvent::Close(1006, String::new())
        );
        assert!(matches!(
            ConnectionEvent::from_frame(Some(Err(WsError::ConnectionClosed))),
            ConnectionEvent::Error(_)
        ));
    }

    #[tokio::test]
    async fn test_connection_established() {
        let manager = manager_with(TestLimiter::default());
        let mut client = connect(&manager, false).await;

        let meta = manager.connection(&client.id).unwrap();
        assert!(meta.id.as_str().starts_with("ws-1-"));
        assert_eq!(meta.user_id.as_deref(), Some("alice"));
        assert_eq!(meta.remote_address, "10.0.0.1");
        assert_eq!(meta.message_count, 0);
        assert!(meta.is_healthy);
        assert!(manager.heartbeat().is_monitoring(&client.id));

        // First heartbeat ping goes out immediately.
        let first = client.sink_rx.recv().await.unwrap();
        assert!(matches!(first, WsMessage::Ping(_)));

        let health = manager.check_connection_health();
        assert_eq!(health.active_connections, 1);
        assert_eq!(health.healthy_connections, 1);
        assert_eq!(health.unhealthy_connections, 0);
        assert_eq!(health.average_latency, 0.0);
    }

    #[tokio::test]
    async fn test_request_roundtrip() {
        let limiter = TestLimiter::default();
        let manager = manager_with(limiter.clone());
        let mut client = connect(&manager, false).await;

        client
            .send_text(r#"{"type":"request","requestId":"r-1","payload":{"cmd":"ls"},"timestamp":1}"#)
            .await;
        let reply = client.next_envelope().await;
        assert_eq!(reply["type"], "response");
        assert_eq!(reply["requestId"], "r-1");
        assert_eq!(reply["payload"], json!({"cmd": "ls"}));

        assert_eq!(manager.connection(&client.id).unwrap().message_count, 1);
        assert_eq!(limiter.recorded.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rate_limited_message_keeps_connection_open() {
        let limiter = TestLimiter::default();
        limiter.deny.store(true, Ordering::SeqCst);
        let manager = manager_with(limiter.clone());
        let mut client = connect(&manager, false).await;

        client
            .send_text(r#"{"type":"request","requestId":"r-1","timestamp":1}"#)
            .await;
        let reply = client.next_envelope().await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["error"], "Rate limit exceeded");
        assert_eq!(reply["retryAfter"], 30);
        client.expect_silence().await;

        let socket = manager.socket(&client.id).unwrap();
        assert!(socket.is_open());
        assert_eq!(manager.connection(&client.id).unwrap().message_count, 1);
        assert_eq!(limiter.recorded.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_malformed_message_gets_error_reply() {
        let manager = manager_with(TestLimiter::default());
        let mut client = connect(&manager, false).await;

        client.send_text("{not json").await;
        let reply = client.next_envelope().await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["error"], "Invalid message format");
        assert!(manager.socket(&client.id).unwrap().is_open());
    }

    #[tokio::test]
    async fn test_unknown_type_is_dropped() {
        let manager = manager_with(TestLimiter::default());
        let mut client = connect(&manager, false).await;

        client.send_text(r#"{"type":"subscribe","timestamp":1}"#).await;
        client.expect_silence().await;
        assert_eq!(manager.connection(&client.id).unwrap().message_count, 1);
    }

    #[tokio::test]
    async fn test_ping_envelope_answered() {
        let manager = manager_with(TestLimiter::default());
        let mut client = connect(&manager, false).await;

        client
            .send_text(r#"{"type":"ping","requestId":"p-1","timestamp":1}"#)
            .await;
        let reply = client.next_envelope().await;
        assert_eq!(reply["type"], "pong");
        assert_eq!(reply["requestId"], "p-1");
    }

    #[tokio::test]
    async fn test_pong_frame_records_latency() {
        let manager = manager_with(TestLimiter::default());
        let client = connect(&manager, false).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        client
            .stream_tx
            .send(Ok(WsMessage::Pong(vec![])))
            .await
            .unwrap();
        wait_until(|| {
            manager
                .connection(&client.id)
                .and_then(|meta| meta.latency_ms)
                .is_some()
        })
        .await;

        let meta = manager.connection(&client.id).unwrap();
        assert!(meta.last_pong_at.is_some());
        assert!(meta.latency_ms.unwrap() >= 20);
        assert!(manager.check_connection_health().average_latency >= 20.0);
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_with_1009() {
        let manager = manager_with(TestLimiter::default());
        let mut client = connect(&manager, false).await;

        client.send_text("x".repeat(2 * 1024 * 1024)).await;
        match client.next_frame().await {
            WsMessage::Close(Some((code, reason))) => {
                assert_eq!(code, 1009);
                assert_eq!(reason, "Message too big");
            }
            other => panic!("expected close frame, got {other:?}"),
        }
        assert_eq!(manager.frame_validator().get_stats().violations, 1);
        assert_eq!(manager.connection(&client.id).unwrap().message_count, 0);

        // Peer acknowledges; the connection leaves the table.
        client
            .stream_tx
            .send(Ok(WsMessage::Close(Some((1009, "Message too big".into())))))
            .await
            .unwrap();
        client.task.await.unwrap();
        assert_eq!(manager.connection_count(), 0);
        assert!(!manager.heartbeat().is_monitoring(&client.id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_1009_close_drops_connection() {
        let manager = ConnectionManager::builder(TestAuth::default(), TestLimiter::default())
            .with_forwarder(EchoForwarder)
            .with_close_timeout(Duration::from_secs(2))
            .build();
        let mut client = connect(&manager, false).await;

        client.send_text("x".repeat(2 * 1024 * 1024)).await;
        match client.next_frame().await {
            WsMessage::Close(Some((code, _))) => assert_eq!(code, 1009),
            other => panic!("expected close frame, got {other:?}"),
        }

        // The peer stays silent.
        tokio::time::sleep(Duration::from_millis(1990)).await;
        assert_eq!(manager.connection_count(), 1);

        client.task.await.unwrap();
        assert_eq!(manager.connection_count(), 0);
        assert!(!manager.heartbeat().is_monitoring(&client.id));
        let closes = manager.graceful_close().stats();
        assert_eq!(closes.total_closes, 1);
        assert_eq!(closes.timed_out, 1);
    }

    #[tokio::test]
    async fn test_compressed_frame_inflating_past_limit_closes_with_1009() {
        let limiter = TestLimiter::default();
        let manager = manager_with(limiter.clone());
        let mut client = connect(&manager, true).await;

        let max = manager.frame_validator().max_frame_size();
        let request = TunnelMessage::request("r-bomb", json!({ "data": "z".repeat(max) }));
        let deflated = manager
            .compression()
            .compress(request.to_json().unwrap().as_bytes())
            .unwrap()
            .unwrap();
        assert!(deflated.len() < max);

        client
            .stream_tx
            .send(Ok(WsMessage::Binary(deflated)))
            .await
            .unwrap();
        match client.next_frame().await {
            WsMessage::Close(Some((code, reason))) => {
                assert_eq!(code, 1009);
                assert_eq!(reason, "Message too big");
            }
            other => panic!("expected close frame, got {other:?}"),
        }
        assert_eq!(manager.frame_validator().get_stats().violations, 1);
        assert_eq!(manager.connection(&client.id).unwrap().message_count, 0);
        assert_eq!(limiter.checks.load(Ordering::SeqCst), 0);
        assert_eq!(manager.compression().get_stats().decompressed_messages, 0);

        client
            .stream_tx
            .send(Ok(WsMessage::Close(Some((1009, "Message too big".into())))))
            .await
            .unwrap();
        client.task.await.unwrap();
        assert_eq!(manager.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_close_envelope_triggers_normal_close() {
        let manager = manager_with(TestLimiter::default());
        let mut client = connect(&manager, false).await;

        client
            .send_text(TunnelMessage::close().to_json().unwrap())
            .await;
        match client.next_frame().await {
            WsMessage::Close(Some((code, _))) => assert_eq!(code, 1000),
            other => panic!("expected close frame, got {other:?}"),
        }

        client
            .stream_tx
            .send(Ok(WsMessage::Close(Some((1000, String::new())))))
            .await
            .unwrap();
        client.task.await.unwrap();
        assert_eq!(manager.connection_count(), 0);
        wait_until(|| manager.graceful_close().stats().acknowledged == 1).await;
    }

    #[tokio::test]
    async fn test_peer_close_is_echoed() {
        let manager = manager_with(TestLimiter::default());
        let mut client = connect(&manager, false).await;

        client
            .stream_tx
            .send(Ok(WsMessage::Close(Some((1000, "bye".into())))))
            .await
            .unwrap();
        assert_eq!(
            client.next_frame().await,
            WsMessage::Close(Some((1000, "bye".into())))
        );
        client.task.await.unwrap();
        assert_eq!(manager.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_stream_end_disconnects_once() {
        let manager = manager_with(TestLimiter::default());
        let client = connect(&manager, false).await;
        let id = client.id.clone();

        drop(client.stream_tx);
        client.task.await.unwrap();
        assert_eq!(manager.connection_count(), 0);

        manager.handle_disconnect(&id, 1000, "again");
        assert_eq!(manager.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_message_after_teardown_closes_with_1011() {
        let manager = manager_with(TestLimiter::default());
        let (socket, rx) = SocketHandle::new(ConnectionId::new(99, 0), 4, None);

        manager
            .handle_message(&socket, br#"{"type":"ping"}"#.to_vec(), false)
            .await;
        match rx.try_recv().unwrap() {
            WsMessage::Close(Some((code, _))) => assert_eq!(code, 1011),
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_transport_error_marks_unhealthy() {
        let manager = manager_with(TestLimiter::default());
        let client = connect(&manager, false).await;

        client
            .stream_tx
            .send(Err(WsError::WebSocket("reset by peer".into())))
            .await
            .unwrap();
        wait_until(|| {
            manager
                .connection(&client.id)
                .map(|meta| !meta.is_healthy)
                .unwrap_or(false)
        })
        .await;

        let health = manager.check_connection_health();
        assert_eq!(health.healthy_connections, 0);
        assert_eq!(health.unhealthy_connections, 1);
    }

    #[tokio::test]
    async fn test_compressed_roundtrip() {
        let manager = manager_with(TestLimiter::default());
        let mut client = connect(&manager, true).await;

        let big = "y".repeat(4096);
        let request = TunnelMessage::request("r-big", json!({ "data": big }));
        let deflated = manager
            .compression()
            .compress(request.to_json().unwrap().as_bytes())
            .unwrap()
            .unwrap();
        client
            .stream_tx
            .send(Ok(WsMessage::Binary(deflated)))
            .await
            .unwrap();

        match client.next_frame().await {
            WsMessage::Binary(data) => {
                let reply =
                    TunnelMessage::parse(&manager.compression().decompress(&data).unwrap()).unwrap();
                assert_eq!(reply.kind, MessageType::Response);
                assert_eq!(reply.request_id.as_deref(), Some("r-big"));
                assert_eq!(reply.payload, Some(json!({ "data": big })));
            }
            other => panic!("expected binary frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_close_all_connections() {
        let manager = manager_with(TestLimiter::default());
        let mut clients = vec![connect(&manager, false).await, connect(&manager, false).await];

        // Each peer echoes the close frame it receives.
        let mut echoes = Vec::new();
        for client in clients.iter_mut() {
            let mut sink_rx = std::mem::replace(&mut client.sink_rx, mpsc::channel(1).1);
            let stream_tx = client.stream_tx.clone();
            echoes.push(tokio::spawn(async move {
                while let Some(frame) = sink_rx.recv().await {
                    if let WsMessage::Close(frame) = frame {
                        stream_tx.send(Ok(WsMessage::Close(frame.clone()))).await.unwrap();
                        return frame;
                    }
                }
                None
            }));
        }

        manager.close_all_connections("Server shutting down").await;

        for echo in echoes {
            let (code, reason) = echo.await.unwrap().unwrap();
            assert_eq!(code, 1001);
            assert_eq!(reason, "Server shutting down");
        }
        for client in clients {
            client.task.await.unwrap();
        }
        assert_eq!(manager.connection_count(), 0);
        assert_eq!(manager.graceful_close().stats().acknowledged, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timeout_closes_connection() {
        let manager = ConnectionManager::builder(TestAuth::default(), TestLimiter::default())
            .with_heartbeat(HeartbeatConfig {
                ping_interval_ms: 100,
                pong_timeout_ms: 50,
                max_missed_pongs: 2,
            })
            .build();
        let mut client = connect(&manager, false).await;

        match client.next_frame().await {
            WsMessage::Close(Some((code, reason))) => {
                assert_eq!(code, 1001);
                assert!(reason.contains("timeout"));
            }
            other => panic!("expected close frame, got {other:?}"),
        }
        let meta = manager.connection(&client.id).unwrap();
        assert!(!meta.is_healthy);

        // Peer never answers: the close times out and the socket is terminated.
        client.task.await.unwrap();
        assert_eq!(manager.connection_count(), 0);
        assert_eq!(manager.graceful_close().stats().timed_out, 1);
    }

    fn upgrade_request(token: Option<&str>) -> UpgradeRequest {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7, 10.0.0.1"));
        if let Some(token) = token {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
            );
        }
        UpgradeRequest {
            headers,
            ..UpgradeRequest::default()
        }
    }

    fn audited_manager(limiter: TestLimiter) -> (ConnectionManager, AuditLog) {
        let auth = TestAuth::default();
        let audit = auth.audit.clone();
        (ConnectionManager::builder(auth, limiter).build(), audit)
    }

    #[tokio::test]
    async fn test_authorize_missing_token() {
        let (manager, audit) = audited_manager(TestLimiter::default());
        let result = manager.authorize_upgrade(&upgrade_request(None)).await;
        assert_eq!(result, Err(UpgradeRejection::MissingToken));
        assert_eq!(manager.connection_count(), 0);
        assert_eq!(audit.lock()[0], (None, false, "missing_token".to_string()));
    }

    #[tokio::test]
    async fn test_authorize_invalid_and_expired_tokens() {
        let (manager, audit) = audited_manager(TestLimiter::default());

        let result = manager.authorize_upgrade(&upgrade_request(Some("forged"))).await;
        assert_eq!(
            result,
            Err(UpgradeRejection::InvalidToken("bad signature".into()))
        );

        let result = manager.authorize_upgrade(&upgrade_request(Some("stale"))).await;
        assert_eq!(result, Err(UpgradeRejection::ExpiredToken));

        let result = manager
            .authorize_upgrade(&upgrade_request(Some("no-context")))
            .await;
        assert_eq!(result, Err(UpgradeRejection::ContextUnavailable));

        let audit = audit.lock();
        assert_eq!(audit.len(), 3);
        assert!(audit.iter().all(|(_, success, _)| !success));
        assert_eq!(audit[1].2, "expired_token");
    }

    #[tokio::test]
    async fn test_authorize_rate_limited() {
        let limiter = TestLimiter::default();
        limiter.deny.store(true, Ordering::SeqCst);
        let (manager, audit) = audited_manager(limiter);

        let result = manager.authorize_upgrade(&upgrade_request(Some("good"))).await;
        assert_eq!(
            result,
            Err(UpgradeRejection::RateLimited {
                retry_after: Some(30)
            })
        );
        assert_eq!(
            audit.lock()[0],
            (Some("alice".into()), false, "rate_limited".to_string())
        );
    }

    #[tokio::test]
    async fn test_authorize_success() {
        let (manager, audit) = audited_manager(TestLimiter::default());

        let mut request = upgrade_request(None);
        request.query_token = Some("good".into());
        request.compression = Some("deflate".into());
        let session = manager.authorize_upgrade(&request).await.unwrap();

        assert_eq!(session.user_id, "alice");
        assert_eq!(session.tier, "pro");
        assert_eq!(session.remote_address, "203.0.113.7");
        assert!(session.compression);
        assert_eq!(
            audit.lock()[0],
            (Some("alice".into()), true, "connection_established".to_string())
        );

        let plain = manager
            .authorize_upgrade(&upgrade_request(Some("good")))
            .await
            .unwrap();
        assert!(!plain.compression);
    }

    #[tokio::test]
    async fn test_stats_snapshot_serializes() {
        let manager = manager_with(TestLimiter::default());
        let _client = connect(&manager, false).await;

        let value = serde_json::to_value(manager.stats()).unwrap();
        assert_eq!(value["health"]["activeConnections"], 1);
        assert_eq!(value["heartbeat"]["monitoredConnections"], 1);
        assert_eq!(value["frames"]["totalFrames"], 0);
        assert_eq!(value["compression"]["compressionRatio"], 1.0);
    }
}
