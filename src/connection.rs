//! Per-connection data model
//!
//! Identity, metadata and aggregate health types shared by the managers,
//! plus the header helpers used while admitting an upgrade.

use axum::http::{header::AUTHORIZATION, HeaderMap};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Identity of one accepted socket, formatted as `ws-<sequence>-<epochMillis>`.
///
/// Ids are never reused within a process: the sequence only moves forward.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Arc<str>);

impl ConnectionId {
    pub fn new(sequence: u64, epoch_millis: i64) -> Self {
        Self(format!("ws-{sequence}-{epoch_millis}").into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for ConnectionId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Hands out connection ids for one manager instance.
#[derive(Debug, Default)]
pub struct ConnectionIdGenerator {
    sequence: AtomicU64,
}

impl ConnectionIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> ConnectionId {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        ConnectionId::new(sequence, Utc::now().timestamp_millis())
    }
}

/// Identity attached to a socket once the upgrade has been admitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub user_id: String,
    pub tier: String,
    pub remote_address: String,
    /// Whether outbound envelopes may be deflated for this peer
    pub compression: bool,
}

/// Metadata tracked for every live connection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: ConnectionId,
    pub user_id: Option<String>,
    pub tier: Option<String>,
    pub remote_address: String,
    pub connected_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub last_pong_at: Option<DateTime<Utc>>,
    pub message_count: u64,
    pub latency_ms: Option<u64>,
    pub is_healthy: bool,
    #[serde(skip)]
    started: Instant,
}

impl Connection {
    pub fn new(id: ConnectionId, session: &SessionInfo) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id: Some(session.user_id.clone()),
            tier: Some(session.tier.clone()),
            remote_address: session.remote_address.clone(),
            connected_at: now,
            last_activity_at: now,
            last_pong_at: None,
            message_count: 0,
            latency_ms: None,
            is_healthy: true,
            started: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    pub fn record_message(&mut self) {
        self.touch();
        self.message_count = self.message_count.saturating_add(1);
    }

    pub fn record_pong(&mut self, latency: Option<Duration>) {
        let now = Utc::now();
        self.last_activity_at = now;
        self.last_pong_at = Some(now);
        if let Some(latency) = latency {
            self.latency_ms = Some(u64::try_from(latency.as_millis()).unwrap_or(u64::MAX));
        }
    }

    /// Unhealthy is terminal for the rest of the connection's life.
    pub fn mark_unhealthy(&mut self) {
        self.is_healthy = false;
    }

    pub fn duration(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn user_or_anonymous(&self) -> &str {
        self.user_id.as_deref().unwrap_or("anonymous")
    }
}

/// Aggregate health report across all tracked connections.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub active_connections: usize,
    pub healthy_connections: usize,
    pub unhealthy_connections: usize,
    /// Mean of the non-zero latency samples, 0 when there are none
    pub average_latency: f64,
}

/// RFC 3339 timestamp used in structured log events.
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn epoch_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Extracts the caller's address, trusting proxy headers first.
///
/// The first entry of `X-Forwarded-For` wins, then `X-Real-IP`, then the
/// peer address observed on the socket.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if let Some(ip) = real_ip {
        return ip.to_string();
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Token from the `token` query parameter, else from `Authorization: Bearer`.
pub fn extract_token(query_token: Option<&str>, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = query_token.map(str::trim).filter(|t| !t.is_empty()) {
        return Some(token.to_string());
    }

    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(ToString::to_string)
}
