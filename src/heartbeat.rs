//! Application-level liveness detection
//!
//! Every monitored socket gets a recurring ping task. Silence longer than
//! `ping_interval + pong_timeout` counts as a missed pong on the next tick;
//! reaching `max_missed_pongs` declares the peer dead. Any pong resets the
//! miss counter to zero.

use crate::close_code::CloseCode;
use crate::config::HeartbeatConfig;
use crate::connection::{epoch_millis, timestamp, ConnectionId};
use crate::graceful_close::{CloseOptions, GracefulCloseManager, DEFAULT_CLOSE_TIMEOUT};
use crate::message::TunnelMessage;
use crate::socket::SocketHandle;
use crate::websocket_trait::WsError;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Reason sent with the 1001 close when a peer stops answering pings.
pub const HEARTBEAT_TIMEOUT_REASON: &str = "Connection timeout - no pong received";

/// Invoked once when a connection is declared dead, instead of the default
/// 1001 close.
pub type TimeoutHandler = Box<dyn FnOnce(SocketHandle) + Send + 'static>;

#[derive(Debug)]
struct HeartbeatState {
    last_ping_at: Instant,
    last_pong_at: Instant,
    missed_pongs: u32,
    latency: Option<Duration>,
    cancel: CancellationToken,
}

/// Read-only view of one connection's heartbeat state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatSnapshot {
    pub last_ping_at: Instant,
    pub last_pong_at: Instant,
    pub missed_pongs: u32,
    pub latency: Option<Duration>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatStats {
    pub monitored_connections: usize,
    pub connections_with_missed_pongs: usize,
    pub total_missed_pongs: u64,
    pub average_latency_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PingOutcome {
    Sent,
    Dead,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct HeartbeatManager {
    config: HeartbeatConfig,
    states: Arc<Mutex<HashMap<ConnectionId, HeartbeatState>>>,
    closer: GracefulCloseManager,
    close_timeout: Duration,
}

impl Default for HeartbeatManager {
    fn default() -> Self {
        Self::new(HeartbeatConfig::default())
    }
}

impl HeartbeatManager {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            states: Arc::new(Mutex::new(HashMap::new())),
            closer: GracefulCloseManager::new(),
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }

    /// Routes the default dead-peer close through `closer`, terminating peers
    /// that do not acknowledge within `timeout`.
    #[must_use]
    pub fn with_close_manager(mut self, closer: GracefulCloseManager, timeout: Duration) -> Self {
        self.closer = closer;
        self.close_timeout = timeout;
        self
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    /// Starts monitoring `socket`. The first ping goes out immediately.
    ///
    /// Returns `false` and leaves the existing monitor untouched when the
    /// socket is already monitored.
    pub fn start_heartbeat(&self, socket: SocketHandle, on_timeout: Option<TimeoutHandler>) -> bool {
        let cancel = CancellationToken::new();
        {
            let mut states = self.states.lock();
            if states.contains_key(socket.id()) {
                debug!(connection_id = %socket.id(), "Heartbeat already running");
                return false;
            }
            let now = Instant::now();
            states.insert(
                socket.id().clone(),
                HeartbeatState {
                    last_ping_at: now,
                    last_pong_at: now,
                    missed_pongs: 0,
                    latency: None,
                    cancel: cancel.clone(),
                },
            );
        }

        debug!(
            connection_id = %socket.id(),
            ping_interval_ms = self.config.ping_interval_ms,
            "Heartbeat started"
        );

        let manager = self.clone();
        let interval = self.config.ping_interval();
        tokio::spawn(async move {
            let mut on_timeout = on_timeout;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        break;
                    }

                    _ = ticker.tick() => {
                        match manager.run_ping_cycle(&socket) {
                            PingOutcome::Sent => {}
                            PingOutcome::Dead => {
                                manager.declare_dead(&socket, on_timeout.take());
                                break;
                            }
                            PingOutcome::Stopped => break,
                        }
                    }
                }
            }

            debug!("Heartbeat task for {} exiting", socket.id());
        });

        true
    }

    /// Cancels the timer and forgets the socket. Safe to call repeatedly.
    pub fn stop_heartbeat(&self, id: &ConnectionId) {
        if let Some(state) = self.states.lock().remove(id) {
            state.cancel.cancel();
            debug!(connection_id = %id, "Heartbeat stopped");
        }
    }

    pub fn stop_all(&self) {
        let drained: Vec<_> = self.states.lock().drain().collect();
        for (_, state) in drained {
            state.cancel.cancel();
        }
    }

    /// Handles a pong (protocol frame or application envelope).
    /// Returns the measured round trip, or `None` for unmonitored sockets.
    pub fn handle_pong(&self, id: &ConnectionId) -> Option<Duration> {
        let latency = {
            let mut states = self.states.lock();
            let state = states.get_mut(id)?;
            let now = Instant::now();
            let latency = now.saturating_duration_since(state.last_ping_at);
            state.last_pong_at = now;
            state.missed_pongs = 0;
            state.latency = Some(latency);
            latency
        };

        debug!(
            event = "heartbeat_pong",
            connection_id = %id,
            latency_ms = latency.as_millis() as u64,
            "Pong received"
        );
        Some(latency)
    }

    /// Answers an application-level `ping` envelope.
    pub fn handle_ping_message(
        &self,
        socket: &SocketHandle,
        message: &TunnelMessage,
    ) -> Result<(), WsError> {
        socket.send_message(&TunnelMessage::pong(message.request_id.clone()))
    }

    /// Treats an application-level `pong` envelope like a pong frame.
    pub fn handle_pong_message(&self, socket: &SocketHandle) -> Option<Duration> {
        self.handle_pong(socket.id())
    }

    pub fn is_monitoring(&self, id: &ConnectionId) -> bool {
        self.states.lock().contains_key(id)
    }

    /// True while the last pong is within `ping_interval + pong_timeout`.
    pub fn is_connection_healthy(&self, id: &ConnectionId) -> bool {
        self.states
            .lock()
            .get(id)
            .map(|state| state.last_pong_at.elapsed() <= self.config.liveness_window())
            .unwrap_or(false)
    }

    pub fn snapshot(&self, id: &ConnectionId) -> Option<HeartbeatSnapshot> {
        self.states.lock().get(id).map(|state| HeartbeatSnapshot {
            last_ping_at: state.last_ping_at,
            last_pong_at: state.last_pong_at,
            missed_pongs: state.missed_pongs,
            latency: state.latency,
        })
    }

    pub fn missed_pongs(&self, id: &ConnectionId) -> Option<u32> {
        self.states.lock().get(id).map(|state| state.missed_pongs)
    }

    pub fn stats(&self) -> HeartbeatStats {
        let states = self.states.lock();
        let latencies: Vec<f64> = states
            .values()
            .filter_map(|state| state.latency)
            .map(|latency| latency.as_secs_f64() * 1000.0)
            .collect();

        HeartbeatStats {
            monitored_connections: states.len(),
            connections_with_missed_pongs: states.values().filter(|s| s.missed_pongs > 0).count(),
            total_missed_pongs: states.values().map(|s| u64::from(s.missed_pongs)).sum(),
            average_latency_ms: if latencies.is_empty() {
                0.0
            } else {
                latencies.iter().sum::<f64>() / latencies.len() as f64
            },
        }
    }

    fn run_ping_cycle(&self, socket: &SocketHandle) -> PingOutcome {
        let id = socket.id();
        if !socket.is_open() {
            debug!(connection_id = %id, "Socket no longer open, stopping heartbeat");
            self.stop_heartbeat(id);
            return PingOutcome::Stopped;
        }

        {
            let mut states = self.states.lock();
            let Some(state) = states.get_mut(id) else {
                return PingOutcome::Stopped;
            };

            let since_pong = state.last_pong_at.elapsed();
            if since_pong > self.config.liveness_window() {
                state.missed_pongs += 1;
                warn!(
                    event = "heartbeat_missed_pong",
                    connection_id = %id,
                    missed_pongs = state.missed_pongs,
                    max_missed_pongs = self.config.max_missed_pongs,
                    ms_since_last_pong = since_pong.as_millis() as u64,
                    "Pong missed"
                );
                if state.missed_pongs >= self.config.max_missed_pongs {
                    return PingOutcome::Dead;
                }
            }
        }

        let payload = epoch_millis().to_be_bytes().to_vec();
        match socket.ping(payload) {
            Ok(()) => {
                if let Some(state) = self.states.lock().get_mut(id) {
                    state.last_ping_at = Instant::now();
                }
                PingOutcome::Sent
            }
            Err(e) => {
                warn!(connection_id = %id, error = %e, "Failed to send ping, stopping heartbeat");
                self.stop_heartbeat(id);
                PingOutcome::Stopped
            }
        }
    }

    fn declare_dead(&self, socket: &SocketHandle, on_timeout: Option<TimeoutHandler>) {
        let missed = self.missed_pongs(socket.id()).unwrap_or_default();
        error!(
            event = "heartbeat_connection_dead",
            connection_id = %socket.id(),
            missed_pongs = missed,
            timestamp = %timestamp(),
            "Connection declared dead"
        );
        self.stop_heartbeat(socket.id());

        match on_timeout {
            Some(handler) => handler(socket.clone()),
            None => {
                let options = CloseOptions::new(CloseCode::GoingAway)
                    .with_reason(HEARTBEAT_TIMEOUT_REASON)
                    .with_timeout(self.close_timeout);
                if !self.closer.spawn_close(socket, options) {
                    socket.terminate();
                }
            }
        }
    }
}
