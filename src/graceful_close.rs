//! Bounded WebSocket close handshake
//!
//! Sends a close frame, waits for the peer's close event, and falls back to
//! terminating the socket once the timeout elapses.

use crate::close_code::CloseCode;
use crate::connection::{timestamp, ConnectionId};
use crate::socket::SocketHandle;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseOptions {
    pub code: u16,
    pub reason: String,
    pub timeout: Duration,
    /// Skip the handshake and terminate immediately
    pub force: bool,
}

impl Default for CloseOptions {
    fn default() -> Self {
        Self::new(CloseCode::Normal)
    }
}

impl CloseOptions {
    pub fn new(code: CloseCode) -> Self {
        Self {
            code: code.as_u16(),
            reason: code.default_reason().to_string(),
            timeout: DEFAULT_CLOSE_TIMEOUT,
            force: false,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

/// One close sequence, from initiation to acknowledgement or termination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseOperation {
    pub connection_id: ConnectionId,
    pub initiated_at: DateTime<Utc>,
    pub code: u16,
    pub reason: String,
    pub acknowledged: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseStats {
    pub total_closes: u64,
    pub acknowledged: u64,
    /// Terminated without a handshake: forced by the caller or the close
    /// frame could not be sent
    pub forced: u64,
    pub timed_out: u64,
    pub in_progress: usize,
    pub average_duration_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseOutcome {
    Acknowledged,
    Forced,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseStart {
    Finished(CloseOutcome),
    AwaitingAck,
}

#[derive(Debug)]
struct TrackedClose {
    operation: CloseOperation,
    started: Instant,
}

#[derive(Debug, Default)]
struct CloseState {
    closing: HashMap<ConnectionId, TrackedClose>,
    totals: CloseStats,
    total_duration_ms: f64,
}

#[derive(Debug, Clone, Default)]
pub struct GracefulCloseManager {
    state: Arc<Mutex<CloseState>>,
}

impl GracefulCloseManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs one close handshake on `socket`.
    ///
    /// Returns the finished operation, or `None` when the socket was already
    /// closing (either here or at the protocol level) and nothing was done.
    pub async fn close_gracefully(
        &self,
        socket: &SocketHandle,
        options: CloseOptions,
    ) -> Option<CloseOperation> {
        let outcome = match self.initiate(socket, &options)? {
            CloseStart::Finished(outcome) => outcome,
            CloseStart::AwaitingAck => await_ack(socket, options.timeout).await,
        };
        self.finalize(socket.id(), outcome)
    }

    /// Like [`close_gracefully`](Self::close_gracefully), but only the close
    /// frame is queued before returning; the wait for the acknowledgement and
    /// the fallback termination run on a spawned task.
    ///
    /// Returns `false` when the socket was already closing.
    pub fn spawn_close(&self, socket: &SocketHandle, options: CloseOptions) -> bool {
        let Some(start) = self.initiate(socket, &options) else {
            return false;
        };
        let closer = self.clone();
        let socket = socket.clone();
        tokio::spawn(async move {
            let outcome = match start {
                CloseStart::Finished(outcome) => outcome,
                CloseStart::AwaitingAck => await_ack(&socket, options.timeout).await,
            };
            closer.finalize(socket.id(), outcome);
        });
        true
    }

    pub async fn close_normal(
        &self,
        socket: &SocketHandle,
        reason: Option<&str>,
    ) -> Option<CloseOperation> {
        self.close_with_code(socket, CloseCode::Normal, reason).await
    }

    pub async fn close_going_away(
        &self,
        socket: &SocketHandle,
        reason: Option<&str>,
    ) -> Option<CloseOperation> {
        self.close_with_code(socket, CloseCode::GoingAway, reason).await
    }

    pub async fn close_protocol_error(
        &self,
        socket: &SocketHandle,
        reason: Option<&str>,
    ) -> Option<CloseOperation> {
        self.close_with_code(socket, CloseCode::ProtocolError, reason).await
    }

    pub async fn close_policy_violation(
        &self,
        socket: &SocketHandle,
        reason: Option<&str>,
    ) -> Option<CloseOperation> {
        self.close_with_code(socket, CloseCode::PolicyViolation, reason).await
    }

    pub async fn close_message_too_big(
        &self,
        socket: &SocketHandle,
        reason: Option<&str>,
    ) -> Option<CloseOperation> {
        self.close_with_code(socket, CloseCode::MessageTooBig, reason).await
    }

    pub async fn close_internal_error(
        &self,
        socket: &SocketHandle,
        reason: Option<&str>,
    ) -> Option<CloseOperation> {
        self.close_with_code(socket, CloseCode::InternalError, reason).await
    }

    pub async fn close_service_restart(
        &self,
        socket: &SocketHandle,
        reason: Option<&str>,
    ) -> Option<CloseOperation> {
        self.close_with_code(socket, CloseCode::ServiceRestart, reason).await
    }

    /// Closes every socket concurrently and waits until each one has been
    /// acknowledged or terminated.
    pub async fn close_all(
        &self,
        sockets: &[SocketHandle],
        options: CloseOptions,
    ) -> Vec<Option<CloseOperation>> {
        join_all(
            sockets
                .iter()
                .map(|socket| self.close_gracefully(socket, options.clone())),
        )
        .await
    }

    pub fn is_closing(&self, id: &ConnectionId) -> bool {
        self.state.lock().closing.contains_key(id)
    }

    pub fn stats(&self) -> CloseStats {
        let state = self.state.lock();
        let finished = state.totals.total_closes;
        CloseStats {
            in_progress: state.closing.len(),
            average_duration_ms: if finished == 0 {
                0.0
            } else {
                state.total_duration_ms / finished as f64
            },
            ..state.totals
        }
    }

    /// Registers the operation and sends the close frame (or terminates when
    /// forced). `None` when the socket was already closing.
    fn initiate(&self, socket: &SocketHandle, options: &CloseOptions) -> Option<CloseStart> {
        let id = socket.id();

        if !socket.is_open() {
            warn!(
                connection_id = %id,
                ready_state = ?socket.ready_state(),
                "Socket already closing or closed, ignoring close request"
            );
            return None;
        }

        {
            let mut state = self.state.lock();
            if state.closing.contains_key(id) {
                warn!(connection_id = %id, "Close already in progress, ignoring close request");
                return None;
            }
            state.closing.insert(
                id.clone(),
                TrackedClose {
                    operation: CloseOperation {
                        connection_id: id.clone(),
                        initiated_at: Utc::now(),
                        code: options.code,
                        reason: options.reason.clone(),
                        acknowledged: false,
                        completed_at: None,
                        duration: None,
                    },
                    started: Instant::now(),
                },
            );
        }

        info!(
            event = "connection_close_initiated",
            connection_id = %id,
            code = options.code,
            reason = %options.reason,
            force = options.force,
            timestamp = %timestamp(),
            "Closing connection"
        );

        if options.force {
            socket.terminate();
            return Some(CloseStart::Finished(CloseOutcome::Forced));
        }
        if let Err(e) = socket.close(options.code, options.reason.as_str()) {
            error!(connection_id = %id, error = %e, "Failed to send close frame, terminating");
            socket.terminate();
            return Some(CloseStart::Finished(CloseOutcome::Forced));
        }
        Some(CloseStart::AwaitingAck)
    }

    async fn close_with_code(
        &self,
        socket: &SocketHandle,
        code: CloseCode,
        reason: Option<&str>,
    ) -> Option<CloseOperation> {
        let mut options = CloseOptions::new(code);
        if let Some(reason) = reason {
            options.reason = reason.to_string();
        }
        self.close_gracefully(socket, options).await
    }

    fn finalize(&self, id: &ConnectionId, outcome: CloseOutcome) -> Option<CloseOperation> {
        let operation = {
            let mut state = self.state.lock();
            let tracked = state.closing.remove(id)?;
            let duration = tracked.started.elapsed();

            let mut operation = tracked.operation;
            operation.acknowledged = outcome == CloseOutcome::Acknowledged;
            operation.completed_at = Some(Utc::now());
            operation.duration = Some(duration);

            state.totals.total_closes += 1;
            match outcome {
                CloseOutcome::Acknowledged => state.totals.acknowledged += 1,
                CloseOutcome::Forced => state.totals.forced += 1,
                CloseOutcome::TimedOut => state.totals.timed_out += 1,
            }
            state.total_duration_ms += duration.as_secs_f64() * 1000.0;
            operation
        };

        info!(
            event = "connection_close_completed",
            connection_id = %id,
            code = operation.code,
            acknowledged = operation.acknowledged,
            duration_ms = operation.duration.map(|d| d.as_millis() as u64).unwrap_or_default(),
            timestamp = %timestamp(),
            "Connection close completed"
        );

        Some(operation)
    }
}

/// Waits for the peer's close event, terminating the socket once `timeout`
/// elapses without one.
async fn await_ack(socket: &SocketHandle, timeout: Duration) -> CloseOutcome {
    tokio::select! {
        _ = socket.closed() => {
            if socket.is_terminated() {
                CloseOutcome::Forced
            } else {
                CloseOutcome::Acknowledged
            }
        }
        _ = tokio::time::sleep(timeout) => {
            warn!(
                connection_id = %socket.id(),
                timeout_ms = timeout.as_millis() as u64,
                "Close handshake timed out, terminating"
            );
            socket.terminate();
            CloseOutcome::TimedOut
        }
    }
}
