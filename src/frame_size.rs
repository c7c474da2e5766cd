//! Frame size limits
//!
//! Bounds per-frame memory and raises a warning before the hard limit is
//! reached. Statistics are process-wide and only reset by an operator.

use crate::close_code::CloseCode;
use crate::config::FrameSizeConfig;
use crate::connection::timestamp;
use crate::graceful_close::{CloseOptions, GracefulCloseManager, DEFAULT_CLOSE_TIMEOUT};
use crate::socket::SocketHandle;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, error, warn};

const MAX_RECENT_VIOLATIONS: usize = 100;

/// Outcome of checking one frame. A frame triggers at most one of
/// violation or warning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameValidation {
    Valid {
        frame_size: usize,
    },
    Warning {
        frame_size: usize,
        warn_threshold: usize,
        warning: String,
    },
    Invalid {
        frame_size: usize,
        max_size: usize,
        reason: String,
    },
}

impl FrameValidation {
    pub fn is_valid(&self) -> bool {
        !matches!(self, Self::Invalid { .. })
    }

    pub fn is_warning(&self) -> bool {
        matches!(self, Self::Warning { .. })
    }

    pub fn frame_size(&self) -> usize {
        match self {
            Self::Valid { frame_size }
            | Self::Warning { frame_size, .. }
            | Self::Invalid { frame_size, .. } => *frame_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameViolation {
    pub timestamp: DateTime<Utc>,
    pub frame_size: usize,
    pub max_size: usize,
    pub user_id: Option<String>,
    pub connection_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameSizeStats {
    pub total_frames: u64,
    pub total_bytes: u64,
    pub violations: u64,
    pub warnings: u64,
    pub largest_frame: usize,
    pub average_frame_size: f64,
}

#[derive(Debug, Default)]
struct ValidatorState {
    stats: FrameSizeStats,
    recent_violations: VecDeque<FrameViolation>,
}

#[derive(Debug)]
pub struct FrameSizeValidator {
    config: FrameSizeConfig,
    state: Mutex<ValidatorState>,
    closer: GracefulCloseManager,
    close_timeout: Duration,
}

impl Default for FrameSizeValidator {
    fn default() -> Self {
        Self::new(FrameSizeConfig::default())
    }
}

impl FrameSizeValidator {
    pub fn new(config: FrameSizeConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ValidatorState::default()),
            closer: GracefulCloseManager::new(),
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }

    /// Routes 1009 closes through `closer`, terminating peers that do not
    /// acknowledge within `timeout`.
    #[must_use]
    pub fn with_close_manager(mut self, closer: GracefulCloseManager, timeout: Duration) -> Self {
        self.closer = closer;
        self.close_timeout = timeout;
        self
    }

    pub fn strict() -> Self {
        Self::new(FrameSizeConfig::strict())
    }

    pub fn lenient() -> Self {
        Self::new(FrameSizeConfig::lenient())
    }

    pub fn config(&self) -> &FrameSizeConfig {
        &self.config
    }

    pub fn max_frame_size(&self) -> usize {
        self.config.max_frame_size
    }

    /// Checks one frame and records it in the statistics. Never closes
    /// anything; see [`validate_and_handle`](Self::validate_and_handle).
    pub fn validate_frame_size(
        &self,
        size: usize,
        user_id: Option<&str>,
        connection_id: Option<&str>,
    ) -> FrameValidation {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let stats = &mut state.stats;
        stats.total_frames += 1;
        stats.total_bytes += size as u64;
        stats.average_frame_size = stats.total_bytes as f64 / stats.total_frames as f64;
        stats.largest_frame = stats.largest_frame.max(size);

        if size > self.config.max_frame_size {
            stats.violations += 1;
            if state.recent_violations.len() == MAX_RECENT_VIOLATIONS {
                state.recent_violations.pop_front();
            }
            state.recent_violations.push_back(FrameViolation {
                timestamp: Utc::now(),
                frame_size: size,
                max_size: self.config.max_frame_size,
                user_id: user_id.map(ToString::to_string),
                connection_id: connection_id.map(ToString::to_string),
            });
            drop(guard);

            error!(
                event = "frame_size_violation",
                frame_size = size,
                max_size = self.config.max_frame_size,
                user_id = user_id.unwrap_or("unknown"),
                connection_id = connection_id.unwrap_or("unknown"),
                timestamp = %timestamp(),
                "Frame exceeds maximum size"
            );

            return FrameValidation::Invalid {
                frame_size: size,
                max_size: self.config.max_frame_size,
                reason: format!(
                    "Frame size {size} bytes exceeds maximum {} bytes",
                    self.config.max_frame_size
                ),
            };
        }

        if size > self.config.warn_threshold {
            stats.warnings += 1;
            drop(guard);

            warn!(
                event = "frame_size_warning",
                frame_size = size,
                warn_threshold = self.config.warn_threshold,
                user_id = user_id.unwrap_or("unknown"),
                connection_id = connection_id.unwrap_or("unknown"),
                timestamp = %timestamp(),
                "Frame approaching maximum size"
            );

            return FrameValidation::Warning {
                frame_size: size,
                warn_threshold: self.config.warn_threshold,
                warning: format!(
                    "Frame size {size} bytes is above warning threshold {} bytes",
                    self.config.warn_threshold
                ),
            };
        }

        FrameValidation::Valid { frame_size: size }
    }

    /// Validates and, on a violation, closes the socket with 1009.
    /// Returns whether the frame may be processed.
    ///
    /// The close frame is queued before returning; a peer that never
    /// acknowledges it is terminated after the close timeout. Must be called
    /// from within a tokio runtime.
    pub fn validate_and_handle(
        &self,
        socket: &SocketHandle,
        size: usize,
        user_id: Option<&str>,
        connection_id: Option<&str>,
    ) -> bool {
        match self.validate_frame_size(size, user_id, connection_id) {
            FrameValidation::Invalid { .. } => {
                let options =
                    CloseOptions::new(CloseCode::MessageTooBig).with_timeout(self.close_timeout);
                if !self.closer.spawn_close(socket, options) {
                    debug!(connection_id = %socket.id(), "Oversized frame on a closing socket");
                }
                false
            }
            _ => true,
        }
    }

    pub fn get_stats(&self) -> FrameSizeStats {
        self.state.lock().stats
    }

    /// Most recent violations, oldest first.
    pub fn recent_violations(&self) -> Vec<FrameViolation> {
        self.state.lock().recent_violations.iter().cloned().collect()
    }

    /// Share of frames that were rejected, 0.0 when nothing was seen.
    pub fn violation_rate(&self) -> f64 {
        let stats = self.get_stats();
        if stats.total_frames == 0 {
            0.0
        } else {
            stats.violations as f64 / stats.total_frames as f64
        }
    }

    pub fn reset_stats(&self) {
        *self.state.lock() = ValidatorState::default();
    }
}
