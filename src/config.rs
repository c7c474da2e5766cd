//! Tunnel server configuration.
//!
//! Every section deserializes with defaults, so a partial JSON document (or
//! none at all) yields a working configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration for the tunnel connection manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Route the upgrade handler is mounted on
    #[serde(default = "default_path")]
    pub path: String,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub frame_size: FrameSizeConfig,

    #[serde(default)]
    pub compression: CompressionConfig,

    /// How long a graceful close waits for the peer's close frame
    #[serde(default = "default_close_timeout")]
    pub close_timeout_ms: u64,

    /// Per-connection grace period used by `close_all_connections`
    #[serde(default = "default_close_timeout")]
    pub shutdown_grace_ms: u64,

    /// Outbound queue depth per connection
    #[serde(default = "default_channel_size")]
    pub channel_size: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            heartbeat: HeartbeatConfig::default(),
            frame_size: FrameSizeConfig::default(),
            compression: CompressionConfig::default(),
            close_timeout_ms: default_close_timeout(),
            shutdown_grace_ms: default_close_timeout(),
            channel_size: default_channel_size(),
        }
    }
}

impl TunnelConfig {
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Ping/pong liveness settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,

    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_ms: u64,

    #[serde(default = "default_max_missed_pongs")]
    pub max_missed_pongs: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval(),
            pong_timeout_ms: default_pong_timeout(),
            max_missed_pongs: default_max_missed_pongs(),
        }
    }
}

impl HeartbeatConfig {
    /// Preset that declares a silent peer dead within 45 seconds.
    pub fn fast() -> Self {
        Self {
            ping_interval_ms: 10_000,
            pong_timeout_ms: 5_000,
            max_missed_pongs: 2,
        }
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    /// Silence longer than this counts as a missed pong on the next tick.
    pub fn liveness_window(&self) -> Duration {
        self.ping_interval() + self.pong_timeout()
    }

    /// Upper bound on the time between the last pong and the connection being
    /// declared dead. Misses are only counted on ping ticks, so the first miss
    /// lands on the first tick after the liveness window and each further
    /// miss costs one more interval.
    pub fn worst_case_detection(&self) -> Duration {
        let interval = self.ping_interval_ms.max(1);
        let window = self.ping_interval_ms + self.pong_timeout_ms;
        let first_miss_tick = (window / interval + 1) * interval;
        let extra = u64::from(self.max_missed_pongs.saturating_sub(1)) * interval;
        Duration::from_millis(first_miss_tick + extra)
    }
}

/// Frame size limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSizeConfig {
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    #[serde(default = "default_warn_threshold")]
    pub warn_threshold: usize,
}

impl Default for FrameSizeConfig {
    fn default() -> Self {
        Self {
            max_frame_size: default_max_frame_size(),
            warn_threshold: default_warn_threshold(),
        }
    }
}

impl FrameSizeConfig {
    /// 256 KiB max, warn above 128 KiB
    pub fn strict() -> Self {
        Self {
            max_frame_size: 256 * 1024,
            warn_threshold: 128 * 1024,
        }
    }

    /// 10 MiB max, warn above 5 MiB
    pub fn lenient() -> Self {
        Self {
            max_frame_size: 10 * 1024 * 1024,
            warn_threshold: 5 * 1024 * 1024,
        }
    }
}

/// Per-message deflate settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// zlib level, 0 (store) to 9 (best)
    #[serde(default = "default_compression_level")]
    pub level: u32,

    /// Payloads smaller than this are sent uncompressed
    #[serde(default = "default_compression_threshold")]
    pub threshold: usize,

    #[serde(default)]
    pub server_no_context_takeover: bool,

    #[serde(default)]
    pub client_no_context_takeover: bool,

    #[serde(default = "default_window_bits")]
    pub server_max_window_bits: u8,

    #[serde(default = "default_window_bits")]
    pub client_max_window_bits: u8,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: default_compression_level(),
            threshold: default_compression_threshold(),
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            server_max_window_bits: default_window_bits(),
            client_max_window_bits: default_window_bits(),
        }
    }
}

fn default_path() -> String {
    "/tunnel".to_string()
}

fn default_close_timeout() -> u64 {
    5_000
}

fn default_channel_size() -> usize {
    100
}

fn default_ping_interval() -> u64 {
    30_000
}

fn default_pong_timeout() -> u64 {
    5_000
}

fn default_max_missed_pongs() -> u32 {
    3
}

fn default_max_frame_size() -> usize {
    1024 * 1024 // 1MB
}

fn default_warn_threshold() -> usize {
    512 * 1024
}

fn default_true() -> bool {
    true
}

fn default_compression_level() -> u32 {
    6
}

fn default_compression_threshold() -> usize {
    1024 // 1KB
}

fn default_window_bits() -> u8 {
    15
}
