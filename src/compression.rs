//! Per-message compression
//!
//! Deflates large outbound envelopes for peers that opted in, inflates their
//! binary frames on the way in, and keeps running totals so operators can see
//! whether compression is paying for itself.

use crate::config::CompressionConfig;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use serde::Serialize;
use std::io::{Read, Write};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Header a client sends (and the server echoes) to opt in to deflated frames.
pub const COMPRESSION_HEADER: &str = "x-tunnel-compression";

/// Upper bound on an inflated payload, guards against decompression bombs.
const MAX_INFLATED_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("compression failed: {0}")]
    Compress(std::io::Error),
    #[error("decompression failed: {0}")]
    Decompress(std::io::Error),
    #[error("inflated payload exceeds {0} bytes")]
    TooLarge(u64),
}

/// Parameters for a socket server that negotiates permessage-deflate itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PerMessageDeflateOptions {
    pub level: u32,
    pub threshold: usize,
    pub server_no_context_takeover: bool,
    pub client_no_context_takeover: bool,
    pub server_max_window_bits: u8,
    pub client_max_window_bits: u8,
}

impl PerMessageDeflateOptions {
    /// Value for a `Sec-WebSocket-Extensions` response header.
    pub fn extension_header(&self) -> String {
        let mut header = String::from("permessage-deflate");
        if self.server_no_context_takeover {
            header.push_str("; server_no_context_takeover");
        }
        if self.client_no_context_takeover {
            header.push_str("; client_no_context_takeover");
        }
        if self.server_max_window_bits < 15 {
            header.push_str(&format!(
                "; server_max_window_bits={}",
                self.server_max_window_bits
            ));
        }
        if self.client_max_window_bits < 15 {
            header.push_str(&format!(
                "; client_max_window_bits={}",
                self.client_max_window_bits
            ));
        }
        header
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionStats {
    pub total_messages: u64,
    pub compressed_messages: u64,
    pub skipped_messages: u64,
    pub decompressed_messages: u64,
    pub bytes_before: u64,
    pub bytes_after: u64,
    pub bytes_saved: u64,
    /// bytes_after / bytes_before, 1.0 before anything was compressed
    pub compression_ratio: f64,
    pub errors: u64,
}

#[derive(Debug)]
pub struct CompressionManager {
    config: CompressionConfig,
    stats: Mutex<CompressionStats>,
}

impl Default for CompressionManager {
    fn default() -> Self {
        Self::new(CompressionConfig::default())
    }
}

impl CompressionManager {
    pub fn new(mut config: CompressionConfig) -> Self {
        if config.level > 9 {
            warn!(level = config.level, "Compression level above 9, clamping");
            config.level = 9;
        }
        Self {
            config,
            stats: Mutex::new(CompressionStats {
                compression_ratio: 1.0,
                ..CompressionStats::default()
            }),
        }
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn negotiation_options(&self) -> PerMessageDeflateOptions {
        PerMessageDeflateOptions {
            level: self.config.level,
            threshold: self.config.threshold,
            server_no_context_takeover: self.config.server_no_context_takeover,
            client_no_context_takeover: self.config.client_no_context_takeover,
            server_max_window_bits: self.config.server_max_window_bits,
            client_max_window_bits: self.config.client_max_window_bits,
        }
    }

    /// Decides whether a peer gets deflated frames.
    ///
    /// `requested` is the comma separated list the client sent in the
    /// opt-in header or query parameter.
    pub fn negotiate(&self, requested: Option<&str>) -> bool {
        if !self.config.enabled {
            return false;
        }
        requested
            .map(|value| {
                value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("deflate"))
            })
            .unwrap_or(false)
    }

    pub fn should_compress(&self, size: usize) -> bool {
        self.config.enabled && size >= self.config.threshold
    }

    /// Deflates `data` if it is worth it.
    ///
    /// Returns `Ok(None)` when the payload is below the threshold or would
    /// not shrink; the caller sends it uncompressed.
    pub fn compress(&self, data: &[u8]) -> Result<Option<Vec<u8>>, CompressionError> {
        if !self.should_compress(data.len()) {
            let mut stats = self.stats.lock();
            stats.total_messages += 1;
            stats.skipped_messages += 1;
            return Ok(None);
        }

        let compressed = match deflate(data, self.config.level) {
            Ok(compressed) => compressed,
            Err(e) => {
                self.record_error(&e);
                return Err(e);
            }
        };

        if compressed.len() >= data.len() {
            let mut stats = self.stats.lock();
            stats.total_messages += 1;
            stats.skipped_messages += 1;
            debug!(
                original = data.len(),
                compressed = compressed.len(),
                "Compression did not shrink payload, sending raw"
            );
            return Ok(None);
        }

        self.record_compression(data.len(), compressed.len());
        Ok(Some(compressed))
    }

    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        self.decompress_bounded(data, MAX_INFLATED_SIZE as usize)
    }

    /// Inflates `data`, failing with [`CompressionError::TooLarge`] as soon
    /// as the output passes `limit` bytes. Never reads past the limit.
    pub fn decompress_bounded(
        &self,
        data: &[u8],
        limit: usize,
    ) -> Result<Vec<u8>, CompressionError> {
        let limit = (limit as u64).min(MAX_INFLATED_SIZE);
        match inflate(data, limit) {
            Ok(inflated) => {
                self.stats.lock().decompressed_messages += 1;
                Ok(inflated)
            }
            Err(e) => {
                self.record_error(&e);
                Err(e)
            }
        }
    }

    pub fn record_compression(&self, original: usize, compressed: usize) {
        let mut stats = self.stats.lock();
        stats.total_messages += 1;
        stats.compressed_messages += 1;
        stats.bytes_before += original as u64;
        stats.bytes_after += compressed as u64;
        stats.bytes_saved = stats.bytes_before.saturating_sub(stats.bytes_after);
        stats.compression_ratio = if stats.bytes_before == 0 {
            1.0
        } else {
            stats.bytes_after as f64 / stats.bytes_before as f64
        };
    }

    pub fn record_error(&self, error: &CompressionError) {
        self.stats.lock().errors += 1;
        warn!(event = "compression_error", error = %error, "Compression error");
    }

    pub fn get_stats(&self) -> CompressionStats {
        *self.stats.lock()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock() = CompressionStats {
            compression_ratio: 1.0,
            ..CompressionStats::default()
        };
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            event = "compression_stats",
            total_messages = stats.total_messages,
            compressed_messages = stats.compressed_messages,
            bytes_saved = stats.bytes_saved,
            ratio = stats.compression_ratio,
            errors = stats.errors,
            "Compression statistics"
        );
    }
}

fn deflate(data: &[u8], level: u32) -> Result<Vec<u8>, CompressionError> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len() / 2), Compression::new(level));
    encoder.write_all(data).map_err(CompressionError::Compress)?;
    encoder.finish().map_err(CompressionError::Compress)
}

fn inflate(data: &[u8], limit: u64) -> Result<Vec<u8>, CompressionError> {
    let mut decoder = DeflateDecoder::new(data).take(limit + 1);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(CompressionError::Decompress)?;
    if out.len() as u64 > limit {
        return Err(CompressionError::TooLarge(limit));
    }
    Ok(out)
}
