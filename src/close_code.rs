//! RFC 6455 close codes
//!
//! The numeric values are part of the wire contract with standard WebSocket
//! clients and must never change.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Close status codes defined by RFC 6455 section 7.4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum CloseCode {
    /// 1000
    Normal,
    /// 1001
    GoingAway,
    /// 1002
    ProtocolError,
    /// 1003
    UnsupportedData,
    /// 1005, never sent on the wire
    NoStatusReceived,
    /// 1006, never sent on the wire
    AbnormalClosure,
    /// 1007
    InvalidPayload,
    /// 1008
    PolicyViolation,
    /// 1009
    MessageTooBig,
    /// 1010
    MandatoryExtension,
    /// 1011
    InternalError,
    /// 1012
    ServiceRestart,
    /// 1013
    TryAgainLater,
    /// 1014
    BadGateway,
    /// 1015, never sent on the wire
    TlsHandshake,
}

impl CloseCode {
    pub const fn as_u16(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::GoingAway => 1001,
            Self::ProtocolError => 1002,
            Self::UnsupportedData => 1003,
            Self::NoStatusReceived => 1005,
            Self::AbnormalClosure => 1006,
            Self::InvalidPayload => 1007,
            Self::PolicyViolation => 1008,
            Self::MessageTooBig => 1009,
            Self::MandatoryExtension => 1010,
            Self::InternalError => 1011,
            Self::ServiceRestart => 1012,
            Self::TryAgainLater => 1013,
            Self::BadGateway => 1014,
            Self::TlsHandshake => 1015,
        }
    }

    pub const fn from_u16(code: u16) -> Option<Self> {
        Some(match code {
            1000 => Self::Normal,
            1001 => Self::GoingAway,
            1002 => Self::ProtocolError,
            1003 => Self::UnsupportedData,
            1005 => Self::NoStatusReceived,
            1006 => Self::AbnormalClosure,
            1007 => Self::InvalidPayload,
            1008 => Self::PolicyViolation,
            1009 => Self::MessageTooBig,
            1010 => Self::MandatoryExtension,
            1011 => Self::InternalError,
            1012 => Self::ServiceRestart,
            1013 => Self::TryAgainLater,
            1014 => Self::BadGateway,
            1015 => Self::TlsHandshake,
            _ => return None,
        })
    }

    /// Reason string used when a caller does not supply one.
    pub const fn default_reason(self) -> &'static str {
        match self {
            Self::Normal => "Normal closure",
            Self::GoingAway => "Going away",
            Self::ProtocolError => "Protocol error",
            Self::UnsupportedData => "Unsupported data",
            Self::NoStatusReceived => "No status received",
            Self::AbnormalClosure => "Abnormal closure",
            Self::InvalidPayload => "Invalid frame payload data",
            Self::PolicyViolation => "Policy violation",
            Self::MessageTooBig => "Message too big",
            Self::MandatoryExtension => "Mandatory extension",
            Self::InternalError => "Internal error",
            Self::ServiceRestart => "Service restart",
            Self::TryAgainLater => "Try again later",
            Self::BadGateway => "Bad gateway",
            Self::TlsHandshake => "TLS handshake failure",
        }
    }

    pub const fn is_normal(self) -> bool {
        is_normal_code(self.as_u16())
    }

    pub const fn is_error(self) -> bool {
        is_error_code(self.as_u16())
    }

    /// Picks the closest close code for an error message.
    ///
    /// Keyword matching is case-insensitive; anything unrecognised maps to
    /// [`CloseCode::InternalError`].
    pub fn from_error_message(message: &str) -> Self {
        let message = message.to_lowercase();
        if message.contains("protocol") {
            Self::ProtocolError
        } else if message.contains("too big") || message.contains("too large") {
            Self::MessageTooBig
        } else if message.contains("policy") || message.contains("violation") {
            Self::PolicyViolation
        } else if message.contains("unsupported") {
            Self::UnsupportedData
        } else {
            Self::InternalError
        }
    }

    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        Self::from_error_message(&error.to_string())
    }
}

/// 1000 and 1001 are the only codes that signal an orderly shutdown.
pub const fn is_normal_code(code: u16) -> bool {
    code == 1000 || code == 1001
}

pub const fn is_error_code(code: u16) -> bool {
    code >= 1002
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        code.as_u16()
    }
}

impl TryFrom<u16> for CloseCode {
    type Error = String;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        Self::from_u16(code).ok_or_else(|| format!("unknown close code {code}"))
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_u16(), self.default_reason())
    }
}
