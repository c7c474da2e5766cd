//! HTTP-level rejections returned before any WebSocket handshake.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Why an upgrade request was refused. Every variant is answered with a plain
/// HTTP response and `Connection: close`, so the protocol switch never happens.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpgradeRejection {
    #[error("Missing authentication token")]
    MissingToken,
    #[error("Invalid token: {0}")]
    InvalidToken(String),
    #[error("Token expired")]
    ExpiredToken,
    #[error("Failed to resolve user context")]
    ContextUnavailable,
    #[error("Rate limit exceeded")]
    RateLimited { retry_after: Option<u64> },
}

impl UpgradeRejection {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::UNAUTHORIZED,
        }
    }

    /// Short machine-readable code for the response body and audit log.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingToken => "missing_token",
            Self::InvalidToken(_) => "invalid_token",
            Self::ExpiredToken => "expired_token",
            Self::ContextUnavailable => "context_unavailable",
            Self::RateLimited { .. } => "rate_limited",
        }
    }
}

impl IntoResponse for UpgradeRejection {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            Self::RateLimited { retry_after } => json!({
                "error": self.code(),
                "message": self.to_string(),
                "retryAfter": retry_after,
            }),
            _ => json!({
                "error": self.code(),
                "message": self.to_string(),
            }),
        };

        let mut response = (status, Json(body)).into_response();
        let headers = response.headers_mut();
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        if let Self::RateLimited {
            retry_after: Some(seconds),
        } = self
        {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(seconds));
        }
        response
    }
}
