//! Collaborators supplied by the embedding application
//!
//! Authentication, rate limiting and request forwarding are not implemented by
//! the tunnel itself; the [`ConnectionManager`](crate::ConnectionManager)
//! calls out to these traits at the points where it needs a decision.

use crate::message::TunnelMessage;
use crate::socket::SocketHandle;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{info, warn};

/// Outcome of validating a bearer token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenValidation {
    pub valid: bool,
    pub user_id: Option<String>,
    /// Why validation failed. Messages mentioning "expired" are reported to
    /// the client as an expired token rather than an invalid one.
    pub error: Option<String>,
}

impl TokenValidation {
    pub fn valid(user_id: impl Into<String>) -> Self {
        Self {
            valid: true,
            user_id: Some(user_id.into()),
            error: None,
        }
    }

    pub fn invalid(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            user_id: None,
            error: Some(error.into()),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.error
            .as_deref()
            .map(|error| error.to_ascii_lowercase().contains("expired"))
            .unwrap_or(false)
    }
}

/// Identity resolved for an authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserContext {
    pub user_id: String,
    pub tier: String,
}

/// Verdict of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Seconds the caller should wait before retrying
    pub retry_after: Option<u64>,
}

impl RateLimitDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            retry_after: None,
        }
    }

    pub fn deny(retry_after: Option<u64>) -> Self {
        Self {
            allowed: false,
            retry_after,
        }
    }
}

/// Validates bearer tokens presented on the upgrade request.
///
/// # Example
/// ```
/// use websocket_tunnel::{Authenticator, TokenValidation, UserContext};
/// use async_trait::async_trait;
/// use anyhow::Result;
///
/// #[derive(Debug)]
/// struct SingleUser;
///
/// #[async_trait]
/// impl Authenticator for SingleUser {
///     async fn validate_token(&self, token: &str) -> TokenValidation {
///         if token == "secret" {
///             TokenValidation::valid("alice")
///         } else {
///             TokenValidation::invalid("unknown token")
///         }
///     }
///
///     async fn user_context(&self, _token: &str) -> Result<UserContext> {
///         Ok(UserContext {
///             user_id: "alice".into(),
///             tier: "pro".into(),
///         })
///     }
/// }
/// ```
#[async_trait]
pub trait Authenticator: Send + Sync + std::fmt::Debug {
    async fn validate_token(&self, token: &str) -> TokenValidation;

    /// Resolves the user id and tier for an already validated token.
    async fn user_context(&self, token: &str) -> Result<UserContext>;

    /// Audit hook for every admission decision. Logs by default.
    async fn log_auth_attempt(&self, user_id: Option<&str>, success: bool, reason: &str) {
        if success {
            info!(
                event = "auth_attempt",
                user_id = user_id.unwrap_or("unknown"),
                success,
                reason,
                "Authentication attempt"
            );
        } else {
            warn!(
                event = "auth_attempt",
                user_id = user_id.unwrap_or("unknown"),
                success,
                reason,
                "Authentication attempt"
            );
        }
    }
}

/// Admission control, consulted at upgrade time and again for every message.
#[async_trait]
pub trait RateLimiter: Send + Sync + std::fmt::Debug {
    async fn check_limit(&self, user_id: &str, ip: &str) -> RateLimitDecision;

    /// Counts an admitted request against the caller's budget.
    async fn record_request(&self, user_id: &str, ip: &str);
}

/// Handles `request` envelopes. Implementations are expected to eventually
/// send a `response` envelope carrying the same `requestId` through `socket`.
#[async_trait]
pub trait RequestForwarder: Send + Sync + std::fmt::Debug {
    async fn forward(&self, socket: &SocketHandle, message: TunnelMessage) -> Result<()>;
}

/// Accepts a fixed set of tokens.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, UserContext>,
}

impl StaticTokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_token(
        mut self,
        token: impl Into<String>,
        user_id: impl Into<String>,
        tier: impl Into<String>,
    ) -> Self {
        self.tokens.insert(
            token.into(),
            UserContext {
                user_id: user_id.into(),
                tier: tier.into(),
            },
        );
        self
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn validate_token(&self, token: &str) -> TokenValidation {
        match self.tokens.get(token) {
            Some(context) => TokenValidation::valid(context.user_id.clone()),
            None => TokenValidation::invalid("Unknown token"),
        }
    }

    async fn user_context(&self, token: &str) -> Result<UserContext> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no user for token"))
    }
}

/// Admits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllRateLimiter;

#[async_trait]
impl RateLimiter for AllowAllRateLimiter {
    async fn check_limit(&self, _user_id: &str, _ip: &str) -> RateLimitDecision {
        RateLimitDecision::allow()
    }

    async fn record_request(&self, _user_id: &str, _ip: &str) {}
}

/// Forwarder used when none is configured: answers every request with an
/// error envelope.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnroutableForwarder;

#[async_trait]
impl RequestForwarder for UnroutableForwarder {
    async fn forward(&self, socket: &SocketHandle, message: TunnelMessage) -> Result<()> {
        socket.send_message(
            &TunnelMessage::error("No request forwarder configured")
                .with_request_id(message.request_id),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expired_detection() {
        assert!(TokenValidation::invalid("Token expired").is_expired());
        assert!(TokenValidation::invalid("jwt EXPIRED at 12:00").is_expired());
        assert!(!TokenValidation::invalid("bad signature").is_expired());
        assert!(!TokenValidation::valid("u").is_expired());
    }

    #[tokio::test]
    async fn test_static_token_authenticator() {
        let auth = StaticTokenAuthenticator::new().with_token("t-1", "alice", "pro");

        let validation = auth.validate_token("t-1").await;
        assert!(validation.valid);
        assert_eq!(validation.user_id.as_deref(), Some("alice"));
        assert_eq!(auth.user_context("t-1").await.unwrap().tier, "pro");

        assert!(!auth.validate_token("nope").await.valid);
        assert!(auth.user_context("nope").await.is_err());
    }

    #[tokio::test]
    async fn test_allow_all_limiter() {
        let decision = AllowAllRateLimiter.check_limit("anyone", "127.0.0.1").await;
        assert_eq!(decision, RateLimitDecision::allow());
    }
}
