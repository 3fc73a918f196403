//! Error taxonomy for the collaboration service.
//!
//! Request-scoped failures are reported to the offending connection as an
//! `error` envelope and leave the document and every other connection
//! untouched. Connection-fatal failures additionally close the socket with a
//! cause-specific close code (see [`crate::protocol::close_code`]).
//! Persistence failures are logged for operators and never surfaced to
//! clients.

use serde::{Deserialize, Serialize};

/// Wire-visible error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Token missing, malformed, or rejected by the validator
    InvalidToken,
    /// Token was valid once but has expired
    TokenExpired,
    /// Message sent before authentication completed
    Unauthorized,
    /// No read access, or a write attempted by a read-only connection
    Forbidden,
    /// Per-user concurrent connection cap exceeded
    RateLimited,
    /// Access was revoked mid-session (session-terminating)
    PermissionRevoked,
    /// Malformed payload, unknown message type, or internal failure
    ServerError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidToken => "INVALID_TOKEN",
            ErrorCode::TokenExpired => "TOKEN_EXPIRED",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::PermissionRevoked => "PERMISSION_REVOKED",
            ErrorCode::ServerError => "SERVER_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Service error carrying a wire code and an operator/client message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollabError {
    pub code: ErrorCode,
    pub message: String,
}

impl CollabError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn invalid_token(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidToken, message)
    }

    pub fn token_expired(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TokenExpired, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RateLimited, message)
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServerError, message)
    }
}

impl std::fmt::Display for CollabError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for CollabError {}
