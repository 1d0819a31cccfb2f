//! Error taxonomy for the query/transform/sync engine.
//!
//! Mirrors the classified-error approach of differential-view engines: every
//! variant is tagged with a retry/surface classification so callers (and the
//! thin HTTP layer) never have to pattern-match on message text. Database
//! errors from remote engines are reclassified at the retry boundary
//! (`classify_db_error`) rather than at the point they're first observed,
//! since the first occurrence of a transient error is retried silently.

use std::fmt;

/// The external surface a given error maps to (spec.md §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    RateLimited,
    BadGateway,
    GatewayTimeout,
    Internal,
}

impl ErrorKind {
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::BadRequest => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::RateLimited => 429,
            ErrorKind::BadGateway => 502,
            ErrorKind::GatewayTimeout => 504,
            ErrorKind::Internal => 500,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("malformed expression: {0}")]
    MalformedExpression(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("upstream connection lost: {0}")]
    BadGateway(String),

    #[error("upstream connection timed out: {0}")]
    GatewayTimeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::MalformedExpression(_) | EngineError::BadRequest(_) => {
                ErrorKind::BadRequest
            }
            EngineError::Unauthorized(_) => ErrorKind::Unauthorized,
            EngineError::Forbidden(_) => ErrorKind::Forbidden,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::RateLimited { .. } => ErrorKind::RateLimited,
            EngineError::BadGateway(_) => ErrorKind::BadGateway,
            EngineError::GatewayTimeout(_) => ErrorKind::GatewayTimeout,
            EngineError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            EngineError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

/// SQLSTATE-ish transient codes the retry layer reclassifies on second
/// failure (spec.md §4.9, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientClass {
    /// `HYT00` — login timeout.
    LoginTimeout,
    /// `08S01` — TCP provider / connection lost.
    ConnectionLost,
}

impl fmt::Display for TransientClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransientClass::LoginTimeout => write!(f, "HYT00"),
            TransientClass::ConnectionLost => write!(f, "08S01"),
        }
    }
}

/// Classify a raw database error message into a transient class, if any.
///
/// Real drivers expose SQLSTATE codes directly; this is a best-effort text
/// match used uniformly across dialects so the retry layer has one place to
/// reason about "is this worth retrying".
pub fn classify_db_error(message: &str) -> Option<TransientClass> {
    let lower = message.to_lowercase();
    if lower.contains("hyt00") || lower.contains("login timeout") {
        Some(TransientClass::LoginTimeout)
    } else if lower.contains("08s01")
        || lower.contains("connection reset")
        || lower.contains("broken pipe")
        || lower.contains("connection lost")
    {
        Some(TransientClass::ConnectionLost)
    } else {
        None
    }
}

impl From<TransientClass> for EngineError {
    fn from(class: TransientClass) -> Self {
        match class {
            TransientClass::LoginTimeout => {
                EngineError::GatewayTimeout("login timeout (HYT00)".into())
            }
            TransientClass::ConnectionLost => {
                EngineError::BadGateway("connection lost (08S01)".into())
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_login_timeout() {
        assert_eq!(
            classify_db_error("driver returned HYT00: login timeout expired"),
            Some(TransientClass::LoginTimeout)
        );
    }

    #[test]
    fn classifies_connection_lost() {
        assert_eq!(
            classify_db_error("08S01: TCP Provider: An existing connection was forcibly closed"),
            Some(TransientClass::ConnectionLost)
        );
    }

    #[test]
    fn non_transient_errors_are_not_classified() {
        assert_eq!(classify_db_error("syntax error near SELECT"), None);
    }

    #[test]
    fn kind_mapping_is_stable() {
        assert_eq!(
            EngineError::RateLimited {
                retry_after_secs: 3
            }
            .kind(),
            ErrorKind::RateLimited
        );
        assert_eq!(ErrorKind::RateLimited.http_status(), 429);
    }
}
