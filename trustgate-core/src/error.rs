//! Error types for Trustgate.
//!
//! Every failure in the core maps to exactly one kind, and every kind maps
//! to one HTTP status. Handlers translate local errors into this taxonomy;
//! anything unexpected becomes `Internal` with a generic message so stack
//! traces never reach the wire.

use axum::http::StatusCode;
use thiserror::Error;

/// Result type alias for Trustgate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Trustgate operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Caller Errors
    // =========================================================================

    /// Malformed body or bad parameter types. Recoverable by the caller.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Missing or invalid API key.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// No bearer credential was presented to the gateway.
    #[error("missing credential: expected Authorization bearer token or X-Agent-Certificate header")]
    MissingCredential,

    // =========================================================================
    // Certificate Errors
    // =========================================================================

    /// Signature verified but the certificate is past its expiry.
    /// The agent should refresh and retry.
    #[error("certificate expired")]
    CertExpired,

    /// Signature mismatch, wrong issuer, or malformed token.
    /// Fatal for this token.
    #[error("invalid certificate: {0}")]
    CertInvalid(String),

    /// The certificate's status claim marks the agent suspended or banned.
    #[error("agent disabled: status is '{status}'")]
    AgentDisabled { status: String },

    // =========================================================================
    // Authorization Errors
    // =========================================================================

    /// Reputation score below the action's threshold.
    #[error("Insufficient reputation score: {score} < {required}")]
    InsufficientScore { score: i64, required: i64 },

    /// Scope violation, behavioral block, or other policy denial.
    /// Not auto-retriable.
    #[error("forbidden: {0}")]
    Forbidden(String),

    // =========================================================================
    // Resource Errors
    // =========================================================================

    /// Unknown agent, action, or certificate record.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate registration or duplicate vouch.
    #[error("conflict: {0}")]
    Conflict(String),

    // =========================================================================
    // Infrastructure Errors
    // =========================================================================

    /// Station or gateway unreachable. Logged internally; never surfaced to
    /// an agent on fire-and-forget paths.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Scoring recompute, signing, or persistence failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status carried by this error kind.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Unauthenticated(_) | Error::MissingCredential => StatusCode::UNAUTHORIZED,
            Error::CertExpired | Error::CertInvalid(_) => StatusCode::UNAUTHORIZED,
            Error::AgentDisabled { .. }
            | Error::InsufficientScore { .. }
            | Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Upstream(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Internal(format!("persistence failure: {e}"))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Upstream(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            Error::MissingCredential.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(Error::CertExpired.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            Error::InsufficientScore {
                score: 50,
                required: 60
            }
            .status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            Error::Conflict("duplicate vouch".into()).status_code(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_score_gate_message_wording() {
        let e = Error::InsufficientScore {
            score: 50,
            required: 60,
        };
        assert_eq!(e.to_string(), "Insufficient reputation score: 50 < 60");
    }
}
