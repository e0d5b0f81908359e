//! Error taxonomy shared by every component of the framework.
//!
//! All failures that cross a component boundary are expressed as one of
//! these kinds so that the wire surface can map them uniformly. Auth
//! failures collapse into a single [`Error::Unauthenticated`] value on
//! purpose: the message never distinguishes missing, malformed, expired,
//! or non-matching credentials.

use thiserror::Error;

/// Framework-wide error kinds.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed request; the caller is wrong. Includes magic-cookie mismatch.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Missing, malformed, expired, or non-matching credential.
    ///
    /// Deliberately carries no detail.
    #[error("unauthenticated")]
    Unauthenticated,

    /// Credential is valid but the principal is not authorized for this
    /// capability or target.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Service type or registration is unknown.
    #[error("not found: {0}")]
    NotFound(String),

    /// Version negotiation failed, a required dependency is unsatisfied,
    /// or the dependency graph contains a cycle.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// Rate limit exceeded.
    #[error("resource exhausted")]
    ResourceExhausted,

    /// Downstream provider unhealthy with no alternate, circuit open, or
    /// handshake target unreachable.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// CSPRNG failure, misconfiguration, or programmer error.
    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    /// Stable wire code for this kind.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidArgument(_) => "invalid_argument",
            Error::Unauthenticated => "unauthenticated",
            Error::PermissionDenied(_) => "permission_denied",
            Error::NotFound(_) => "not_found",
            Error::FailedPrecondition(_) => "failed_precondition",
            Error::ResourceExhausted => "resource_exhausted",
            Error::Unavailable(_) => "unavailable",
            Error::Internal(_) => "internal",
        }
    }

    /// HTTP status the wire surface maps this kind to.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::InvalidArgument(_) | Error::FailedPrecondition(_) => 400,
            Error::Unauthenticated => 401,
            Error::PermissionDenied(_) => 403,
            Error::NotFound(_) => 404,
            Error::ResourceExhausted => 429,
            Error::Unavailable(_) => 503,
            Error::Internal(_) => 500,
        }
    }

    /// Parse a wire code back into an error kind. Used by clients to
    /// decide retry behavior.
    pub fn from_code(code: &str, message: &str) -> Self {
        match code {
            "invalid_argument" => Error::InvalidArgument(message.to_string()),
            "unauthenticated" => Error::Unauthenticated,
            "permission_denied" => Error::PermissionDenied(message.to_string()),
            "not_found" => Error::NotFound(message.to_string()),
            "failed_precondition" => Error::FailedPrecondition(message.to_string()),
            "resource_exhausted" => Error::ResourceExhausted,
            "unavailable" => Error::Unavailable(message.to_string()),
            _ => Error::Internal(message.to_string()),
        }
    }

    /// Whether a client may retry the failed call.
    ///
    /// Retries are a client concern and apply only to transient kinds.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Unavailable(_) | Error::ResourceExhausted)
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;
