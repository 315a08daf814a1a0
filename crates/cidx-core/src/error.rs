//! Stable error taxonomy shared by every CIDX component.
//!
//! Every fallible operation that crosses a capability-trait boundary
//! (store, embedder, repo manager, job queue, query engine) returns
//! `Result<T, CidxError>` rather than a bare `anyhow::Error`, so the
//! API Facade can map it to a stable error-code string and an HTTP
//! status without string-matching a message.
//!
//! Application glue (CLI commands, `main.rs`) still uses `anyhow`: typed
//! errors live in the core crates that cross capability boundaries,
//! `anyhow` everywhere else.

use thiserror::Error;

/// The full error taxonomy from the design's error-handling section.
#[derive(Debug, Error, Clone)]
pub enum CidxError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("index integrity failure: {0}")]
    IntegrityFailure(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("external failure: {0}")]
    ExternalFailure(String),

    #[error("maintenance mode: {0}")]
    Maintenance(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CidxError {
    /// Stable machine-readable error code, distinct from the HTTP status,
    /// so clients can branch on it even when two codes share a status.
    pub fn error_code(&self) -> &'static str {
        match self {
            CidxError::InvalidInput(_) => "invalid_input",
            CidxError::Unauthenticated(_) => "unauthenticated",
            CidxError::PermissionDenied(_) => "permission_denied",
            CidxError::NotFound(_) => "not_found",
            CidxError::Conflict(_) => "conflict",
            CidxError::Validation(_) => "validation",
            CidxError::IntegrityFailure(_) => "integrity_failure",
            CidxError::Timeout(_) => "timeout",
            CidxError::ExternalFailure(_) => "external_failure",
            CidxError::Maintenance(_) => "maintenance",
            CidxError::Internal(_) => "internal",
        }
    }

    /// HTTP status mapping per the external-interfaces design (§6).
    ///
    /// `429` is reserved but unused (no rate limiting is specified).
    pub fn status_code(&self) -> u16 {
        match self {
            CidxError::InvalidInput(_) => 400,
            CidxError::Unauthenticated(_) => 401,
            CidxError::PermissionDenied(_) => 403,
            CidxError::NotFound(_) => 404,
            CidxError::Conflict(_) => 409,
            CidxError::Validation(_) => 422,
            CidxError::IntegrityFailure(_) => 200, // degraded result, not a hard failure
            CidxError::Timeout(_) => 504,
            CidxError::ExternalFailure(_) => 502,
            CidxError::Maintenance(_) => 503,
            CidxError::Internal(_) => 500,
        }
    }

    /// Whether this error is safe to retry with bounded exponential
    /// backoff (transient external failures only).
    pub fn is_retryable(&self) -> bool {
        matches!(self, CidxError::ExternalFailure(_) | CidxError::Timeout(_))
    }
}

pub type CidxResult<T> = Result<T, CidxError>;
