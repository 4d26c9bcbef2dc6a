//! Error types shared across the DFM services.
//!
//! Every error that can reach a client maps onto one of the wire-level
//! [`ErrorKind`]s; everything else is folded into `INTERNAL`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire-level error taxonomy.
///
/// These are the `error_kind` strings carried by HTTP error bodies and by
/// `error` response envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Pipeline verification failed; reported synchronously from `process`.
    BadPipeline,
    /// Polling or cancelling an unknown request.
    NoSuchRequest,
    /// An adapter deemed its params invalid at run time. Never retried.
    AdapterBadInput,
    /// External data/inference service unreachable. Retried with backoff,
    /// then terminal.
    UpstreamUnavailable,
    /// Broker or cache failure after the retry budget. Terminal.
    Internal,
    /// Explicit cancel, request timeout, or dependency failure.
    Cancelled,
}

impl ErrorKind {
    /// The wire string for this kind, e.g. `BAD_PIPELINE`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BadPipeline => "BAD_PIPELINE",
            ErrorKind::NoSuchRequest => "NO_SUCH_REQUEST",
            ErrorKind::AdapterBadInput => "ADAPTER_BAD_INPUT",
            ErrorKind::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            ErrorKind::Internal => "INTERNAL",
            ErrorKind::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for DFM operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DfmError {
    /// Pipeline failed verification.
    #[error("invalid pipeline: {0}")]
    BadPipeline(String),

    /// The request id is unknown (expired, deleted, or never existed).
    #[error("no such request: {0}")]
    NoSuchRequest(String),

    /// An adapter rejected its inputs at run time.
    #[error("bad adapter input: {0}")]
    AdapterBadInput(String),

    /// An external collaborator of an adapter is unreachable.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The node or request was cancelled.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Broker-side failure. Transient until the retry budget is exhausted.
    #[error("broker error: {0}")]
    Broker(String),

    /// Cache-side failure.
    #[error("cache error: {0}")]
    Cache(String),

    /// Invalid site or environment configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DfmError {
    /// The wire-level kind this error surfaces as.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DfmError::BadPipeline(_) => ErrorKind::BadPipeline,
            DfmError::NoSuchRequest(_) => ErrorKind::NoSuchRequest,
            DfmError::AdapterBadInput(_) => ErrorKind::AdapterBadInput,
            DfmError::UpstreamUnavailable(_) => ErrorKind::UpstreamUnavailable,
            DfmError::Cancelled(_) => ErrorKind::Cancelled,
            DfmError::Broker(_)
            | DfmError::Cache(_)
            | DfmError::Config(_)
            | DfmError::Serialization(_)
            | DfmError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether local recovery (retry with backoff) applies.
    ///
    /// Only `UPSTREAM_UNAVAILABLE` and broker failures are transient; every
    /// other kind is terminal on first occurrence.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DfmError::UpstreamUnavailable(_) | DfmError::Broker(_)
        )
    }
}

/// Result type alias for DFM operations.
pub type Result<T> = std::result::Result<T, DfmError>;
