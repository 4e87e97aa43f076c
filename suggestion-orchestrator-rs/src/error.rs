//! Error types for the suggestion pipeline
//!
//! Only [`OrchestratorError::InvalidRequest`] ever reaches a caller of
//! `submit`; provider failures resolve to degraded responses and cache
//! failures to uncached runs.

use provider_sdk::ServiceError;
use thiserror::Error;

/// Result type used throughout the orchestrator
pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

/// Errors surfaced by the orchestrator
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// The caller sent a request that can never succeed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration could not be loaded or is inconsistent
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A provider failed and the failure was not recovered
    #[error("Provider error: {0}")]
    Provider(#[from] ServiceError),

    /// The streaming session could not be served
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    /// The pipeline task ended without producing a result
    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Create a new invalid request error
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Create a new configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create a new internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether the error is the caller's fault
    pub fn is_invalid_request(&self) -> bool {
        matches!(self, Self::InvalidRequest(_))
    }
}

/// Failures of the cache layer. Never fatal to a pipeline run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The backing store cannot be reached
    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    /// The stored payload could not be read back
    #[error("Corrupt cache entry {fingerprint}: {reason}")]
    Corrupt { fingerprint: String, reason: String },
}

/// Failures of a streaming session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// The receiver went away or the session was cancelled
    #[error("Stream {0} was cancelled")]
    Cancelled(String),

    /// The session already reached a terminal state
    #[error("Stream {0} is closed")]
    Closed(String),

    /// No event was delivered within the idle timeout
    #[error("Stream {stream_id} idle for {idle_ms}ms")]
    IdleTimeout { stream_id: String, idle_ms: u64 },
}
