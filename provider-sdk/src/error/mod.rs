//! Error handling for the provider SDK
//!
//! This module provides the error system shared by every provider client:
//! - Categorizes errors by type (network, rate limit, parsing, etc.)
//! - Classifies them into the gateway's `ErrorKind` taxonomy
//! - Adds rich context to errors for better debugging
//! - Provides a convenient Result type alias

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod mapping;

/// Result type for provider SDK operations
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Main error type for the provider SDK
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Network or connection errors
    #[error("Network error: {0}")]
    Network(String),

    /// Authentication errors
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Authorization errors (permission issues)
    #[error("Authorization error: {0}")]
    Authorization(String),

    /// Rate limiting errors
    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    /// Provider-side failures (5xx and similar)
    #[error("Service error: {0}")]
    Service(String),

    /// Request validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Response parsing errors
    #[error("Parsing error: {0}")]
    Parsing(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Timeout errors
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Unexpected or internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// Circuit breaker open errors
    #[error("Circuit broken: {0}")]
    CircuitBroken(String),

    /// Errors with additional context
    #[error("{inner}")]
    WithContext {
        inner: Box<ServiceError>,
        context: ErrorContext,
    },
}

/// Gateway-level classification of a provider failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The call did not complete within its timeout
    Timeout,
    /// The provider asked us to slow down
    RateLimited,
    /// The provider's circuit breaker is open; nothing was sent
    ProviderUnavailable,
    /// The provider answered with something we could not use
    InvalidResponse,
    /// Connection failures and provider-side 5xx responses
    TransientNetwork,
    /// Auth, validation or configuration problems on our side
    Rejected,
}

impl ErrorKind {
    /// Transient kinds are retried and counted by the circuit breaker
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::RateLimited | ErrorKind::TransientNetwork
        )
    }

    /// Stable lowercase label for logs and metrics
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ProviderUnavailable => "provider_unavailable",
            ErrorKind::InvalidResponse => "invalid_response",
            ErrorKind::TransientNetwork => "transient_network",
            ErrorKind::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ServiceError {
    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        ServiceError::Network(message.into())
    }

    /// Create an authentication error
    pub fn authentication(message: impl Into<String>) -> Self {
        ServiceError::Authentication(message.into())
    }

    /// Create an authorization error
    pub fn authorization(message: impl Into<String>) -> Self {
        ServiceError::Authorization(message.into())
    }

    /// Create a rate limit error
    pub fn rate_limit(message: impl Into<String>) -> Self {
        ServiceError::RateLimit(message.into())
    }

    /// Create a provider-side service error
    pub fn service(message: impl Into<String>) -> Self {
        ServiceError::Service(message.into())
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        ServiceError::Validation(message.into())
    }

    /// Create a parsing error
    pub fn parsing(message: impl Into<String>) -> Self {
        ServiceError::Parsing(message.into())
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        ServiceError::Configuration(message.into())
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        ServiceError::Timeout(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        ServiceError::Internal(message.into())
    }

    /// Create a circuit broken error
    pub fn circuit_broken(message: impl Into<String>) -> Self {
        ServiceError::CircuitBroken(message.into())
    }

    /// Add context to an existing error
    pub fn with_context(self, context: ErrorContext) -> Self {
        ServiceError::WithContext {
            inner: Box::new(self),
            context,
        }
    }

    /// Add a single context key/value to an existing error
    pub fn with_context_value(self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        match self {
            ServiceError::WithContext { inner, mut context } => {
                context.add(key, value);
                ServiceError::WithContext { inner, context }
            }
            other => {
                let mut context = ErrorContext::new();
                context.add(key, value);
                other.with_context(context)
            }
        }
    }

    /// Get the error context if one was attached
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            ServiceError::WithContext { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Get the provider name if available
    pub fn service_name(&self) -> Option<&str> {
        self.context().map(|context| context.service.as_str())
    }

    /// Get the HTTP status code if available
    pub fn status_code(&self) -> Option<u16> {
        self.context().and_then(|context| context.status_code)
    }

    /// The innermost error, with all context layers stripped
    pub fn root(&self) -> &ServiceError {
        match self {
            ServiceError::WithContext { inner, .. } => inner.root(),
            other => other,
        }
    }

    /// Classify this error into the gateway taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            ServiceError::Timeout(_) => ErrorKind::Timeout,
            ServiceError::RateLimit(_) => ErrorKind::RateLimited,
            ServiceError::CircuitBroken(_) => ErrorKind::ProviderUnavailable,
            ServiceError::Parsing(_) => ErrorKind::InvalidResponse,
            ServiceError::Network(_) | ServiceError::Service(_) => ErrorKind::TransientNetwork,
            ServiceError::Authentication(_)
            | ServiceError::Authorization(_)
            | ServiceError::Validation(_)
            | ServiceError::Configuration(_)
            | ServiceError::Internal(_) => ErrorKind::Rejected,
            ServiceError::WithContext { .. } => ErrorKind::Rejected,
        }
    }

    /// Check if this is a retryable error
    pub fn is_retryable(&self) -> bool {
        self.kind().is_transient()
    }

    /// Check if this is a permanent error (not retryable)
    pub fn is_permanent(&self) -> bool {
        !self.is_retryable()
    }
}

/// Error context information
#[derive(Debug, Clone)]
pub struct ErrorContext {
    /// Provider that generated the error
    pub service: String,

    /// Error timestamp
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,

    /// HTTP status code if applicable
    pub status_code: Option<u16>,

    /// Provider-specific error code
    pub error_code: Option<String>,

    /// Request ID for tracing
    pub request_id: Option<String>,

    /// Endpoint that was called
    pub endpoint: Option<String>,

    /// Additional context data
    pub data: HashMap<String, String>,
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self {
            service: "unknown".to_string(),
            timestamp: Some(chrono::Utc::now()),
            status_code: None,
            error_code: None,
            request_id: None,
            endpoint: None,
            data: HashMap::new(),
        }
    }
}

impl ErrorContext {
    /// Create a new error context
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new error context for a specific provider
    pub fn for_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            ..Self::default()
        }
    }

    /// Add an HTTP status code
    pub fn status_code(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }

    /// Add an error code
    pub fn error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    /// Add a request ID
    pub fn request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    /// Add an endpoint
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Add a context value
    pub fn add<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: fmt::Display,
    {
        self.data.insert(key.into(), value.to_string());
    }

    /// Add a context value and return self (builder pattern)
    pub fn with<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: fmt::Display,
    {
        self.add(key, value);
        self
    }
}

/// Convert reqwest errors to ServiceError
impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        let context = ErrorContext::for_service("http_client");

        let service_error = if err.is_timeout() {
            ServiceError::timeout(format!("Request timed out: {}", err))
        } else if err.is_connect() {
            ServiceError::network(format!("Connection error: {}", err))
        } else if err.is_decode() {
            ServiceError::parsing(format!("Response decode error: {}", err))
        } else if err.is_request() || err.is_body() {
            ServiceError::network(format!("Request failed: {}", err))
        } else if err.is_redirect() {
            ServiceError::network(format!("Too many redirects: {}", err))
        } else {
            ServiceError::internal(format!("HTTP client error: {}", err))
        };

        match err.status() {
            Some(status) => service_error.with_context(context.status_code(status.as_u16())),
            None => service_error.with_context(context),
        }
    }
}

/// Convert serde_json errors to ServiceError
impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::parsing(format!("JSON error: {}", err))
            .with_context(ErrorContext::for_service("json"))
    }
}
