//! # Provider SDK
//!
//! Resilient access to the external providers used by the suggestion
//! pipeline: image analysis, text generation and speech synthesis.
//!
//! This crate provides:
//!
//! - Provider traits and the request/response models that flow through them
//! - HTTP clients for each provider
//! - Comprehensive error handling with a gateway-level error taxonomy
//! - Resilience patterns (retries, circuit breakers)
//! - Configuration management utilities
//!
//! ## Architecture
//!
//! - `ProviderGateway`: the single entry point; one breaker and retry policy per provider
//! - `VisionProvider`, `GenerationProvider`, `SpeechProvider`: the provider seams
//! - `CallObserver`: receives a `ProviderCallRecord` for every attempt
//! - `ServiceError` / `ErrorKind`: normalized errors and their classification

pub mod core;
pub use core::{
    CallObserver, CallOutcome, ClientBuilder, ContentType, GeneratedSuggestion,
    GenerationProvider, GenerationRequest, GenerationResponse, ModelMeta, ProviderCallRecord,
    ProviderKind, ProviderRequest, ProviderResponse, SpeechAudio, SpeechProvider, SpeechRequest,
    VisionAnalysis, VisionProvider, VisionRequest, VoiceSettings,
};

pub mod services;

pub mod error;
pub use error::{ErrorContext, ErrorKind, Result, ServiceError};

pub mod resilience;
pub use resilience::{
    BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus, Resilience,
    RetryExecutor, RetryPolicy,
};

pub mod config;
pub use config::{ConfigProvider, ConfigProviderExt, ProviderEndpointConfig, ServiceConfig};

pub mod gateway;
pub use gateway::{ProviderGateway, ProviderGatewayBuilder};

pub mod util;

#[cfg(test)]
mod tests;
