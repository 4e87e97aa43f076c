//! # Suggestion Orchestrator
//!
//! Turns a screenshot plus generation hints into a small set of ranked,
//! quality-checked suggestions within a tier's latency budget.
//!
//! This crate provides:
//!
//! - Tier selection and the pipeline state machine
//! - Exact and semantic caching with in-flight deduplication
//! - Quality scoring and filtering
//! - Streaming delivery with cancellation and idle timeouts
//! - A performance monitor that raises alerts and tunes the pipeline
//!
//! ## Architecture
//!
//! - `Orchestrator`: entry point; owns the cache, monitor and stream registry
//! - `CacheLayer` / `CacheStore`: cache policy over a pluggable store
//! - `QualityFilter`: scores suggestions and rejects the weak ones
//! - `PerformanceMonitor`: rolling windows, alerts, `Tuning`
//! - `StreamingDelivery`: bounded-channel streams of suggestions
//! - Provider access goes through `provider_sdk::ProviderGateway`

pub mod error;
pub use error::{CacheError, OrchestratorError, Result, StreamError};

pub mod types;
pub use types::{
    CacheMatch, ImageRef, PipelineOutput, PipelinePhase, QualityScores, ResponseMeta, ResponseStatus,
    Suggestion, SuggestionRequest, SuggestionResponse, SuggestionType, Tier, Tone,
};

pub mod config;
pub use config::{
    CacheConfig, LatencyTarget, MonitorConfig, OrchestratorConfig, StreamConfig, TierProfile,
};

pub mod logging;
pub use logging::{init_logging, LoggingConfig};

pub mod fingerprint;
pub use fingerprint::{Fingerprint, SemanticSignature};

pub mod fallback;

pub mod quality;
pub use quality::{FilteredBatch, QualityContext, QualityEvaluation, QualityFilter};

pub mod cache;
pub use cache::{CacheEntry, CacheHit, CacheLayer, CacheStats, CacheStore, MemoryCacheStore};

pub mod monitor;
pub use monitor::{
    Alert, AlertSeverity, Dashboard, MonitorSignal, Optimization, PerformanceMonitor,
    PerformanceSample, Tuning, WindowStats,
};

pub mod streaming;
pub use streaming::{
    OrderingMode, StreamEvent, StreamHandle, StreamOptions, StreamReceiver, StreamSession,
    StreamStatus, StreamingDelivery,
};

pub mod history;
pub use history::{HistoryRecord, HistorySink, LoggingHistorySink};

pub mod orchestrator;
pub use orchestrator::{
    estimate_duration, select_tier, HealthReport, Orchestrator, OrchestratorBuilder,
};
