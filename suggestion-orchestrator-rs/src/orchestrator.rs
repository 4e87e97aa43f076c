//! # Orchestrator
//!
//! Drives one request through
//! `Selecting -> CacheCheck -> [HitDone | Generating -> Scoring -> Publishing] -> Done | Degraded`.
//!
//! The pipeline for a fingerprint runs on its own task, owned by the
//! in-flight claim. Callers only wait on the claim, so a caller that goes
//! away never aborts work that other waiters and the cache still need.
//! The owner reports each phase it enters on the claim; streaming callers
//! forward those reports to their clients.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use once_cell::sync::Lazy;
use provider_sdk::{
    BreakerSnapshot, GenerationRequest, ProviderGateway, ProviderKind, ServiceError, VisionRequest,
};
use regex::Regex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

use crate::cache::{CacheHit, CacheLayer, CacheStats, CacheStore, Claim, ClaimGuard, ClaimUpdate};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::fallback;
use crate::fingerprint::{Fingerprint, SemanticSignature};
use crate::history::{self, HistoryRecord, HistorySink, LoggingHistorySink};
use crate::monitor::{Dashboard, PerformanceMonitor, PerformanceSample, Tuning};
use crate::quality::{self, QualityContext, QualityFilter};
use crate::streaming::{StreamHandle, StreamOptions, StreamReceiver, StreamingDelivery};
use crate::types::{
    CacheMatch, PipelineOutput, PipelinePhase, ResponseMeta, ResponseStatus, Suggestion,
    SuggestionRequest, SuggestionResponse, Tier,
};

/// Rounds of claim-or-join before answering without a pipeline result
const MAX_CLAIM_ROUNDS: usize = 3;

static CONVERSATION_HINT: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)conversation|chat|messages").ok());
static PROFILE_HINT: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)profile|bio|description").ok());

fn mentions(pattern: &Lazy<Option<Regex>>, text: &str) -> bool {
    pattern.as_ref().map_or(false, |re| re.is_match(text))
}

/// Preference key callers set to `"true"` to ask for the most careful tier
pub const HIGH_ACCURACY_PREFERENCE: &str = "require_high_accuracy";

/// How demanding a request looks, `0.0` and up
pub fn complexity_score(request: &SuggestionRequest) -> f32 {
    let mut score = 0.0;

    let image_size = request.image.size();
    if image_size > 500_000 {
        score += 0.3;
    }
    if image_size > 1_000_000 {
        score += 0.2;
    }

    let context = request.context.as_str();
    if context.chars().count() > 500 {
        score += 0.2;
    }
    if mentions(&CONVERSATION_HINT, context) {
        score += 0.2;
    }
    if mentions(&PROFILE_HINT, context) {
        score += 0.1;
    }

    if request
        .user_preferences
        .get(HIGH_ACCURACY_PREFERENCE)
        .map_or(false, |v| v.eq_ignore_ascii_case("true"))
    {
        score += 0.3;
    }
    score
}

/// Pick the tier for a request.
///
/// An explicit hint is used as is. Otherwise low-latency clients get `Fast`,
/// everyone else is scored, and the monitor's tuning may move the result
/// one step down.
pub fn select_tier(request: &SuggestionRequest, tuning: &Tuning) -> Tier {
    if let Some(hint) = request.strategy_hint {
        return hint;
    }
    if request.low_latency_client {
        return Tier::Fast;
    }

    let score = complexity_score(request);
    let tier = if score >= 0.8 {
        Tier::Comprehensive
    } else if score >= 0.4 {
        Tier::Standard
    } else {
        Tier::Fast
    };
    tuning.apply(tier)
}

/// Rough wall time a request should take, announced when a stream starts
pub fn estimate_duration(request: &SuggestionRequest, tier: Tier) -> Duration {
    let mut millis: f64 = 8_000.0;

    let image_size = request.image.size();
    if image_size > 1_000_000 {
        millis += 2_000.0;
    } else if image_size > 500_000 {
        millis += 1_000.0;
    }

    millis *= match tier {
        Tier::Fast => 0.7,
        Tier::Standard => 1.0,
        Tier::Comprehensive => 1.5,
    };
    if request.low_latency_client {
        millis *= 0.8;
    }
    Duration::from_millis(millis.min(12_000.0).round() as u64)
}

/// Point-in-time health of the pipeline
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub service: String,
    /// `healthy`, or `degraded` while any breaker is not closed
    pub status: &'static str,
    pub breakers: BTreeMap<ProviderKind, BreakerSnapshot>,
    pub cache: CacheStats,
    pub cache_hit_rate: f64,
    pub p50_latency_ms: u64,
    pub p95_latency_ms: u64,
    pub p99_latency_ms: u64,
    pub in_flight: usize,
    pub active_streams: usize,
    pub tuning: Tuning,
}

/// How a request got its answer
struct Resolution {
    output: Arc<PipelineOutput>,
    cache_match: Option<CacheMatch>,
    deduplicated: bool,
}

impl Resolution {
    fn from_hit(hit: CacheHit) -> Self {
        Self {
            output: Arc::new(PipelineOutput {
                status: ResponseStatus::Complete,
                tier: hit.tier,
                requested_tier: hit.tier,
                suggestions: hit.suggestions,
                rejected: Vec::new(),
                guidance: None,
            }),
            cache_match: Some(hit.matched),
            deduplicated: false,
        }
    }
}

struct Inner {
    config: OrchestratorConfig,
    gateway: Arc<ProviderGateway>,
    cache: CacheLayer<Arc<PipelineOutput>>,
    quality: QualityFilter,
    monitor: Arc<PerformanceMonitor>,
    streaming: StreamingDelivery,
    history: Arc<dyn HistorySink>,
}

/// Entry point of the suggestion pipeline
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.inner.monitor
    }

    pub fn cache(&self) -> &CacheLayer<Arc<PipelineOutput>> {
        &self.inner.cache
    }

    /// Answer a request.
    ///
    /// Only an invalid request is an error; provider trouble produces a
    /// degraded response instead.
    pub async fn submit(&self, request: SuggestionRequest) -> Result<SuggestionResponse> {
        let accepted = Instant::now();
        request.validate()?;

        let request = Arc::new(request);
        let tier = select_tier(&request, &self.inner.monitor.tuning());
        let fingerprint = Fingerprint::of(&request);
        let span = tracing::info_span!(
            "suggest",
            correlation_id = %request.correlation_id,
            tier = %tier,
            fingerprint = %fingerprint.short(),
        );

        async move {
            let resolution = Arc::clone(&self.inner)
                .resolve(Arc::clone(&request), tier, fingerprint.clone(), None)
                .await;
            let mut response = self.inner.publish(&request, tier, &fingerprint, resolution, accepted);
            quality::rank(&mut response.suggestions);
            Ok(response)
        }
        .instrument(span)
        .await
    }

    /// Answer a request as a stream of suggestions.
    ///
    /// Cancelling the returned receiver stops delivery but not generation:
    /// the result still reaches the cache and any other waiters.
    pub async fn submit_streaming(
        &self,
        request: SuggestionRequest,
        options: StreamOptions,
    ) -> Result<StreamReceiver> {
        let accepted = Instant::now();
        request.validate()?;

        let request = Arc::new(request);
        let tier = select_tier(&request, &self.inner.monitor.tuning());
        let fingerprint = Fingerprint::of(&request);
        let (handle, receiver) = self.inner.streaming.start(
            &request.correlation_id,
            estimate_duration(&request, tier),
            options,
        );
        let span = tracing::info_span!(
            "suggest_stream",
            correlation_id = %request.correlation_id,
            stream_id = %handle.stream_id(),
            tier = %tier,
            fingerprint = %fingerprint.short(),
        );

        let inner = Arc::clone(&self.inner);
        tokio::spawn(
            async move {
                // Polling the pipeline first starts generation even when the
                // stream is already gone
                let pipeline = Arc::clone(&inner).resolve(
                    Arc::clone(&request),
                    tier,
                    fingerprint.clone(),
                    Some(&handle),
                );
                let resolved = tokio::select! {
                    biased;
                    resolution = pipeline => resolution,
                    _ = handle.closed() => {
                        debug!("Stream closed before the answer was ready");
                        return;
                    }
                };

                // Generation order; the stream applies the client's ordering
                let response = inner.publish(&request, tier, &fingerprint, resolved, accepted);
                let delivered = match handle.send_batch(response.suggestions).await {
                    Ok(_) => handle.complete(response.meta).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = delivered {
                    debug!(error = %e, "Stream delivery stopped");
                }
            }
            .instrument(span),
        );

        Ok(receiver)
    }

    /// Breakers, cache, latency and stream state
    pub fn health(&self) -> HealthReport {
        let inner = &self.inner;
        let breakers = inner.gateway.breaker_snapshots();
        let status = if breakers
            .values()
            .all(|b| b.status == provider_sdk::CircuitBreakerStatus::Closed)
        {
            "healthy"
        } else {
            "degraded"
        };
        let cache = inner.cache.stats();
        let dashboard = inner.monitor.dashboard();

        HealthReport {
            service: inner.config.service_name.clone(),
            status,
            breakers,
            cache_hit_rate: cache.hit_rate(),
            in_flight: cache.in_flight,
            cache,
            p50_latency_ms: dashboard.overall.p50_latency_ms,
            p95_latency_ms: dashboard.overall.p95_latency_ms,
            p99_latency_ms: dashboard.overall.p99_latency_ms,
            active_streams: inner.streaming.active_count(),
            tuning: dashboard.tuning,
        }
    }

    pub fn dashboard(&self) -> Dashboard {
        self.inner.monitor.dashboard()
    }
}

impl Inner {
    /// Cache, then claim: run the pipeline as owner or wait on the owner.
    ///
    /// A waiter whose owner ran for a cheaper tier claims again, and keeps
    /// that answer only if no better one turns up.
    async fn resolve(
        self: Arc<Self>,
        request: Arc<SuggestionRequest>,
        tier: Tier,
        fingerprint: Fingerprint,
        stream: Option<&StreamHandle>,
    ) -> Resolution {
        let signature = SemanticSignature::of(&request);
        let mut cheaper: Option<Arc<PipelineOutput>> = None;

        for round in 0..MAX_CLAIM_ROUNDS {
            match self.cache.lookup(&fingerprint, &signature, tier).await {
                Ok(Some(hit)) => {
                    debug!(matched = ?hit.matched, age_ms = hit.age.as_millis() as u64, "Cache hit");
                    return Resolution::from_hit(hit);
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Cache lookup failed, continuing uncached"),
            }

            let (mut waiter, deduplicated) = match self.cache.claim_or_join(&fingerprint) {
                Claim::Owner(guard) => {
                    let waiter = guard.subscribe();
                    let inner = Arc::clone(&self);
                    let request = Arc::clone(&request);
                    let signature = signature.clone();
                    tokio::spawn(
                        async move { inner.run_owned(request, tier, signature, guard).await }
                            .in_current_span(),
                    );
                    (waiter, false)
                }
                Claim::Waiter(waiter) => {
                    debug!(round, "Joined in-flight generation");
                    (waiter, true)
                }
            };

            let settled = loop {
                match waiter.next_update().await {
                    ClaimUpdate::Running(phase) => {
                        if let Some(stream) = stream {
                            stream.report_progress(phase);
                        }
                    }
                    ClaimUpdate::Ready(output) => break Some(output),
                    ClaimUpdate::Abandoned => break None,
                }
            };

            match settled {
                Some(output)
                    if deduplicated
                        && output.status == ResponseStatus::Complete
                        && output.requested_tier < tier =>
                {
                    debug!(
                        round,
                        owner_tier = %output.requested_tier,
                        "Joined a cheaper run, claiming again"
                    );
                    cheaper = Some(output);
                }
                Some(output) => {
                    return Resolution {
                        output,
                        cache_match: None,
                        deduplicated,
                    }
                }
                None => warn!(round, "In-flight generation was abandoned"),
            }
        }

        if let Some(output) = cheaper {
            warn!("No run for the requested tier, keeping the cheaper answer");
            return Resolution {
                output,
                cache_match: None,
                deduplicated: true,
            };
        }

        error!("No pipeline result after repeated claims, answering with emergency suggestions");
        let output = self.degraded(&request, tier, "pipeline abandoned", Vec::new());
        Resolution {
            output: Arc::new(output),
            cache_match: None,
            deduplicated: false,
        }
    }

    /// The owner's side: generate, store, then release every waiter
    async fn run_owned(
        self: Arc<Self>,
        request: Arc<SuggestionRequest>,
        tier: Tier,
        signature: SemanticSignature,
        guard: ClaimGuard<Arc<PipelineOutput>>,
    ) {
        let report = |phase: PipelinePhase| guard.report(phase);
        let mut output = self.run_pipeline(&request, tier, &report).await;
        output.requested_tier = tier;
        let output = Arc::new(output);

        if output.status == ResponseStatus::Complete {
            let stored = self
                .cache
                .store(
                    guard.fingerprint().clone(),
                    signature,
                    output.tier,
                    output.suggestions.clone(),
                    self.monitor.tuning().ttl_multiplier,
                )
                .await;
            if let Err(e) = stored {
                warn!(error = %e, "Failed to cache suggestions");
            }
        }

        debug!(waiters = guard.waiters(), status = output.status.as_str(), "Publishing pipeline result");
        guard.publish(output);
    }

    /// One attempt at the selected tier, one at the next cheaper tier, then
    /// emergency suggestions
    async fn run_pipeline(
        &self,
        request: &SuggestionRequest,
        tier: Tier,
        report: &(dyn Fn(PipelinePhase) + Sync),
    ) -> PipelineOutput {
        let first = match self.attempt(request, tier, report).await {
            Ok(output) => return self.score(request, output, report),
            Err(e) => e,
        };

        let retry_tier = tier.downgrade();
        warn!(
            error = %first,
            kind = first.kind().as_str(),
            retry_tier = %retry_tier,
            "Pipeline failed, retrying at a cheaper tier"
        );

        match self.attempt(request, retry_tier, report).await {
            Ok(output) => self.score(request, output, report),
            Err(second) => {
                error!(
                    error = %second,
                    kind = second.kind().as_str(),
                    "Pipeline failed twice, answering with emergency suggestions"
                );
                self.degraded(request, retry_tier, &second.to_string(), Vec::new())
            }
        }
    }

    /// Vision then generation, bounded by the tier's budget
    async fn attempt(
        &self,
        request: &SuggestionRequest,
        tier: Tier,
        report: &(dyn Fn(PipelinePhase) + Sync),
    ) -> std::result::Result<Generated, ServiceError> {
        let profile = self.config.tier(tier);

        let work = async {
            report(PipelinePhase::ImageAnalysis);
            let analysis = self
                .gateway
                .analyze(
                    VisionRequest {
                        image_id: request.image.id.clone(),
                        image: request.image.bytes.as_ref().clone(),
                        suggestion_type: request.suggestion_type.as_str().to_string(),
                        context: request.context.clone(),
                    },
                    profile.vision_timeout,
                )
                .await?;

            if analysis.needs_more_input {
                info!(quality_score = analysis.quality_score, "Image needs more input");
                return Ok(Generated::NeedsMoreInput {
                    tier,
                    guidance: analysis
                        .guidance
                        .unwrap_or_else(|| fallback::DEFAULT_GUIDANCE.to_string()),
                });
            }

            report(PipelinePhase::ContextProcessing);
            let generation_request = GenerationRequest {
                extracted_details: analysis.extracted_details.clone(),
                tone: request.tone.as_str().to_string(),
                suggestion_type: request.suggestion_type.as_str().to_string(),
                count: profile.suggestion_count,
                context: request.context.clone(),
            };

            report(PipelinePhase::SuggestionGeneration);
            let generation = self
                .gateway
                .generate(generation_request, profile.generation_timeout)
                .await?;

            debug!(
                model = %generation.model_meta.model,
                generated = generation.suggestions.len(),
                "Generation finished"
            );
            Ok::<_, ServiceError>(Generated::Suggestions {
                tier,
                details: analysis.extracted_details,
                suggestions: generation.suggestions.into_iter().map(Suggestion::from).collect(),
            })
        };

        match tokio::time::timeout(profile.budget, work).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::timeout(format!(
                "{} tier budget of {}ms exceeded",
                tier,
                profile.budget.as_millis()
            ))),
        }
    }

    fn score(
        &self,
        request: &SuggestionRequest,
        generated: Generated,
        report: &(dyn Fn(PipelinePhase) + Sync),
    ) -> PipelineOutput {
        let (tier, details, suggestions) = match generated {
            Generated::NeedsMoreInput { tier, guidance } => {
                return PipelineOutput {
                    status: ResponseStatus::NeedsMoreInput,
                    tier,
                    requested_tier: tier,
                    suggestions: Vec::new(),
                    rejected: Vec::new(),
                    guidance: Some(guidance),
                }
            }
            Generated::Suggestions {
                tier,
                details,
                suggestions,
            } => (tier, details, suggestions),
        };

        report(PipelinePhase::QualityValidation);
        let ctx = QualityContext::new(request, Some(&details));
        let batch = self.quality.filter_batch(suggestions, &ctx, tier);
        debug!(
            passed = batch.passed.len(),
            rejected = batch.rejected.len(),
            pass_rate = batch.pass_rate(),
            "Quality filter finished"
        );

        if batch.passed.is_empty() {
            warn!(rejected = batch.rejected.len(), "No suggestion passed quality checks");
            return self.degraded(request, tier, "no suggestion passed quality checks", batch.rejected);
        }

        PipelineOutput {
            status: ResponseStatus::Complete,
            tier,
            requested_tier: tier,
            suggestions: batch.passed,
            rejected: batch.rejected,
            guidance: None,
        }
    }

    /// Emergency suggestions, scored for display but never dropped
    fn degraded(
        &self,
        request: &SuggestionRequest,
        tier: Tier,
        reason: &str,
        rejected: Vec<Suggestion>,
    ) -> PipelineOutput {
        let ctx = QualityContext::new(request, None);
        let suggestions = fallback::emergency_suggestions(request.tone, reason)
            .into_iter()
            .map(|mut suggestion| {
                suggestion.quality = self.quality.evaluate(&suggestion, &ctx, tier).scores;
                suggestion
            })
            .collect();

        PipelineOutput {
            status: ResponseStatus::Degraded,
            tier,
            requested_tier: tier,
            suggestions,
            rejected,
            guidance: None,
        }
    }

    /// Build the response, in generation order, and report it to the
    /// monitor and history
    fn publish(
        &self,
        request: &SuggestionRequest,
        requested_tier: Tier,
        fingerprint: &Fingerprint,
        resolution: Resolution,
        accepted: Instant,
    ) -> SuggestionResponse {
        let latency = accepted.elapsed();
        let output = resolution.output;
        let cache_hit = resolution.cache_match.is_some();

        let meta = ResponseMeta {
            correlation_id: request.correlation_id.clone(),
            tier: output.tier,
            requested_tier,
            status: output.status,
            cache_hit,
            cache_match: resolution.cache_match,
            degraded: output.status == ResponseStatus::Degraded,
            deduplicated: resolution.deduplicated,
            latency_ms: millis(latency),
            rejected_count: output.rejected.len(),
            guidance: output.guidance.clone(),
        };

        self.monitor.record(PerformanceSample {
            correlation_id: meta.correlation_id.clone(),
            tier: meta.tier,
            latency,
            status: meta.status,
            cache_hit,
            deduplicated: meta.deduplicated,
            suggestions_returned: output.suggestions.len(),
            suggestions_rejected: output.rejected.len(),
            recorded_at: Utc::now(),
        });

        history::record_detached(
            &self.history,
            HistoryRecord {
                correlation_id: meta.correlation_id.clone(),
                fingerprint: fingerprint.to_string(),
                tier: meta.tier,
                status: meta.status,
                cache_hit,
                suggestion_ids: output.suggestions.iter().map(|s| s.id.clone()).collect(),
                latency_ms: meta.latency_ms,
                recorded_at: Utc::now(),
            },
        );

        info!(
            status = meta.status.as_str(),
            answered_tier = %meta.tier,
            cache_hit,
            deduplicated = meta.deduplicated,
            suggestions = output.suggestions.len(),
            latency_ms = meta.latency_ms,
            "Request answered"
        );

        SuggestionResponse {
            suggestions: output.suggestions.clone(),
            meta,
        }
    }
}

/// What the providers produced before scoring
enum Generated {
    NeedsMoreInput {
        tier: Tier,
        guidance: String,
    },
    Suggestions {
        tier: Tier,
        details: BTreeMap<String, serde_json::Value>,
        suggestions: Vec<Suggestion>,
    },
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}

/// Assembles an [`Orchestrator`]
#[derive(Default)]
pub struct OrchestratorBuilder {
    config: Option<OrchestratorConfig>,
    gateway: Option<Arc<ProviderGateway>>,
    cache_store: Option<Arc<dyn CacheStore>>,
    monitor: Option<Arc<PerformanceMonitor>>,
    history: Option<Arc<dyn HistorySink>>,
}

impl OrchestratorBuilder {
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Required
    pub fn gateway(mut self, gateway: Arc<ProviderGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Defaults to an in-memory store
    pub fn cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache_store = Some(store);
        self
    }

    /// Share the monitor that also observes the gateway's calls
    pub fn monitor(mut self, monitor: Arc<PerformanceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Defaults to [`LoggingHistorySink`]
    pub fn history(mut self, history: Arc<dyn HistorySink>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let gateway = self
            .gateway
            .ok_or_else(|| OrchestratorError::configuration("A provider gateway is required"))?;
        for kind in [ProviderKind::Vision, ProviderKind::Generation] {
            if !gateway.has_provider(kind) {
                warn!(provider = %kind, "No provider registered; every request will degrade");
            }
        }

        let cache = match self.cache_store {
            Some(store) => CacheLayer::new(store, &config),
            None => CacheLayer::in_memory(&config),
        };
        let monitor = self
            .monitor
            .unwrap_or_else(|| Arc::new(PerformanceMonitor::new(&config)));
        let history = self
            .history
            .unwrap_or_else(|| Arc::new(LoggingHistorySink));

        Ok(Orchestrator {
            inner: Arc::new(Inner {
                quality: QualityFilter::from_config(&config),
                streaming: StreamingDelivery::new(config.stream.clone()),
                config,
                gateway,
                cache,
                monitor,
                history,
            }),
        })
    }
}
