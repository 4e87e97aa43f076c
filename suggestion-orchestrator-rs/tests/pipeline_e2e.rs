//! End-to-end pipeline tests against scripted in-memory providers

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use provider_sdk::config::MemoryConfigProvider;
use provider_sdk::{
    CircuitBreakerConfig, GeneratedSuggestion, GenerationProvider, GenerationRequest,
    GenerationResponse, ProviderGateway, ProviderKind, RetryPolicy, ServiceError, VisionAnalysis,
    VisionProvider, VisionRequest,
};
use suggestion_orchestrator::{
    CacheEntry, CacheError, CacheStore, Fingerprint, ImageRef, MonitorSignal, Optimization,
    Orchestrator, OrchestratorConfig, PerformanceMonitor, PipelinePhase, ResponseStatus,
    StreamEvent, StreamOptions, StreamStatus, SuggestionRequest, Tier,
};

const SUGGESTIONS: [(&str, f32); 3] = [
    ("That sunset hike photo looks amazing, where was it?", 0.9),
    ("You seem like someone who would enjoy a spontaneous adventure, true?", 0.6),
    ("Your dog has the best smile, what is the secret?", 0.8),
];

struct ScriptedVision {
    needs_more_input: bool,
    calls: AtomicUsize,
}

impl ScriptedVision {
    fn new() -> Self {
        Self {
            needs_more_input: false,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl VisionProvider for ScriptedVision {
    fn name(&self) -> &str {
        "scripted-vision"
    }

    async fn analyze(&self, _request: &VisionRequest) -> provider_sdk::Result<VisionAnalysis> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(VisionAnalysis {
            quality_score: 8.0,
            needs_more_input: self.needs_more_input,
            guidance: self
                .needs_more_input
                .then(|| "Capture the whole conversation".to_string()),
            ..VisionAnalysis::default()
        })
    }
}

#[derive(Clone, Copy)]
enum Step {
    Succeed,
    FailTransient,
    FailPermanent,
}

/// Plays `script` in order, then `fallback` forever
struct ScriptedGeneration {
    delay: Duration,
    calls: AtomicUsize,
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
}

impl ScriptedGeneration {
    fn new(delay: Duration) -> Self {
        Self::scripted(delay, Vec::new(), Step::Succeed)
    }

    fn scripted(delay: Duration, script: Vec<Step>, fallback: Step) -> Self {
        Self {
            delay,
            calls: AtomicUsize::new(0),
            script: Mutex::new(script.into()),
            fallback,
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationProvider for ScriptedGeneration {
    fn name(&self) -> &str {
        "scripted-generation"
    }

    async fn generate(
        &self,
        _request: &GenerationRequest,
    ) -> provider_sdk::Result<GenerationResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);
        tokio::time::sleep(self.delay).await;

        match step {
            Step::Succeed => Ok(GenerationResponse {
                suggestions: SUGGESTIONS
                    .iter()
                    .map(|(text, confidence)| GeneratedSuggestion {
                        text: text.to_string(),
                        confidence: *confidence,
                        reasoning: Some("scripted".to_string()),
                    })
                    .collect(),
                model_meta: Default::default(),
            }),
            Step::FailTransient => Err(ServiceError::service("upstream returned 503")),
            Step::FailPermanent => Err(ServiceError::validation("prompt rejected")),
        }
    }
}

/// A cache backend that is always down
struct BrokenStore;

#[async_trait]
impl CacheStore for BrokenStore {
    async fn get(&self, _fingerprint: &Fingerprint) -> Result<Option<Arc<CacheEntry>>, CacheError> {
        Err(CacheError::Unavailable("connection refused".to_string()))
    }

    async fn candidates(&self, _min_tier: Tier) -> Result<Vec<Arc<CacheEntry>>, CacheError> {
        Err(CacheError::Unavailable("connection refused".to_string()))
    }

    async fn put(&self, _entry: CacheEntry) -> Result<(), CacheError> {
        Err(CacheError::Unavailable("connection refused".to_string()))
    }

    async fn remove(&self, _fingerprint: &Fingerprint) -> Result<bool, CacheError> {
        Err(CacheError::Unavailable("connection refused".to_string()))
    }

    async fn len(&self) -> Result<usize, CacheError> {
        Err(CacheError::Unavailable("connection refused".to_string()))
    }
}

struct Harness {
    orchestrator: Orchestrator,
    vision: Arc<ScriptedVision>,
    generation: Arc<ScriptedGeneration>,
}

fn harness_with(
    config: OrchestratorConfig,
    vision: ScriptedVision,
    generation: ScriptedGeneration,
    cache_store: Option<Arc<dyn CacheStore>>,
) -> Harness {
    harness_retrying(config, vision, generation, cache_store, RetryPolicy::no_retry())
}

fn harness_retrying(
    config: OrchestratorConfig,
    vision: ScriptedVision,
    generation: ScriptedGeneration,
    cache_store: Option<Arc<dyn CacheStore>>,
    retry_policy: RetryPolicy,
) -> Harness {
    let vision = Arc::new(vision);
    let generation = Arc::new(generation);
    let monitor = Arc::new(PerformanceMonitor::new(&config));

    let gateway = ProviderGateway::builder()
        .vision(vision.clone())
        .generation(generation.clone())
        .retry_policy(retry_policy)
        .breaker(
            ProviderKind::Generation,
            CircuitBreakerConfig {
                failure_threshold: 2,
                cooldown: Duration::from_secs(30),
                max_cooldown: Duration::from_secs(600),
            },
        )
        .observer(monitor.clone())
        .build();

    let mut builder = Orchestrator::builder()
        .config(config)
        .gateway(Arc::new(gateway))
        .monitor(monitor);
    if let Some(store) = cache_store {
        builder = builder.cache_store(store);
    }

    Harness {
        orchestrator: builder.build().unwrap(),
        vision,
        generation,
    }
}

fn harness(generation: ScriptedGeneration) -> Harness {
    harness_with(OrchestratorConfig::default(), ScriptedVision::new(), generation, None)
}

fn request(image: &str) -> SuggestionRequest {
    SuggestionRequest::new(ImageRef::new(image, image.as_bytes().to_vec())).with_strategy(Tier::Fast)
}

fn chunk_confidences(events: &[StreamEvent]) -> Vec<f32> {
    events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::Chunk { suggestion, .. } => Some(suggestion.confidence),
            _ => None,
        })
        .collect()
}

fn progress_phases(events: &[StreamEvent]) -> Vec<PipelinePhase> {
    events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::Progress { phase, .. } => Some(*phase),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn concurrent_duplicates_generate_once() {
    let h = harness(ScriptedGeneration::new(Duration::from_millis(200)));

    let responses = join_all((0..10).map(|i| {
        h.orchestrator
            .submit(request("screenshot-1").with_correlation_id(format!("req-{}", i)))
    }))
    .await;

    assert_eq!(h.generation.calls(), 1);
    assert_eq!(h.vision.calls.load(Ordering::SeqCst), 1);

    let responses: Vec<_> = responses.into_iter().map(Result::unwrap).collect();
    let texts: Vec<Vec<String>> = responses
        .iter()
        .map(|r| r.suggestions.iter().map(|s| s.text.clone()).collect())
        .collect();
    assert!(texts.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(responses.iter().filter(|r| r.meta.deduplicated).count(), 9);
    assert!(responses.iter().all(|r| r.meta.status == ResponseStatus::Complete));
}

#[tokio::test(start_paused = true)]
async fn duplicate_fifty_ms_later_joins_the_first() {
    let h = harness(ScriptedGeneration::new(Duration::from_millis(200)));

    let first = {
        let orchestrator = h.orchestrator.clone();
        tokio::spawn(async move { orchestrator.submit(request("burst").with_correlation_id("a")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = h
        .orchestrator
        .submit(request("burst").with_correlation_id("b"))
        .await
        .unwrap();
    let first = first.await.unwrap().unwrap();

    assert_eq!(h.generation.calls(), 1);
    assert!(!first.meta.deduplicated);
    assert!(second.meta.deduplicated);
    assert_eq!(first.suggestions, second.suggestions);
    assert!(second.meta.latency_ms >= 100, "waiting counts toward latency");

    let third = h.orchestrator.submit(request("burst")).await.unwrap();
    assert!(third.meta.cache_hit);
    assert_eq!(h.generation.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn joining_a_cheaper_run_claims_again() {
    let h = harness(ScriptedGeneration::new(Duration::from_millis(200)));

    let fast = {
        let orchestrator = h.orchestrator.clone();
        tokio::spawn(async move { orchestrator.submit(request("upgrade").with_correlation_id("fast")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let comprehensive = h
        .orchestrator
        .submit(
            request("upgrade")
                .with_strategy(Tier::Comprehensive)
                .with_correlation_id("comprehensive"),
        )
        .await
        .unwrap();
    let fast = fast.await.unwrap().unwrap();

    assert_eq!(fast.meta.tier, Tier::Fast);
    assert_eq!(comprehensive.meta.status, ResponseStatus::Complete);
    assert_eq!(comprehensive.meta.tier, Tier::Comprehensive);
    assert!(!comprehensive.meta.deduplicated);
    assert_eq!(h.generation.calls(), 2);

    // Both tiers are cached now; a fast request takes the better one
    let again = h.orchestrator.submit(request("upgrade")).await.unwrap();
    assert!(again.meta.cache_hit);
    assert_eq!(h.generation.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn joining_a_richer_run_takes_its_answer() {
    let h = harness(ScriptedGeneration::new(Duration::from_millis(200)));

    let comprehensive = {
        let orchestrator = h.orchestrator.clone();
        tokio::spawn(async move {
            orchestrator
                .submit(request("downgrade").with_strategy(Tier::Comprehensive))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let fast = h.orchestrator.submit(request("downgrade")).await.unwrap();
    comprehensive.await.unwrap().unwrap();

    assert!(fast.meta.deduplicated);
    assert_eq!(fast.meta.tier, Tier::Comprehensive);
    assert_eq!(h.generation.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn always_answers_when_providers_fail() {
    let h = harness(ScriptedGeneration::scripted(
        Duration::from_millis(10),
        Vec::new(),
        Step::FailPermanent,
    ));

    let response = h
        .orchestrator
        .submit(request("img").with_strategy(Tier::Standard))
        .await
        .unwrap();

    assert_eq!(response.meta.status, ResponseStatus::Degraded);
    assert!(response.meta.degraded);
    assert_eq!(response.meta.requested_tier, Tier::Standard);
    assert_eq!(response.meta.tier, Tier::Fast);
    assert_eq!(response.suggestions.len(), 3);
    assert!(response.suggestions.iter().all(|s| s.fallback));
    // Selected tier, then one downgrade, permanent errors never retried
    assert_eq!(h.generation.calls(), 2);

    // Degraded answers are not cached
    assert!(!h.orchestrator.submit(request("img").with_strategy(Tier::Standard)).await.unwrap().meta.cache_hit);
}

#[tokio::test(start_paused = true)]
async fn failure_downgrades_tier_once() {
    let h = harness(ScriptedGeneration::scripted(
        Duration::from_millis(10),
        vec![Step::FailPermanent],
        Step::Succeed,
    ));

    let response = h
        .orchestrator
        .submit(request("img").with_strategy(Tier::Comprehensive))
        .await
        .unwrap();

    assert_eq!(response.meta.status, ResponseStatus::Complete);
    assert_eq!(response.meta.requested_tier, Tier::Comprehensive);
    assert_eq!(response.meta.tier, Tier::Standard);
    assert_eq!(h.generation.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn open_breaker_short_circuits_generation() {
    let h = harness(ScriptedGeneration::scripted(
        Duration::from_millis(10),
        Vec::new(),
        Step::FailTransient,
    ));

    let first = h.orchestrator.submit(request("one")).await.unwrap();
    assert_eq!(first.meta.status, ResponseStatus::Degraded);
    assert_eq!(h.generation.calls(), 2);

    let second = h.orchestrator.submit(request("two")).await.unwrap();
    assert_eq!(second.meta.status, ResponseStatus::Degraded);
    assert_eq!(h.generation.calls(), 2, "open breaker must not reach the provider");

    let health = h.orchestrator.health();
    assert_eq!(health.status, "degraded");
    assert_eq!(h.orchestrator.dashboard().providers[&ProviderKind::Generation].short_circuited, 2);
}

#[tokio::test(start_paused = true)]
async fn cached_tier_must_cover_requested_tier() {
    let h = harness(ScriptedGeneration::new(Duration::from_millis(10)));

    h.orchestrator.submit(request("img")).await.unwrap();
    let comprehensive = h
        .orchestrator
        .submit(request("img").with_strategy(Tier::Comprehensive))
        .await
        .unwrap();
    assert!(!comprehensive.meta.cache_hit);
    assert_eq!(comprehensive.meta.tier, Tier::Comprehensive);
    assert_eq!(h.generation.calls(), 2);

    let fast = h.orchestrator.submit(request("img")).await.unwrap();
    assert!(fast.meta.cache_hit);
    assert_eq!(fast.meta.tier, Tier::Comprehensive);
    assert_eq!(h.generation.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn similar_context_hits_semantically() {
    let h = harness(ScriptedGeneration::new(Duration::from_millis(10)));

    h.orchestrator
        .submit(request("a").with_context("she loves hiking mountains and strong coffee"))
        .await
        .unwrap();
    let response = h
        .orchestrator
        .submit(request("b").with_context("loves hiking mountains and strong coffee"))
        .await
        .unwrap();

    assert!(response.meta.cache_hit);
    assert!(matches!(
        response.meta.cache_match,
        Some(suggestion_orchestrator::CacheMatch::Semantic { .. })
    ));
    assert_eq!(h.generation.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn needs_more_input_streams_guidance_only() {
    let vision = ScriptedVision {
        needs_more_input: true,
        calls: AtomicUsize::new(0),
    };
    let h = harness_with(
        OrchestratorConfig::default(),
        vision,
        ScriptedGeneration::new(Duration::from_millis(10)),
        None,
    );

    let receiver = h
        .orchestrator
        .submit_streaming(request("blurry"), StreamOptions::default())
        .await
        .unwrap();
    let events = receiver.collect().await;

    assert!(chunk_confidences(&events).is_empty());
    match events.last() {
        Some(StreamEvent::Completed { meta }) => {
            assert_eq!(meta.status, ResponseStatus::NeedsMoreInput);
            assert_eq!(meta.guidance.as_deref(), Some("Capture the whole conversation"));
        }
        other => panic!("expected completion, got {:?}", other),
    }
    assert_eq!(h.generation.calls(), 0);
    assert!(!h.orchestrator.submit(request("blurry")).await.unwrap().meta.cache_hit);
}

#[tokio::test(start_paused = true)]
async fn stream_delivers_ranked_or_arrival_order() {
    let h = harness(ScriptedGeneration::new(Duration::from_millis(10)));

    let ranked = h
        .orchestrator
        .submit_streaming(request("ranked"), StreamOptions::default())
        .await
        .unwrap()
        .collect()
        .await;
    assert!(matches!(ranked.first(), Some(StreamEvent::Started { .. })));
    assert_eq!(chunk_confidences(&ranked), vec![0.9, 0.8, 0.6]);
    assert!(progress_phases(&ranked).contains(&PipelinePhase::SuggestionGeneration));
    assert!(matches!(ranked.last(), Some(StreamEvent::Completed { .. })));

    let arrival = h
        .orchestrator
        .submit_streaming(request("arrival"), StreamOptions::arrival_order())
        .await
        .unwrap()
        .collect()
        .await;
    // As the provider produced them
    assert_eq!(chunk_confidences(&arrival), vec![0.9, 0.6, 0.8]);
    assert_eq!(h.orchestrator.health().active_streams, 0);
}

#[tokio::test(start_paused = true)]
async fn cancelled_stream_still_populates_cache() {
    let h = harness(ScriptedGeneration::new(Duration::from_millis(500)));

    let mut receiver = h
        .orchestrator
        .submit_streaming(request("cancel-me"), StreamOptions::default())
        .await
        .unwrap();
    match receiver.next().await {
        Some(StreamEvent::Started { estimated_duration_ms, phases, .. }) => {
            assert_eq!(estimated_duration_ms, 5_600);
            assert_eq!(phases, PipelinePhase::ALL.to_vec());
        }
        other => panic!("expected start, got {:?}", other),
    }
    assert_eq!(h.orchestrator.health().active_streams, 1);

    receiver.cancel();
    assert_eq!(receiver.status(), StreamStatus::Cancelled);
    assert_eq!(h.orchestrator.health().active_streams, 0);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.generation.calls(), 1);

    let response = h.orchestrator.submit(request("cancel-me")).await.unwrap();
    assert!(response.meta.cache_hit);
    assert_eq!(h.generation.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn idle_stream_errors_but_generation_finishes() {
    let h = harness(ScriptedGeneration::new(Duration::from_secs(1)));

    let mut receiver = h
        .orchestrator
        .submit_streaming(
            request("slow"),
            StreamOptions {
                idle_timeout: Some(Duration::from_millis(500)),
                ..StreamOptions::default()
            },
        )
        .await
        .unwrap();

    assert!(matches!(receiver.next().await, Some(StreamEvent::Started { .. })));
    let ended = loop {
        match receiver.next().await {
            Some(StreamEvent::Progress { .. }) => continue,
            other => break other,
        }
    };
    match ended {
        Some(StreamEvent::Errored { reason }) => assert!(reason.contains("idle"), "{}", reason),
        other => panic!("expected idle error, got {:?}", other),
    }
    assert_eq!(receiver.status(), StreamStatus::Errored);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(h.orchestrator.submit(request("slow")).await.unwrap().meta.cache_hit);
}

#[tokio::test(start_paused = true)]
async fn hanging_provider_still_completes_the_stream() {
    let h = harness_retrying(
        OrchestratorConfig::default(),
        ScriptedVision::new(),
        ScriptedGeneration::new(Duration::from_secs(600)),
        None,
        RetryPolicy::default(),
    );

    let receiver = h
        .orchestrator
        .submit_streaming(request("hang").with_strategy(Tier::Comprehensive), StreamOptions::default())
        .await
        .unwrap();
    let started = tokio::time::Instant::now();
    let events = receiver.collect().await;

    assert!(
        !events.iter().any(|e| matches!(e, StreamEvent::Errored { .. })),
        "{:?}",
        events
    );
    match events.last() {
        Some(StreamEvent::Completed { meta }) => {
            assert!(meta.degraded);
            assert_eq!(meta.requested_tier, Tier::Comprehensive);
            assert_eq!(meta.tier, Tier::Standard);
        }
        other => panic!("expected completion, got {:?}", other),
    }
    assert_eq!(chunk_confidences(&events).len(), 3);
    assert!(started.elapsed() <= Duration::from_secs(41));
}

#[tokio::test(start_paused = true)]
async fn streamed_request_survives_a_tier_downgrade() {
    let h = harness(ScriptedGeneration::scripted(
        Duration::from_millis(10),
        vec![Step::FailPermanent],
        Step::Succeed,
    ));

    let events = h
        .orchestrator
        .submit_streaming(request("retry").with_strategy(Tier::Comprehensive), StreamOptions::default())
        .await
        .unwrap()
        .collect()
        .await;

    // Phases in quick succession coalesce; each attempt waits on generation
    let generating = progress_phases(&events)
        .into_iter()
        .filter(|phase| *phase == PipelinePhase::SuggestionGeneration)
        .count();
    assert_eq!(generating, 2);
    assert!(!chunk_confidences(&events).is_empty());
    match events.last() {
        Some(StreamEvent::Completed { meta }) => {
            assert_eq!(meta.status, ResponseStatus::Complete);
            assert_eq!(meta.requested_tier, Tier::Comprehensive);
            assert_eq!(meta.tier, Tier::Standard);
        }
        other => panic!("expected completion, got {:?}", other),
    }
    assert_eq!(h.generation.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn entries_expire_after_their_ttl() {
    let h = harness(ScriptedGeneration::new(Duration::from_millis(10)));

    h.orchestrator.submit(request("ttl")).await.unwrap();
    tokio::time::advance(Duration::from_secs(30 * 60)).await;
    assert!(h.orchestrator.submit(request("ttl")).await.unwrap().meta.cache_hit);

    tokio::time::advance(Duration::from_secs(31 * 60)).await;
    assert!(!h.orchestrator.submit(request("ttl")).await.unwrap().meta.cache_hit);
    assert_eq!(h.generation.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn slow_tier_with_cold_cache_extends_ttl() {
    let mut provider = MemoryConfigProvider::new();
    provider.set("tier_fast_latency_warning", "20ms");
    provider.set("tier_fast_latency_target", "50ms");
    provider.set("tier_fast_latency_critical", "500ms");
    provider.set("monitor_min_samples", "3");
    let config = OrchestratorConfig::from_provider(&provider).unwrap();

    let h = harness_with(
        config,
        ScriptedVision::new(),
        ScriptedGeneration::new(Duration::from_millis(100)),
        None,
    );
    let mut signals = h.orchestrator.monitor().subscribe();

    for i in 0..3 {
        h.orchestrator
            .submit(request(&format!("distinct-{}", i)))
            .await
            .unwrap();
    }

    let mut optimizations = Vec::new();
    while let Ok(signal) = signals.try_recv() {
        if let MonitorSignal::Optimization(optimization) = signal {
            optimizations.push(optimization);
        }
    }
    assert_eq!(optimizations, vec![Optimization::ExtendCacheTtl { multiplier: 1.5 }]);
    assert_eq!(h.orchestrator.monitor().tuning().ttl_multiplier, 1.5);
    assert!(!h.orchestrator.monitor().alerts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unavailable_cache_is_bypassed() {
    let h = harness_with(
        OrchestratorConfig::default(),
        ScriptedVision::new(),
        ScriptedGeneration::new(Duration::from_millis(10)),
        Some(Arc::new(BrokenStore)),
    );

    let first = h.orchestrator.submit(request("img")).await.unwrap();
    let second = h.orchestrator.submit(request("img")).await.unwrap();

    assert_eq!(first.meta.status, ResponseStatus::Complete);
    assert!(!second.meta.cache_hit);
    assert_eq!(h.generation.calls(), 2);
    assert!(h.orchestrator.health().cache.errors >= 3);
}

#[tokio::test]
async fn invalid_request_is_the_only_error() {
    let h = harness(ScriptedGeneration::new(Duration::from_millis(1)));

    let too_long = request("img").with_context("x".repeat(1_001));
    assert!(h.orchestrator.submit(too_long).await.unwrap_err().is_invalid_request());

    let err = h
        .orchestrator
        .submit_streaming(request(""), StreamOptions::default())
        .await
        .err()
        .unwrap();
    assert!(err.is_invalid_request());
    assert_eq!(h.generation.calls(), 0);
}
