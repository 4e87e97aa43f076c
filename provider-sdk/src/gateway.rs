//! Provider gateway
//!
//! One uniform entry point for every provider call. Each provider kind has
//! its own [`Resilience`] (breaker plus retry); every attempt is reported to
//! the registered [`CallObserver`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{ConfigProvider, ProviderEndpointConfig};
use crate::core::{
    CallObserver, CallOutcome, GenerationProvider, GenerationRequest, GenerationResponse,
    ProviderCallRecord, ProviderKind, ProviderRequest, ProviderResponse, SpeechAudio,
    SpeechProvider, SpeechRequest, VisionAnalysis, VisionProvider, VisionRequest,
};
use crate::error::{Result, ServiceError};
use crate::resilience::{
    AttemptReport, BreakerSnapshot, CircuitBreakerConfig, Resilience, RetryPolicy,
};
use crate::services::{GenerationClient, SpeechClient, VisionClient};

/// Resilient, observable access to the external providers
pub struct ProviderGateway {
    vision: Option<Arc<dyn VisionProvider>>,
    generation: Option<Arc<dyn GenerationProvider>>,
    speech: Option<Arc<dyn SpeechProvider>>,
    resilience: BTreeMap<ProviderKind, Resilience>,
    observer: Option<Arc<dyn CallObserver>>,
}

impl fmt::Debug for ProviderGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderGateway")
            .field("vision", &self.vision.as_ref().map(|p| p.name().to_string()))
            .field("generation", &self.generation.as_ref().map(|p| p.name().to_string()))
            .field("speech", &self.speech.as_ref().map(|p| p.name().to_string()))
            .field("resilience", &self.resilience)
            .finish()
    }
}

impl ProviderGateway {
    /// Start building a gateway
    pub fn builder() -> ProviderGatewayBuilder {
        ProviderGatewayBuilder::default()
    }

    /// Call a provider under its breaker, the per-attempt timeout and retry
    pub async fn call(&self, request: ProviderRequest, timeout: Duration) -> Result<ProviderResponse> {
        let kind = request.kind();
        let resilience = self.resilience(kind)?;
        let request = &request;

        let result = resilience
            .execute(
                timeout,
                move |_| self.dispatch(request),
                |report| self.report(kind, report),
            )
            .await;

        if let Err(ref err) = result {
            log::debug!("{} call failed ({}): {}", kind, err.kind(), err);
        }
        result
    }

    /// Analyze an image
    pub async fn analyze(&self, request: VisionRequest, timeout: Duration) -> Result<VisionAnalysis> {
        match self.call(ProviderRequest::Vision(request), timeout).await? {
            ProviderResponse::Vision(analysis) => Ok(analysis),
            other => Err(mismatch(ProviderKind::Vision, &other)),
        }
    }

    /// Generate suggestions
    pub async fn generate(
        &self,
        request: GenerationRequest,
        timeout: Duration,
    ) -> Result<GenerationResponse> {
        match self.call(ProviderRequest::Generation(request), timeout).await? {
            ProviderResponse::Generation(response) => Ok(response),
            other => Err(mismatch(ProviderKind::Generation, &other)),
        }
    }

    /// Synthesize speech
    pub async fn synthesize(&self, request: SpeechRequest, timeout: Duration) -> Result<SpeechAudio> {
        match self.call(ProviderRequest::Speech(request), timeout).await? {
            ProviderResponse::Speech(audio) => Ok(audio),
            other => Err(mismatch(ProviderKind::Speech, &other)),
        }
    }

    /// Current state of every provider's breaker
    pub fn breaker_snapshots(&self) -> BTreeMap<ProviderKind, BreakerSnapshot> {
        self.resilience
            .iter()
            .map(|(kind, resilience)| (*kind, resilience.circuit_breaker().snapshot()))
            .collect()
    }

    /// Whether a provider of this kind is registered
    pub fn has_provider(&self, kind: ProviderKind) -> bool {
        match kind {
            ProviderKind::Vision => self.vision.is_some(),
            ProviderKind::Generation => self.generation.is_some(),
            ProviderKind::Speech => self.speech.is_some(),
        }
    }

    fn resilience(&self, kind: ProviderKind) -> Result<&Resilience> {
        self.resilience
            .get(&kind)
            .ok_or_else(|| ServiceError::configuration(format!("No {} provider configured", kind)))
    }

    async fn dispatch(&self, request: &ProviderRequest) -> Result<ProviderResponse> {
        match request {
            ProviderRequest::Vision(request) => {
                let provider = self.vision.as_ref().ok_or_else(|| missing(ProviderKind::Vision))?;
                provider.analyze(request).await.map(ProviderResponse::Vision)
            }
            ProviderRequest::Generation(request) => {
                let provider = self
                    .generation
                    .as_ref()
                    .ok_or_else(|| missing(ProviderKind::Generation))?;
                provider.generate(request).await.map(ProviderResponse::Generation)
            }
            ProviderRequest::Speech(request) => {
                let provider = self.speech.as_ref().ok_or_else(|| missing(ProviderKind::Speech))?;
                provider.synthesize(request).await.map(ProviderResponse::Speech)
            }
        }
    }

    fn report(&self, provider: ProviderKind, report: AttemptReport<'_>) {
        let Some(observer) = &self.observer else {
            return;
        };

        let outcome = match report.error {
            None => CallOutcome::Success,
            Some(ServiceError::CircuitBroken(_)) => CallOutcome::ShortCircuited,
            Some(_) => CallOutcome::Failure,
        };

        observer.record_call(&ProviderCallRecord {
            provider,
            attempt: report.attempt,
            latency: report.latency,
            outcome,
            error_class: report.error.map(ServiceError::kind),
            trial: report.trial,
        });
    }
}

fn missing(kind: ProviderKind) -> ServiceError {
    ServiceError::configuration(format!("No {} provider configured", kind))
}

fn mismatch(expected: ProviderKind, response: &ProviderResponse) -> ServiceError {
    ServiceError::internal(format!(
        "Expected a {} response, got {}",
        expected,
        response.kind()
    ))
}

/// Builder for [`ProviderGateway`]
#[derive(Default)]
pub struct ProviderGatewayBuilder {
    vision: Option<Arc<dyn VisionProvider>>,
    generation: Option<Arc<dyn GenerationProvider>>,
    speech: Option<Arc<dyn SpeechProvider>>,
    retry_policy: Option<RetryPolicy>,
    breakers: BTreeMap<ProviderKind, CircuitBreakerConfig>,
    observer: Option<Arc<dyn CallObserver>>,
}

impl ProviderGatewayBuilder {
    /// Register the vision provider
    pub fn vision(mut self, provider: Arc<dyn VisionProvider>) -> Self {
        self.vision = Some(provider);
        self
    }

    /// Register the generation provider
    pub fn generation(mut self, provider: Arc<dyn GenerationProvider>) -> Self {
        self.generation = Some(provider);
        self
    }

    /// Register the speech provider
    pub fn speech(mut self, provider: Arc<dyn SpeechProvider>) -> Self {
        self.speech = Some(provider);
        self
    }

    /// Retry policy shared by all providers
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Override the breaker settings of one provider
    pub fn breaker(mut self, kind: ProviderKind, config: CircuitBreakerConfig) -> Self {
        self.breakers.insert(kind, config);
        self
    }

    /// Receive a record for every attempt
    pub fn observer(mut self, observer: Arc<dyn CallObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Register HTTP clients for every provider with a usable configuration.
    ///
    /// Providers whose configuration is missing or invalid are skipped with a
    /// warning; calls to them fail as rejected.
    pub fn http_providers<P: ConfigProvider + ?Sized>(mut self, provider: &P) -> Self {
        for kind in ProviderKind::ALL {
            let config = match ProviderEndpointConfig::from_provider(kind, provider) {
                Ok(config) => config,
                Err(err) => {
                    log::warn!("Skipping {} provider: {}", kind, err);
                    continue;
                }
            };
            self.breakers.insert(kind, config.breaker_config());

            let registered = match kind {
                ProviderKind::Vision => VisionClient::new_with_config(config)
                    .map(|client| self.vision = Some(Arc::new(client))),
                ProviderKind::Generation => GenerationClient::new_with_config(config)
                    .map(|client| self.generation = Some(Arc::new(client))),
                ProviderKind::Speech => SpeechClient::new_with_config(config)
                    .map(|client| self.speech = Some(Arc::new(client))),
            };
            if let Err(err) = registered {
                log::warn!("Failed to build {} client: {}", kind, err);
            }
        }
        self
    }

    /// Build the gateway
    pub fn build(self) -> ProviderGateway {
        let retry_policy = self.retry_policy.unwrap_or_default();
        let resilience = ProviderKind::ALL
            .into_iter()
            .map(|kind| {
                let breaker = self
                    .breakers
                    .get(&kind)
                    .cloned()
                    .unwrap_or_else(|| kind.default_breaker_config());
                (kind, Resilience::new(kind.as_str(), retry_policy.clone(), breaker))
            })
            .collect();

        ProviderGateway {
            vision: self.vision,
            generation: self.generation,
            speech: self.speech,
            resilience,
            observer: self.observer,
        }
    }
}
