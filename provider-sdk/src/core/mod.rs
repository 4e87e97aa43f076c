//! Core abstractions for the provider SDK
//!
//! This module provides the fundamental interfaces every provider client
//! implements or uses:
//!
//! - `ProviderKind`: which external capability a call targets
//! - `VisionProvider`, `GenerationProvider`, `SpeechProvider`: the provider seams
//! - `ProviderRequest` / `ProviderResponse`: tagged variants for the uniform gateway call
//! - `CallObserver`: receives one `ProviderCallRecord` per attempt
//! - `ClientBuilder`: builder for the underlying HTTP clients

pub mod builder;
pub use builder::ClientBuilder;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorKind, Result, ServiceError};
use crate::resilience::CircuitBreakerConfig;

/// The external capabilities the gateway fronts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Image analysis
    Vision,
    /// Text generation
    Generation,
    /// Speech synthesis
    Speech,
}

impl ProviderKind {
    /// Every provider kind, in pipeline order
    pub const ALL: [ProviderKind; 3] = [
        ProviderKind::Vision,
        ProviderKind::Generation,
        ProviderKind::Speech,
    ];

    /// Stable lowercase name, also used as the configuration key prefix
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Vision => "vision",
            ProviderKind::Generation => "generation",
            ProviderKind::Speech => "speech",
        }
    }

    /// Breaker settings used in production for this provider
    pub fn default_breaker_config(self) -> CircuitBreakerConfig {
        let (failure_threshold, cooldown_secs) = match self {
            ProviderKind::Vision => (5, 90),
            ProviderKind::Generation => (5, 30),
            ProviderKind::Speech => (3, 120),
        };

        CircuitBreakerConfig {
            failure_threshold,
            cooldown: Duration::from_secs(cooldown_secs),
            max_cooldown: Duration::from_secs(600),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a screenshot shows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    /// A dating profile
    #[default]
    Profile,
    /// An ongoing conversation
    Chat,
}

/// Request for image analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionRequest {
    /// Caller supplied image identifier
    pub image_id: String,

    /// Raw image bytes; sent base64 encoded
    #[serde(skip)]
    pub image: Vec<u8>,

    /// What kind of suggestion the analysis feeds
    pub suggestion_type: String,

    /// Free text context from the user
    pub context: String,
}

/// Result of image analysis
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VisionAnalysis {
    /// Details the model extracted from the image
    #[serde(default)]
    pub extracted_details: BTreeMap<String, Value>,

    /// Image quality on a 0 to 10 scale
    #[serde(default)]
    pub quality_score: f32,

    /// The image lacks information; the user should supply more
    #[serde(default)]
    pub needs_more_input: bool,

    /// Whether the screenshot is a profile or a conversation
    #[serde(default)]
    pub content_type: ContentType,

    /// Message to show the user when more input is needed
    #[serde(default)]
    pub guidance: Option<String>,
}

impl VisionAnalysis {
    /// Reject analyses that violate the documented ranges
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=10.0).contains(&self.quality_score) || self.quality_score.is_nan() {
            return Err(ServiceError::parsing(format!(
                "Vision quality score out of range: {}",
                self.quality_score
            )));
        }
        Ok(())
    }
}

/// Request for suggestion generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Details produced by the vision step
    pub extracted_details: BTreeMap<String, Value>,

    /// Requested tone
    pub tone: String,

    /// Requested suggestion type
    pub suggestion_type: String,

    /// How many suggestions to produce
    pub count: u32,

    /// Free text context from the user
    pub context: String,
}

/// One generated suggestion, before quality scoring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedSuggestion {
    pub text: String,

    #[serde(default)]
    pub confidence: f32,

    #[serde(default)]
    pub reasoning: Option<String>,
}

/// Model bookkeeping returned with a generation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelMeta {
    pub model: String,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
}

/// Result of suggestion generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub suggestions: Vec<GeneratedSuggestion>,

    #[serde(default)]
    pub model_meta: ModelMeta,
}

/// Voice tuning for speech synthesis, each value in `0.0..=1.0`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoiceSettings {
    pub stability: f32,
    pub similarity_boost: f32,
    pub style: f32,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            stability: 0.5,
            similarity_boost: 0.75,
            style: 0.0,
        }
    }
}

/// Request for speech synthesis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechRequest {
    /// Text to synthesize, 1 to 1000 characters
    pub text: String,

    /// Voice to use; the client's configured voice when absent
    pub voice_id: Option<String>,

    #[serde(default)]
    pub voice_settings: VoiceSettings,
}

impl SpeechRequest {
    /// Maximum number of characters accepted for synthesis
    pub const MAX_TEXT_CHARS: usize = 1000;

    /// Check the request before it is sent anywhere
    pub fn validate(&self) -> Result<()> {
        let chars = self.text.trim().chars().count();
        if chars == 0 {
            return Err(ServiceError::validation("Speech text must not be empty"));
        }
        if chars > Self::MAX_TEXT_CHARS {
            return Err(ServiceError::validation(format!(
                "Speech text is {} characters, limit is {}",
                chars,
                Self::MAX_TEXT_CHARS
            )));
        }

        let settings = self.voice_settings;
        for (name, value) in [
            ("stability", settings.stability),
            ("similarity_boost", settings.similarity_boost),
            ("style", settings.style),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ServiceError::validation(format!(
                    "Voice setting {} must be within 0..1, got {}",
                    name, value
                )));
            }
        }

        Ok(())
    }
}

/// Synthesized audio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechAudio {
    pub audio: Vec<u8>,
    pub content_type: String,
}

impl SpeechAudio {
    /// Size of the audio payload in bytes
    pub fn size(&self) -> usize {
        self.audio.len()
    }
}

/// A request for any provider, dispatched by the gateway
#[derive(Debug, Clone)]
pub enum ProviderRequest {
    Vision(VisionRequest),
    Generation(GenerationRequest),
    Speech(SpeechRequest),
}

impl ProviderRequest {
    /// The provider this request targets
    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderRequest::Vision(_) => ProviderKind::Vision,
            ProviderRequest::Generation(_) => ProviderKind::Generation,
            ProviderRequest::Speech(_) => ProviderKind::Speech,
        }
    }
}

/// The response matching a [`ProviderRequest`]
#[derive(Debug, Clone)]
pub enum ProviderResponse {
    Vision(VisionAnalysis),
    Generation(GenerationResponse),
    Speech(SpeechAudio),
}

impl ProviderResponse {
    /// The provider that produced this response
    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderResponse::Vision(_) => ProviderKind::Vision,
            ProviderResponse::Generation(_) => ProviderKind::Generation,
            ProviderResponse::Speech(_) => ProviderKind::Speech,
        }
    }
}

/// Image analysis provider
#[async_trait]
pub trait VisionProvider: Send + Sync {
    /// The provider name used in logs
    fn name(&self) -> &str;

    /// Analyze an image
    async fn analyze(&self, request: &VisionRequest) -> Result<VisionAnalysis>;
}

/// Text generation provider
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// The provider name used in logs
    fn name(&self) -> &str;

    /// Generate suggestions
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse>;
}

/// Speech synthesis provider
#[async_trait]
pub trait SpeechProvider: Send + Sync {
    /// The provider name used in logs
    fn name(&self) -> &str;

    /// Synthesize speech
    async fn synthesize(&self, request: &SpeechRequest) -> Result<SpeechAudio>;
}

/// How a single provider attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    /// The provider answered successfully
    Success,
    /// The provider was called and the call failed
    Failure,
    /// The breaker rejected the attempt; no call was made
    ShortCircuited,
}

/// One provider attempt, as reported to the [`CallObserver`]
#[derive(Debug, Clone, Serialize)]
pub struct ProviderCallRecord {
    pub provider: ProviderKind,
    pub attempt: u32,
    pub latency: Duration,
    pub outcome: CallOutcome,
    pub error_class: Option<ErrorKind>,
    pub trial: bool,
}

/// Receives every provider attempt the gateway makes
#[cfg_attr(test, mockall::automock)]
pub trait CallObserver: Send + Sync {
    /// Called once per attempt, fast-fails included
    fn record_call(&self, record: &ProviderCallRecord);
}
