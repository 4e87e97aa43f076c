//! Request, suggestion and response models

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use provider_sdk::GeneratedSuggestion;
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

/// Longest accepted context, in characters
pub const MAX_CONTEXT_CHARS: usize = 1000;
/// Longest accepted image identifier, in characters
pub const MAX_IMAGE_ID_CHARS: usize = 100;
/// Largest accepted image payload
pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;
/// Longest accepted preference key
pub const MAX_PREFERENCE_KEY_CHARS: usize = 64;
/// Most preferences a request may carry
pub const MAX_PREFERENCES: usize = 32;

/// Voice of the generated suggestions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    #[default]
    Playful,
    Witty,
    Romantic,
    Casual,
    Bold,
}

impl Tone {
    pub const ALL: [Tone; 5] = [Tone::Playful, Tone::Witty, Tone::Romantic, Tone::Casual, Tone::Bold];

    pub fn as_str(self) -> &'static str {
        match self {
            Tone::Playful => "playful",
            Tone::Witty => "witty",
            Tone::Romantic => "romantic",
            Tone::Casual => "casual",
            Tone::Bold => "bold",
        }
    }
}

/// Where in a conversation the suggestion will be used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestionType {
    /// First message to a profile
    #[default]
    Opener,
    /// Reply to the last message
    Response,
    /// Keep a stalled conversation going
    Continuation,
}

impl SuggestionType {
    pub fn as_str(self) -> &'static str {
        match self {
            SuggestionType::Opener => "opener",
            SuggestionType::Response => "response",
            SuggestionType::Continuation => "continuation",
        }
    }
}

/// Quality and cost level of a pipeline run, cheapest first
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Fast,
    #[default]
    Standard,
    Comprehensive,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Fast, Tier::Standard, Tier::Comprehensive];

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Fast => "fast",
            Tier::Standard => "standard",
            Tier::Comprehensive => "comprehensive",
        }
    }

    /// The next cheaper tier; `Fast` stays `Fast`
    pub fn downgrade(self) -> Tier {
        match self {
            Tier::Comprehensive => Tier::Standard,
            Tier::Standard | Tier::Fast => Tier::Fast,
        }
    }
}

/// Stage of a pipeline run, as reported to streaming clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    ImageAnalysis,
    ContextProcessing,
    SuggestionGeneration,
    QualityValidation,
}

impl PipelinePhase {
    pub const ALL: [PipelinePhase; 4] = [
        PipelinePhase::ImageAnalysis,
        PipelinePhase::ContextProcessing,
        PipelinePhase::SuggestionGeneration,
        PipelinePhase::QualityValidation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PipelinePhase::ImageAnalysis => "image_analysis",
            PipelinePhase::ContextProcessing => "context_processing",
            PipelinePhase::SuggestionGeneration => "suggestion_generation",
            PipelinePhase::QualityValidation => "quality_validation",
        }
    }

    /// Percent complete while this phase runs, `[start, end)`
    pub fn progress_range(self) -> (u8, u8) {
        match self {
            PipelinePhase::ImageAnalysis => (0, 30),
            PipelinePhase::ContextProcessing => (30, 50),
            PipelinePhase::SuggestionGeneration => (50, 80),
            PipelinePhase::QualityValidation => (80, 100),
        }
    }
}

impl fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

macro_rules! display_and_parse {
    ($ty:ident, $what:literal, [$($variant:ident),+]) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = OrchestratorError;

            fn from_str(s: &str) -> Result<Self> {
                let wanted = s.trim().to_lowercase();
                $(
                    if wanted == $ty::$variant.as_str() {
                        return Ok($ty::$variant);
                    }
                )+
                Err(OrchestratorError::invalid_request(format!(
                    "Unknown {}: {}",
                    $what, s
                )))
            }
        }
    };
}

display_and_parse!(Tone, "tone", [Playful, Witty, Romantic, Casual, Bold]);
display_and_parse!(SuggestionType, "suggestion type", [Opener, Response, Continuation]);
display_and_parse!(Tier, "tier", [Fast, Standard, Comprehensive]);

/// The screenshot a request is about
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ImageRef {
    /// Caller supplied identifier
    pub id: String,

    /// Raw image bytes; may be empty when only the id is known
    #[serde(skip)]
    pub bytes: Arc<Vec<u8>>,
}

impl ImageRef {
    pub fn new(id: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            bytes: Arc::new(bytes),
        }
    }

    /// An image known only by its identifier
    pub fn id_only(id: impl Into<String>) -> Self {
        Self::new(id, Vec::new())
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

impl fmt::Debug for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageRef")
            .field("id", &self.id)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

/// A normalized request handed over by the ingress layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestionRequest {
    pub correlation_id: String,
    pub image: ImageRef,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub suggestion_type: SuggestionType,
    #[serde(default)]
    pub tone: Tone,
    #[serde(default)]
    pub user_preferences: BTreeMap<String, String>,
    /// Explicit tier requested by the caller
    #[serde(default)]
    pub strategy_hint: Option<Tier>,
    /// Keyboard extensions and other clients that cannot wait long
    #[serde(default)]
    pub low_latency_client: bool,
}

impl SuggestionRequest {
    /// Request for an image with default tone and type and a fresh correlation id
    pub fn new(image: ImageRef) -> Self {
        Self {
            correlation_id: provider_sdk::util::generate_request_id(),
            image,
            context: String::new(),
            suggestion_type: SuggestionType::default(),
            tone: Tone::default(),
            user_preferences: BTreeMap::new(),
            strategy_hint: None,
            low_latency_client: false,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = id.into();
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn with_tone(mut self, tone: Tone) -> Self {
        self.tone = tone;
        self
    }

    pub fn with_suggestion_type(mut self, suggestion_type: SuggestionType) -> Self {
        self.suggestion_type = suggestion_type;
        self
    }

    pub fn with_preference(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_preferences.insert(key.into(), value.into());
        self
    }

    pub fn with_strategy(mut self, tier: Tier) -> Self {
        self.strategy_hint = Some(tier);
        self
    }

    pub fn low_latency(mut self, low_latency: bool) -> Self {
        self.low_latency_client = low_latency;
        self
    }

    /// Reject requests that can never produce a useful answer
    pub fn validate(&self) -> Result<()> {
        let id_chars = self.image.id.trim().chars().count();
        if id_chars == 0 {
            return Err(OrchestratorError::invalid_request("Image id must not be empty"));
        }
        if id_chars > MAX_IMAGE_ID_CHARS {
            return Err(OrchestratorError::invalid_request(format!(
                "Image id is {} characters, limit is {}",
                id_chars, MAX_IMAGE_ID_CHARS
            )));
        }
        if self.image.size() > MAX_IMAGE_BYTES {
            return Err(OrchestratorError::invalid_request(format!(
                "Image is {} bytes, limit is {}",
                self.image.size(),
                MAX_IMAGE_BYTES
            )));
        }

        let context_chars = self.context.chars().count();
        if context_chars > MAX_CONTEXT_CHARS {
            return Err(OrchestratorError::invalid_request(format!(
                "Context is {} characters, limit is {}",
                context_chars, MAX_CONTEXT_CHARS
            )));
        }

        if self.user_preferences.len() > MAX_PREFERENCES {
            return Err(OrchestratorError::invalid_request(format!(
                "{} preferences supplied, limit is {}",
                self.user_preferences.len(),
                MAX_PREFERENCES
            )));
        }
        for key in self.user_preferences.keys() {
            let chars = key.chars().count();
            if chars == 0 || chars > MAX_PREFERENCE_KEY_CHARS {
                return Err(OrchestratorError::invalid_request(format!(
                    "Preference key must be 1 to {} characters: {:?}",
                    MAX_PREFERENCE_KEY_CHARS, key
                )));
            }
        }

        Ok(())
    }
}

/// Sub-scores and composite produced by quality assurance, each in `0.0..=1.0`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityScores {
    pub overall: f32,
    pub confidence: f32,
    pub sentiment: f32,
    pub creativity: f32,
    pub tone_match: f32,
    pub relevance: f32,
    pub safety: f32,
}

/// One suggestion as returned to the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub id: String,
    pub text: String,
    pub confidence: f32,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub quality: QualityScores,
    #[serde(default)]
    pub rejected: bool,
    #[serde(default)]
    pub rejection_reason: Option<String>,
    /// Canned text produced without a provider
    #[serde(default)]
    pub fallback: bool,
}

impl Suggestion {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            confidence: confidence.clamp(0.0, 1.0),
            reasoning: None,
            quality: QualityScores::default(),
            rejected: false,
            rejection_reason: None,
            fallback: false,
        }
    }

    pub(crate) fn reject(&mut self, reason: impl Into<String>) {
        self.rejected = true;
        self.rejection_reason = Some(reason.into());
    }
}

impl From<GeneratedSuggestion> for Suggestion {
    fn from(generated: GeneratedSuggestion) -> Self {
        Self {
            reasoning: generated.reasoning,
            ..Suggestion::new(generated.text.trim(), generated.confidence)
        }
    }
}

/// How a response was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    /// Suggestions generated and quality checked
    Complete,
    /// The image lacked information; see `guidance`
    NeedsMoreInput,
    /// Providers failed; emergency suggestions were returned
    Degraded,
}

impl ResponseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseStatus::Complete => "complete",
            ResponseStatus::NeedsMoreInput => "needs_more_input",
            ResponseStatus::Degraded => "degraded",
        }
    }
}

/// Which cache lookup produced a hit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum CacheMatch {
    Exact,
    Semantic { similarity: f32 },
}

/// Result of one pipeline execution, shared between the owner and its waiters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineOutput {
    pub status: ResponseStatus,
    /// Tier that actually produced the suggestions
    pub tier: Tier,
    /// Tier the pipeline run was started for
    pub requested_tier: Tier,
    /// Suggestions that passed, in generation order
    pub suggestions: Vec<Suggestion>,
    /// Suggestions quality assurance rejected, with reasons
    pub rejected: Vec<Suggestion>,
    pub guidance: Option<String>,
}

/// Bookkeeping returned with every response
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseMeta {
    pub correlation_id: String,
    /// Tier that produced the suggestions
    pub tier: Tier,
    /// Tier chosen when the request was accepted
    pub requested_tier: Tier,
    pub status: ResponseStatus,
    pub cache_hit: bool,
    pub cache_match: Option<CacheMatch>,
    pub degraded: bool,
    /// The result was produced by another request's pipeline run
    pub deduplicated: bool,
    /// Wall time from acceptance to answer, waiting for an owner included
    pub latency_ms: u64,
    pub rejected_count: usize,
    pub guidance: Option<String>,
}

/// The answer to a non-streaming request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuggestionResponse {
    pub suggestions: Vec<Suggestion>,
    pub meta: ResponseMeta,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_are_ordered_by_cost() {
        assert!(Tier::Fast < Tier::Standard);
        assert!(Tier::Standard < Tier::Comprehensive);
        assert_eq!(Tier::Comprehensive.downgrade(), Tier::Standard);
        assert_eq!(Tier::Standard.downgrade(), Tier::Fast);
        assert_eq!(Tier::Fast.downgrade(), Tier::Fast);
    }

    #[test]
    fn phases_cover_the_whole_run() {
        let mut expected_start = 0;
        for phase in PipelinePhase::ALL {
            let (start, end) = phase.progress_range();
            assert_eq!(start, expected_start, "{} starts where the last phase ended", phase);
            expected_start = end;
        }
        assert_eq!(expected_start, 100);
    }

    #[test]
    fn enums_parse_case_insensitively() {
        assert_eq!("Playful".parse::<Tone>().unwrap(), Tone::Playful);
        assert_eq!(" bold ".parse::<Tone>().unwrap(), Tone::Bold);
        assert_eq!("continuation".parse::<SuggestionType>().unwrap(), SuggestionType::Continuation);
        assert_eq!("COMPREHENSIVE".parse::<Tier>().unwrap(), Tier::Comprehensive);
        assert!("sarcastic".parse::<Tone>().unwrap_err().is_invalid_request());
    }

    #[test]
    fn validation_limits() {
        let ok = SuggestionRequest::new(ImageRef::id_only("img-1")).with_context("hi");
        assert!(ok.validate().is_ok());

        let empty_id = SuggestionRequest::new(ImageRef::id_only("  "));
        assert!(empty_id.validate().is_err());

        let long_id = SuggestionRequest::new(ImageRef::id_only("x".repeat(MAX_IMAGE_ID_CHARS + 1)));
        assert!(long_id.validate().is_err());

        let at_limit = SuggestionRequest::new(ImageRef::id_only("img"))
            .with_context("é".repeat(MAX_CONTEXT_CHARS));
        assert!(at_limit.validate().is_ok());

        let long_context = SuggestionRequest::new(ImageRef::id_only("img"))
            .with_context("a".repeat(MAX_CONTEXT_CHARS + 1));
        assert!(long_context.validate().is_err());

        let bad_key = SuggestionRequest::new(ImageRef::id_only("img"))
            .with_preference("k".repeat(MAX_PREFERENCE_KEY_CHARS + 1), "v");
        assert!(bad_key.validate().is_err());

        let mut many = SuggestionRequest::new(ImageRef::id_only("img"));
        for i in 0..=MAX_PREFERENCES {
            many = many.with_preference(format!("key{}", i), "v");
        }
        assert!(many.validate().is_err());
    }

    #[test]
    fn generated_suggestion_is_trimmed_and_clamped() {
        let suggestion = Suggestion::from(GeneratedSuggestion {
            text: "  hello there  ".to_string(),
            confidence: 1.4,
            reasoning: Some("short".to_string()),
        });
        assert_eq!(suggestion.text, "hello there");
        assert_eq!(suggestion.confidence, 1.0);
        assert_eq!(suggestion.reasoning.as_deref(), Some("short"));
        assert!(!suggestion.rejected);
    }
}
