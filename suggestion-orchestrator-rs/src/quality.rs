//! Quality assurance for generated suggestions
//!
//! Scoring is a pure function of the suggestion, the request context and
//! the tier. The only randomness is a small jitter on the creativity score,
//! seeded from the suggestion text.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use once_cell::sync::Lazy;
use rand::{rngs::StdRng, Rng, SeedableRng};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::OrchestratorConfig;
use crate::types::{QualityScores, Suggestion, SuggestionRequest, SuggestionType, Tier, Tone};

/// Longest suggestion that can be sent as a message
pub const MAX_SUGGESTION_CHARS: usize = 280;

/// Word-set Jaccard similarity at which two suggestions count as duplicates
pub const DUPLICATE_SIMILARITY: f32 = 0.8;

const WEIGHT_CONFIDENCE: f32 = 0.25;
const WEIGHT_CREATIVITY: f32 = 0.20;
const WEIGHT_SENTIMENT: f32 = 0.15;
const WEIGHT_TONE: f32 = 0.15;
const WEIGHT_RELEVANCE: f32 = 0.10;
const WEIGHT_SAFETY: f32 = 0.15;

static INAPPROPRIATE: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\b(explicit|sexual|nsfw|porn|xxx)\b",
        r"(?i)\b(drugs?|cocaine|meth|heroin)\b",
        r"(?i)\b(kill|murder|suicide)\b",
        r"(?i)\b(racist|racism|sexist|homophobic)\b",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

static SPAM: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\b(click here|visit my|website|https?://)",
        r"(?i)\b(buy now|discount|promo code)\b",
        r"(?i)\b(cash ?app|venmo|paypal)\b",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

static REPEATED_CHARS: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(.)\1{4,}").ok());

const CLICHES: &[&str] = &[
    "hey there",
    "what's up",
    "come here often",
    "you're beautiful",
    "how are you",
    "nice profile",
];

const POSITIVE: &[&str] = &[
    "love", "great", "amazing", "fun", "awesome", "cool", "nice", "happy", "excited",
    "interesting", "enjoy", "favorite", "best", "wonderful", "adventure", "beautiful",
];

const NEGATIVE: &[&str] = &[
    "hate", "boring", "ugly", "stupid", "annoying", "worst", "awful", "terrible", "lame", "sad",
];

fn tone_markers(tone: Tone) -> &'static [&'static str] {
    match tone {
        Tone::Playful => &["fun", "haha", "bet", "game", "adventure", "guess", "!", "dare"],
        Tone::Witty => &["actually", "clearly", "important", "question", "technically", "plot", "honestly"],
        Tone::Romantic => &["smile", "heart", "beautiful", "dinner", "sunset", "together", "dream"],
        Tone::Casual => &["hey", "cool", "nice", "chill", "what's", "weekend", "pretty"],
        Tone::Bold => &["need", "must", "tell", "already", "confident", "date", "let's"],
    }
}

/// What a suggestion is judged against
#[derive(Debug, Clone, Default)]
pub struct QualityContext {
    pub tone: Tone,
    pub suggestion_type: SuggestionType,
    /// Lowercase words from the request context and the vision analysis
    pub keywords: BTreeSet<String>,
}

impl QualityContext {
    pub fn new(request: &SuggestionRequest, details: Option<&BTreeMap<String, Value>>) -> Self {
        let mut keywords = BTreeSet::new();
        collect_keywords(&request.context, &mut keywords);
        if let Some(details) = details {
            for value in details.values() {
                collect_value_keywords(value, &mut keywords);
            }
        }

        Self {
            tone: request.tone,
            suggestion_type: request.suggestion_type,
            keywords,
        }
    }
}

fn collect_keywords(text: &str, into: &mut BTreeSet<String>) {
    into.extend(
        words(text)
            .into_iter()
            .filter(|word| word.chars().count() > 3),
    );
}

fn collect_value_keywords(value: &Value, into: &mut BTreeSet<String>) {
    match value {
        Value::String(text) => collect_keywords(text, into),
        Value::Array(items) => items.iter().for_each(|item| collect_value_keywords(item, into)),
        Value::Object(map) => map.values().for_each(|item| collect_value_keywords(item, into)),
        _ => {}
    }
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Outcome of scoring one suggestion
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityEvaluation {
    pub scores: QualityScores,
    pub passed: bool,
    pub rejection_reason: Option<String>,
}

/// A batch split into what may be shown and what was held back
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilteredBatch {
    /// In generation order; see [`rank`]
    pub passed: Vec<Suggestion>,
    /// Marked rejected, each with a reason
    pub rejected: Vec<Suggestion>,
}

impl FilteredBatch {
    pub fn pass_rate(&self) -> f64 {
        let total = self.passed.len() + self.rejected.len();
        if total == 0 {
            return 0.0;
        }
        self.passed.len() as f64 / total as f64
    }
}

/// Scores suggestions and enforces the per-tier pass threshold
#[derive(Debug, Clone)]
pub struct QualityFilter {
    thresholds: BTreeMap<Tier, f32>,
}

impl Default for QualityFilter {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default())
    }
}

impl QualityFilter {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            thresholds: Tier::ALL
                .into_iter()
                .map(|tier| (tier, config.tier(tier).pass_threshold))
                .collect(),
        }
    }

    pub fn threshold(&self, tier: Tier) -> f32 {
        self.thresholds.get(&tier).copied().unwrap_or(0.7)
    }

    /// Score one suggestion. Hard rules reject regardless of the composite.
    pub fn evaluate(&self, suggestion: &Suggestion, ctx: &QualityContext, tier: Tier) -> QualityEvaluation {
        let text = suggestion.text.trim();
        let scores = score(text, suggestion.confidence, ctx);

        let rejection_reason = if text.is_empty() {
            Some("empty suggestion".to_string())
        } else if text.chars().count() > MAX_SUGGESTION_CHARS {
            Some(format!(
                "longer than {} characters",
                MAX_SUGGESTION_CHARS
            ))
        } else if INAPPROPRIATE.iter().any(|pattern| pattern.is_match(text)) {
            Some("inappropriate content".to_string())
        } else if scores.overall < self.threshold(tier) {
            Some(format!(
                "quality {:.2} below {} threshold {:.2}",
                scores.overall,
                tier,
                self.threshold(tier)
            ))
        } else {
            None
        };

        QualityEvaluation {
            scores,
            passed: rejection_reason.is_none(),
            rejection_reason,
        }
    }

    /// Score a batch and reject failures and near-duplicates.
    ///
    /// Survivors keep the order they were generated in.
    pub fn filter_batch(
        &self,
        batch: Vec<Suggestion>,
        ctx: &QualityContext,
        tier: Tier,
    ) -> FilteredBatch {
        let mut filtered = FilteredBatch::default();
        let mut accepted_words: Vec<(String, HashSet<String>)> = Vec::new();

        for mut suggestion in batch {
            let evaluation = self.evaluate(&suggestion, ctx, tier);
            suggestion.quality = evaluation.scores;

            if let Some(reason) = evaluation.rejection_reason {
                suggestion.reject(reason);
                filtered.rejected.push(suggestion);
                continue;
            }

            let word_set: HashSet<String> = words(&suggestion.text).into_iter().collect();
            let duplicate_of = accepted_words
                .iter()
                .find(|(_, other)| jaccard(&word_set, other) >= DUPLICATE_SIMILARITY)
                .map(|(id, _)| id.clone());

            match duplicate_of {
                Some(id) => {
                    suggestion.reject(format!("near duplicate of {}", id));
                    filtered.rejected.push(suggestion);
                }
                None => {
                    accepted_words.push((suggestion.id.clone(), word_set));
                    filtered.passed.push(suggestion);
                }
            }
        }

        filtered
    }
}

/// Descending confidence, ties broken by overall quality
pub fn rank(suggestions: &mut [Suggestion]) {
    suggestions.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| b.quality.overall.total_cmp(&a.quality.overall))
    });
}

fn score(text: &str, confidence: f32, ctx: &QualityContext) -> QualityScores {
    let words = words(text);

    let confidence = confidence.clamp(0.0, 1.0);
    let sentiment = sentiment_score(text, &words);
    let creativity = creativity_score(text, &words);
    let tone_match = tone_score(text, &words, ctx.tone);
    let relevance = relevance_score(&words, &ctx.keywords);
    let safety = safety_score(text);

    let overall = confidence * WEIGHT_CONFIDENCE
        + creativity * WEIGHT_CREATIVITY
        + sentiment * WEIGHT_SENTIMENT
        + tone_match * WEIGHT_TONE
        + relevance * WEIGHT_RELEVANCE
        + safety * WEIGHT_SAFETY;

    QualityScores {
        overall: overall.clamp(0.0, 1.0),
        confidence,
        sentiment,
        creativity,
        tone_match,
        relevance,
        safety,
    }
}

fn sentiment_score(text: &str, words: &[String]) -> f32 {
    let positive = words.iter().filter(|w| POSITIVE.contains(&w.as_str())).count().min(3);
    let negative = words.iter().filter(|w| NEGATIVE.contains(&w.as_str())).count();
    let engaging = if text.contains('?') { 0.1 } else { 0.0 };

    (0.6 + 0.1 * positive as f32 - 0.2 * negative as f32 + engaging).clamp(0.0, 1.0)
}

fn creativity_score(text: &str, words: &[String]) -> f32 {
    if words.is_empty() {
        return 0.0;
    }

    let distinct = words.iter().collect::<HashSet<_>>().len();
    let mut score = 0.5 + 0.4 * distinct as f32 / words.len() as f32;

    let lower = text.to_lowercase();
    let cliches = CLICHES.iter().filter(|c| lower.contains(*c)).count();
    score -= 0.3 * cliches as f32;

    let low_effort = text.chars().count() < 10
        || REPEATED_CHARS.as_ref().map_or(false, |re| re.is_match(text))
        || !text.chars().any(char::is_alphabetic);
    if low_effort {
        score = score.min(0.2);
    }

    (score + jitter(text)).clamp(0.0, 1.0)
}

fn tone_score(text: &str, words: &[String], tone: Tone) -> f32 {
    let lower = text.to_lowercase();
    let hits = tone_markers(tone)
        .iter()
        .filter(|marker| {
            if marker.chars().all(char::is_alphanumeric) {
                words.iter().any(|w| w == *marker)
            } else {
                lower.contains(*marker)
            }
        })
        .count();

    (0.6 + 0.1 * hits as f32).min(1.0)
}

fn relevance_score(words: &[String], keywords: &BTreeSet<String>) -> f32 {
    if keywords.is_empty() {
        return 0.7;
    }
    let overlap = words
        .iter()
        .filter(|w| w.chars().count() > 3 && keywords.contains(*w))
        .collect::<HashSet<_>>()
        .len()
        .min(2);

    0.5 + 0.25 * overlap as f32
}

fn safety_score(text: &str) -> f32 {
    if INAPPROPRIATE.iter().any(|pattern| pattern.is_match(text)) {
        return 0.0;
    }
    let spam = SPAM.iter().filter(|pattern| pattern.is_match(text)).count();
    (1.0 - 0.5 * spam as f32).max(0.0)
}

// Stable across runs: seeded from the text, never the clock
fn jitter(text: &str) -> f32 {
    let digest = Sha256::digest(text.as_bytes());
    let mut seed = [0u8; 8];
    seed.copy_from_slice(&digest[..8]);
    let mut rng = StdRng::seed_from_u64(u64::from_le_bytes(seed));
    rng.gen_range(-0.05f32..=0.05f32)
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f32 / union as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ImageRef;

    fn ctx() -> QualityContext {
        let request = SuggestionRequest::new(ImageRef::id_only("img"))
            .with_context("She loves hiking and mountain sunsets");
        QualityContext::new(&request, None)
    }

    #[test]
    fn evaluation_is_deterministic() {
        let filter = QualityFilter::default();
        let suggestion = Suggestion::new("What's the best hiking trail you've done this year?", 0.8);

        let first = filter.evaluate(&suggestion, &ctx(), Tier::Standard);
        let second = filter.evaluate(&suggestion.clone(), &ctx(), Tier::Standard);
        assert_eq!(first, second);
        assert!(first.passed, "{:?}", first);
    }

    #[test]
    fn hard_rules_reject_regardless_of_score() {
        let filter = QualityFilter::default();

        let inappropriate = Suggestion::new("Want to do drugs on our first hike?", 1.0);
        let evaluation = filter.evaluate(&inappropriate, &ctx(), Tier::Fast);
        assert!(!evaluation.passed);
        assert_eq!(evaluation.rejection_reason.as_deref(), Some("inappropriate content"));

        let empty = Suggestion::new("   ", 1.0);
        assert!(!filter.evaluate(&empty, &ctx(), Tier::Fast).passed);

        let long = Suggestion::new("hiking ".repeat(50), 1.0);
        let evaluation = filter.evaluate(&long, &ctx(), Tier::Fast);
        assert!(!evaluation.passed);
        assert!(evaluation.rejection_reason.unwrap().contains("280"));
    }

    #[test]
    fn threshold_depends_on_tier() {
        let filter = QualityFilter::default();
        let weak = Suggestion::new("So what do you do for work these days", 0.1);

        let fast = filter.evaluate(&weak, &ctx(), Tier::Fast);
        let comprehensive = filter.evaluate(&weak, &ctx(), Tier::Comprehensive);
        assert_eq!(fast.scores, comprehensive.scores);
        assert!(!comprehensive.passed);
        assert!(comprehensive.rejection_reason.unwrap().contains("comprehensive"));
    }

    #[test]
    fn batch_keeps_generation_order_and_rejections_keep_reasons() {
        let filter = QualityFilter::default();
        let batch = vec![
            Suggestion::new("Which mountain has the best sunset you've seen?", 0.6),
            Suggestion::new("Is hiking your favorite way to spend a weekend?", 0.9),
            Suggestion::new("Is hiking your favorite way to spend a weekend??", 0.85),
            Suggestion::new("Tell me about the last trail that surprised you!", 0.8),
            Suggestion::new("", 0.99),
        ];

        let mut filtered = filter.filter_batch(batch, &ctx(), Tier::Fast);
        let confidences: Vec<f32> = filtered.passed.iter().map(|s| s.confidence).collect();
        assert_eq!(confidences, vec![0.6, 0.9, 0.8]);

        rank(&mut filtered.passed);
        let ranked: Vec<f32> = filtered.passed.iter().map(|s| s.confidence).collect();
        assert_eq!(ranked, vec![0.9, 0.8, 0.6]);

        assert_eq!(filtered.rejected.len(), 2);
        assert!(filtered.rejected.iter().all(|s| s.rejected && s.rejection_reason.is_some()));
        assert!(filtered
            .rejected
            .iter()
            .any(|s| s.rejection_reason.as_deref().unwrap().starts_with("near duplicate")));
        assert!((filtered.pass_rate() - 0.6).abs() < 1e-9);
    }

    #[test]
    fn context_keywords_raise_relevance() {
        let filter = QualityFilter::default();
        let on_topic = Suggestion::new("Which mountain sunsets are worth the hiking?", 0.7);
        let off_topic = Suggestion::new("Which pizza toppings are worth the calories?", 0.7);

        let a = filter.evaluate(&on_topic, &ctx(), Tier::Fast).scores.relevance;
        let b = filter.evaluate(&off_topic, &ctx(), Tier::Fast).scores.relevance;
        assert!(a > b);
    }

    #[test]
    fn keywords_include_vision_details() {
        let request = SuggestionRequest::new(ImageRef::id_only("img"));
        let mut details = BTreeMap::new();
        details.insert("interests".to_string(), serde_json::json!(["Surfing", "art"]));
        details.insert("bio".to_string(), serde_json::json!("Coffee snob"));

        let ctx = QualityContext::new(&request, Some(&details));
        assert!(ctx.keywords.contains("surfing"));
        assert!(ctx.keywords.contains("coffee"));
        assert!(!ctx.keywords.contains("art"));
    }
}
