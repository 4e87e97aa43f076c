//! Emergency suggestions
//!
//! Static, tone-aware texts returned when every provider attempt failed so
//! the caller still gets an answer.

use crate::types::{QualityScores, Suggestion, Tone};

/// Confidence reported for canned suggestions
pub const EMERGENCY_CONFIDENCE: f32 = 0.5;

/// Suggestions returned in a degraded response
pub const EMERGENCY_COUNT: usize = 3;

/// Shown when the image lacks information and the provider gave no hint
pub const DEFAULT_GUIDANCE: &str =
    "Not enough to go on yet. Scroll to show more of the profile or conversation and try again.";

fn templates(tone: Tone) -> &'static [&'static str] {
    match tone {
        Tone::Playful => &[
            "Your photo caught my attention, what's the story behind it?",
            "I love the energy in this picture! What were you up to?",
            "That looks like an interesting place, tell me more!",
        ],
        Tone::Witty => &[
            "I was going to play it cool, but this photo made that impossible. What's the backstory?",
            "Important question: is that spot as good as it looks, or is it all camera angles?",
            "Something tells me you have some interesting stories to share.",
        ],
        Tone::Romantic => &[
            "There's something really genuine about your vibe, that's refreshing to see.",
            "What's been the highlight of your week so far?",
            "I'd love to hear about what's happening in this picture.",
        ],
        Tone::Casual => &[
            "Hey! What's going on in this photo?",
            "Nice picture! Where was this taken?",
            "This looks fun, what's the context?",
        ],
        Tone::Bold => &[
            "I'm intrigued by your photo. Care to elaborate?",
            "That's a great shot. I need the backstory.",
            "You seem like someone worth getting to know. What are you up to this week?",
        ],
    }
}

/// Canned suggestions for a tone, flagged as fallback
pub fn emergency_suggestions(tone: Tone, reason: &str) -> Vec<Suggestion> {
    templates(tone)
        .iter()
        .take(EMERGENCY_COUNT)
        .map(|text| {
            let mut suggestion = Suggestion::new(*text, EMERGENCY_CONFIDENCE);
            suggestion.reasoning = Some(format!("Emergency fallback: {}", reason));
            suggestion.fallback = true;
            suggestion.quality = QualityScores {
                overall: EMERGENCY_CONFIDENCE,
                confidence: EMERGENCY_CONFIDENCE,
                ..QualityScores::default()
            };
            suggestion
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_tone_has_enough_templates() {
        for tone in Tone::ALL {
            let suggestions = emergency_suggestions(tone, "test");
            assert_eq!(suggestions.len(), EMERGENCY_COUNT, "{}", tone);
            assert!(suggestions.iter().all(|s| s.fallback && !s.rejected));
            assert!(suggestions.iter().all(|s| s.text.chars().count() <= 280));
        }
    }

    #[test]
    fn reason_is_recorded() {
        let suggestions = emergency_suggestions(Tone::Casual, "generation unavailable");
        assert_eq!(
            suggestions[0].reasoning.as_deref(),
            Some("Emergency fallback: generation unavailable")
        );
        assert_eq!(suggestions[0].confidence, EMERGENCY_CONFIDENCE);
    }
}
