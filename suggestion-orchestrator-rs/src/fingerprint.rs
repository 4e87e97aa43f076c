//! Request fingerprints and semantic signatures
//!
//! A [`Fingerprint`] is the exact cache key and the dedup key for in-flight
//! work. A [`SemanticSignature`] is a small bag-of-words vector used to find
//! cached answers for requests that are worded differently but mean the same.

use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::types::SuggestionRequest;

/// Dimensions of a semantic signature
pub const SIGNATURE_DIMS: usize = 128;

/// Deterministic key over the content of a request
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(request: &SuggestionRequest) -> Self {
        let mut hasher = Sha256::new();

        hasher.update(b"image:");
        hasher.update(image_hash(request).as_bytes());
        hasher.update(b"\ntype:");
        hasher.update(request.suggestion_type.as_str().as_bytes());
        hasher.update(b"\ntone:");
        hasher.update(request.tone.as_str().as_bytes());
        hasher.update(b"\ncontext:");
        hasher.update(normalize_context(&request.context).as_bytes());

        // BTreeMap iterates in key order
        for (key, value) in &request.user_preferences {
            hasher.update(b"\npref:");
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
        }

        Self(hex(&hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading characters, for log lines
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hash of the image bytes, or of the id when no bytes were supplied
fn image_hash(request: &SuggestionRequest) -> String {
    let digest = if request.image.bytes.is_empty() {
        Sha256::digest(request.image.id.trim().as_bytes())
    } else {
        Sha256::digest(request.image.bytes.as_slice())
    };
    hex(&digest)
}

/// Trim, lowercase and collapse runs of whitespace
pub fn normalize_context(context: &str) -> String {
    context
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// L2-normalized bag-of-words vector over context, type and tone
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SemanticSignature {
    vector: Vec<f32>,
}

impl SemanticSignature {
    /// Empty when the context has no words: type and tone alone say nothing
    /// about the image, so such requests only ever match exactly.
    pub fn of(request: &SuggestionRequest) -> Self {
        if Self::from_text(&request.context).is_empty() {
            return Self::from_text("");
        }
        let text = format!(
            "{} {} {}",
            request.context,
            request.suggestion_type.as_str(),
            request.tone.as_str()
        );
        Self::from_text(&text)
    }

    pub fn from_text(text: &str) -> Self {
        let mut vector = vec![0.0f32; SIGNATURE_DIMS];

        let words = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|word| word.chars().count() > 2)
            .map(str::to_lowercase);

        for (index, word) in words.enumerate() {
            let slot = bucket(&word);
            let weight = (1.0 - 0.01 * index as f32).max(0.1);
            vector[slot] += weight;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }

        Self { vector }
    }

    /// Cosine similarity; zero when either side has no words
    pub fn similarity(&self, other: &SemanticSignature) -> f32 {
        self.vector
            .iter()
            .zip(&other.vector)
            .map(|(a, b)| a * b)
            .sum::<f32>()
            .clamp(0.0, 1.0)
    }

    pub fn is_empty(&self) -> bool {
        self.vector.iter().all(|v| *v == 0.0)
    }
}

// FNV-1a keeps the slot stable across processes and releases
fn bucket(word: &str) -> usize {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in word.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    (hash % SIGNATURE_DIMS as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ImageRef, Tone};

    fn request(context: &str) -> SuggestionRequest {
        SuggestionRequest::new(ImageRef::id_only("img-1")).with_context(context)
    }

    #[test]
    fn fingerprint_ignores_correlation_id_and_whitespace() {
        let a = request("Loves  hiking\tand coffee").with_correlation_id("a");
        let b = request("  loves hiking and COFFEE ").with_correlation_id("b");
        assert_eq!(Fingerprint::of(&a), Fingerprint::of(&b));
        assert_eq!(Fingerprint::of(&a).as_str().len(), 64);
    }

    #[test]
    fn fingerprint_covers_tone_preferences_and_image() {
        let base = request("hiking");
        let fp = Fingerprint::of(&base);

        assert_ne!(fp, Fingerprint::of(&base.clone().with_tone(Tone::Bold)));
        assert_ne!(fp, Fingerprint::of(&base.clone().with_preference("emoji", "no")));

        let other_image = SuggestionRequest::new(ImageRef::id_only("img-2")).with_context("hiking");
        assert_ne!(fp, Fingerprint::of(&other_image));

        let with_bytes = SuggestionRequest::new(ImageRef::new("img-1", vec![1, 2, 3]))
            .with_context("hiking");
        assert_ne!(fp, Fingerprint::of(&with_bytes));
    }

    #[test]
    fn similar_contexts_are_close() {
        let a = SemanticSignature::of(&request("she loves hiking mountains and strong coffee"));
        let b = SemanticSignature::of(&request("loves hiking mountains and strong coffee!"));
        let c = SemanticSignature::of(&request("jazz records vinyl collection saxophone"));

        assert!(a.similarity(&b) > 0.8, "similarity {}", a.similarity(&b));
        assert!(a.similarity(&c) < a.similarity(&b));
        assert!((a.similarity(&a) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn requests_without_context_have_no_signature() {
        assert!(SemanticSignature::of(&request("")).is_empty());
        assert!(SemanticSignature::of(&request("  ok ")).is_empty());
        assert!(!SemanticSignature::of(&request("hiking")).is_empty());
    }

    #[test]
    fn short_words_are_ignored() {
        let signature = SemanticSignature::from_text("a an to of");
        assert!(signature.is_empty());
        assert_eq!(signature.similarity(&SemanticSignature::from_text("hiking")), 0.0);
    }
}
