//! # Cache Layer
//!
//! Exact and semantic lookup of earlier answers, plus the in-flight registry
//! that keeps concurrent identical requests down to one pipeline run.
//!
//! Entries are immutable apart from their hit counter and are swapped in
//! whole, so a reader never sees a partially written entry.

pub mod inflight;
pub mod store;

pub use inflight::{Claim, ClaimGuard, ClaimUpdate, ClaimWaiter, InFlightClaim, InFlightRegistry};
pub use store::MemoryCacheStore;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::OrchestratorConfig;
use crate::error::CacheError;
use crate::fingerprint::{Fingerprint, SemanticSignature};
use crate::types::{CacheMatch, Suggestion, Tier};

/// A cached answer
#[derive(Debug)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub signature: SemanticSignature,
    pub tier: Tier,
    pub payload: Vec<Suggestion>,
    pub created_at: Instant,
    pub expires_at: Instant,
    hit_count: AtomicU64,
}

impl CacheEntry {
    pub fn new(
        fingerprint: Fingerprint,
        signature: SemanticSignature,
        tier: Tier,
        payload: Vec<Suggestion>,
        ttl: Duration,
    ) -> Self {
        let created_at = Instant::now();
        Self {
            fingerprint,
            signature,
            tier,
            payload,
            created_at,
            expires_at: created_at + ttl,
            hit_count: AtomicU64::new(0),
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    pub fn hit_count(&self) -> u64 {
        self.hit_count.load(Ordering::Relaxed)
    }

    fn record_hit(&self) -> u64 {
        self.hit_count.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Storage behind the cache layer
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// The live entry for a fingerprint
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Arc<CacheEntry>>, CacheError>;

    /// Live entries whose tier is at least `min_tier`
    async fn candidates(&self, min_tier: Tier) -> Result<Vec<Arc<CacheEntry>>, CacheError>;

    /// Insert or replace an entry
    async fn put(&self, entry: CacheEntry) -> Result<(), CacheError>;

    /// Drop an entry; `true` when something was removed
    async fn remove(&self, fingerprint: &Fingerprint) -> Result<bool, CacheError>;

    /// Number of stored entries, expired ones included
    async fn len(&self) -> Result<usize, CacheError>;
}

/// A successful lookup
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    pub suggestions: Vec<Suggestion>,
    pub tier: Tier,
    pub matched: CacheMatch,
    pub age: Duration,
    pub hit_count: u64,
}

/// Lookup counters since start
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub exact_hits: u64,
    pub semantic_hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub errors: u64,
    pub in_flight: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let hits = self.exact_hits + self.semantic_hits;
        let total = hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}

#[derive(Default)]
struct Counters {
    exact_hits: AtomicU64,
    semantic_hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    errors: AtomicU64,
}

/// Tiered cache with semantic matching and in-flight deduplication
pub struct CacheLayer<T> {
    store: Arc<dyn CacheStore>,
    semantic_threshold: f32,
    base_ttls: BTreeMap<Tier, Duration>,
    min_ttl: Duration,
    max_ttl: Duration,
    inflight: InFlightRegistry<T>,
    counters: Counters,
}

impl<T: Clone + Send + Sync + 'static> CacheLayer<T> {
    pub fn new(store: Arc<dyn CacheStore>, config: &OrchestratorConfig) -> Self {
        Self {
            store,
            semantic_threshold: config.cache.semantic_threshold,
            base_ttls: Tier::ALL
                .into_iter()
                .map(|tier| (tier, config.tier(tier).cache_ttl))
                .collect(),
            min_ttl: config.cache.min_ttl,
            max_ttl: config.cache.max_ttl,
            inflight: InFlightRegistry::new(),
            counters: Counters::default(),
        }
    }

    /// In-memory cache sized from the configuration
    pub fn in_memory(config: &OrchestratorConfig) -> Self {
        Self::new(Arc::new(MemoryCacheStore::new(config.cache.max_entries)), config)
    }

    /// Exact match first, then the most similar entry above the threshold.
    ///
    /// Either way the entry's tier must be at least `min_tier`.
    pub async fn lookup(
        &self,
        fingerprint: &Fingerprint,
        signature: &SemanticSignature,
        min_tier: Tier,
    ) -> Result<Option<CacheHit>, CacheError> {
        let now = Instant::now();

        let exact = self.store.get(fingerprint).await.map_err(|e| self.error(e))?;
        if let Some(entry) = exact.filter(|e| !e.is_expired(now) && e.tier >= min_tier) {
            self.counters.exact_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(hit(&entry, CacheMatch::Exact, now)));
        }

        if !signature.is_empty() {
            let candidates = self.store.candidates(min_tier).await.map_err(|e| self.error(e))?;
            let best = candidates
                .iter()
                .filter(|e| !e.is_expired(now) && e.tier >= min_tier)
                .map(|e| (e, e.signature.similarity(signature)))
                .filter(|(_, similarity)| *similarity >= self.semantic_threshold)
                .max_by(|a, b| a.1.total_cmp(&b.1));

            if let Some((entry, similarity)) = best {
                self.counters.semantic_hits.fetch_add(1, Ordering::Relaxed);
                debug!(
                    fingerprint = %fingerprint.short(),
                    matched = %entry.fingerprint.short(),
                    similarity,
                    "Semantic cache hit"
                );
                return Ok(Some(hit(entry, CacheMatch::Semantic { similarity }, now)));
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    /// Store an answer under the tier's TTL scaled by `ttl_multiplier`
    pub async fn store(
        &self,
        fingerprint: Fingerprint,
        signature: SemanticSignature,
        tier: Tier,
        payload: Vec<Suggestion>,
        ttl_multiplier: f64,
    ) -> Result<(), CacheError> {
        let ttl = self.ttl_for(tier, ttl_multiplier);
        let entry = CacheEntry::new(fingerprint, signature, tier, payload, ttl);
        self.store.put(entry).await.map_err(|e| self.error(e))?;
        self.counters.stores.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Remove a cached answer
    pub async fn invalidate(&self, fingerprint: &Fingerprint) -> Result<bool, CacheError> {
        self.store.remove(fingerprint).await.map_err(|e| self.error(e))
    }

    /// TTL for a tier, clamped to the configured bounds
    pub fn ttl_for(&self, tier: Tier, multiplier: f64) -> Duration {
        let base = self
            .base_ttls
            .get(&tier)
            .copied()
            .unwrap_or(self.min_ttl);
        let multiplier = if multiplier.is_finite() && multiplier > 0.0 {
            multiplier
        } else {
            1.0
        };
        base.mul_f64(multiplier).clamp(self.min_ttl, self.max_ttl)
    }

    /// Become the owner of a fingerprint's pipeline run, or join it
    pub fn claim_or_join(&self, fingerprint: &Fingerprint) -> Claim<T> {
        self.inflight.claim_or_join(fingerprint)
    }

    pub fn in_flight(&self) -> Vec<InFlightClaim> {
        self.inflight.claims()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            exact_hits: self.counters.exact_hits.load(Ordering::Relaxed),
            semantic_hits: self.counters.semantic_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            stores: self.counters.stores.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            in_flight: self.inflight.len(),
        }
    }

    pub async fn len(&self) -> Result<usize, CacheError> {
        self.store.len().await
    }

    fn error(&self, err: CacheError) -> CacheError {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        warn!(error = %err, "Cache store failed");
        err
    }
}

fn hit(entry: &CacheEntry, matched: CacheMatch, now: Instant) -> CacheHit {
    CacheHit {
        suggestions: entry.payload.clone(),
        tier: entry.tier,
        matched,
        age: now.saturating_duration_since(entry.created_at),
        hit_count: entry.record_hit(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ImageRef, SuggestionRequest};

    fn request(id: &str, context: &str) -> SuggestionRequest {
        SuggestionRequest::new(ImageRef::id_only(id)).with_context(context)
    }

    fn keys(request: &SuggestionRequest) -> (Fingerprint, SemanticSignature) {
        (Fingerprint::of(request), SemanticSignature::of(request))
    }

    fn layer() -> CacheLayer<u32> {
        CacheLayer::in_memory(&OrchestratorConfig::default())
    }

    #[tokio::test]
    async fn exact_hit_counts_hits() {
        let cache = layer();
        let (fp, sig) = keys(&request("img", "likes hiking"));

        assert!(cache.lookup(&fp, &sig, Tier::Fast).await.unwrap().is_none());
        cache
            .store(fp.clone(), sig.clone(), Tier::Standard, vec![Suggestion::new("hi there", 0.8)], 1.0)
            .await
            .unwrap();

        let first = cache.lookup(&fp, &sig, Tier::Fast).await.unwrap().unwrap();
        let second = cache.lookup(&fp, &sig, Tier::Standard).await.unwrap().unwrap();
        assert_eq!(first.matched, CacheMatch::Exact);
        assert_eq!(first.hit_count, 1);
        assert_eq!(second.hit_count, 2);

        let stats = cache.stats();
        assert_eq!(stats.exact_hits, 2);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn lower_tier_never_satisfies_higher_request() {
        let cache = layer();
        let (fp, sig) = keys(&request("img", "likes hiking"));
        cache
            .store(fp.clone(), sig.clone(), Tier::Fast, vec![Suggestion::new("hey", 0.8)], 1.0)
            .await
            .unwrap();

        assert!(cache.lookup(&fp, &sig, Tier::Comprehensive).await.unwrap().is_none());
        assert!(cache.lookup(&fp, &sig, Tier::Standard).await.unwrap().is_none());
        assert!(cache.lookup(&fp, &sig, Tier::Fast).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn semantic_hit_respects_threshold_and_tier() {
        let cache = layer();
        let stored = request("img-1", "she loves hiking mountains and strong coffee");
        let (fp, sig) = keys(&stored);
        cache
            .store(fp, sig, Tier::Standard, vec![Suggestion::new("Best trail?", 0.9)], 1.0)
            .await
            .unwrap();

        let similar = request("img-2", "loves hiking mountains and strong coffee");
        let (fp2, sig2) = keys(&similar);
        let found = cache.lookup(&fp2, &sig2, Tier::Fast).await.unwrap().unwrap();
        assert!(matches!(found.matched, CacheMatch::Semantic { similarity } if similarity >= 0.8));

        assert!(cache.lookup(&fp2, &sig2, Tier::Comprehensive).await.unwrap().is_none());

        let different = request("img-3", "jazz records vinyl collection saxophone");
        let (fp3, sig3) = keys(&different);
        assert!(cache.lookup(&fp3, &sig3, Tier::Fast).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = layer();
        let (fp, sig) = keys(&request("img", "likes hiking"));
        cache
            .store(fp.clone(), sig.clone(), Tier::Fast, vec![Suggestion::new("hey", 0.8)], 1.0)
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(3_599)).await;
        assert!(cache.lookup(&fp, &sig, Tier::Fast).await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.lookup(&fp, &sig, Tier::Fast).await.unwrap().is_none());
    }

    #[test]
    fn ttl_scales_with_tier_and_is_clamped() {
        let cache = layer();
        assert_eq!(cache.ttl_for(Tier::Fast, 1.0), Duration::from_secs(3_600));
        assert!(cache.ttl_for(Tier::Comprehensive, 1.0) > cache.ttl_for(Tier::Standard, 1.0));
        assert_eq!(cache.ttl_for(Tier::Fast, 1.5), Duration::from_secs(5_400));
        assert_eq!(cache.ttl_for(Tier::Comprehensive, 10.0), Duration::from_secs(24 * 3_600));
        assert_eq!(cache.ttl_for(Tier::Fast, 0.001), Duration::from_secs(5 * 60));
        assert_eq!(cache.ttl_for(Tier::Fast, f64::NAN), Duration::from_secs(3_600));
    }
}
