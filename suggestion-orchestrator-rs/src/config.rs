//! Orchestrator configuration
//!
//! Every value has a production default; any of them can be overridden
//! through a [`ConfigProvider`]. Durations accept `"250ms"`, `"30s"`, `"5m"`
//! or `"1h"`. With the default environment provider the keys read as
//! `SUGGEST_TIER_FAST_BUDGET`, `SUGGEST_CACHE_SEMANTIC_THRESHOLD` and so on.

use std::collections::BTreeMap;
use std::time::Duration;

use provider_sdk::{ConfigProvider, ConfigProviderExt};
use serde::Serialize;

use crate::error::{OrchestratorError, Result};
use crate::types::Tier;

/// Latency thresholds for one tier
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencyTarget {
    /// Above this a warning alert is raised
    pub warning: Duration,
    /// The latency the tier is expected to meet on average
    pub target: Duration,
    /// Above this a critical alert is raised
    pub critical: Duration,
}

/// Budgets and policy for one tier
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierProfile {
    /// All-up budget for one attempt at this tier
    pub budget: Duration,
    pub vision_timeout: Duration,
    pub generation_timeout: Duration,
    /// Suggestions requested from the generation provider
    pub suggestion_count: u32,
    /// Composite quality score a suggestion needs to pass
    pub pass_threshold: f32,
    /// Cache lifetime before the monitor's TTL multiplier
    pub cache_ttl: Duration,
    pub latency: LatencyTarget,
}

impl TierProfile {
    pub fn defaults(tier: Tier) -> Self {
        let ms = Duration::from_millis;
        match tier {
            Tier::Fast => Self {
                budget: ms(3_000),
                vision_timeout: ms(1_200),
                generation_timeout: ms(1_800),
                suggestion_count: 3,
                pass_threshold: 0.60,
                cache_ttl: Duration::from_secs(3_600),
                latency: LatencyTarget {
                    warning: ms(2_500),
                    target: ms(3_000),
                    critical: ms(4_000),
                },
            },
            Tier::Standard => Self {
                budget: ms(15_000),
                vision_timeout: ms(6_000),
                generation_timeout: ms(9_000),
                suggestion_count: 5,
                pass_threshold: 0.70,
                cache_ttl: Duration::from_secs(2 * 3_600),
                latency: LatencyTarget {
                    warning: ms(12_000),
                    target: ms(15_000),
                    critical: ms(18_000),
                },
            },
            Tier::Comprehensive => Self {
                budget: ms(25_000),
                vision_timeout: ms(10_000),
                generation_timeout: ms(15_000),
                suggestion_count: 6,
                pass_threshold: 0.75,
                cache_ttl: Duration::from_secs(4 * 3_600),
                latency: LatencyTarget {
                    warning: ms(20_000),
                    target: ms(25_000),
                    critical: ms(30_000),
                },
            },
        }
    }

    fn from_provider<P: ConfigProvider + ?Sized>(tier: Tier, provider: &P) -> Self {
        let defaults = Self::defaults(tier);
        let key = |suffix: &str| format!("tier_{}_{}", tier.as_str(), suffix);

        Self {
            budget: provider.get_duration_or(&key("budget"), defaults.budget),
            vision_timeout: provider.get_duration_or(&key("vision_timeout"), defaults.vision_timeout),
            generation_timeout: provider
                .get_duration_or(&key("generation_timeout"), defaults.generation_timeout),
            suggestion_count: provider
                .get_int_or(&key("suggestion_count"), defaults.suggestion_count as i64)
                .clamp(1, 20) as u32,
            pass_threshold: provider
                .get_float_or(&key("pass_threshold"), defaults.pass_threshold as f64)
                as f32,
            cache_ttl: provider.get_duration_or(&key("cache_ttl"), defaults.cache_ttl),
            latency: LatencyTarget {
                warning: provider.get_duration_or(&key("latency_warning"), defaults.latency.warning),
                target: provider.get_duration_or(&key("latency_target"), defaults.latency.target),
                critical: provider
                    .get_duration_or(&key("latency_critical"), defaults.latency.critical),
            },
        }
    }
}

/// Cache layer settings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheConfig {
    /// Minimum cosine similarity for a semantic hit
    pub semantic_threshold: f32,
    pub max_entries: usize,
    pub min_ttl: Duration,
    pub max_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            semantic_threshold: 0.80,
            max_entries: 5_000,
            min_ttl: Duration::from_secs(5 * 60),
            max_ttl: Duration::from_secs(24 * 3_600),
        }
    }
}

/// Performance monitor settings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorConfig {
    /// Samples kept per tier and call records kept per provider
    pub window: usize,
    /// Samples a tier needs before optimization rules run
    pub min_samples: usize,
    pub alert_cooldown: Duration,
    pub optimization_cooldown: Duration,
    /// How long an optimization stays in force without recovery
    pub tuning_expiry: Duration,
    pub alert_history: usize,
    pub low_cache_hit_rate: f64,
    pub low_pass_rate: f64,
    pub ttl_multiplier_step: f64,
    pub max_ttl_multiplier: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window: 200,
            min_samples: 20,
            alert_cooldown: Duration::from_secs(60),
            optimization_cooldown: Duration::from_secs(5 * 60),
            tuning_expiry: Duration::from_secs(30 * 60),
            alert_history: 100,
            low_cache_hit_rate: 0.20,
            low_pass_rate: 0.50,
            ttl_multiplier_step: 1.5,
            max_ttl_multiplier: 3.0,
        }
    }
}

/// Streaming delivery settings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamConfig {
    /// No event for this long errors the session
    pub idle_timeout: Duration,
    /// Events buffered between producer and consumer
    pub capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
            capacity: 16,
        }
    }
}

/// Complete orchestrator configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrchestratorConfig {
    pub service_name: String,
    pub tiers: BTreeMap<Tier, TierProfile>,
    pub cache: CacheConfig,
    pub monitor: MonitorConfig,
    pub stream: StreamConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            service_name: "suggestion-orchestrator".to_string(),
            tiers: Tier::ALL
                .into_iter()
                .map(|tier| (tier, TierProfile::defaults(tier)))
                .collect(),
            cache: CacheConfig::default(),
            monitor: MonitorConfig::default(),
            stream: StreamConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration, falling back to defaults for missing keys
    pub fn from_provider<P: ConfigProvider + ?Sized>(provider: &P) -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            service_name: provider.get_string_or("service_name", &defaults.service_name),
            tiers: Tier::ALL
                .into_iter()
                .map(|tier| (tier, TierProfile::from_provider(tier, provider)))
                .collect(),
            cache: CacheConfig {
                semantic_threshold: provider.get_float_or(
                    "cache_semantic_threshold",
                    defaults.cache.semantic_threshold as f64,
                ) as f32,
                max_entries: provider
                    .get_int_or("cache_max_entries", defaults.cache.max_entries as i64)
                    .max(1) as usize,
                min_ttl: provider.get_duration_or("cache_min_ttl", defaults.cache.min_ttl),
                max_ttl: provider.get_duration_or("cache_max_ttl", defaults.cache.max_ttl),
            },
            monitor: MonitorConfig {
                window: provider
                    .get_int_or("monitor_window", defaults.monitor.window as i64)
                    .max(1) as usize,
                min_samples: provider
                    .get_int_or("monitor_min_samples", defaults.monitor.min_samples as i64)
                    .max(1) as usize,
                alert_cooldown: provider
                    .get_duration_or("monitor_alert_cooldown", defaults.monitor.alert_cooldown),
                optimization_cooldown: provider.get_duration_or(
                    "monitor_optimization_cooldown",
                    defaults.monitor.optimization_cooldown,
                ),
                tuning_expiry: provider
                    .get_duration_or("monitor_tuning_expiry", defaults.monitor.tuning_expiry),
                alert_history: provider
                    .get_int_or("monitor_alert_history", defaults.monitor.alert_history as i64)
                    .max(1) as usize,
                ..defaults.monitor
            },
            stream: StreamConfig {
                idle_timeout: provider
                    .get_duration_or("stream_idle_timeout", defaults.stream.idle_timeout),
                capacity: provider
                    .get_int_or("stream_capacity", defaults.stream.capacity as i64)
                    .max(1) as usize,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Profile of a tier
    pub fn tier(&self, tier: Tier) -> TierProfile {
        self.tiers
            .get(&tier)
            .cloned()
            .unwrap_or_else(|| TierProfile::defaults(tier))
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.cache.semantic_threshold) {
            return Err(OrchestratorError::configuration(format!(
                "Semantic threshold must be within 0..1, got {}",
                self.cache.semantic_threshold
            )));
        }
        if self.cache.min_ttl > self.cache.max_ttl {
            return Err(OrchestratorError::configuration(format!(
                "Cache min TTL {:?} exceeds max TTL {:?}",
                self.cache.min_ttl, self.cache.max_ttl
            )));
        }
        if self.stream.idle_timeout.is_zero() {
            return Err(OrchestratorError::configuration(
                "Stream idle timeout must be positive",
            ));
        }

        for (tier, profile) in &self.tiers {
            if profile.budget.is_zero()
                || profile.vision_timeout.is_zero()
                || profile.generation_timeout.is_zero()
            {
                return Err(OrchestratorError::configuration(format!(
                    "{} tier timeouts must be positive",
                    tier
                )));
            }
            if !(0.0..=1.0).contains(&profile.pass_threshold) {
                return Err(OrchestratorError::configuration(format!(
                    "{} tier pass threshold must be within 0..1, got {}",
                    tier, profile.pass_threshold
                )));
            }
            // Every attempt reports its first phase, so one budget bounds a stream's silence
            if self.stream.idle_timeout <= profile.budget {
                return Err(OrchestratorError::configuration(format!(
                    "Stream idle timeout {:?} must exceed the {} tier budget {:?}",
                    self.stream.idle_timeout, tier, profile.budget
                )));
            }
            let latency = profile.latency;
            if latency.warning > latency.critical {
                return Err(OrchestratorError::configuration(format!(
                    "{} tier warning latency exceeds critical latency",
                    tier
                )));
            }
        }

        Ok(())
    }
}
