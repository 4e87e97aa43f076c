//! # Performance Monitor
//!
//! Rolling windows of request samples per tier and provider call records per
//! provider. Raises latency alerts with per-key cooldown and, when a tier is
//! persistently slow, emits optimization signals that the orchestrator
//! applies through [`Tuning`]. An adjustment is reverted once the tier that
//! caused it is back on target, or after `tuning_expiry` at the latest.
//!
//! Recording never waits: every update is a short critical section and
//! signals go out on a broadcast channel without back-pressure.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use provider_sdk::{CallObserver, CallOutcome, ProviderCallRecord, ProviderKind};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::{LatencyTarget, MonitorConfig, OrchestratorConfig};
use crate::types::{ResponseStatus, Tier};

const SIGNAL_CAPACITY: usize = 64;

/// One finished request
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceSample {
    pub correlation_id: String,
    /// Tier that produced the answer
    pub tier: Tier,
    pub latency: Duration,
    pub status: ResponseStatus,
    pub cache_hit: bool,
    pub deduplicated: bool,
    pub suggestions_returned: usize,
    pub suggestions_rejected: usize,
    pub recorded_at: DateTime<Utc>,
}

impl PerformanceSample {
    fn quality_counts(&self) -> (usize, usize) {
        if self.cache_hit || self.deduplicated {
            return (0, 0);
        }
        let passed = match self.status {
            ResponseStatus::Complete => self.suggestions_returned,
            _ => 0,
        };
        (passed, self.suggestions_rejected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// A threshold crossing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    /// Alerts with the same key share one cooldown
    pub key: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub tier: Option<Tier>,
    pub observed_ms: u64,
    pub raised_at: DateTime<Utc>,
}

/// An adjustment the orchestrator should apply
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Optimization {
    /// Cache answers longer
    ExtendCacheTtl { multiplier: f64 },
    /// Requests that would pick this tier get the next cheaper one
    DowngradeDefaultTier(Tier),
    /// Back to the configured cache lifetimes
    ResetCacheTtl,
    /// The tier is selected normally again
    RestoreTier(Tier),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorSignal {
    Alert(Alert),
    Optimization(Optimization),
}

/// Adjustments currently in force
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tuning {
    pub ttl_multiplier: f64,
    pub downgraded_tiers: BTreeSet<Tier>,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            ttl_multiplier: 1.0,
            downgraded_tiers: BTreeSet::new(),
        }
    }
}

impl Tuning {
    /// The tier to use when `tier` was selected without an explicit hint
    pub fn apply(&self, tier: Tier) -> Tier {
        if self.downgraded_tiers.contains(&tier) {
            tier.downgrade()
        } else {
            tier
        }
    }
}

/// Aggregates over a window of samples
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WindowStats {
    pub samples: usize,
    pub avg_latency_ms: f64,
    pub p50_latency_ms: u64,
    pub p95_latency_ms: u64,
    pub p99_latency_ms: u64,
    pub success_rate: f64,
    pub cache_hit_rate: f64,
    pub pass_rate: f64,
    pub degraded_rate: f64,
}

impl WindowStats {
    fn from_samples<'a>(samples: impl IntoIterator<Item = &'a PerformanceSample>) -> Self {
        let samples: Vec<&PerformanceSample> = samples.into_iter().collect();
        if samples.is_empty() {
            return Self::default();
        }

        let n = samples.len() as f64;
        let mut latencies: Vec<u64> = samples.iter().map(|s| millis(s.latency)).collect();
        latencies.sort_unstable();

        let degraded = samples.iter().filter(|s| s.status == ResponseStatus::Degraded).count();
        let hits = samples.iter().filter(|s| s.cache_hit).count();
        let (passed, judged) = samples.iter().fold((0usize, 0usize), |(p, t), s| {
            let (passed, rejected) = s.quality_counts();
            (p + passed, t + passed + rejected)
        });

        Self {
            samples: samples.len(),
            avg_latency_ms: latencies.iter().sum::<u64>() as f64 / n,
            p50_latency_ms: percentile(&latencies, 0.50),
            p95_latency_ms: percentile(&latencies, 0.95),
            p99_latency_ms: percentile(&latencies, 0.99),
            success_rate: (samples.len() - degraded) as f64 / n,
            cache_hit_rate: hits as f64 / n,
            pass_rate: if judged == 0 {
                1.0
            } else {
                passed as f64 / judged as f64
            },
            degraded_rate: degraded as f64 / n,
        }
    }
}

/// Aggregates over a provider's recent attempts
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProviderStats {
    pub calls: usize,
    pub success_rate: f64,
    pub short_circuited: usize,
    pub trials: usize,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: u64,
    pub error_classes: BTreeMap<String, usize>,
}

impl ProviderStats {
    fn from_records(records: &VecDeque<ProviderCallRecord>) -> Self {
        if records.is_empty() {
            return Self::default();
        }

        // Fast-fails never reached the provider
        let mut latencies: Vec<u64> = records
            .iter()
            .filter(|r| r.outcome != CallOutcome::ShortCircuited)
            .map(|r| millis(r.latency))
            .collect();
        latencies.sort_unstable();

        let mut error_classes = BTreeMap::new();
        for class in records.iter().filter_map(|r| r.error_class) {
            *error_classes.entry(class.as_str().to_string()).or_insert(0) += 1;
        }

        let successes = records.iter().filter(|r| r.outcome == CallOutcome::Success).count();
        Self {
            calls: records.len(),
            success_rate: successes as f64 / records.len() as f64,
            short_circuited: records
                .iter()
                .filter(|r| r.outcome == CallOutcome::ShortCircuited)
                .count(),
            trials: records.iter().filter(|r| r.trial).count(),
            avg_latency_ms: if latencies.is_empty() {
                0.0
            } else {
                latencies.iter().sum::<u64>() as f64 / latencies.len() as f64
            },
            p95_latency_ms: percentile(&latencies, 0.95),
            error_classes,
        }
    }
}

/// Read-only snapshot for dashboards
#[derive(Debug, Clone, Serialize)]
pub struct Dashboard {
    pub overall: WindowStats,
    pub tiers: BTreeMap<Tier, WindowStats>,
    pub providers: BTreeMap<ProviderKind, ProviderStats>,
    pub alerts: Vec<Alert>,
    pub tuning: Tuning,
    pub total_samples: u64,
    pub generated_at: DateTime<Utc>,
}

#[derive(Default)]
struct MonitorState {
    tiers: BTreeMap<Tier, VecDeque<PerformanceSample>>,
    providers: BTreeMap<ProviderKind, VecDeque<ProviderCallRecord>>,
    alerts: VecDeque<Alert>,
    alert_last_raised: HashMap<String, Instant>,
    last_optimization: Option<Instant>,
    tuning: Tuning,
    /// Tier whose slowness extended the TTL, and when
    ttl_extended_for: Option<(Tier, Instant)>,
    downgraded_at: BTreeMap<Tier, Instant>,
    total_samples: u64,
}

/// Records request outcomes and provider calls, raises alerts and tunes
pub struct PerformanceMonitor {
    config: MonitorConfig,
    targets: BTreeMap<Tier, LatencyTarget>,
    state: Mutex<MonitorState>,
    signals: broadcast::Sender<MonitorSignal>,
}

impl PerformanceMonitor {
    pub fn new(config: &OrchestratorConfig) -> Self {
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self {
            config: config.monitor.clone(),
            targets: Tier::ALL
                .into_iter()
                .map(|tier| (tier, config.tier(tier).latency))
                .collect(),
            state: Mutex::new(MonitorState::default()),
            signals,
        }
    }

    fn state(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Alerts and optimizations as they happen
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorSignal> {
        self.signals.subscribe()
    }

    /// Adjustments currently in force
    pub fn tuning(&self) -> Tuning {
        self.state().tuning.clone()
    }

    /// The last alerts, oldest first
    pub fn alerts(&self) -> Vec<Alert> {
        self.state().alerts.iter().cloned().collect()
    }

    /// Record a finished request
    pub fn record(&self, sample: PerformanceSample) {
        let tier = sample.tier;
        let latency_ms = millis(sample.latency);

        counter!(
            "suggestion_requests_total",
            1,
            "tier" => tier.as_str(),
            "status" => sample.status.as_str()
        );
        histogram!(
            "suggestion_request_latency_seconds",
            sample.latency.as_secs_f64(),
            "tier" => tier.as_str()
        );
        if sample.cache_hit {
            counter!("suggestion_cache_hits_total", 1, "tier" => tier.as_str());
        }

        let signals = {
            let mut state = self.state();
            state.total_samples += 1;

            let window = state.tiers.entry(tier).or_default();
            window.push_back(sample.clone());
            while window.len() > self.config.window {
                window.pop_front();
            }
            let stats = WindowStats::from_samples(window.iter());

            let mut signals = Vec::new();
            if let Some(alert) = self.latency_alert(&mut state, &sample, latency_ms) {
                signals.push(MonitorSignal::Alert(alert));
            }
            if sample.status == ResponseStatus::Degraded {
                let alert = self.raise(
                    &mut state,
                    format!("degraded.{}", tier),
                    AlertSeverity::Warning,
                    format!("{} tier served emergency suggestions", tier),
                    Some(tier),
                    latency_ms,
                );
                signals.extend(alert.map(MonitorSignal::Alert));
            }
            signals.extend(
                self.relax(&mut state, tier, &stats)
                    .into_iter()
                    .map(MonitorSignal::Optimization),
            );
            if let Some(optimization) = self.optimize(&mut state, tier, &stats) {
                signals.push(MonitorSignal::Optimization(optimization));
            }
            signals
        };

        for signal in signals {
            // No subscribers is fine
            let _ = self.signals.send(signal);
        }
    }

    /// Aggregates, recent alerts and tuning
    pub fn dashboard(&self) -> Dashboard {
        let state = self.state();
        Dashboard {
            overall: WindowStats::from_samples(state.tiers.values().flatten()),
            tiers: state
                .tiers
                .iter()
                .map(|(tier, window)| (*tier, WindowStats::from_samples(window.iter())))
                .collect(),
            providers: state
                .providers
                .iter()
                .map(|(kind, records)| (*kind, ProviderStats::from_records(records)))
                .collect(),
            alerts: state.alerts.iter().cloned().collect(),
            tuning: state.tuning.clone(),
            total_samples: state.total_samples,
            generated_at: Utc::now(),
        }
    }

    fn latency_alert(
        &self,
        state: &mut MonitorState,
        sample: &PerformanceSample,
        latency_ms: u64,
    ) -> Option<Alert> {
        let target = self.targets.get(&sample.tier)?;
        let tier = sample.tier;

        let severity = if sample.latency > target.critical {
            AlertSeverity::Critical
        } else if sample.latency > target.warning {
            AlertSeverity::Warning
        } else {
            return None;
        };
        let (label, limit) = match severity {
            AlertSeverity::Critical => ("critical", target.critical),
            AlertSeverity::Warning => ("warning", target.warning),
        };

        self.raise(
            state,
            format!("latency.{}.{}", tier, label),
            severity,
            format!(
                "{} tier took {}ms, {} threshold is {}ms",
                tier,
                latency_ms,
                label,
                millis(limit)
            ),
            Some(tier),
            latency_ms,
        )
    }

    fn raise(
        &self,
        state: &mut MonitorState,
        key: String,
        severity: AlertSeverity,
        message: String,
        tier: Option<Tier>,
        observed_ms: u64,
    ) -> Option<Alert> {
        let now = Instant::now();
        if let Some(last) = state.alert_last_raised.get(&key) {
            if now.saturating_duration_since(*last) < self.config.alert_cooldown {
                return None;
            }
        }
        state.alert_last_raised.insert(key.clone(), now);

        match severity {
            AlertSeverity::Critical => error!(alert = %key, observed_ms, "{}", message),
            AlertSeverity::Warning => warn!(alert = %key, observed_ms, "{}", message),
        }
        counter!("suggestion_alerts_total", 1, "severity" => severity_label(severity));

        let alert = Alert {
            key,
            severity,
            message,
            tier,
            observed_ms,
            raised_at: Utc::now(),
        };
        state.alerts.push_back(alert.clone());
        while state.alerts.len() > self.config.alert_history {
            state.alerts.pop_front();
        }
        Some(alert)
    }

    /// Revert adjustments that expired or whose tier recovered
    fn relax(&self, state: &mut MonitorState, tier: Tier, stats: &WindowStats) -> Vec<Optimization> {
        let now = Instant::now();
        let expired = |since: Instant| now.saturating_duration_since(since) >= self.config.tuning_expiry;
        let recovered = stats.samples >= self.config.min_samples
            && self
                .targets
                .get(&tier)
                .map_or(false, |target| stats.avg_latency_ms <= millis(target.target) as f64);

        let mut reverted = Vec::new();
        if let Some((cause, since)) = state.ttl_extended_for {
            if expired(since) || (recovered && cause == tier) {
                state.tuning.ttl_multiplier = 1.0;
                state.ttl_extended_for = None;
                gauge!("suggestion_cache_ttl_multiplier", 1.0);
                reverted.push(Optimization::ResetCacheTtl);
            }
        }

        let restored: Vec<Tier> = state
            .downgraded_at
            .iter()
            .filter(|(downgraded, since)| expired(**since) || (recovered && **downgraded == tier))
            .map(|(downgraded, _)| *downgraded)
            .collect();
        for downgraded in restored {
            state.downgraded_at.remove(&downgraded);
            state.tuning.downgraded_tiers.remove(&downgraded);
            reverted.push(Optimization::RestoreTier(downgraded));
        }

        for optimization in &reverted {
            info!(tier = %tier, optimization = ?optimization, "Reverting optimization");
        }
        reverted
    }

    fn optimize(&self, state: &mut MonitorState, tier: Tier, stats: &WindowStats) -> Option<Optimization> {
        let target = self.targets.get(&tier)?;
        if stats.samples < self.config.min_samples
            || stats.avg_latency_ms <= millis(target.target) as f64
        {
            return None;
        }

        let now = Instant::now();
        if let Some(last) = state.last_optimization {
            if now.saturating_duration_since(last) < self.config.optimization_cooldown {
                return None;
            }
        }

        let optimization = if stats.cache_hit_rate < self.config.low_cache_hit_rate
            && state.tuning.ttl_multiplier < self.config.max_ttl_multiplier
        {
            let multiplier = (state.tuning.ttl_multiplier * self.config.ttl_multiplier_step)
                .min(self.config.max_ttl_multiplier);
            state.tuning.ttl_multiplier = multiplier;
            state.ttl_extended_for = Some((tier, now));
            gauge!("suggestion_cache_ttl_multiplier", multiplier);
            Optimization::ExtendCacheTtl { multiplier }
        } else if stats.pass_rate < self.config.low_pass_rate
            && tier != Tier::Fast
            && !state.tuning.downgraded_tiers.contains(&tier)
        {
            state.tuning.downgraded_tiers.insert(tier);
            state.downgraded_at.insert(tier, now);
            Optimization::DowngradeDefaultTier(tier)
        } else {
            return None;
        };

        state.last_optimization = Some(now);
        info!(
            tier = %tier,
            avg_latency_ms = stats.avg_latency_ms,
            cache_hit_rate = stats.cache_hit_rate,
            pass_rate = stats.pass_rate,
            optimization = ?optimization,
            "Applying optimization"
        );
        counter!("suggestion_optimizations_total", 1, "tier" => tier.as_str());
        Some(optimization)
    }
}

impl CallObserver for PerformanceMonitor {
    fn record_call(&self, record: &ProviderCallRecord) {
        let outcome = match record.outcome {
            CallOutcome::Success => "success",
            CallOutcome::Failure => "failure",
            CallOutcome::ShortCircuited => "short_circuited",
        };
        counter!(
            "provider_calls_total",
            1,
            "provider" => record.provider.as_str(),
            "outcome" => outcome
        );
        if record.outcome != CallOutcome::ShortCircuited {
            histogram!(
                "provider_call_latency_seconds",
                record.latency.as_secs_f64(),
                "provider" => record.provider.as_str()
            );
        }

        let alert = {
            let mut state = self.state();
            let window = state.providers.entry(record.provider).or_default();
            window.push_back(record.clone());
            while window.len() > self.config.window {
                window.pop_front();
            }

            if record.outcome == CallOutcome::ShortCircuited {
                self.raise(
                    &mut state,
                    format!("breaker.{}", record.provider),
                    AlertSeverity::Critical,
                    format!("{} circuit is open, calls are failing fast", record.provider),
                    None,
                    0,
                )
            } else {
                None
            }
        };

        if let Some(alert) = alert {
            let _ = self.signals.send(MonitorSignal::Alert(alert));
        }
    }
}

fn severity_label(severity: AlertSeverity) -> &'static str {
    match severity {
        AlertSeverity::Warning => "warning",
        AlertSeverity::Critical => "critical",
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Nearest-rank percentile of sorted values
fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
