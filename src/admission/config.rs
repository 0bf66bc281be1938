//! # Backpressure Configuration
//!
//! The controller's settings panel. A `BackpressureConfig` is immutable once
//! handed to the controller; changes go through
//! [`BackpressureController::update_config`](super::BackpressureController::update_config)
//! which validates and swaps the whole snapshot.
//!
//! ## Signals and Levels
//!
//! ```text
//!     queue depth / max_queue_size ──┐
//!     memory MB   / max_memory_mb  ──┤
//!     publish/s   / max_publish_rate ┼──► max ratio ──► level
//!     cpu %       / max_cpu_percent ─┘
//!
//!     ratio <  low_threshold    (0.6) ─► none
//!     ratio <  medium_threshold (0.8) ─► low
//!     ratio <  high_threshold   (1.0) ─► medium
//!     ratio >= high_threshold         ─► high
//! ```
//!
//! ## Presets
//!
//! Named bundles for common environments:
//!
//! | preset            | max_queue_size | max_publish_rate | recovery_delay_ms |
//! |-------------------|----------------|------------------|-------------------|
//! | `testing`         | 100            | 50               | 100               |
//! | `development`     | 1_000          | 500              | 1_000             |
//! | `production`      | 10_000         | 5_000            | 30_000            |
//! | `high_throughput` | 100_000        | 50_000           | 10_000            |

use serde::Deserialize;

use super::types::{DegradationLevel, Priority};
use crate::error::{ConfigError, ConfigResult};

/// Names accepted by [`BackpressureConfig::preset`].
pub const PRESET_NAMES: [&str; 4] = ["testing", "development", "production", "high_throughput"];

/// Drop-probability curve used by load-shedding.
///
/// The probability that a non-guaranteed message is sampled away is
///
/// ```text
///     p(level, priority) = min(1, level_base[level] * priority_factor[priority])
/// ```
///
/// `validate` insists on a monotone curve: non-decreasing in level and
/// non-increasing in priority, with `critical` pinned to zero.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SamplingCurve {
    /// Base drop probability per level, indexed `[none, low, medium, high]`.
    pub level_base: [f64; 4],
    /// Multiplier per priority, indexed `[low, medium, high, critical]`.
    pub priority_factor: [f64; 4],
}

impl Default for SamplingCurve {
    fn default() -> Self {
        Self {
            level_base: [0.0, 0.2, 0.5, 0.8],
            priority_factor: [1.0, 0.6, 0.25, 0.0],
        }
    }
}

impl SamplingCurve {
    /// Raw curve value, ignoring prioritization cutoffs.
    #[inline]
    pub fn drop_probability(&self, level: DegradationLevel, priority: Priority) -> f64 {
        (self.level_base[level.index()] * self.priority_factor[priority.index()]).clamp(0.0, 1.0)
    }

    /// Checks ranges and monotonicity.
    pub fn validate(&self) -> ConfigResult<()> {
        if self
            .level_base
            .iter()
            .chain(self.priority_factor.iter())
            .any(|v| !v.is_finite() || *v < 0.0)
        {
            return Err(ConfigError::invalid(
                "sampling_curve",
                "values must be finite and non-negative",
            ));
        }
        if self.level_base.iter().any(|v| *v > 1.0) {
            return Err(ConfigError::invalid(
                "sampling_curve.level_base",
                "probabilities must not exceed 1.0",
            ));
        }
        if self.level_base.windows(2).any(|w| w[0] > w[1]) {
            return Err(ConfigError::invalid(
                "sampling_curve.level_base",
                "must be non-decreasing from none to high",
            ));
        }
        if self.priority_factor.windows(2).any(|w| w[0] < w[1]) {
            return Err(ConfigError::invalid(
                "sampling_curve.priority_factor",
                "must be non-increasing from low to critical",
            ));
        }
        if self.priority_factor[Priority::Critical.index()] != 0.0 {
            return Err(ConfigError::invalid(
                "sampling_curve.priority_factor",
                "critical messages are never sampled; factor must be 0",
            ));
        }
        Ok(())
    }
}

/// Configuration for the backpressure controller.
///
/// Deserializable from TOML; every field has a default so partial files
/// are accepted.
///
/// ```rust
/// use floodgate::BackpressureConfig;
///
/// let config = BackpressureConfig::from_toml_str(r#"
///     max_queue_size = 250
///     enable_batching = false
/// "#).unwrap();
/// assert_eq!(config.max_queue_size, 250);
/// assert!(!config.enable_batching);
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    /// Memory budget for the process (MB).
    pub max_memory_usage_mb: u64,
    /// Absolute queue capacity (entries).
    pub max_queue_size: usize,
    /// Publish attempts per second considered full load.
    pub max_publish_rate: u64,
    /// CPU budget (percent of all cores).
    pub max_cpu_usage_percent: f64,

    /// Consult per-subject circuit breakers on publish.
    pub enable_circuit_breaker: bool,
    /// Apply probabilistic load shedding at levels above `none`.
    pub enable_sampling: bool,
    /// Guarantee admission above a level-dependent priority cutoff.
    pub enable_prioritization: bool,
    /// Coalesce messages to the same subject while degraded.
    pub enable_batching: bool,

    /// Worst ratio (percent) that must hold before stepping down a level.
    pub recovery_threshold_percent: f64,
    /// How long the worst ratio must stay under the recovery threshold.
    pub recovery_delay_ms: u64,
    /// Upper bound for retry backoff on downstream sends.
    pub max_backoff_ms: u64,

    /// Interval between background samples.
    pub sample_interval_ms: u64,
    /// Entries older than this are dropped (reported as `sampled`).
    pub max_residency_ms: u64,
    /// Window during which messages to one subject may be coalesced.
    pub batch_window_ms: u64,
    /// Maximum payloads per coalesced entry.
    pub max_batch_size: usize,
    /// Rate at which `drain_queue` forwards entries downstream.
    pub drain_rate_per_sec: u64,

    /// Failure rate (percent) that opens a subject's breaker.
    pub failure_threshold_percent: f64,
    /// Rolling window for failure-rate computation.
    pub failure_window_ms: u64,
    /// Minimum outcomes in the window before the failure rate counts.
    pub min_failure_samples: usize,
    /// Time an automatically opened breaker waits before probing.
    pub breaker_cooldown_ms: u64,
    /// Fraction of publishes admitted while half-open.
    pub half_open_probe_fraction: f64,

    /// Ratio at which `low` degradation starts.
    pub low_threshold: f64,
    /// Ratio at which `medium` degradation starts.
    pub medium_threshold: f64,
    /// Ratio at which `high` degradation starts.
    pub high_threshold: f64,

    /// Load-shedding curve.
    pub sampling_curve: SamplingCurve,
}

impl Default for BackpressureConfig {
    /// Balanced defaults, equivalent to the `development` preset.
    fn default() -> Self {
        Self {
            max_memory_usage_mb: 512,
            max_queue_size: 1_000,
            max_publish_rate: 500,
            max_cpu_usage_percent: 80.0,
            enable_circuit_breaker: true,
            enable_sampling: true,
            enable_prioritization: true,
            enable_batching: true,
            recovery_threshold_percent: 50.0,
            recovery_delay_ms: 1_000,
            max_backoff_ms: 5_000,
            sample_interval_ms: 250,
            max_residency_ms: 60_000,
            batch_window_ms: 50,
            max_batch_size: 20,
            drain_rate_per_sec: 1_000,
            failure_threshold_percent: 50.0,
            failure_window_ms: 30_000,
            min_failure_samples: 10,
            breaker_cooldown_ms: 10_000,
            half_open_probe_fraction: 0.1,
            low_threshold: 0.6,
            medium_threshold: 0.8,
            high_threshold: 1.0,
            sampling_curve: SamplingCurve::default(),
        }
    }
}

impl BackpressureConfig {
    /// Returns a named preset.
    ///
    /// # Errors
    ///
    /// `ConfigError::UnknownPreset` for names outside [`PRESET_NAMES`].
    ///
    /// ```rust
    /// use floodgate::BackpressureConfig;
    ///
    /// let config = BackpressureConfig::preset("testing").unwrap();
    /// assert_eq!(config.max_queue_size, 100);
    /// assert!(BackpressureConfig::preset("turbo").is_err());
    /// ```
    pub fn preset(name: &str) -> ConfigResult<Self> {
        match name {
            "testing" => Ok(Self::testing()),
            "development" => Ok(Self::default()),
            "production" => Ok(Self::production()),
            "high_throughput" => Ok(Self::high_throughput()),
            other => Err(ConfigError::UnknownPreset(other.to_string())),
        }
    }

    /// Small, fast-reacting settings for tests and local experiments.
    pub fn testing() -> Self {
        Self {
            max_memory_usage_mb: 4_096,
            max_queue_size: 100,
            max_publish_rate: 50,
            max_cpu_usage_percent: 100.0,
            recovery_delay_ms: 100,
            max_backoff_ms: 200,
            sample_interval_ms: 20,
            max_residency_ms: 5_000,
            batch_window_ms: 10,
            max_batch_size: 5,
            drain_rate_per_sec: 10_000,
            failure_window_ms: 1_000,
            min_failure_samples: 3,
            breaker_cooldown_ms: 200,
            half_open_probe_fraction: 0.5,
            ..Self::default()
        }
    }

    /// Conservative settings with slow recovery to avoid flapping.
    pub fn production() -> Self {
        Self {
            max_memory_usage_mb: 2_048,
            max_queue_size: 10_000,
            max_publish_rate: 5_000,
            max_cpu_usage_percent: 75.0,
            recovery_threshold_percent: 40.0,
            recovery_delay_ms: 30_000,
            max_backoff_ms: 30_000,
            sample_interval_ms: 1_000,
            max_residency_ms: 300_000,
            batch_window_ms: 100,
            max_batch_size: 50,
            drain_rate_per_sec: 2_000,
            failure_window_ms: 60_000,
            min_failure_samples: 20,
            breaker_cooldown_ms: 30_000,
            half_open_probe_fraction: 0.05,
            ..Self::default()
        }
    }

    /// Large queues, late degradation, aggressive batching.
    pub fn high_throughput() -> Self {
        Self {
            max_memory_usage_mb: 8_192,
            max_queue_size: 100_000,
            max_publish_rate: 50_000,
            max_cpu_usage_percent: 90.0,
            recovery_delay_ms: 10_000,
            max_backoff_ms: 10_000,
            sample_interval_ms: 500,
            batch_window_ms: 200,
            max_batch_size: 200,
            drain_rate_per_sec: 20_000,
            low_threshold: 0.7,
            medium_threshold: 0.85,
            ..Self::production()
        }
    }

    /// Parses a TOML document; missing fields take their defaults.
    ///
    /// The parsed configuration is validated before it is returned.
    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration for correctness.
    ///
    /// # Errors
    ///
    /// Returns the first offending field with a reason.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_queue_size == 0 {
            return Err(ConfigError::invalid("max_queue_size", "must be greater than 0"));
        }
        if self.max_memory_usage_mb == 0 {
            return Err(ConfigError::invalid(
                "max_memory_usage_mb",
                "must be greater than 0",
            ));
        }
        if self.max_publish_rate == 0 {
            return Err(ConfigError::invalid("max_publish_rate", "must be greater than 0"));
        }
        if !(self.max_cpu_usage_percent > 0.0 && self.max_cpu_usage_percent <= 100.0) {
            return Err(ConfigError::invalid(
                "max_cpu_usage_percent",
                "must be in (0, 100]",
            ));
        }
        if !(self.recovery_threshold_percent > 0.0 && self.recovery_threshold_percent <= 100.0) {
            return Err(ConfigError::invalid(
                "recovery_threshold_percent",
                "must be in (0, 100]",
            ));
        }
        if self.sample_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "sample_interval_ms",
                "must be greater than 0",
            ));
        }
        if self.max_batch_size == 0 {
            return Err(ConfigError::invalid("max_batch_size", "must be at least 1"));
        }
        if self.drain_rate_per_sec == 0 {
            return Err(ConfigError::invalid(
                "drain_rate_per_sec",
                "must be greater than 0",
            ));
        }
        if !(self.failure_threshold_percent > 0.0 && self.failure_threshold_percent <= 100.0) {
            return Err(ConfigError::invalid(
                "failure_threshold_percent",
                "must be in (0, 100]",
            ));
        }
        if self.failure_window_ms == 0 {
            return Err(ConfigError::invalid(
                "failure_window_ms",
                "must be greater than 0",
            ));
        }
        if !(0.0..=1.0).contains(&self.half_open_probe_fraction) {
            return Err(ConfigError::invalid(
                "half_open_probe_fraction",
                "must be in [0, 1]",
            ));
        }
        let thresholds = [self.low_threshold, self.medium_threshold, self.high_threshold];
        if thresholds.iter().any(|t| !t.is_finite() || *t <= 0.0) {
            return Err(ConfigError::invalid(
                "thresholds",
                "level thresholds must be positive",
            ));
        }
        if !(self.low_threshold < self.medium_threshold
            && self.medium_threshold < self.high_threshold)
        {
            return Err(ConfigError::invalid(
                "thresholds",
                "must satisfy low < medium < high",
            ));
        }
        if self.recovery_threshold_percent / 100.0 > self.high_threshold {
            return Err(ConfigError::invalid(
                "recovery_threshold_percent",
                "must not exceed the high threshold",
            ));
        }
        self.sampling_curve.validate()
    }

    /// Maps a worst-signal ratio to a degradation level.
    #[inline]
    pub fn level_for_ratio(&self, ratio: f64) -> DegradationLevel {
        if ratio >= self.high_threshold {
            DegradationLevel::High
        } else if ratio >= self.medium_threshold {
            DegradationLevel::Medium
        } else if ratio >= self.low_threshold {
            DegradationLevel::Low
        } else {
            DegradationLevel::None
        }
    }

    /// Lowest priority that is admitted without sampling at `level`.
    ///
    /// ```text
    ///     none   ─► low      (everything)
    ///     low    ─► medium
    ///     medium ─► high
    ///     high   ─► high
    /// ```
    #[inline]
    pub fn guaranteed_priority(&self, level: DegradationLevel) -> Priority {
        match level {
            DegradationLevel::None => Priority::Low,
            DegradationLevel::Low => Priority::Medium,
            DegradationLevel::Medium | DegradationLevel::High => Priority::High,
        }
    }

    /// Effective probability that a message is sampled away.
    ///
    /// Combines the prioritization cutoff with the sampling curve. Zero
    /// when sampling is disabled or the level is `none`.
    pub fn drop_probability(&self, level: DegradationLevel, priority: Priority) -> f64 {
        if !self.enable_sampling || level == DegradationLevel::None {
            return 0.0;
        }
        if self.enable_prioritization && priority >= self.guaranteed_priority(level) {
            return 0.0;
        }
        self.sampling_curve.drop_probability(level, priority)
    }
}
