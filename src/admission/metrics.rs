//! # Controller Metrics and Health
//!
//! Snapshot types returned by the controller, plus the analytics built on
//! its bounded histories.
//!
//! ```text
//!     Health mapping:
//!
//!     level none, no breaker open, not draining ──► Healthy   (200)
//!     level low/medium, or breaker open/draining ─► Degraded  (206)
//!     level high, or queue at capacity ──────────► Unhealthy (503)
//! ```

use std::fmt;

use serde::Serialize;

use super::config::BackpressureConfig;
use super::types::{DegradationLevel, DropReason};

/// Drops broken down by reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DropCounts {
    /// Rejected by an open circuit breaker.
    pub circuit_open: u64,
    /// No room in the queue, evicted, or rejected while draining.
    pub queue_full: u64,
    /// Load shedding or queue aging.
    pub sampled: u64,
    /// Credential budget exhausted downstream.
    pub rate_limited: u64,
}

impl DropCounts {
    pub(crate) fn from_array(counts: [u64; 4]) -> Self {
        Self {
            circuit_open: counts[DropReason::CircuitOpen.index()],
            queue_full: counts[DropReason::QueueFull.index()],
            sampled: counts[DropReason::Sampled.index()],
            rate_limited: counts[DropReason::RateLimited.index()],
        }
    }

    /// Count for one reason.
    pub fn get(&self, reason: DropReason) -> u64 {
        match reason {
            DropReason::CircuitOpen => self.circuit_open,
            DropReason::QueueFull => self.queue_full,
            DropReason::Sampled => self.sampled,
            DropReason::RateLimited => self.rate_limited,
        }
    }

    /// Sum over all reasons.
    pub fn total(&self) -> u64 {
        self.circuit_open + self.queue_full + self.sampled + self.rate_limited
    }

    /// The reason with the most drops, if any drop happened.
    pub fn dominant(&self) -> Option<DropReason> {
        DropReason::ALL
            .into_iter()
            .filter(|r| self.get(*r) > 0)
            .max_by_key(|r| self.get(*r))
    }
}

/// Point-in-time view of the backpressure controller.
///
/// ```rust
/// use floodgate::{BackpressureConfig, BackpressureController};
///
/// let controller = BackpressureController::new(BackpressureConfig::testing());
/// controller.publish("orders", serde_json::json!({"id": 1}), floodgate::Priority::High);
///
/// let metrics = controller.metrics();
/// assert_eq!(metrics.queue_depth, 1);
/// assert_eq!(metrics.max_queue_size, 100);
/// println!("{}", metrics.summary());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerMetrics {
    /// When the snapshot was taken (ms since UNIX epoch).
    pub timestamp_ms: u64,
    /// Current degradation level.
    pub degradation_level: DegradationLevel,
    /// True if any subject's breaker is open or half-open.
    pub circuit_breaker_open: bool,
    /// Number of breakers open or half-open.
    pub open_circuit_breakers: usize,

    /// Entries queued.
    pub queue_depth: usize,
    /// Payloads queued, counting every member of a batch.
    pub queued_payloads: usize,
    /// Entries per priority `[low, medium, high, critical]`.
    pub queue_depth_by_priority: [usize; 4],
    /// Configured queue capacity.
    pub max_queue_size: usize,
    /// Rough bytes held by the queue.
    pub queue_bytes: usize,
    /// True while a drain is in progress.
    pub draining: bool,

    /// Publish attempts since startup.
    pub total_published: u64,
    /// Publish attempts that were accepted.
    pub total_accepted: u64,
    /// Payloads coalesced into an existing entry.
    pub total_batched: u64,
    /// Entries handed to the worker pool.
    pub total_dequeued: u64,
    /// Entries forwarded by drains.
    pub total_drained: u64,
    /// Entries discarded by `clear_queue`.
    pub total_cleared: u64,
    /// Drops broken down by reason.
    pub drops: DropCounts,
    /// Fraction of publish attempts that ended in a drop.
    pub drop_rate: f64,

    /// Publish attempts per second over the last window.
    pub publish_rate: f64,
    /// Last sampled process memory (MB).
    pub memory_usage_mb: f64,
    /// Last sampled CPU usage (percent).
    pub cpu_usage_percent: f64,
    /// Worst signal ratio of the last evaluation.
    pub worst_ratio: f64,
}

impl ControllerMetrics {
    /// Total drops across all reasons.
    #[inline]
    pub fn total_dropped(&self) -> u64 {
        self.drops.total()
    }

    /// Queue depth relative to capacity (0.0 to 1.0+).
    #[inline]
    pub fn queue_utilization(&self) -> f64 {
        if self.max_queue_size == 0 {
            return 0.0;
        }
        self.queue_depth as f64 / self.max_queue_size as f64
    }

    /// Overall health derived from level, breakers and queue depth.
    pub fn health_status(&self) -> HealthStatus {
        if self.degradation_level == DegradationLevel::High || self.queue_utilization() >= 1.0 {
            HealthStatus::Unhealthy
        } else if self.degradation_level != DegradationLevel::None
            || self.circuit_breaker_open
            || self.draining
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Human-readable report suitable for logging.
    pub fn summary(&self) -> String {
        format!(
            "Backpressure Controller Metrics:\n\
             ├─ State:\n\
             │  ├─ Degradation Level: {}\n\
             │  ├─ Worst Ratio: {:.2}\n\
             │  ├─ Open Breakers: {}\n\
             │  └─ Draining: {}\n\
             ├─ Queue:\n\
             │  ├─ Depth: {}/{} ({:.1}%)\n\
             │  ├─ Payloads: {}\n\
             │  └─ By Priority (low/medium/high/critical): {}/{}/{}/{}\n\
             ├─ Traffic:\n\
             │  ├─ Published: {}\n\
             │  ├─ Accepted: {}\n\
             │  ├─ Publish Rate: {:.1}/s\n\
             │  └─ Drop Rate: {:.2}%\n\
             ├─ Drops:\n\
             │  ├─ circuit_open: {}\n\
             │  ├─ queue_full: {}\n\
             │  ├─ sampled: {}\n\
             │  └─ rate_limited: {}\n\
             └─ Health:\n\
                ├─ Status: {}\n\
                ├─ Memory: {:.1} MB\n\
                └─ CPU: {:.1}%",
            self.degradation_level,
            self.worst_ratio,
            self.open_circuit_breakers,
            self.draining,
            self.queue_depth,
            self.max_queue_size,
            self.queue_utilization() * 100.0,
            self.queued_payloads,
            self.queue_depth_by_priority[0],
            self.queue_depth_by_priority[1],
            self.queue_depth_by_priority[2],
            self.queue_depth_by_priority[3],
            self.total_published,
            self.total_accepted,
            self.publish_rate,
            self.drop_rate * 100.0,
            self.drops.circuit_open,
            self.drops.queue_full,
            self.drops.sampled,
            self.drops.rate_limited,
            self.health_status(),
            self.memory_usage_mb,
            self.cpu_usage_percent,
        )
    }
}

impl fmt::Display for ControllerMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.summary())
    }
}

/// Three-level health assessment used by status endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Operating inside every budget.
    Healthy,
    /// Shedding some load or isolating failing subjects.
    Degraded,
    /// Shedding heavily or out of queue space.
    Unhealthy,
}

impl HealthStatus {
    /// HTTP status code an admin surface reports for this health.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Healthy => 200,
            Self::Degraded => 206,
            Self::Unhealthy => 503,
        }
    }

    /// Returns true if the status indicates any problem.
    pub fn is_unhealthy(&self) -> bool {
        !matches!(self, Self::Healthy)
    }

    /// Returns a suggested action based on the health status.
    pub fn suggested_action(&self) -> &'static str {
        match self {
            Self::Healthy => "No action needed",
            Self::Degraded => "Monitor closely, consider scaling workers",
            Self::Unhealthy => "Immediate action required: scale up, drain, or reduce load",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "✅ Healthy"),
            Self::Degraded => write!(f, "⚠️ Degraded"),
            Self::Unhealthy => write!(f, "🔴 Unhealthy"),
        }
    }
}

/// One degradation level transition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DegradationRecord {
    /// When the transition happened.
    pub timestamp_ms: u64,
    /// Level before.
    pub old: DegradationLevel,
    /// Level after.
    pub new: DegradationLevel,
    /// Worst ratio that triggered it.
    pub max_ratio: f64,
}

/// Compact metrics sample kept for time-ranged queries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricsSample {
    /// When the sample was taken.
    pub timestamp_ms: u64,
    /// Level after the evaluation.
    pub degradation_level: DegradationLevel,
    /// Worst signal ratio.
    pub worst_ratio: f64,
    /// Queue depth in entries.
    pub queue_depth: usize,
    /// Publish attempts per second.
    pub publish_rate: f64,
    /// Process memory (MB).
    pub memory_usage_mb: f64,
    /// CPU usage (percent).
    pub cpu_usage_percent: f64,
    /// Drops since the previous sample.
    pub dropped: u64,
}

/// How urgent a recommendation is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational.
    Info,
    /// Should be looked at.
    Warning,
    /// Needs action now.
    Critical,
}

/// Operator advice derived from current metrics and recent history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recommendation {
    /// How urgent the advice is.
    pub severity: Severity,
    /// Short machine-friendly topic, e.g. `queue` or `flapping`.
    pub category: &'static str,
    /// Advice for a human.
    pub message: String,
}

impl Recommendation {
    fn new(severity: Severity, category: &'static str, message: String) -> Self {
        Self {
            severity,
            category,
            message,
        }
    }
}

/// Transitions inside this window count towards flapping.
const FLAPPING_WINDOW_MS: u64 = 60_000;
/// Transitions inside the window that indicate flapping.
const FLAPPING_TRANSITIONS: usize = 6;

/// Builds recommendations, most severe first.
pub(crate) fn recommendations(
    metrics: &ControllerMetrics,
    history: &[DegradationRecord],
    config: &BackpressureConfig,
) -> Vec<Recommendation> {
    let mut out = Vec::new();

    let utilization = metrics.queue_utilization();
    if utilization >= 1.0 {
        out.push(Recommendation::new(
            Severity::Critical,
            "queue",
            format!(
                "Queue is full ({} entries); scale workers, drain, or raise max_queue_size",
                metrics.queue_depth
            ),
        ));
    } else if utilization >= config.medium_threshold {
        out.push(Recommendation::new(
            Severity::Warning,
            "queue",
            format!(
                "Queue at {:.0}% of capacity; consider scaling workers",
                utilization * 100.0
            ),
        ));
    }

    if metrics.drop_rate > 0.1 {
        let reason = metrics
            .drops
            .dominant()
            .map(|r| r.as_str())
            .unwrap_or("unknown");
        let severity = if metrics.drop_rate > 0.5 {
            Severity::Critical
        } else {
            Severity::Warning
        };
        out.push(Recommendation::new(
            severity,
            "drops",
            format!(
                "{:.1}% of publishes dropped, mostly `{}`",
                metrics.drop_rate * 100.0,
                reason
            ),
        ));
    }

    if metrics.open_circuit_breakers > 0 {
        out.push(Recommendation::new(
            Severity::Warning,
            "circuit_breaker",
            format!(
                "{} circuit breaker(s) open; check the failing destinations",
                metrics.open_circuit_breakers
            ),
        ));
    }

    let cutoff = metrics.timestamp_ms.saturating_sub(FLAPPING_WINDOW_MS);
    let recent = history.iter().filter(|r| r.timestamp_ms >= cutoff).count();
    if recent >= FLAPPING_TRANSITIONS {
        out.push(Recommendation::new(
            Severity::Warning,
            "flapping",
            format!(
                "{recent} level changes in the last minute; raise recovery_delay_ms (now {}ms)",
                config.recovery_delay_ms
            ),
        ));
    }

    let memory_ratio = metrics.memory_usage_mb / config.max_memory_usage_mb as f64;
    if memory_ratio >= config.medium_threshold {
        out.push(Recommendation::new(
            Severity::Warning,
            "memory",
            format!(
                "Memory at {:.0}% of budget ({:.0} MB)",
                memory_ratio * 100.0,
                metrics.memory_usage_mb
            ),
        ));
    }

    let cpu_ratio = metrics.cpu_usage_percent / config.max_cpu_usage_percent;
    if cpu_ratio >= config.medium_threshold {
        out.push(Recommendation::new(
            Severity::Warning,
            "cpu",
            format!("CPU at {:.0}% of budget", cpu_ratio * 100.0),
        ));
    }

    let rate_ratio = metrics.publish_rate / config.max_publish_rate as f64;
    if rate_ratio >= config.medium_threshold {
        out.push(Recommendation::new(
            Severity::Warning,
            "publish_rate",
            format!(
                "Publish rate {:.0}/s is near max_publish_rate {}",
                metrics.publish_rate, config.max_publish_rate
            ),
        ));
    }

    if out.is_empty() {
        out.push(Recommendation::new(
            Severity::Info,
            "healthy",
            "Operating within all budgets".to_string(),
        ));
    }

    out.sort_by(|a, b| b.severity.cmp(&a.severity));
    out
}
