//! Core admission data model: degradation levels, priorities, queued
//! messages and drop reasons.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How aggressively the controller is shedding work.
///
/// Totally ordered: `None < Low < Medium < High`. Stored in an `AtomicU8`
/// by the controller, hence the `u8` round-trip helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum DegradationLevel {
    /// Normal operation, every message is admitted.
    None = 0,
    /// Light sampling of non-critical traffic.
    Low = 1,
    /// Batching and heavier sampling.
    Medium = 2,
    /// Only `high` and `critical` traffic is guaranteed.
    High = 3,
}

impl DegradationLevel {
    /// All levels in ascending order.
    pub const ALL: [DegradationLevel; 4] = [Self::None, Self::Low, Self::Medium, Self::High];

    /// Convert to u8 for atomic storage.
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Convert from u8 (from atomic load). Out-of-range values map to `High`.
    #[inline]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::None,
            1 => Self::Low,
            2 => Self::Medium,
            _ => Self::High,
        }
    }

    /// The next lower level, saturating at `None`.
    #[inline]
    pub const fn step_down(self) -> Self {
        match self {
            Self::None | Self::Low => Self::None,
            Self::Medium => Self::Low,
            Self::High => Self::Medium,
        }
    }

    /// Index into per-level tables.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Lowercase name as used in events and metrics.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl Default for DegradationLevel {
    fn default() -> Self {
        Self::None
    }
}

impl fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message priority. Totally ordered: `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Priority {
    /// Best-effort traffic, first to be sampled away.
    Low = 0,
    /// Default priority.
    Medium = 1,
    /// Important traffic, guaranteed up to `high` degradation.
    High = 2,
    /// Never sampled; only a full queue or an open breaker drops it.
    Critical = 3,
}

impl Priority {
    /// All priorities from highest to lowest, the dequeue order.
    pub const DESCENDING: [Priority; 4] = [Self::Critical, Self::High, Self::Medium, Self::Low];

    /// Index into per-priority tables.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Lowercase name as used in events and metrics.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Medium
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// Why a message did not make it downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// The subject's circuit breaker rejected it.
    CircuitOpen,
    /// No room in the queue, or the queue is draining.
    QueueFull,
    /// Load shedding drew it out, or it aged out of the queue.
    Sampled,
    /// Its credential ran out of platform budget.
    RateLimited,
}

impl DropReason {
    /// All reasons, in the order used for per-reason counters.
    pub const ALL: [DropReason; 4] = [
        Self::CircuitOpen,
        Self::QueueFull,
        Self::Sampled,
        Self::RateLimited,
    ];

    /// Index into per-reason counters.
    #[inline]
    pub const fn index(self) -> usize {
        match self {
            Self::CircuitOpen => 0,
            Self::QueueFull => 1,
            Self::Sampled => 2,
            Self::RateLimited => 3,
        }
    }

    /// Wire name carried by `message_dropped` events.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CircuitOpen => "circuit_open",
            Self::QueueFull => "queue_full",
            Self::Sampled => "sampled",
            Self::RateLimited => "rate_limited",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message accepted by the controller and waiting in its queue.
///
/// Owned exclusively by the controller until it is dequeued, drained,
/// cleared or dropped. When batching is active several payloads for the
/// same subject share one entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    /// UUIDv7, so ids sort by creation time.
    pub id: Uuid,
    /// Destination subject (topic, account, or `platform:credential[:endpoint]`).
    pub subject: String,
    /// One payload, or several when batching coalesced them.
    pub payloads: Vec<serde_json::Value>,
    /// Admission priority.
    pub priority: Priority,
    /// When the entry was first enqueued (ms since UNIX epoch).
    pub enqueued_at_ms: u64,
}

impl QueuedMessage {
    /// Create a single-payload message with a fresh UUIDv7 id.
    pub fn new(
        subject: impl Into<String>,
        payload: serde_json::Value,
        priority: Priority,
        enqueued_at_ms: u64,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            subject: subject.into(),
            payloads: vec![payload],
            priority,
            enqueued_at_ms,
        }
    }

    /// Number of coalesced payloads carried by this entry.
    #[inline]
    pub fn batch_size(&self) -> usize {
        self.payloads.len()
    }

    /// Rough in-memory footprint, used for queue accounting.
    pub fn estimated_bytes(&self) -> usize {
        let payload_bytes: usize = self.payloads.iter().map(value_bytes).sum();
        std::mem::size_of::<Self>() + self.subject.len() + payload_bytes
    }
}

// Structural estimate; avoids serializing on the publish path.
fn value_bytes(value: &serde_json::Value) -> usize {
    use serde_json::Value;
    let own = std::mem::size_of::<Value>();
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => own,
        Value::String(s) => own + s.len(),
        Value::Array(items) => own + items.iter().map(value_bytes).sum::<usize>(),
        Value::Object(map) => {
            own + map
                .iter()
                .map(|(k, v)| k.len() + value_bytes(v))
                .sum::<usize>()
        }
    }
}
