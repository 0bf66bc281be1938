//! # Admission Module
//!
//! Everything that decides whether a publish is accepted.
//!
//! ## Module Structure
//!
//! ```text
//!     admission/
//!     ├── mod.rs          (Module organization)
//!     ├── types.rs        (Levels, priorities, queued messages, drop reasons)
//!     ├── config.rs       (BackpressureConfig, presets, sampling curve)
//!     ├── controller.rs   (Publish path, degradation state machine, monitor)
//!     ├── breaker.rs      (Per-subject circuit breakers)
//!     ├── queue.rs        (Bounded priority queue with batching and aging)
//!     ├── probe.rs        (Memory/CPU probes, publish rate tracker)
//!     ├── events.rs       (Observer side channel)
//!     └── metrics.rs      (Snapshots, health, history, recommendations)
//! ```
//!
//! ## Architecture Flow
//!
//! ```text
//!     publish() ──► Controller ──► Breaker Registry
//!                       │
//!                       ├──► Sampling curve (config)
//!                       ├──► Priority queue ──► dequeue() ──► workers
//!                       └──► EventBus ──► sinks / subscribers
//!
//!     monitor thread ──► tick() ──► probe + queue depth + publish rate
//!                                        └──► degradation level
//! ```

mod breaker;
mod config;
mod controller;
mod events;
mod metrics;
mod probe;
mod queue;
mod types;

/// Per-subject circuit breakers
pub use breaker::{BreakerAdmission, BreakerSnapshot, BreakerState, CircuitBreakerRegistry};

/// Controller configuration and presets
pub use config::{BackpressureConfig, SamplingCurve, PRESET_NAMES};

/// The admission controller and its monitor handle
pub use controller::{BackpressureController, MonitorHandle};

/// Observer side channel
pub use events::{ControllerEvent, EventSink, SUBSCRIBER_CAPACITY};

/// Metrics, health and analytics
pub use metrics::{
    ControllerMetrics, DegradationRecord, DropCounts, HealthStatus, MetricsSample,
    Recommendation, Severity,
};

/// Resource sampling
pub use probe::{FixedProbe, RateTracker, ResourceProbe, ResourceUsage, SystemProbe};

/// Core data model
pub use types::{DegradationLevel, DropReason, Priority, QueuedMessage};
