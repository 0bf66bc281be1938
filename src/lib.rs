//! # Floodgate - Admission Control for Multi-Tenant Publishing
//!
//! Floodgate sits between producers and a downstream transport and decides,
//! message by message, whether to accept, queue or shed load. It keeps a
//! process healthy when memory, CPU, queue depth or publish rate climb, and
//! keeps the accounts that share a platform's quota from starving each other.
//!
//! ## Components
//!
//! - **Backpressure Controller** - admission decisions, the degradation state
//!   machine, priority sampling and the bounded priority queue
//! - **Circuit Breaker Registry** - per-subject breakers fed by send results
//! - **Rate Limit Ledger** - minute, hour, day and burst counters per
//!   (credential, platform, endpoint)
//! - **Fair-Share Scheduler** - weighted fairness between credentials of one
//!   platform
//! - **Worker Pool Manager** - per-platform lanes of sender threads
//! - **Admin Surface** - operational entry points for tooling
//!
//! ## Architecture Overview
//!
//! ```text
//!                    ┌─────────────────────────┐
//!                    │       Producers         │
//!                    └──────────┬──────────────┘
//!                               │ publish()
//!                    ┌──────────▼──────────────┐
//!                    │ BackpressureController  │◄── monitor thread (tick)
//!                    ├─────────────────────────┤
//!                    │ • breakers              │
//!                    │ • sampling curve        │
//!                    │ • priority queue        │
//!                    └──────────┬──────────────┘
//!                               │ dequeue()
//!                    ┌──────────▼──────────────┐
//!                    │   WorkerPoolManager     │
//!                    ├─────────────────────────┤
//!                    │ lane per platform       │──► FairShareScheduler
//!                    │ workers per lane        │──► RateLimitLedger
//!                    └──────────┬──────────────┘
//!                               │ send()
//!                    ┌──────────▼──────────────┐
//!                    │       Transport         │
//!                    └─────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use floodgate::{BackpressureConfig, ControllerBuilder, Priority};
//! use serde_json::json;
//!
//! let controller = ControllerBuilder::new()
//!     .config(BackpressureConfig::testing())
//!     .build()
//!     .unwrap();
//!
//! if controller.publish("orders", json!({"id": 1}), Priority::High) {
//!     let batch = controller.dequeue(32);
//!     assert_eq!(batch.len(), 1);
//! }
//! ```
//!
//! ### Rate limits
//!
//! ```rust
//! use floodgate::ledger::{AttemptTag, PlatformRateLimitConfig, RateLimitKey, RateLimitLedger};
//! use uuid::Uuid;
//!
//! let ledger = RateLimitLedger::new();
//! ledger
//!     .load_platform_configs(vec![PlatformRateLimitConfig::for_platform("tiktok").per_minute(2)])
//!     .unwrap();
//!
//! let key = RateLimitKey::new("acct-1", "tiktok", "upload");
//! assert!(ledger.meter(&key, AttemptTag::new(Uuid::now_v7(), 0)).is_allowed());
//! assert!(ledger.meter(&key, AttemptTag::new(Uuid::now_v7(), 0)).is_allowed());
//! assert!(!ledger.meter(&key, AttemptTag::new(Uuid::now_v7(), 0)).is_allowed());
//! ```
//!
//! ### Fair share
//!
//! ```rust
//! use floodgate::fairness::{FairShareConfig, FairShareScheduler};
//!
//! let scheduler = FairShareScheduler::new(FairShareConfig::default());
//! scheduler.set_weight("tiktok", "big", 3.0).unwrap();
//! scheduler.record_consumption("tiktok", "big", 3);
//! scheduler.record_consumption("tiktok", "small", 3);
//!
//! // "big" has used less of its weighted share
//! let next = scheduler.next_credential("tiktok", [("big", 0), ("small", 0)]);
//! assert_eq!(next.as_deref(), Some("big"));
//! ```
//!
//! ## Thread Safety
//!
//! Every component is `Send + Sync` and meant to be shared through `Arc`.
//! Background work (the resource monitor, the ledger's persistence writer,
//! the dispatcher and the workers) runs on named threads that stop when
//! their handle or owner is dropped.
//!
//! ## Logging
//!
//! The crate emits `tracing` events only. Call [`init_tracing`] from a
//! binary to get formatted output controlled by `RUST_LOG`.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    missing_debug_implementations
)]
#![forbid(unsafe_op_in_unsafe_fn)]

pub mod admin;
pub mod admission;
pub mod fairness;
pub mod ledger;
pub mod workers;

mod error;
mod telemetry;
mod utils;

use std::sync::Arc;

pub use admin::{AdminSurface, LoadTestReport, LoadTestSpec, StatusReport};
pub use admission::{
    BackpressureConfig, BackpressureController, ControllerMetrics, DegradationLevel, DropReason,
    HealthStatus, Priority, QueuedMessage, ResourceProbe,
};
pub use error::{
    AdminError, AdminResult, ConfigError, ConfigResult, SendError, StoreError, WorkerError,
};
pub use telemetry::init_tracing;
pub use utils::{cpu_relax, current_time_ms, CACHE_LINE_SIZE};
pub use workers::{Route, Transport, WorkerPoolConfig, WorkerPoolManager};

/// A controller wrapped in `Arc`, the way it is shared with the monitor
/// thread, the worker pool and the admin surface.
pub type SharedController = Arc<BackpressureController>;

/// Version information for the crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Minimum supported Rust version.
pub const MSRV: &str = "1.70.0";

/// Prelude module for convenient imports.
///
/// ```rust
/// use floodgate::prelude::*;
/// ```
pub mod prelude {
    //! Common imports for wiring a pipeline.
    //!
    //! # Example
    //! ```rust
    //! use floodgate::prelude::*;
    //!
    //! let controller = BackpressureController::new(BackpressureConfig::testing());
    //! assert_eq!(controller.health_status(), HealthStatus::Healthy);
    //! let _ = Priority::Critical;
    //! ```

    pub use crate::admin::AdminSurface;
    pub use crate::admission::{
        BackpressureConfig, BackpressureController, DegradationLevel, HealthStatus, Priority,
    };
    pub use crate::fairness::{FairShareConfig, FairShareScheduler};
    pub use crate::ledger::{AttemptTag, PlatformRateLimitConfig, RateLimitKey, RateLimitLedger};
    pub use crate::workers::{Route, Transport, WorkerPoolConfig, WorkerPoolManager};
    pub use crate::{ControllerBuilder, SendError, SharedController};
}

/// Builder for a [`BackpressureController`] with a custom configuration,
/// resource probe or a seeded sampler.
///
/// # Example
///
/// ```rust
/// use floodgate::admission::FixedProbe;
/// use floodgate::ControllerBuilder;
/// use std::sync::Arc;
///
/// let controller = ControllerBuilder::new()
///     .preset("testing")
///     .unwrap()
///     .probe(Arc::new(FixedProbe::new(64.0, 5.0)))
///     .rng_seed(7)
///     .build()
///     .unwrap();
///
/// assert_eq!(controller.config().max_queue_size, 100);
///
/// // Invalid configurations are rejected, not panicked on
/// let mut config = floodgate::BackpressureConfig::testing();
/// config.max_queue_size = 0;
/// assert!(ControllerBuilder::new().config(config).build().is_err());
/// ```
#[derive(Clone)]
pub struct ControllerBuilder {
    config: BackpressureConfig,
    probe: Option<Arc<dyn ResourceProbe>>,
    rng_seed: Option<u64>,
}

impl ControllerBuilder {
    /// Starts from [`BackpressureConfig::default`], the host probe and an
    /// entropy-seeded sampler.
    pub fn new() -> Self {
        Self {
            config: BackpressureConfig::default(),
            probe: None,
            rng_seed: None,
        }
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: BackpressureConfig) -> Self {
        self.config = config;
        self
    }

    /// Starts from a named preset (`testing`, `production`,
    /// `high_throughput`).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownPreset`] for any other name.
    pub fn preset(mut self, name: &str) -> ConfigResult<Self> {
        self.config = BackpressureConfig::preset(name)?;
        Ok(self)
    }

    /// Samples memory and CPU from `probe` instead of the host.
    pub fn probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Seeds the drop sampler, making shedding reproducible.
    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Builds the controller.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration fails validation.
    pub fn build(self) -> ConfigResult<BackpressureController> {
        let probe = match self.probe {
            Some(probe) => probe,
            None => Arc::new(admission::SystemProbe::new()),
        };
        BackpressureController::with_parts(self.config, probe, self.rng_seed)
    }

    /// Builds the controller behind an `Arc`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration fails validation.
    pub fn build_shared(self) -> ConfigResult<SharedController> {
        self.build().map(Arc::new)
    }
}

impl Default for ControllerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ControllerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerBuilder")
            .field("config", &self.config)
            .field("custom_probe", &self.probe.is_some())
            .field("rng_seed", &self.rng_seed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::FixedProbe;
    use serde_json::json;

    #[test]
    fn test_builder_defaults() {
        let controller = ControllerBuilder::new()
            .probe(Arc::new(FixedProbe::new(10.0, 1.0)))
            .build()
            .unwrap();
        assert_eq!(controller.degradation_level(), DegradationLevel::None);
        assert_eq!(controller.queue_depth(), 0);
    }

    #[test]
    fn test_builder_preset() {
        let controller = ControllerBuilder::new()
            .preset("production")
            .unwrap()
            .probe(Arc::new(FixedProbe::new(10.0, 1.0)))
            .build()
            .unwrap();
        assert_eq!(controller.config().max_queue_size, 10_000);
    }

    #[test]
    fn test_builder_unknown_preset() {
        let result = ControllerBuilder::new().preset("turbo");
        assert!(matches!(result, Err(ConfigError::UnknownPreset(_))));
    }

    #[test]
    fn test_builder_validation() {
        let mut config = BackpressureConfig::testing();
        config.max_queue_size = 0;
        let result = ControllerBuilder::new()
            .config(config)
            .probe(Arc::new(FixedProbe::new(10.0, 1.0)))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_build_shared_across_threads() {
        let controller = ControllerBuilder::new()
            .config(BackpressureConfig::testing())
            .probe(Arc::new(FixedProbe::new(10.0, 1.0)))
            .rng_seed(1)
            .build_shared()
            .unwrap();

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let controller = Arc::clone(&controller);
                std::thread::spawn(move || {
                    for i in 0..10 {
                        controller.publish(
                            &format!("subject-{t}"),
                            json!({ "i": i }),
                            Priority::High,
                        );
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(controller.metrics().total_published, 40);
    }

    #[test]
    fn test_prelude_imports() {
        use crate::prelude::*;

        let _config = BackpressureConfig::testing();
        let _scheduler = FairShareScheduler::new(FairShareConfig::default());
        let _ledger = RateLimitLedger::new();
        let _route = Route::parse("tiktok:acct");
        let _status = HealthStatus::Healthy;
    }

    #[test]
    fn test_constants() {
        assert!(!VERSION.is_empty());
        assert_eq!(MSRV, "1.70.0");
    }
}
