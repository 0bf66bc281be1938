//! # Admin Surface
//!
//! Programmatic operations for operational tooling. An HTTP layer maps
//! onto these one to one; every error is returned synchronously with
//! enough detail to correct the input.
//!
//! ```text
//!     status / metrics / analytics  ─► BackpressureController
//!     breakers / drain / clear      ─► BackpressureController
//!     presets / config              ─► BackpressureController (atomic swap)
//!     load test start / stop        ─► floodgate-loadtest thread
//!     rate limits                   ─► RateLimitLedger
//!     scheduling                    ─► FairShareScheduler
//!     scale / restart / health      ─► WorkerPoolManager
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::admission::{
    BackpressureConfig, BackpressureController, ControllerMetrics, DegradationLevel,
    DegradationRecord, HealthStatus, MetricsSample, Priority, Recommendation,
};
use crate::error::{AdminError, AdminResult, ConfigError, WorkerError};
use crate::fairness::{FairShareScheduler, FairShareSnapshot, FairnessCheck};
use crate::ledger::{PlatformRateLimitConfig, RateLimitKey, RateLimitLedger, RateLimitStatus};
use crate::utils::current_time_ms;
use crate::workers::{PoolHealth, WorkerPoolManager};

/// Answer of [`AdminSurface::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    /// Overall health.
    pub health: HealthStatus,
    /// 200 healthy, 206 degraded, 503 unhealthy.
    pub http_status: u16,
    /// Current degradation level.
    pub degradation_level: DegradationLevel,
    /// Entries queued.
    pub queue_depth: usize,
    /// Subjects whose breaker is not closed.
    pub open_circuit_breakers: Vec<String>,
    /// What an operator should do.
    pub suggested_action: &'static str,
    /// Worker pool liveness, when a pool is attached.
    pub workers: Option<PoolHealth>,
}

/// Parameters of a synthetic load test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadTestSpec {
    /// Subjects are `{subject_prefix}-{n % subjects}`.
    pub subject_prefix: String,
    /// Distinct subjects to spread the load over.
    pub subjects: usize,
    /// Target publish rate.
    pub messages_per_second: u64,
    /// How long to run.
    pub duration_ms: u64,
    /// Priority of every generated message.
    pub priority: Priority,
}

impl Default for LoadTestSpec {
    fn default() -> Self {
        Self {
            subject_prefix: "loadtest".to_string(),
            subjects: 10,
            messages_per_second: 100,
            duration_ms: 10_000,
            priority: Priority::Low,
        }
    }
}

impl LoadTestSpec {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.subject_prefix.is_empty() {
            return Err(ConfigError::invalid("subject_prefix", "must not be empty"));
        }
        if self.subjects == 0 {
            return Err(ConfigError::invalid("subjects", "must be greater than 0"));
        }
        if self.messages_per_second == 0 || self.messages_per_second > 1_000_000 {
            return Err(ConfigError::invalid(
                "messages_per_second",
                "must be between 1 and 1000000",
            ));
        }
        if self.duration_ms == 0 {
            return Err(ConfigError::invalid("duration_ms", "must be greater than 0"));
        }
        Ok(())
    }
}

/// Progress of a load test.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadTestReport {
    /// Run id.
    pub id: Uuid,
    /// What was requested.
    pub spec: LoadTestSpec,
    /// When it started.
    pub started_at_ms: u64,
    /// Time since start, or total run time once finished.
    pub elapsed_ms: u64,
    /// Publishes attempted.
    pub published: u64,
    /// Publishes accepted.
    pub accepted: u64,
    /// Whether the generator is still running.
    pub running: bool,
}

impl LoadTestReport {
    /// Publishes rejected by admission control.
    pub fn rejected(&self) -> u64 {
        self.published.saturating_sub(self.accepted)
    }
}

#[derive(Default)]
struct LoadTestCounters {
    published: AtomicU64,
    accepted: AtomicU64,
    finished_at_ms: AtomicU64,
}

struct LoadTestRun {
    id: Uuid,
    spec: LoadTestSpec,
    started_at_ms: u64,
    counters: Arc<LoadTestCounters>,
    stop_tx: mpsc::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl LoadTestRun {
    fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn report(&self) -> LoadTestReport {
        let finished = self.counters.finished_at_ms.load(Ordering::Acquire);
        let end = if finished == 0 { current_time_ms() } else { finished };
        LoadTestReport {
            id: self.id,
            spec: self.spec.clone(),
            started_at_ms: self.started_at_ms,
            elapsed_ms: end.saturating_sub(self.started_at_ms),
            published: self.counters.published.load(Ordering::Relaxed),
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            running: self.is_running(),
        }
    }

    fn stop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(id = %self.id, "Load test thread panicked");
            }
        }
    }
}

/// Operational entry point over the controller, ledger, scheduler and
/// (optionally) the worker pool.
pub struct AdminSurface {
    controller: Arc<BackpressureController>,
    ledger: Arc<RateLimitLedger>,
    scheduler: Arc<FairShareScheduler>,
    pool: Option<Arc<WorkerPoolManager>>,
    load_test: Mutex<Option<LoadTestRun>>,
}

impl AdminSurface {
    /// Admin surface without a worker pool.
    pub fn new(
        controller: Arc<BackpressureController>,
        ledger: Arc<RateLimitLedger>,
        scheduler: Arc<FairShareScheduler>,
    ) -> Self {
        Self {
            controller,
            ledger,
            scheduler,
            pool: None,
            load_test: Mutex::new(None),
        }
    }

    /// Attaches a worker pool for scaling and health operations.
    pub fn with_pool(mut self, pool: Arc<WorkerPoolManager>) -> Self {
        self.pool = Some(pool);
        self
    }

    fn pool(&self) -> AdminResult<&WorkerPoolManager> {
        self.pool
            .as_deref()
            .ok_or_else(|| AdminError::NotFound("no worker pool attached".into()))
    }

    // ------------------------------------------------------------------
    // Status and metrics
    // ------------------------------------------------------------------

    /// Health summary with its HTTP status code.
    ///
    /// A failed worker pool health check downgrades a healthy controller
    /// to degraded.
    pub fn status(&self) -> StatusReport {
        let metrics = self.controller.metrics();
        let workers = self.pool.as_ref().map(|p| p.health_check());
        let mut health = metrics.health_status();
        if health == HealthStatus::Healthy && workers.as_ref().is_some_and(|w| !w.healthy) {
            health = HealthStatus::Degraded;
        }
        StatusReport {
            health,
            http_status: health.http_status(),
            degradation_level: metrics.degradation_level,
            queue_depth: metrics.queue_depth,
            open_circuit_breakers: self
                .controller
                .breakers()
                .open_subjects()
                .into_iter()
                .map(|s| s.subject)
                .collect(),
            suggested_action: health.suggested_action(),
            workers,
        }
    }

    /// Full metrics snapshot.
    pub fn metrics(&self) -> ControllerMetrics {
        self.controller.metrics()
    }

    // ------------------------------------------------------------------
    // Circuit breakers and queue
    // ------------------------------------------------------------------

    /// Manually opens `subject`'s breaker. `false` if already open.
    pub fn open_circuit_breaker(&self, subject: &str) -> bool {
        info!(subject, "Admin opening circuit breaker");
        self.controller.open_circuit_breaker(subject)
    }

    /// Closes `subject`'s breaker. `false` if already closed.
    pub fn close_circuit_breaker(&self, subject: &str) -> bool {
        info!(subject, "Admin closing circuit breaker");
        self.controller.close_circuit_breaker(subject)
    }

    /// Forwards every queued entry downstream. Returns how many were taken.
    pub fn drain_queue(&self) -> usize {
        self.controller.drain_queue()
    }

    /// Discards every queued entry. Returns how many were discarded.
    pub fn clear_queue(&self) -> usize {
        self.controller.clear_queue()
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// Current controller configuration.
    pub fn config(&self) -> Arc<BackpressureConfig> {
        self.controller.config()
    }

    /// Replaces the controller configuration with a named preset.
    pub fn apply_preset(&self, name: &str) -> AdminResult<()> {
        self.controller.apply_preset(name)?;
        Ok(())
    }

    /// Replaces the controller configuration.
    pub fn update_config(&self, config: BackpressureConfig) -> AdminResult<()> {
        self.controller.update_config(config)?;
        Ok(())
    }

    /// Replaces the controller configuration from TOML. Unspecified
    /// options take their defaults.
    pub fn update_config_toml(&self, text: &str) -> AdminResult<()> {
        let config = BackpressureConfig::from_toml_str(text)?;
        self.update_config(config)
    }

    // ------------------------------------------------------------------
    // Load testing
    // ------------------------------------------------------------------

    /// Starts a synthetic publisher.
    ///
    /// Fails with [`AdminError::Conflict`] while another load test runs.
    pub fn start_load_test(&self, spec: LoadTestSpec) -> AdminResult<Uuid> {
        spec.validate()?;
        let mut slot = self.load_test.lock();
        if let Some(run) = slot.as_ref() {
            if run.is_running() {
                return Err(AdminError::Conflict(format!(
                    "load test {} is already running",
                    run.id
                )));
            }
        }

        let id = Uuid::now_v7();
        let counters = Arc::new(LoadTestCounters::default());
        let (stop_tx, stop_rx) = mpsc::channel();
        let controller = Arc::clone(&self.controller);
        let thread_counters = Arc::clone(&counters);
        let thread_spec = spec.clone();
        let started_at_ms = current_time_ms();

        let handle = thread::Builder::new()
            .name("floodgate-loadtest".to_string())
            .spawn(move || run_load_test(&controller, &thread_spec, &thread_counters, stop_rx))
            .map_err(|e| WorkerError::Spawn(e.to_string()))?;

        info!(
            %id,
            rate = spec.messages_per_second,
            duration_ms = spec.duration_ms,
            "Load test started"
        );
        *slot = Some(LoadTestRun {
            id,
            spec,
            started_at_ms,
            counters,
            stop_tx,
            handle: Some(handle),
        });
        Ok(id)
    }

    /// Stops the running load test and returns its final report.
    pub fn stop_load_test(&self) -> AdminResult<LoadTestReport> {
        let mut slot = self.load_test.lock();
        match slot.as_mut() {
            Some(run) if run.is_running() => {
                run.stop();
                let report = run.report();
                info!(id = %run.id, published = report.published, "Load test stopped");
                Ok(report)
            }
            _ => Err(AdminError::NotFound("no load test is running".into())),
        }
    }

    /// Report of the current or most recent load test.
    pub fn load_test_status(&self) -> Option<LoadTestReport> {
        self.load_test.lock().as_ref().map(LoadTestRun::report)
    }

    // ------------------------------------------------------------------
    // Analytics
    // ------------------------------------------------------------------

    /// Degradation level transitions, oldest first.
    pub fn degradation_history(&self) -> Vec<DegradationRecord> {
        self.controller.degradation_history()
    }

    /// Tuning advice derived from current metrics and history.
    pub fn recommendations(&self) -> Vec<Recommendation> {
        self.controller.recommendations()
    }

    /// Metrics samples taken between `from_ms` and `to_ms` inclusive.
    pub fn metrics_history(&self, from_ms: u64, to_ms: u64) -> AdminResult<Vec<MetricsSample>> {
        if from_ms > to_ms {
            return Err(ConfigError::invalid("from_ms", "must not be after to_ms").into());
        }
        Ok(self.controller.metrics_history(from_ms, to_ms))
    }

    // ------------------------------------------------------------------
    // Rate limits
    // ------------------------------------------------------------------

    /// Every platform rate limit config.
    pub fn platform_configs(&self) -> Vec<PlatformRateLimitConfig> {
        self.ledger.platform_configs()
    }

    /// Adds or replaces one platform config.
    pub fn update_platform_config(&self, config: PlatformRateLimitConfig) -> AdminResult<()> {
        self.ledger.update_platform_config(config)?;
        Ok(())
    }

    /// Replaces every platform config.
    pub fn load_platform_configs(&self, configs: Vec<PlatformRateLimitConfig>) -> AdminResult<()> {
        self.ledger.load_platform_configs(configs)?;
        Ok(())
    }

    /// Clears counters of `credential`. Returns how many keys were reset.
    pub fn reset_rate_limits(
        &self,
        credential: &str,
        platform: Option<&str>,
        endpoint: Option<&str>,
    ) -> usize {
        self.ledger.reset_rate_limits(credential, platform, endpoint)
    }

    /// Remaining budget of one key.
    pub fn rate_limit_status(&self, key: &RateLimitKey) -> RateLimitStatus {
        self.ledger.get_rate_limit_status(key)
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    /// Sets a credential's scheduling weight.
    pub fn set_credential_weight(
        &self,
        platform: &str,
        credential: &str,
        weight: f64,
    ) -> AdminResult<()> {
        self.scheduler.set_weight(platform, credential, weight)?;
        Ok(())
    }

    /// Sets a credential's tie-break priority (1..=10).
    pub fn set_credential_priority(
        &self,
        platform: &str,
        credential: &str,
        priority: u8,
    ) -> AdminResult<()> {
        self.scheduler.set_priority(platform, credential, priority)?;
        Ok(())
    }

    /// Includes or excludes a credential from fairness checks.
    pub fn set_credential_active(&self, platform: &str, credential: &str, active: bool) {
        self.scheduler.set_active(platform, credential, active);
    }

    /// Per-credential fair-share numbers of `platform`.
    pub fn fair_share_state(&self, platform: &str) -> AdminResult<FairShareSnapshot> {
        self.scheduler
            .get_fair_share_state(platform)
            .ok_or_else(|| AdminError::NotFound(format!("platform {platform}")))
    }

    /// Fairness check of `platform`.
    pub fn check_fairness(&self, platform: &str) -> FairnessCheck {
        self.scheduler.check_fairness(platform)
    }

    // ------------------------------------------------------------------
    // Workers
    // ------------------------------------------------------------------

    /// Scales `platform`'s worker lane. Returns the resulting count.
    pub fn scale_workers(&self, platform: &str) -> AdminResult<usize> {
        Ok(self.pool()?.scale_workers(platform))
    }

    /// Restarts `platform`'s workers.
    pub fn restart_workers(&self, platform: &str) -> AdminResult<usize> {
        Ok(self.pool()?.restart_workers(platform)?)
    }

    /// Worker pool liveness.
    pub fn worker_health(&self) -> AdminResult<PoolHealth> {
        Ok(self.pool()?.health_check())
    }
}

impl Drop for AdminSurface {
    fn drop(&mut self) {
        if let Some(run) = self.load_test.get_mut().as_mut() {
            run.stop();
        }
    }
}

impl std::fmt::Debug for AdminSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminSurface")
            .field("controller", &self.controller.degradation_level())
            .field("ledger", &self.ledger)
            .field("pool", &self.pool)
            .field("load_test", &self.load_test_status())
            .finish()
    }
}

fn run_load_test(
    controller: &BackpressureController,
    spec: &LoadTestSpec,
    counters: &LoadTestCounters,
    stop_rx: mpsc::Receiver<()>,
) {
    let interval = Duration::from_secs_f64(1.0 / spec.messages_per_second as f64);
    let deadline = std::time::Instant::now() + Duration::from_millis(spec.duration_ms);
    let mut n: u64 = 0;

    while std::time::Instant::now() < deadline {
        match stop_rx.recv_timeout(interval) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                let subject = format!("{}-{}", spec.subject_prefix, n % spec.subjects as u64);
                let payload = serde_json::json!({ "seq": n, "load_test": true });
                counters.published.fetch_add(1, Ordering::Relaxed);
                if controller.publish(&subject, payload, spec.priority) {
                    counters.accepted.fetch_add(1, Ordering::Relaxed);
                }
                n += 1;
            }
        }
    }
    counters
        .finished_at_ms
        .store(current_time_ms(), Ordering::Release);
    info!(published = n, "Load test finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::FixedProbe;
    use serde_json::json;

    fn surface() -> AdminSurface {
        let controller = BackpressureController::with_parts(
            BackpressureConfig::testing(),
            Arc::new(FixedProbe::new(0.0, 0.0)),
            Some(11),
        )
        .unwrap();
        AdminSurface::new(
            Arc::new(controller),
            Arc::new(RateLimitLedger::new()),
            Arc::new(FairShareScheduler::default()),
        )
    }

    #[test]
    fn test_status_healthy() {
        let admin = surface();
        let status = admin.status();
        assert_eq!(status.health, HealthStatus::Healthy);
        assert_eq!(status.http_status, 200);
        assert!(status.open_circuit_breakers.is_empty());
        assert!(status.workers.is_none());
    }

    #[test]
    fn test_breaker_round_trip() {
        let admin = surface();
        assert!(admin.open_circuit_breaker("X"));
        assert!(!admin.open_circuit_breaker("X"));
        assert_eq!(admin.status().open_circuit_breakers, vec!["X".to_string()]);
        assert!(admin.close_circuit_breaker("X"));
        assert!(admin.status().open_circuit_breakers.is_empty());
    }

    #[test]
    fn test_preset_and_invalid_config() {
        let admin = surface();
        admin.apply_preset("production").unwrap();
        assert_eq!(admin.metrics().max_queue_size, 10_000);
        admin.apply_preset("testing").unwrap();
        assert_eq!(admin.metrics().max_queue_size, 100);

        assert!(matches!(
            admin.apply_preset("turbo"),
            Err(AdminError::Config(ConfigError::UnknownPreset(_)))
        ));
        assert!(matches!(
            admin.update_config_toml("max_queue_size = -1"),
            Err(AdminError::Config(ConfigError::Parse(_)))
        ));
        assert_eq!(admin.config().max_queue_size, 100);

        admin.update_config_toml("max_queue_size = 42").unwrap();
        assert_eq!(admin.config().max_queue_size, 42);
    }

    #[test]
    fn test_drain_and_clear() {
        let admin = surface();
        admin.controller.publish("a", json!(1), Priority::High);
        admin.controller.publish("b", json!(2), Priority::High);
        assert_eq!(admin.clear_queue(), 2);
        assert_eq!(admin.drain_queue(), 0);
    }

    #[test]
    fn test_second_load_test_conflicts() {
        let admin = surface();
        let spec = LoadTestSpec {
            messages_per_second: 200,
            duration_ms: 60_000,
            ..Default::default()
        };
        let id = admin.start_load_test(spec.clone()).unwrap();
        assert!(matches!(admin.start_load_test(spec), Err(AdminError::Conflict(_))));

        thread::sleep(Duration::from_millis(50));
        let report = admin.stop_load_test().unwrap();
        assert_eq!(report.id, id);
        assert!(!report.running);
        assert!(report.published > 0);
        assert!(report.accepted <= report.published);

        assert!(matches!(admin.stop_load_test(), Err(AdminError::NotFound(_))));
        assert!(admin
            .start_load_test(LoadTestSpec {
                duration_ms: 10,
                ..Default::default()
            })
            .is_ok());
    }

    #[test]
    fn test_load_test_spec_validation() {
        let admin = surface();
        let bad = LoadTestSpec {
            messages_per_second: 0,
            ..Default::default()
        };
        assert!(matches!(
            admin.start_load_test(bad),
            Err(AdminError::Config(ConfigError::InvalidValue { field: "messages_per_second", .. }))
        ));
        assert!(admin.load_test_status().is_none());
    }

    #[test]
    fn test_rate_limit_admin() {
        let admin = surface();
        assert!(admin
            .update_platform_config(PlatformRateLimitConfig::for_platform("ig").per_minute(0))
            .is_err());
        admin
            .update_platform_config(PlatformRateLimitConfig::for_platform("ig").per_minute(3))
            .unwrap();
        assert_eq!(admin.platform_configs().len(), 1);

        let key = RateLimitKey::new("acct", "ig", "media");
        let status = admin.rate_limit_status(&key);
        assert!(status.metered);
        assert_eq!(status.minute.remaining, Some(3));
        assert_eq!(admin.reset_rate_limits("acct", None, None), 0);
    }

    #[test]
    fn test_scheduling_admin() {
        let admin = surface();
        assert!(matches!(admin.fair_share_state("ig"), Err(AdminError::NotFound(_))));
        admin.set_credential_weight("ig", "a", 2.0).unwrap();
        admin.set_credential_priority("ig", "a", 7).unwrap();
        admin.set_credential_active("ig", "b", false);
        assert!(admin.set_credential_weight("ig", "a", -1.0).is_err());
        assert!(admin.set_credential_priority("ig", "a", 42).is_err());

        let state = admin.fair_share_state("ig").unwrap();
        assert_eq!(state.credentials.len(), 2);
        assert_eq!(state.credentials[0].weight, 2.0);
        assert_eq!(state.credentials[0].priority, 7);
        assert!(!state.credentials[1].active);
        assert!(admin.check_fairness("ig").fair);
    }

    #[test]
    fn test_analytics() {
        let admin = surface();
        assert!(admin.degradation_history().is_empty());
        assert!(!admin.recommendations().is_empty());
        assert!(admin.metrics_history(10, 5).is_err());
        assert!(admin.metrics_history(0, u64::MAX).unwrap().is_empty());
    }

    #[test]
    fn test_worker_ops_need_pool() {
        let admin = surface();
        assert!(matches!(admin.scale_workers("ig"), Err(AdminError::NotFound(_))));
        assert!(matches!(admin.worker_health(), Err(AdminError::NotFound(_))));
    }
}
