//! # Backpressure Controller
//!
//! The admission decision for every publish, and the degradation state
//! machine driving it.
//!
//! ## Publish Path
//!
//! ```text
//!     publish(subject, payload, priority)
//!          │
//!          ├─► breaker open for subject? ───────────────► drop: circuit_open
//!          ├─► draining and priority low? ──────────────► drop: queue_full
//!          ├─► level > none and draw < p(level, prio)? ─► drop: sampled
//!          ├─► level > none and batchable? ─────────────► coalesce, accept
//!          └─► enqueue
//!                 ├─ room ──────────────────────────────► accept
//!                 ├─ full, lower priority queued ───────► evict it, accept
//!                 └─ full ──────────────────────────────► drop: queue_full
//! ```
//!
//! The whole decision and the enqueue happen under one mutex, so `publish`,
//! `drain_queue`, `clear_queue` and `dequeue` are atomic with respect to
//! each other. The level itself lives in an `AtomicU8`: read on every
//! publish, written only by `tick`/`evaluate` (the monitor thread).
//!
//! ## Level Transitions
//!
//! ```text
//!     worst = max(queue/max_queue, mem/max_mem, rate/max_rate, cpu/max_cpu)
//!
//!     target > level ──► jump to target immediately
//!     target < level ──► step down one level once worst has stayed below
//!                        recovery_threshold_percent for recovery_delay_ms
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use crossbeam_channel::Receiver;
use parking_lot::{Mutex, RwLock};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, info, warn};

use super::breaker::CircuitBreakerRegistry;
use super::config::BackpressureConfig;
use super::events::{ControllerEvent, EventBus, EventSink};
use super::metrics::{
    self, ControllerMetrics, DegradationRecord, DropCounts, HealthStatus, MetricsSample,
    Recommendation,
};
use super::probe::{RateTracker, ResourceProbe, ResourceUsage, SystemProbe};
use super::queue::{MessageQueue, PushOutcome};
use super::types::{DegradationLevel, DropReason, Priority, QueuedMessage};
use crate::error::{ConfigResult, WorkerError};
use crate::utils::{current_time_ms, CacheAligned};
use crate::workers::{Route, Transport};

/// Level transitions kept for analytics.
const MAX_DEGRADATION_HISTORY: usize = 256;
/// Metrics samples kept for time-ranged queries.
const MAX_METRICS_HISTORY: usize = 3_600;
/// Window over which the publish rate is measured.
const PUBLISH_RATE_WINDOW_MS: u64 = 1_000;
const PUBLISH_RATE_BUCKETS: usize = 10;

struct AdmissionState {
    queue: MessageQueue,
    rng: SmallRng,
}

#[derive(Default)]
struct SignalState {
    below_recovery_since_ms: Option<u64>,
    last_usage: ResourceUsage,
    worst_ratio: f64,
    dropped_at_last_sample: u64,
}

#[derive(Default)]
struct Counters {
    published: CacheAligned<AtomicU64>,
    accepted: CacheAligned<AtomicU64>,
    batched: AtomicU64,
    dequeued: AtomicU64,
    drained: AtomicU64,
    cleared: AtomicU64,
    drops: [AtomicU64; 4],
}

impl Counters {
    fn drops(&self) -> [u64; 4] {
        [
            self.drops[0].load(Ordering::Relaxed),
            self.drops[1].load(Ordering::Relaxed),
            self.drops[2].load(Ordering::Relaxed),
            self.drops[3].load(Ordering::Relaxed),
        ]
    }
}

/// What one publish decision produced.
enum Admission {
    Enqueued,
    Batched,
    Evicted(QueuedMessage),
    Dropped(QueuedMessage, DropReason),
}

/// Admission controller shared by every publisher.
///
/// Cheap to consult from many threads; wrap it in an `Arc`.
///
/// ```rust
/// use floodgate::{BackpressureConfig, BackpressureController, Priority};
/// use serde_json::json;
///
/// let controller = BackpressureController::new(BackpressureConfig::testing());
///
/// assert!(controller.publish("orders", json!({"id": 1}), Priority::Medium));
///
/// controller.open_circuit_breaker("orders");
/// assert!(!controller.publish("orders", json!({"id": 2}), Priority::Critical));
///
/// let batch = controller.dequeue(10);
/// assert_eq!(batch.len(), 1);
/// ```
pub struct BackpressureController {
    config: RwLock<Arc<BackpressureConfig>>,
    level: AtomicU8,
    state: Mutex<AdmissionState>,
    signals: Mutex<SignalState>,
    breakers: Arc<CircuitBreakerRegistry>,
    events: Arc<EventBus>,
    probe: Arc<dyn ResourceProbe>,
    publish_rate: RateTracker,
    counters: Arc<Counters>,
    degradation_history: Mutex<VecDeque<DegradationRecord>>,
    metrics_history: Mutex<VecDeque<MetricsSample>>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    active_drains: Arc<AtomicUsize>,
}

impl BackpressureController {
    /// Creates a controller that samples the host through [`SystemProbe`].
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid (see
    /// [`BackpressureConfig::validate`]). Use [`try_new`](Self::try_new) or
    /// [`ControllerBuilder`](crate::ControllerBuilder) to handle the error.
    pub fn new(config: BackpressureConfig) -> Self {
        match Self::try_new(config) {
            Ok(controller) => controller,
            Err(err) => panic!("invalid backpressure configuration: {err}"),
        }
    }

    /// Creates a controller, rejecting an invalid configuration.
    pub fn try_new(config: BackpressureConfig) -> ConfigResult<Self> {
        Self::with_parts(config, Arc::new(SystemProbe::new()), None)
    }

    pub(crate) fn with_parts(
        config: BackpressureConfig,
        probe: Arc<dyn ResourceProbe>,
        rng_seed: Option<u64>,
    ) -> ConfigResult<Self> {
        config.validate()?;
        let rng = match rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        info!(
            max_queue_size = config.max_queue_size,
            max_publish_rate = config.max_publish_rate,
            "Backpressure controller created"
        );
        Ok(Self {
            config: RwLock::new(Arc::new(config)),
            level: AtomicU8::new(DegradationLevel::None.as_u8()),
            state: Mutex::new(AdmissionState {
                queue: MessageQueue::new(),
                rng,
            }),
            signals: Mutex::new(SignalState::default()),
            breakers: Arc::new(CircuitBreakerRegistry::new()),
            events: Arc::new(EventBus::default()),
            probe,
            publish_rate: RateTracker::new(PUBLISH_RATE_WINDOW_MS, PUBLISH_RATE_BUCKETS),
            counters: Arc::new(Counters::default()),
            degradation_history: Mutex::new(VecDeque::new()),
            metrics_history: Mutex::new(VecDeque::new()),
            transport: RwLock::new(None),
            active_drains: Arc::new(AtomicUsize::new(0)),
        })
    }

    // ----- configuration -------------------------------------------------

    /// Current configuration snapshot.
    #[inline]
    pub fn config(&self) -> Arc<BackpressureConfig> {
        self.config.read().clone()
    }

    /// Validates and swaps in a new configuration.
    ///
    /// In-flight decisions finish on the snapshot they started with.
    pub fn update_config(&self, config: BackpressureConfig) -> ConfigResult<()> {
        config.validate()?;
        info!(
            max_queue_size = config.max_queue_size,
            max_publish_rate = config.max_publish_rate,
            "Backpressure configuration updated"
        );
        *self.config.write() = Arc::new(config);
        Ok(())
    }

    /// Replaces the configuration with a named preset.
    pub fn apply_preset(&self, name: &str) -> ConfigResult<()> {
        let config = BackpressureConfig::preset(name)?;
        info!(preset = name, "Applying backpressure preset");
        self.update_config(config)
    }

    /// Sets the transport used by [`drain_queue`](Self::drain_queue).
    pub fn set_transport(&self, transport: Arc<dyn Transport>) {
        *self.transport.write() = Some(transport);
    }

    // ----- events --------------------------------------------------------

    /// Registers a synchronous event sink.
    pub fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.events.add_sink(sink);
    }

    /// Returns a channel receiving every subsequent event.
    ///
    /// The channel is bounded; a subscriber that falls behind misses events.
    pub fn subscribe(&self) -> Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    // ----- publish -------------------------------------------------------

    /// Current degradation level.
    #[inline]
    pub fn degradation_level(&self) -> DegradationLevel {
        DegradationLevel::from_u8(self.level.load(Ordering::Acquire))
    }

    /// Decides whether to accept a message.
    ///
    /// Returns `true` if the message was queued (or coalesced into a queued
    /// batch), `false` if it was dropped; every drop also emits a
    /// `message_dropped` event. Never blocks on I/O.
    pub fn publish(&self, subject: &str, payload: serde_json::Value, priority: Priority) -> bool {
        self.publish_at(subject, payload, priority, current_time_ms())
    }

    /// [`publish`](Self::publish) with an explicit clock.
    pub fn publish_at(
        &self,
        subject: &str,
        payload: serde_json::Value,
        priority: Priority,
        now_ms: u64,
    ) -> bool {
        self.counters.published.get().fetch_add(1, Ordering::Relaxed);
        self.publish_rate.record_at(now_ms, 1);

        let config = self.config();
        let level = self.degradation_level();
        let draining = self.is_draining();

        let admission = {
            let mut state = self.state.lock();
            self.decide(&mut state, &config, level, draining, subject, payload, priority, now_ms)
        };

        match admission {
            Admission::Enqueued => {
                self.counters.accepted.get().fetch_add(1, Ordering::Relaxed);
                true
            }
            Admission::Batched => {
                self.counters.accepted.get().fetch_add(1, Ordering::Relaxed);
                self.counters.batched.fetch_add(1, Ordering::Relaxed);
                true
            }
            Admission::Evicted(victim) => {
                self.counters.accepted.get().fetch_add(1, Ordering::Relaxed);
                self.report_drop(victim, DropReason::QueueFull);
                true
            }
            Admission::Dropped(message, reason) => {
                self.report_drop(message, reason);
                false
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn decide(
        &self,
        state: &mut AdmissionState,
        config: &BackpressureConfig,
        level: DegradationLevel,
        draining: bool,
        subject: &str,
        payload: serde_json::Value,
        priority: Priority,
        now_ms: u64,
    ) -> Admission {
        if config.enable_circuit_breaker {
            let draw: f64 = state.rng.gen();
            if !self.breakers.admit(subject, config, now_ms, draw).is_admitted() {
                let message = QueuedMessage::new(subject, payload, priority, now_ms);
                return Admission::Dropped(message, DropReason::CircuitOpen);
            }
        }

        if draining && priority == Priority::Low {
            let message = QueuedMessage::new(subject, payload, priority, now_ms);
            return Admission::Dropped(message, DropReason::QueueFull);
        }

        let mut payload = payload;
        if level != DegradationLevel::None {
            let p = config.drop_probability(level, priority);
            if p > 0.0 && state.rng.gen::<f64>() < p {
                let message = QueuedMessage::new(subject, payload, priority, now_ms);
                return Admission::Dropped(message, DropReason::Sampled);
            }

            if config.enable_batching {
                match state.queue.try_coalesce(
                    subject,
                    payload,
                    priority,
                    now_ms,
                    config.batch_window_ms,
                    config.max_batch_size,
                ) {
                    Ok(()) => return Admission::Batched,
                    Err(returned) => payload = returned,
                }
            }
        }

        let message = QueuedMessage::new(subject, payload, priority, now_ms);
        match state.queue.push(message, config.max_queue_size) {
            PushOutcome::Enqueued => Admission::Enqueued,
            PushOutcome::Evicted(victim) => Admission::Evicted(victim),
            PushOutcome::Rejected(message) => Admission::Dropped(message, DropReason::QueueFull),
        }
    }

    /// Records a drop that happened outside `publish` (e.g. a worker giving
    /// up on a rate-limited message) and emits its event.
    pub fn report_drop(&self, message: QueuedMessage, reason: DropReason) {
        self.counters.drops[reason.index()].fetch_add(1, Ordering::Relaxed);
        debug!(
            subject = %message.subject,
            priority = %message.priority,
            %reason,
            "Message dropped"
        );
        self.events.emit(ControllerEvent::MessageDropped { message, reason });
    }

    /// Drops a message whose delivery stayed rate limited through every
    /// retry. The drop also counts as a failure in the subject's breaker
    /// window, so a subject that is throttled without end trips it.
    pub fn report_rate_limited(&self, message: QueuedMessage) {
        self.record_send_failure(&message.subject);
        self.report_drop(message, DropReason::RateLimited);
    }

    // ----- queue management ----------------------------------------------

    /// Removes up to `max` entries for delivery, highest priority first.
    pub fn dequeue(&self, max: usize) -> Vec<QueuedMessage> {
        if max == 0 {
            return Vec::new();
        }
        let batch = self.state.lock().queue.pop(max);
        self.counters
            .dequeued
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        batch
    }

    /// Removes up to `max` entries that `accept` approves, highest priority
    /// first. Entries it refuses keep their place and keep counting toward
    /// `max_queue_size`.
    pub fn dequeue_where<F>(&self, max: usize, accept: F) -> Vec<QueuedMessage>
    where
        F: FnMut(&QueuedMessage) -> bool,
    {
        if max == 0 {
            return Vec::new();
        }
        let batch = self.state.lock().queue.pop_where(max, accept);
        self.counters
            .dequeued
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        batch
    }

    /// Entries currently queued.
    pub fn queue_depth(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// True while a drain is forwarding messages.
    #[inline]
    pub fn is_draining(&self) -> bool {
        self.active_drains.load(Ordering::Acquire) > 0
    }

    /// Takes every queued entry and forwards it to the transport at
    /// `drain_rate_per_sec` on a background thread.
    ///
    /// Returns the number of entries taken. Until forwarding finishes,
    /// `low` priority publishes are rejected with `queue_full`. Without a
    /// transport the entries are discarded with a warning.
    pub fn drain_queue(&self) -> usize {
        // Flag first so no low-priority publish slips in behind the take.
        self.active_drains.fetch_add(1, Ordering::AcqRel);
        let items = self.state.lock().queue.take_all();
        let count = items.len();
        self.counters
            .drained
            .fetch_add(count as u64, Ordering::Relaxed);

        let transport = self.transport.read().clone();
        let Some(transport) = transport else {
            if count > 0 {
                warn!(count, "Drained queue without a transport; entries discarded");
            }
            self.active_drains.fetch_sub(1, Ordering::AcqRel);
            return count;
        };

        info!(count, "Draining queue");
        let job = DrainJob {
            items,
            transport,
            config: self.config(),
            breakers: self.breakers.clone(),
            events: self.events.clone(),
            active_drains: self.active_drains.clone(),
        };
        let spawned = thread::Builder::new()
            .name("floodgate-drain".to_string())
            .spawn(move || job.run());
        if let Err(err) = spawned {
            // The closure (and the job's drain guard) is dropped on failure.
            error!(%err, count, "Failed to spawn drain thread; drained entries lost");
        }
        count
    }

    /// Waits until no drain is in progress, up to `timeout`.
    pub fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while self.is_draining() {
            if std::time::Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    /// Discards every queued entry. Returns the number discarded.
    pub fn clear_queue(&self) -> usize {
        let cleared = self.state.lock().queue.clear();
        self.counters
            .cleared
            .fetch_add(cleared as u64, Ordering::Relaxed);
        info!(cleared, "Queue cleared");
        cleared
    }

    // ----- circuit breakers ----------------------------------------------

    /// The per-subject breaker registry.
    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// Opens `subject`'s breaker. Returns `true` if it was not already open.
    pub fn open_circuit_breaker(&self, subject: &str) -> bool {
        self.emit_transition(self.breakers.open(subject, current_time_ms()))
    }

    /// Closes and resets `subject`'s breaker. Returns `true` if it was not
    /// already closed.
    pub fn close_circuit_breaker(&self, subject: &str) -> bool {
        self.emit_transition(self.breakers.close(subject))
    }

    /// Feeds a successful downstream send into the subject's breaker.
    pub fn record_send_success(&self, subject: &str) {
        let config = self.config();
        let event = self
            .breakers
            .record_success(subject, &config, current_time_ms());
        self.emit_transition(event);
    }

    /// Feeds a failed downstream send into the subject's breaker.
    pub fn record_send_failure(&self, subject: &str) {
        let config = self.config();
        if !config.enable_circuit_breaker {
            return;
        }
        let event = self
            .breakers
            .record_failure(subject, &config, current_time_ms());
        self.emit_transition(event);
    }

    fn emit_transition(&self, event: Option<ControllerEvent>) -> bool {
        match event {
            Some(event) => {
                self.events.emit(event);
                true
            }
            None => false,
        }
    }

    // ----- state machine -------------------------------------------------

    /// Samples the probe and evaluates the level. What the monitor runs.
    pub fn tick(&self) -> DegradationLevel {
        let usage = self.probe.sample();
        self.evaluate_at(usage, current_time_ms())
    }

    /// Evaluates the level for an externally supplied resource reading.
    pub fn evaluate(&self, usage: ResourceUsage) -> DegradationLevel {
        self.evaluate_at(usage, current_time_ms())
    }

    /// Evaluates the level at an explicit time.
    ///
    /// Also ages out queued entries older than `max_residency_ms` (reported
    /// as `sampled` drops) and appends a metrics sample to the history.
    pub fn evaluate_at(&self, usage: ResourceUsage, now_ms: u64) -> DegradationLevel {
        let config = self.config();

        let (expired, depth) = {
            let mut state = self.state.lock();
            let expired = state.queue.expire(now_ms, config.max_residency_ms);
            (expired, state.queue.len())
        };
        let expired_count = expired.len();
        for message in expired {
            self.report_drop(message, DropReason::Sampled);
        }
        if expired_count > 0 {
            debug!(expired_count, "Aged entries out of the queue");
        }

        let publish_rate = self.publish_rate.rate_at(now_ms);
        let ratios = [
            depth as f64 / config.max_queue_size as f64,
            usage.memory_mb / config.max_memory_usage_mb as f64,
            publish_rate / config.max_publish_rate as f64,
            usage.cpu_percent / config.max_cpu_usage_percent,
        ];
        let worst = ratios
            .iter()
            .copied()
            .filter(|r| r.is_finite())
            .fold(0.0_f64, f64::max);
        let target = config.level_for_ratio(worst);

        let (old, new, dropped_since) = {
            let mut signals = self.signals.lock();
            let current = self.degradation_level();
            let next = if target > current {
                signals.below_recovery_since_ms = None;
                target
            } else if target < current && worst < config.recovery_threshold_percent / 100.0 {
                let since = *signals.below_recovery_since_ms.get_or_insert(now_ms);
                if now_ms.saturating_sub(since) >= config.recovery_delay_ms {
                    signals.below_recovery_since_ms = Some(now_ms);
                    current.step_down()
                } else {
                    current
                }
            } else {
                signals.below_recovery_since_ms = None;
                current
            };
            if next != current {
                self.level.store(next.as_u8(), Ordering::Release);
            }
            signals.last_usage = usage;
            signals.worst_ratio = worst;
            let total_dropped: u64 = self.counters.drops().iter().sum();
            let dropped_since = total_dropped.saturating_sub(signals.dropped_at_last_sample);
            signals.dropped_at_last_sample = total_dropped;
            (current, next, dropped_since)
        };

        self.push_metrics_sample(MetricsSample {
            timestamp_ms: now_ms,
            degradation_level: new,
            worst_ratio: worst,
            queue_depth: depth,
            publish_rate,
            memory_usage_mb: usage.memory_mb,
            cpu_usage_percent: usage.cpu_percent,
            dropped: dropped_since,
        });

        if new != old {
            if new > old {
                warn!(%old, %new, max_ratio = worst, "Degradation level escalated");
            } else {
                info!(%old, %new, max_ratio = worst, "Degradation level recovered");
            }
            {
                let mut history = self.degradation_history.lock();
                if history.len() >= MAX_DEGRADATION_HISTORY {
                    history.pop_front();
                }
                history.push_back(DegradationRecord {
                    timestamp_ms: now_ms,
                    old,
                    new,
                    max_ratio: worst,
                });
            }
            self.events.emit(ControllerEvent::DegradationLevelChanged {
                old,
                new,
                max_ratio: worst,
            });
        }
        new
    }

    fn push_metrics_sample(&self, sample: MetricsSample) {
        let mut history = self.metrics_history.lock();
        if history.len() >= MAX_METRICS_HISTORY {
            history.pop_front();
        }
        history.push_back(sample);
    }

    /// Starts the background sampling thread.
    ///
    /// The thread calls [`tick`](Self::tick) every `sample_interval_ms`
    /// (re-read from the live configuration) until the handle is stopped or
    /// dropped.
    pub fn start_monitor(self: Arc<Self>) -> Result<MonitorHandle, WorkerError> {
        let (stop_tx, stop_rx) = mpsc::channel();
        let controller = self;

        let handle = thread::Builder::new()
            .name("floodgate-monitor".to_string())
            .spawn(move || {
                info!(
                    interval_ms = controller.config().sample_interval_ms,
                    "Started backpressure monitor"
                );
                loop {
                    let interval = Duration::from_millis(controller.config().sample_interval_ms);
                    match stop_rx.recv_timeout(interval) {
                        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                            info!("Backpressure monitor stopping");
                            break;
                        }
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            controller.tick();
                        }
                    }
                }
            })
            .map_err(|e| WorkerError::Spawn(e.to_string()))?;

        Ok(MonitorHandle {
            stop_tx,
            handle: Some(handle),
        })
    }

    // ----- observability -------------------------------------------------

    /// Point-in-time metrics snapshot.
    pub fn metrics(&self) -> ControllerMetrics {
        let config = self.config();
        let (depth, payloads, by_priority, bytes) = {
            let state = self.state.lock();
            (
                state.queue.len(),
                state.queue.payload_count(),
                state.queue.depth_by_priority(),
                state.queue.estimated_bytes(),
            )
        };
        let (usage, worst) = {
            let signals = self.signals.lock();
            (signals.last_usage, signals.worst_ratio)
        };

        let published = self.counters.published.get().load(Ordering::Relaxed);
        let drops = DropCounts::from_array(self.counters.drops());
        let drop_rate = if published == 0 {
            0.0
        } else {
            (drops.total() as f64 / published as f64).min(1.0)
        };

        ControllerMetrics {
            timestamp_ms: current_time_ms(),
            degradation_level: self.degradation_level(),
            circuit_breaker_open: self.breakers.any_open(),
            open_circuit_breakers: self.breakers.open_count(),
            queue_depth: depth,
            queued_payloads: payloads,
            queue_depth_by_priority: by_priority,
            max_queue_size: config.max_queue_size,
            queue_bytes: bytes,
            draining: self.is_draining(),
            total_published: published,
            total_accepted: self.counters.accepted.get().load(Ordering::Relaxed),
            total_batched: self.counters.batched.load(Ordering::Relaxed),
            total_dequeued: self.counters.dequeued.load(Ordering::Relaxed),
            total_drained: self.counters.drained.load(Ordering::Relaxed),
            total_cleared: self.counters.cleared.load(Ordering::Relaxed),
            drops,
            drop_rate,
            publish_rate: self.publish_rate.rate_at(current_time_ms()),
            memory_usage_mb: usage.memory_mb,
            cpu_usage_percent: usage.cpu_percent,
            worst_ratio: worst,
        }
    }

    /// Overall health, as reported by status endpoints.
    pub fn health_status(&self) -> HealthStatus {
        self.metrics().health_status()
    }

    /// Recorded level transitions, oldest first.
    pub fn degradation_history(&self) -> Vec<DegradationRecord> {
        self.degradation_history.lock().iter().copied().collect()
    }

    /// Metrics samples with `from_ms <= timestamp_ms <= to_ms`.
    pub fn metrics_history(&self, from_ms: u64, to_ms: u64) -> Vec<MetricsSample> {
        self.metrics_history
            .lock()
            .iter()
            .filter(|s| s.timestamp_ms >= from_ms && s.timestamp_ms <= to_ms)
            .copied()
            .collect()
    }

    /// Operator advice from current metrics and recent transitions.
    pub fn recommendations(&self) -> Vec<Recommendation> {
        let metrics = self.metrics();
        let history = self.degradation_history();
        metrics::recommendations(&metrics, &history, &self.config())
    }
}

impl std::fmt::Debug for BackpressureController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackpressureController")
            .field("level", &self.degradation_level())
            .field("queue_depth", &self.queue_depth())
            .field("draining", &self.is_draining())
            .field("breakers", &self.breakers)
            .field("events", &self.events)
            .finish()
    }
}

/// Forwards drained entries downstream at a bounded rate.
struct DrainJob {
    items: Vec<QueuedMessage>,
    transport: Arc<dyn Transport>,
    config: Arc<BackpressureConfig>,
    breakers: Arc<CircuitBreakerRegistry>,
    events: Arc<EventBus>,
    active_drains: Arc<AtomicUsize>,
}

impl DrainJob {
    fn run(self) {
        let interval = Duration::from_secs_f64(1.0 / self.config.drain_rate_per_sec as f64);
        let total = self.items.len();
        let mut failed = 0usize;
        for (i, message) in self.items.iter().enumerate() {
            if i > 0 {
                thread::sleep(interval);
            }
            let route = Route::parse(&message.subject);
            let now = current_time_ms();
            let event = match self.transport.send(&route, message) {
                Ok(()) => self.breakers.record_success(&message.subject, &self.config, now),
                Err(err) => {
                    failed += 1;
                    debug!(subject = %message.subject, %err, "Drain send failed");
                    if self.config.enable_circuit_breaker {
                        self.breakers.record_failure(&message.subject, &self.config, now)
                    } else {
                        None
                    }
                }
            };
            if let Some(event) = event {
                self.events.emit(event);
            }
        }
        info!(total, failed, "Drain finished");
    }
}

impl Drop for DrainJob {
    fn drop(&mut self) {
        self.active_drains.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Handle to the background monitor thread.
///
/// Dropping the handle signals the thread to stop without waiting.
#[derive(Debug)]
pub struct MonitorHandle {
    stop_tx: mpsc::Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl MonitorHandle {
    /// Signals the monitor to stop and waits for it to exit.
    pub fn stop(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Backpressure monitor thread panicked");
            }
        }
    }

    /// True while the monitor thread is running.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
    }
}
