//! Per-platform worker lanes that move accepted messages downstream.
//!
//! ```text
//!     controller.dequeue() ──► dispatcher ──► lane[platform]
//!                                               │  credential ─► VecDeque<Pending>
//!                                               ▼
//!     worker: next_credential ─► ledger.meter ─► jitter ─► transport.send
//!                 │                   │ limited                 │
//!                 │                   ▼                         ▼
//!                 │          retry with backoff        breaker + scheduler
//!                 │          or drop(rate_limited)     feedback
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::transport::{Route, Transport};
use crate::admission::{BackpressureController, QueuedMessage};
use crate::error::{ConfigError, ConfigResult, WorkerError};
use crate::fairness::FairShareScheduler;
use crate::ledger::{AttemptTag, MeterDecision, RateLimitKey, RateLimitLedger};
use crate::utils::{current_time_ms, exponential_delay_ms};

/// Worker pool tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Workers kept per platform lane even when idle.
    pub min_workers_per_platform: usize,
    /// Upper bound of workers per platform lane.
    pub max_workers_per_platform: usize,
    /// Pending entries one worker is expected to handle.
    /// Also sizes each lane's backlog, see
    /// [`lane_capacity`](Self::lane_capacity).
    pub target_pending_per_worker: usize,
    /// Entries pulled from the controller per dispatch.
    pub dispatch_batch_size: usize,
    /// Dispatcher period and idle worker wait.
    pub poll_interval_ms: u64,
    /// How often the dispatcher re-scales lanes.
    pub scale_interval_ms: u64,
    /// Whether the dispatcher scales lanes on its own.
    pub auto_scale: bool,
    /// Rate-limited attempts retried before dropping the message.
    pub max_rate_limit_retries: u32,
    /// First retry delay; doubles per attempt up to the controller's
    /// `max_backoff_ms`.
    pub retry_base_delay_ms: u64,
    /// A worker whose heartbeat is older than this is reported dead.
    pub heartbeat_timeout_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            min_workers_per_platform: 1,
            max_workers_per_platform: 8,
            target_pending_per_worker: 50,
            dispatch_batch_size: 64,
            poll_interval_ms: 10,
            scale_interval_ms: 500,
            auto_scale: true,
            max_rate_limit_retries: 3,
            retry_base_delay_ms: 100,
            heartbeat_timeout_ms: 5_000,
        }
    }
}

impl WorkerPoolConfig {
    /// Entries a lane holds before the dispatcher leaves further work for
    /// its platform in the controller queue.
    pub fn lane_capacity(&self) -> usize {
        self.max_workers_per_platform
            .saturating_mul(self.target_pending_per_worker)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_workers_per_platform == 0 {
            return Err(ConfigError::invalid(
                "max_workers_per_platform",
                "must be greater than 0",
            ));
        }
        if self.min_workers_per_platform > self.max_workers_per_platform {
            return Err(ConfigError::invalid(
                "min_workers_per_platform",
                "must not exceed max_workers_per_platform",
            ));
        }
        for (field, value) in [
            ("target_pending_per_worker", self.target_pending_per_worker as u64),
            ("dispatch_batch_size", self.dispatch_batch_size as u64),
            ("poll_interval_ms", self.poll_interval_ms),
            ("scale_interval_ms", self.scale_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be greater than 0"));
            }
        }
        if self.heartbeat_timeout_ms <= self.poll_interval_ms {
            return Err(ConfigError::invalid(
                "heartbeat_timeout_ms",
                "must be greater than poll_interval_ms",
            ));
        }
        Ok(())
    }
}

/// Liveness of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerHealth {
    /// Lane the worker serves.
    pub platform: String,
    /// Worker id, unique within its lane.
    pub id: usize,
    /// Thread running and heartbeat fresh.
    pub alive: bool,
    /// Last heartbeat.
    pub last_heartbeat_ms: u64,
    /// Entries this worker handled.
    pub processed: u64,
}

/// One lane in a [`PoolHealth`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaneHealth {
    /// Platform name.
    pub platform: String,
    /// Workers in the lane.
    pub workers: usize,
    /// Entries waiting in the lane.
    pub pending: usize,
}

/// Result of [`WorkerPoolManager::health_check`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolHealth {
    /// Pass/fail: not shut down, dispatcher alive when started, and every
    /// worker alive.
    pub healthy: bool,
    /// Whether the dispatcher thread is running.
    pub dispatcher_running: bool,
    /// Workers across all lanes.
    pub total_workers: usize,
    /// Workers reported alive.
    pub live_workers: usize,
    /// Per-lane summary, sorted by platform.
    pub lanes: Vec<LaneHealth>,
    /// Per-worker detail.
    pub workers: Vec<WorkerHealth>,
}

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Entries pulled from the controller.
    pub dispatched: u64,
    /// Successful sends.
    pub sent: u64,
    /// Failed sends.
    pub failed: u64,
    /// Rate-limited attempts scheduled for retry.
    pub rate_limit_retries: u64,
    /// Entries dropped after exhausting rate limit retries.
    pub rate_limit_drops: u64,
}

#[derive(Debug)]
struct Pending {
    message: QueuedMessage,
    route: Route,
    attempt: u32,
    not_before_ms: u64,
}

#[derive(Debug, Default)]
struct LaneQueue {
    by_credential: HashMap<String, VecDeque<Pending>>,
    len: usize,
}

struct WorkerHandle {
    id: usize,
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
    heartbeat: Arc<AtomicU64>,
    processed: Arc<AtomicU64>,
}

impl WorkerHandle {
    fn is_alive(&self, now_ms: u64, timeout_ms: u64) -> bool {
        !self.handle.is_finished()
            && now_ms.saturating_sub(self.heartbeat.load(Ordering::Acquire)) <= timeout_ms
    }

    fn stop(self) {
        let _ = self.stop_tx.send(());
        if self.handle.join().is_err() {
            error!(worker = self.id, "Worker thread panicked");
        }
    }
}

struct Lane {
    platform: String,
    queue: Mutex<LaneQueue>,
    // Held for the whole of a scale or restart, which serializes them.
    workers: Mutex<Vec<WorkerHandle>>,
    next_worker_id: AtomicUsize,
}

impl Lane {
    fn new(platform: String) -> Self {
        Self {
            platform,
            queue: Mutex::new(LaneQueue::default()),
            workers: Mutex::new(Vec::new()),
            next_worker_id: AtomicUsize::new(0),
        }
    }

    fn pending(&self) -> usize {
        self.queue.lock().len
    }

    fn push_back(&self, pending: Pending) {
        let mut queue = self.queue.lock();
        queue
            .by_credential
            .entry(pending.route.credential.clone())
            .or_default()
            .push_back(pending);
        queue.len += 1;
    }

    fn push_front(&self, pending: Pending) {
        let mut queue = self.queue.lock();
        queue
            .by_credential
            .entry(pending.route.credential.clone())
            .or_default()
            .push_front(pending);
        queue.len += 1;
    }

    /// Pops the front entry of the credential the scheduler picks among
    /// those whose front entry is due.
    fn next_ready(&self, scheduler: &FairShareScheduler, now_ms: u64) -> Option<Pending> {
        let mut queue = self.queue.lock();
        if queue.len == 0 {
            return None;
        }
        let candidates = queue.by_credential.iter().filter_map(|(credential, entries)| {
            let front = entries.front()?;
            (front.not_before_ms <= now_ms)
                .then(|| (credential.as_str(), front.message.enqueued_at_ms))
        });
        let credential = scheduler.next_credential_at(&self.platform, candidates, now_ms)?;

        let entries = queue.by_credential.get_mut(&credential)?;
        let pending = entries.pop_front();
        if entries.is_empty() {
            queue.by_credential.remove(&credential);
        }
        if pending.is_some() {
            queue.len -= 1;
        }
        pending
    }

    fn take_all(&self) -> Vec<Pending> {
        let mut queue = self.queue.lock();
        queue.len = 0;
        queue.by_credential.drain().flat_map(|(_, entries)| entries).collect()
    }
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
    rate_limit_retries: AtomicU64,
    rate_limit_drops: AtomicU64,
}

struct PoolShared {
    config: WorkerPoolConfig,
    controller: Arc<BackpressureController>,
    ledger: Arc<RateLimitLedger>,
    scheduler: Arc<FairShareScheduler>,
    transport: Arc<dyn Transport>,
    lanes: DashMap<String, Arc<Lane>, ahash::RandomState>,
    counters: Counters,
    shut_down: AtomicBool,
}

impl PoolShared {
    fn lane(&self, platform: &str) -> Arc<Lane> {
        if let Some(lane) = self.lanes.get(platform) {
            return lane.value().clone();
        }
        self.lanes
            .entry(platform.to_string())
            .or_insert_with(|| {
                debug!(platform, "Creating worker lane");
                Arc::new(Lane::new(platform.to_string()))
            })
            .value()
            .clone()
    }

    /// Moves entries into lanes that have room. A lane stops taking work
    /// at [`WorkerPoolConfig::lane_capacity`]; the rest stays in the
    /// controller queue where depth budgets and eviction apply to it.
    fn dispatch_once(&self) -> usize {
        let capacity = self.config.lane_capacity();
        let mut room: HashMap<String, usize> = self
            .lanes
            .iter()
            .map(|e| (e.key().clone(), capacity.saturating_sub(e.value().pending())))
            .collect();
        let batch = self
            .controller
            .dequeue_where(self.config.dispatch_batch_size, |message| {
                let platform = Route::parse(&message.subject).platform;
                let left = room.entry(platform).or_insert(capacity);
                if *left == 0 {
                    return false;
                }
                *left -= 1;
                true
            });
        let count = batch.len();
        let now = current_time_ms();
        for message in batch {
            let route = Route::parse(&message.subject);
            self.lane(&route.platform).push_back(Pending {
                message,
                route,
                attempt: 0,
                not_before_ms: now,
            });
        }
        self.counters
            .dispatched
            .fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    fn desired_workers(&self, lane: &Lane) -> usize {
        let config = &self.config;
        let pending = lane.pending();
        let target = config.target_pending_per_worker;
        let mut desired = ((pending + target - 1) / target)
            .clamp(config.min_workers_per_platform, config.max_workers_per_platform);
        if pending > 0 && !self.scheduler.check_fairness(&lane.platform).fair {
            desired = (desired + 1).min(config.max_workers_per_platform);
        }
        desired
    }

    fn scale(self: &Arc<Self>, platform: &str) -> usize {
        let lane = self.lane(platform);
        let mut workers = lane.workers.lock();
        if self.shut_down.load(Ordering::Acquire) {
            return 0;
        }

        // Replace workers whose threads exited.
        let before = workers.len();
        workers.retain(|w| !w.handle.is_finished());
        if workers.len() < before {
            warn!(platform, lost = before - workers.len(), "Reaped exited workers");
        }

        let desired = self.desired_workers(&lane);
        let current = workers.len();
        if desired > current {
            for _ in current..desired {
                match self.spawn_worker(&lane) {
                    Ok(worker) => workers.push(worker),
                    Err(e) => {
                        error!(platform, error = %e, "Failed to spawn worker");
                        break;
                    }
                }
            }
        } else {
            for worker in workers.drain(desired..).collect::<Vec<_>>() {
                worker.stop();
            }
        }

        if workers.len() != current {
            info!(platform, from = current, to = workers.len(), "Scaled worker lane");
        }
        workers.len()
    }

    fn restart(self: &Arc<Self>, platform: &str) -> Result<usize, WorkerError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(WorkerError::ShutDown);
        }
        let lane = self.lane(platform);
        let mut workers = lane.workers.lock();
        let count = workers.len().max(self.config.min_workers_per_platform);
        for worker in workers.drain(..) {
            worker.stop();
        }
        for _ in 0..count {
            workers.push(self.spawn_worker(&lane)?);
        }
        info!(platform, workers = count, "Restarted worker lane");
        Ok(count)
    }

    fn spawn_worker(self: &Arc<Self>, lane: &Arc<Lane>) -> Result<WorkerHandle, WorkerError> {
        let id = lane.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let (stop_tx, stop_rx) = mpsc::channel();
        let heartbeat = Arc::new(AtomicU64::new(current_time_ms()));
        let processed = Arc::new(AtomicU64::new(0));

        let shared = Arc::clone(self);
        let worker_lane = Arc::clone(lane);
        let worker_heartbeat = Arc::clone(&heartbeat);
        let worker_processed = Arc::clone(&processed);
        let handle = thread::Builder::new()
            .name(format!("floodgate-{}-{}", lane.platform, id))
            .spawn(move || {
                shared.worker_loop(&worker_lane, stop_rx, &worker_heartbeat, &worker_processed)
            })
            .map_err(|e| WorkerError::Spawn(e.to_string()))?;

        Ok(WorkerHandle {
            id,
            stop_tx,
            handle,
            heartbeat,
            processed,
        })
    }

    fn worker_loop(
        &self,
        lane: &Lane,
        stop_rx: mpsc::Receiver<()>,
        heartbeat: &AtomicU64,
        processed: &AtomicU64,
    ) {
        let idle = Duration::from_millis(self.config.poll_interval_ms);
        debug!(platform = %lane.platform, "Worker started");
        loop {
            let now = current_time_ms();
            heartbeat.store(now, Ordering::Release);
            match stop_rx.try_recv() {
                Ok(()) | Err(mpsc::TryRecvError::Disconnected) => break,
                Err(mpsc::TryRecvError::Empty) => {}
            }

            match lane.next_ready(&self.scheduler, now) {
                Some(pending) => {
                    self.process(lane, pending);
                    processed.fetch_add(1, Ordering::Relaxed);
                }
                None => match stop_rx.recv_timeout(idle) {
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                },
            }
        }
        debug!(platform = %lane.platform, "Worker stopped");
    }

    fn process(&self, lane: &Lane, mut pending: Pending) {
        let key = RateLimitKey::from_route(&pending.route);
        let tag = AttemptTag::new(pending.message.id, pending.attempt);

        if let MeterDecision::Limited {
            window,
            retry_after_ms,
        } = self.ledger.meter(&key, tag)
        {
            if pending.attempt >= self.config.max_rate_limit_retries {
                debug!(
                    %key,
                    %window,
                    attempts = pending.attempt + 1,
                    "Giving up on rate-limited message"
                );
                self.controller.report_rate_limited(pending.message);
                self.counters.rate_limit_drops.fetch_add(1, Ordering::Relaxed);
                return;
            }
            let max_backoff = self.controller.config().max_backoff_ms;
            let delay =
                exponential_delay_ms(self.config.retry_base_delay_ms, pending.attempt, max_backoff)
                    .max(retry_after_ms.min(max_backoff));
            pending.attempt += 1;
            pending.not_before_ms = current_time_ms() + delay;
            self.counters.rate_limit_retries.fetch_add(1, Ordering::Relaxed);
            lane.push_front(pending);
            return;
        }

        let jitter = self.ledger.jitter(&key);
        if !jitter.is_zero() {
            thread::sleep(jitter);
        }

        let message = &pending.message;
        self.scheduler.record_consumption(
            &pending.route.platform,
            &pending.route.credential,
            message.batch_size() as u64,
        );
        match self.transport.send(&pending.route, message) {
            Ok(()) => {
                self.controller.record_send_success(&message.subject);
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                debug!(subject = %message.subject, error = %e, "Send failed");
                self.controller.record_send_failure(&message.subject);
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn stop_all(&self) -> usize {
        let lanes: Vec<_> = self.lanes.iter().map(|e| e.value().clone()).collect();
        let mut stopped = 0;
        for lane in lanes {
            let workers: Vec<_> = lane.workers.lock().drain(..).collect();
            stopped += workers.len();
            for worker in workers {
                worker.stop();
            }
        }
        stopped
    }
}

/// Owns the per-platform worker lanes.
///
/// Construct with [`new`](Self::new), then [`start`](Self::start) the
/// dispatcher. The pool installs its transport on the controller so
/// `drain_queue` and the workers share one downstream.
pub struct WorkerPoolManager {
    shared: Arc<PoolShared>,
    dispatcher: Mutex<Option<(mpsc::Sender<()>, JoinHandle<()>)>>,
}

impl WorkerPoolManager {
    /// Creates an idle pool.
    pub fn new(
        controller: Arc<BackpressureController>,
        ledger: Arc<RateLimitLedger>,
        scheduler: Arc<FairShareScheduler>,
        transport: Arc<dyn Transport>,
        config: WorkerPoolConfig,
    ) -> ConfigResult<Self> {
        config.validate()?;
        controller.set_transport(Arc::clone(&transport));
        Ok(Self {
            shared: Arc::new(PoolShared {
                config,
                controller,
                ledger,
                scheduler,
                transport,
                lanes: DashMap::with_hasher(ahash::RandomState::new()),
                counters: Counters::default(),
                shut_down: AtomicBool::new(false),
            }),
            dispatcher: Mutex::new(None),
        })
    }

    /// Pool tunables.
    pub fn config(&self) -> &WorkerPoolConfig {
        &self.shared.config
    }

    /// Starts the dispatcher thread. Idempotent.
    pub fn start(&self) -> Result<(), WorkerError> {
        if self.shared.shut_down.load(Ordering::Acquire) {
            return Err(WorkerError::ShutDown);
        }
        let mut dispatcher = self.dispatcher.lock();
        if dispatcher.as_ref().is_some_and(|(_, h)| !h.is_finished()) {
            return Ok(());
        }

        let (stop_tx, stop_rx) = mpsc::channel();
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("floodgate-dispatch".to_string())
            .spawn(move || {
                let interval = Duration::from_millis(shared.config.poll_interval_ms);
                let scale_every = Duration::from_millis(shared.config.scale_interval_ms);
                let mut last_scale = Instant::now();
                info!("Started worker dispatcher");
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            let dispatched = shared.dispatch_once();
                            if shared.config.auto_scale
                                && (dispatched > 0 || last_scale.elapsed() >= scale_every)
                            {
                                let platforms: Vec<_> =
                                    shared.lanes.iter().map(|e| e.key().clone()).collect();
                                for platform in platforms {
                                    shared.scale(&platform);
                                }
                                last_scale = Instant::now();
                            }
                        }
                    }
                }
                info!("Worker dispatcher stopping");
            })
            .map_err(|e| WorkerError::Spawn(e.to_string()))?;

        *dispatcher = Some((stop_tx, handle));
        Ok(())
    }

    /// Moves up to one batch from the controller queue into lanes that are
    /// below [`WorkerPoolConfig::lane_capacity`]. Returns the number moved.
    /// The dispatcher calls this on every tick.
    pub fn dispatch_once(&self) -> usize {
        self.shared.dispatch_once()
    }

    /// Brings `platform`'s lane to its desired worker count and returns
    /// that count.
    ///
    /// Desired is `ceil(pending / target_pending_per_worker)` clamped to
    /// the min/max, plus one while the platform is unfair. Concurrent calls
    /// for the same platform are serialized; repeating a call with no
    /// change in load changes nothing.
    pub fn scale_workers(&self, platform: &str) -> usize {
        self.shared.scale(platform)
    }

    /// Stops and respawns every worker of `platform`. Returns the number
    /// of workers running afterwards.
    pub fn restart_workers(&self, platform: &str) -> Result<usize, WorkerError> {
        self.shared.restart(platform)
    }

    /// Entries waiting in `platform`'s lane.
    pub fn pending(&self, platform: &str) -> usize {
        self.shared
            .lanes
            .get(platform)
            .map_or(0, |lane| lane.pending())
    }

    /// Workers in `platform`'s lane.
    pub fn worker_count(&self, platform: &str) -> usize {
        self.shared
            .lanes
            .get(platform)
            .map_or(0, |lane| lane.workers.lock().len())
    }

    /// Platforms that have a lane, sorted.
    pub fn platforms(&self) -> Vec<String> {
        let mut names: Vec<_> = self.shared.lanes.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Delivery counters.
    pub fn stats(&self) -> PoolStats {
        let c = &self.shared.counters;
        PoolStats {
            dispatched: c.dispatched.load(Ordering::Relaxed),
            sent: c.sent.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            rate_limit_retries: c.rate_limit_retries.load(Ordering::Relaxed),
            rate_limit_drops: c.rate_limit_drops.load(Ordering::Relaxed),
        }
    }

    /// Aggregated liveness.
    pub fn health_check(&self) -> PoolHealth {
        let now = current_time_ms();
        let timeout = self.shared.config.heartbeat_timeout_ms;
        let (dispatcher_started, dispatcher_running) = match &*self.dispatcher.lock() {
            Some((_, handle)) => (true, !handle.is_finished()),
            None => (false, false),
        };

        let mut lanes = Vec::new();
        let mut workers = Vec::new();
        for entry in self.shared.lanes.iter() {
            let lane = entry.value();
            let handles = lane.workers.lock();
            lanes.push(LaneHealth {
                platform: lane.platform.clone(),
                workers: handles.len(),
                pending: lane.pending(),
            });
            workers.extend(handles.iter().map(|w| WorkerHealth {
                platform: lane.platform.clone(),
                id: w.id,
                alive: w.is_alive(now, timeout),
                last_heartbeat_ms: w.heartbeat.load(Ordering::Acquire),
                processed: w.processed.load(Ordering::Relaxed),
            }));
        }
        lanes.sort_by(|a, b| a.platform.cmp(&b.platform));
        workers.sort_by(|a, b| (&a.platform, a.id).cmp(&(&b.platform, b.id)));

        let live_workers = workers.iter().filter(|w| w.alive).count();
        let healthy = !self.shared.shut_down.load(Ordering::Acquire)
            && (!dispatcher_started || dispatcher_running)
            && live_workers == workers.len();

        PoolHealth {
            healthy,
            dispatcher_running,
            total_workers: workers.len(),
            live_workers,
            lanes,
            workers,
        }
    }

    /// Stops the dispatcher and every worker. Entries still waiting in the
    /// lanes are abandoned; the count is returned.
    pub fn shutdown(&self) -> usize {
        if self.shared.shut_down.swap(true, Ordering::AcqRel) {
            return 0;
        }
        if let Some((stop_tx, handle)) = self.dispatcher.lock().take() {
            let _ = stop_tx.send(());
            if handle.join().is_err() {
                error!("Worker dispatcher panicked");
            }
        }
        let stopped = self.shared.stop_all();

        let abandoned: usize = self
            .shared
            .lanes
            .iter()
            .map(|lane| lane.value().take_all().len())
            .sum();
        if abandoned > 0 {
            warn!(abandoned, "Worker pool shut down with pending entries");
        }
        info!(workers = stopped, "Worker pool shut down");
        abandoned
    }

    /// Whether [`shutdown`](Self::shutdown) has run.
    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::Acquire)
    }
}

impl Drop for WorkerPoolManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPoolManager")
            .field("config", &self.shared.config)
            .field("platforms", &self.platforms())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{
        BackpressureConfig, ControllerEvent, DegradationLevel, DropReason, FixedProbe, Priority,
    };
    use crate::error::SendError;
    use crate::fairness::FairShareConfig;
    use crate::ledger::PlatformRateLimitConfig;
    use serde_json::json;

    type Sent = Arc<Mutex<Vec<(Route, usize)>>>;

    fn recording_transport() -> (Arc<dyn Transport>, Sent) {
        let sent: Sent = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&sent);
        let transport = move |route: &Route, message: &QueuedMessage| -> Result<(), SendError> {
            sink.lock().push((route.clone(), message.batch_size()));
            Ok(())
        };
        (Arc::new(transport), sent)
    }

    fn controller() -> Arc<BackpressureController> {
        let mut config = BackpressureConfig::testing();
        config.enable_batching = false;
        Arc::new(
            BackpressureController::with_parts(config, Arc::new(FixedProbe::new(0.0, 0.0)), Some(3))
                .unwrap(),
        )
    }

    fn pool_config() -> WorkerPoolConfig {
        WorkerPoolConfig {
            min_workers_per_platform: 0,
            max_workers_per_platform: 4,
            target_pending_per_worker: 10,
            poll_interval_ms: 5,
            auto_scale: false,
            retry_base_delay_ms: 5,
            ..Default::default()
        }
    }

    fn pool(
        controller: &Arc<BackpressureController>,
        ledger: Arc<RateLimitLedger>,
        transport: Arc<dyn Transport>,
        config: WorkerPoolConfig,
    ) -> WorkerPoolManager {
        WorkerPoolManager::new(
            Arc::clone(controller),
            ledger,
            Arc::new(FairShareScheduler::new(FairShareConfig::default())),
            transport,
            config,
        )
        .unwrap()
    }

    fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn test_config_validation() {
        assert!(WorkerPoolConfig::default().validate().is_ok());
        let bad = WorkerPoolConfig {
            min_workers_per_platform: 5,
            max_workers_per_platform: 2,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let zero = WorkerPoolConfig {
            dispatch_batch_size: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_dispatch_routes_into_lanes() {
        let controller = controller();
        let (transport, _) = recording_transport();
        let pool = pool(&controller, Arc::new(RateLimitLedger::new()), transport, pool_config());

        controller.publish("ig:a:media", json!(1), Priority::Medium);
        controller.publish("ig:b", json!(2), Priority::Medium);
        controller.publish("plain-subject", json!(3), Priority::Medium);

        assert_eq!(pool.dispatch_once(), 3);
        assert_eq!(pool.pending("ig"), 2);
        assert_eq!(pool.pending("default"), 1);
        assert_eq!(pool.platforms(), vec!["default".to_string(), "ig".to_string()]);
        assert_eq!(controller.queue_depth(), 0);
    }

    #[test]
    fn test_full_lane_leaves_backlog_in_controller() {
        let mut config = BackpressureConfig::testing();
        config.enable_batching = false;
        config.max_publish_rate = 1_000_000;
        let controller = Arc::new(
            BackpressureController::with_parts(config, Arc::new(FixedProbe::new(0.0, 0.0)), Some(3))
                .unwrap(),
        );
        let (transport, _) = recording_transport();
        let pool = pool(&controller, Arc::new(RateLimitLedger::new()), transport, pool_config());
        assert_eq!(pool.config().lane_capacity(), 40);

        for i in 0..60 {
            controller.publish("ig:a", json!(i), Priority::Low);
        }
        assert_eq!(pool.dispatch_once(), 40);
        assert_eq!(pool.pending("ig"), 40);
        assert_eq!(controller.queue_depth(), 20);
        assert_eq!(pool.dispatch_once(), 0);

        // A full lane does not hold up other platforms
        controller.publish("tiktok:a", json!(0), Priority::Low);
        assert_eq!(pool.dispatch_once(), 1);
        assert_eq!(pool.pending("tiktok"), 1);

        // The backlog counts against max_queue_size and drives degradation
        for i in 0..100 {
            controller.publish("ig:a", json!(i), Priority::Low);
        }
        assert_eq!(controller.queue_depth(), 100);
        assert_eq!(controller.metrics().drops.queue_full, 20);
        assert_ne!(controller.tick(), DegradationLevel::None);
    }

    #[test]
    fn test_slow_transport_keeps_lane_bounded() {
        let mut config = BackpressureConfig::testing();
        config.enable_batching = false;
        config.max_publish_rate = 1_000_000;
        let controller = Arc::new(
            BackpressureController::with_parts(config, Arc::new(FixedProbe::new(0.0, 0.0)), Some(3))
                .unwrap(),
        );
        let transport: Arc<dyn Transport> = Arc::new(|_: &Route, _: &QueuedMessage| {
            thread::sleep(Duration::from_millis(20));
            Ok::<(), SendError>(())
        });
        let pool = pool(
            &controller,
            Arc::new(RateLimitLedger::new()),
            transport,
            WorkerPoolConfig {
                min_workers_per_platform: 1,
                max_workers_per_platform: 1,
                target_pending_per_worker: 5,
                auto_scale: true,
                ..pool_config()
            },
        );
        pool.start().unwrap();

        for i in 0..60 {
            controller.publish("ig:a", json!(i), Priority::Low);
        }
        thread::sleep(Duration::from_millis(100));
        assert!(pool.pending("ig") <= 5);
        assert!(controller.queue_depth() >= 30);

        pool.shutdown();
    }

    #[test]
    fn test_scale_workers_is_idempotent() {
        let controller = controller();
        let (transport, _) = recording_transport();
        let pool = pool(&controller, Arc::new(RateLimitLedger::new()), transport, pool_config());

        // No pending work and min 0: nothing to run.
        assert_eq!(pool.scale_workers("ig"), 0);
        assert_eq!(pool.scale_workers("ig"), 0);

        for i in 0..25 {
            pool.shared.lane("ig").push_back(Pending {
                message: QueuedMessage::new("ig:a", json!(i), Priority::Low, 0),
                route: Route::parse("ig:a"),
                attempt: 0,
                not_before_ms: u64::MAX,
            });
        }
        assert_eq!(pool.scale_workers("ig"), 3);
        assert_eq!(pool.scale_workers("ig"), 3);
        assert_eq!(pool.worker_count("ig"), 3);
    }

    #[test]
    fn test_concurrent_scale_serializes() {
        let controller = controller();
        let (transport, _) = recording_transport();
        let pool = Arc::new(pool(
            &controller,
            Arc::new(RateLimitLedger::new()),
            transport,
            pool_config(),
        ));
        for i in 0..40 {
            pool.shared.lane("x").push_back(Pending {
                message: QueuedMessage::new("x:a", json!(i), Priority::Low, 0),
                route: Route::parse("x:a"),
                attempt: 0,
                not_before_ms: u64::MAX,
            });
        }

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || pool.scale_workers("x"))
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 4);
        }
        assert_eq!(pool.worker_count("x"), 4);
    }

    #[test]
    fn test_workers_deliver_and_feed_back() {
        let controller = controller();
        let (transport, sent) = recording_transport();
        let scheduler = Arc::new(FairShareScheduler::default());
        let pool = WorkerPoolManager::new(
            Arc::clone(&controller),
            Arc::new(RateLimitLedger::new()),
            Arc::clone(&scheduler),
            transport,
            WorkerPoolConfig {
                min_workers_per_platform: 1,
                ..pool_config()
            },
        )
        .unwrap();

        for i in 0..10 {
            controller.publish(&format!("ig:acct{}", i % 2), json!(i), Priority::High);
        }
        pool.dispatch_once();
        pool.scale_workers("ig");

        assert!(wait_until(Duration::from_secs(5), || pool.stats().sent == 10));
        assert_eq!(sent.lock().len(), 10);
        let state = scheduler.get_fair_share_state("ig").unwrap();
        assert_eq!(state.credentials.len(), 2);
        assert!(state.credentials.iter().all(|c| c.lifetime_consumed == 5));
    }

    #[test]
    fn test_send_failures_open_breaker() {
        let controller = controller();
        let transport: Arc<dyn Transport> = Arc::new(|_: &Route, _: &QueuedMessage| {
            Err(SendError::Unavailable("down".into()))
        });
        let pool = pool(
            &controller,
            Arc::new(RateLimitLedger::new()),
            transport,
            WorkerPoolConfig {
                min_workers_per_platform: 1,
                ..pool_config()
            },
        );

        for i in 0..5 {
            controller.publish("ig:a", json!(i), Priority::High);
        }
        pool.dispatch_once();
        pool.scale_workers("ig");

        assert!(wait_until(Duration::from_secs(5), || pool.stats().failed == 5));
        assert!(controller.breakers().any_open());
    }

    #[test]
    fn test_rate_limited_messages_are_dropped_after_retries() {
        let controller = controller();
        let events = controller.subscribe();
        let ledger = Arc::new(RateLimitLedger::new());
        ledger
            .load_platform_configs(vec![PlatformRateLimitConfig::for_platform("ig").per_hour(1)])
            .unwrap();
        let (transport, sent) = recording_transport();
        let pool = pool(
            &controller,
            ledger,
            transport,
            WorkerPoolConfig {
                min_workers_per_platform: 1,
                max_rate_limit_retries: 2,
                ..pool_config()
            },
        );

        controller.publish("ig:a", json!(1), Priority::High);
        controller.publish("ig:a", json!(2), Priority::High);
        pool.dispatch_once();
        pool.scale_workers("ig");

        assert!(wait_until(Duration::from_secs(10), || pool.stats().rate_limit_drops == 1));
        assert_eq!(sent.lock().len(), 1);
        assert_eq!(pool.stats().rate_limit_retries, 2);

        let dropped = events
            .try_iter()
            .find(|e| matches!(e, ControllerEvent::MessageDropped { .. }));
        assert!(matches!(
            dropped,
            Some(ControllerEvent::MessageDropped {
                reason: DropReason::RateLimited,
                ..
            })
        ));
    }

    #[test]
    fn test_exhausted_rate_limits_open_breaker() {
        let controller = controller();
        let ledger = Arc::new(RateLimitLedger::new());
        ledger
            .load_platform_configs(vec![PlatformRateLimitConfig::for_platform("ig").per_hour(1)])
            .unwrap();
        let (transport, sent) = recording_transport();
        let pool = pool(
            &controller,
            ledger,
            transport,
            WorkerPoolConfig {
                min_workers_per_platform: 1,
                max_rate_limit_retries: 0,
                ..pool_config()
            },
        );

        for i in 0..4 {
            controller.publish("ig:a", json!(i), Priority::High);
        }
        pool.dispatch_once();
        pool.scale_workers("ig");

        assert!(wait_until(Duration::from_secs(5), || pool.stats().rate_limit_drops == 3));
        assert_eq!(sent.lock().len(), 1);
        assert_eq!(pool.stats().failed, 0);
        assert!(controller.breakers().any_open());
        assert_eq!(controller.metrics().drops.rate_limited, 3);
    }

    #[test]
    fn test_health_check_and_restart() {
        let controller = controller();
        let (transport, _) = recording_transport();
        let pool = pool(
            &controller,
            Arc::new(RateLimitLedger::new()),
            transport,
            WorkerPoolConfig {
                min_workers_per_platform: 2,
                ..pool_config()
            },
        );
        pool.scale_workers("ig");

        let health = pool.health_check();
        assert!(health.healthy);
        assert_eq!(health.total_workers, 2);
        assert_eq!(health.live_workers, 2);
        assert!(!health.dispatcher_running);

        assert_eq!(pool.restart_workers("ig").unwrap(), 2);
        let ids: Vec<_> = pool.health_check().workers.iter().map(|w| w.id).collect();
        assert_eq!(ids, vec![2, 3]);

        pool.shutdown();
        assert!(!pool.health_check().healthy);
        assert_eq!(pool.restart_workers("ig"), Err(WorkerError::ShutDown));
        assert_eq!(pool.start(), Err(WorkerError::ShutDown));
    }

    #[test]
    fn test_dispatcher_auto_scales() {
        let controller = controller();
        let (transport, sent) = recording_transport();
        let pool = pool(
            &controller,
            Arc::new(RateLimitLedger::new()),
            transport,
            WorkerPoolConfig {
                auto_scale: true,
                ..pool_config()
            },
        );
        pool.start().unwrap();
        pool.start().unwrap();

        for i in 0..20 {
            controller.publish("tiktok:a", json!(i), Priority::Critical);
        }
        assert!(wait_until(Duration::from_secs(5), || sent.lock().len() == 20));
        assert!(pool.health_check().dispatcher_running);
        assert_eq!(pool.shutdown(), 0);
    }

    #[test]
    fn test_pool_installs_transport_for_drain() {
        let controller = controller();
        let (transport, sent) = recording_transport();
        let _pool = pool(&controller, Arc::new(RateLimitLedger::new()), transport, pool_config());

        controller.publish("ig:a", json!(1), Priority::Medium);
        assert_eq!(controller.drain_queue(), 1);
        assert!(controller.wait_for_drain(Duration::from_secs(5)));
        assert_eq!(sent.lock().len(), 1);
    }
}
