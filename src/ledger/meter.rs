//! The rate limit ledger: per-key counters checked before every send.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use super::bucket::BurstBucket;
use super::config::{PlatformRateLimitConfig, RateLimitKey, WILDCARD_ENDPOINT};
use super::store::{LedgerStore, PersistCommand, PersistWorker};
use super::types::{
    AttemptTag, BurstStatus, LimitWindow, MeterDecision, RateLimitHit, RateLimitStatus,
    WindowStatus,
};
use crate::error::{ConfigError, ConfigResult, WorkerError};
use crate::utils::current_time_ms;

/// Rate limit hits kept in memory for analytics.
pub const RECENT_HITS_CAPACITY: usize = 1024;

/// Attempt decisions remembered per key for retry deduplication.
const ATTEMPT_MEMORY: usize = 256;

type ConfigMap = HashMap<(String, String), PlatformRateLimitConfig>;

#[derive(Debug, Clone, Copy, Default)]
struct FixedWindow {
    start_ms: u64,
    count: u64,
}

impl FixedWindow {
    fn start_for(now_ms: u64, length_ms: u64) -> u64 {
        now_ms - now_ms % length_ms
    }

    fn roll(&mut self, now_ms: u64, length_ms: u64) {
        let start = Self::start_for(now_ms, length_ms);
        if start != self.start_ms {
            self.start_ms = start;
            self.count = 0;
        }
    }

    fn used_at(&self, now_ms: u64, length_ms: u64) -> u64 {
        if Self::start_for(now_ms, length_ms) == self.start_ms {
            self.count
        } else {
            0
        }
    }

    fn status(&self, limit: Option<u64>, now_ms: u64, length_ms: u64) -> WindowStatus {
        let used = self.used_at(now_ms, length_ms);
        WindowStatus {
            limit,
            used,
            remaining: limit.map(|l| l.saturating_sub(used)),
            resets_at_ms: Self::start_for(now_ms, length_ms) + length_ms,
        }
    }
}

/// Window counters and attempt memory of one key.
#[derive(Debug, Default)]
struct UsageCounter {
    minute: FixedWindow,
    hour: FixedWindow,
    day: FixedWindow,
    attempts: VecDeque<(AttemptTag, MeterDecision)>,
    total_allowed: u64,
    total_limited: u64,
}

impl UsageCounter {
    const WINDOWS: [LimitWindow; 3] = [LimitWindow::Minute, LimitWindow::Hour, LimitWindow::Day];

    fn window(&self, window: LimitWindow) -> &FixedWindow {
        match window {
            LimitWindow::Minute | LimitWindow::Burst => &self.minute,
            LimitWindow::Hour => &self.hour,
            LimitWindow::Day => &self.day,
        }
    }

    fn window_mut(&mut self, window: LimitWindow) -> &mut FixedWindow {
        match window {
            LimitWindow::Minute | LimitWindow::Burst => &mut self.minute,
            LimitWindow::Hour => &mut self.hour,
            LimitWindow::Day => &mut self.day,
        }
    }

    fn cached(&self, tag: AttemptTag) -> Option<MeterDecision> {
        self.attempts
            .iter()
            .find(|(seen, _)| *seen == tag)
            .map(|(_, decision)| *decision)
    }

    fn remember(&mut self, tag: AttemptTag, decision: MeterDecision) {
        if self.attempts.len() >= ATTEMPT_MEMORY {
            self.attempts.pop_front();
        }
        self.attempts.push_back((tag, decision));
    }

    fn roll(&mut self, now_ms: u64) {
        for window in Self::WINDOWS {
            if let Some(length) = window.length_ms() {
                self.window_mut(window).roll(now_ms, length);
            }
        }
    }

    /// First exhausted window with its limit and time to reset.
    fn exhausted(
        &self,
        config: &PlatformRateLimitConfig,
        now_ms: u64,
    ) -> Option<(LimitWindow, u64, u64)> {
        Self::WINDOWS.into_iter().find_map(|window| {
            let limit = limit_of(config, window)?;
            let length = window.length_ms()?;
            let counter = self.window(window);
            (counter.count >= limit)
                .then(|| (window, limit, counter.start_ms + length - now_ms))
        })
    }

    fn charge(&mut self) {
        self.minute.count += 1;
        self.hour.count += 1;
        self.day.count += 1;
        self.total_allowed += 1;
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

fn limit_of(config: &PlatformRateLimitConfig, window: LimitWindow) -> Option<u64> {
    match window {
        LimitWindow::Minute => config.limit_per_minute,
        LimitWindow::Hour => config.limit_per_hour,
        LimitWindow::Day => config.limit_per_day,
        LimitWindow::Burst => config.burst_limit,
    }
}

#[derive(Debug)]
struct CounterCell {
    usage: Mutex<UsageCounter>,
    burst: BurstBucket,
}

impl CounterCell {
    fn new(config: &PlatformRateLimitConfig, now_ms: u64) -> Self {
        Self {
            usage: Mutex::new(UsageCounter::default()),
            burst: BurstBucket::new(
                config.burst_limit.unwrap_or(0),
                config.burst_window_seconds.saturating_mul(1000),
                now_ms,
            ),
        }
    }

    /// Brings the bucket in line with the current config.
    fn sync_burst(&self, config: &PlatformRateLimitConfig, now_ms: u64) {
        let Some(capacity) = config.burst_limit else { return };
        let window_ms = config.burst_window_seconds.saturating_mul(1000);
        let previous = self.burst.capacity();
        if previous == capacity && self.burst.window_ms() == window_ms {
            return;
        }
        self.burst.reconfigure(capacity, window_ms);
        if previous == 0 {
            self.burst.reset(now_ms);
        }
    }
}

/// Per-(credential, platform, endpoint) quota tracking.
///
/// Every send the worker pool makes is metered here first. Counters live
/// in memory and are the only input to quota decisions; an optional
/// [`LedgerStore`] receives hits and config snapshots in the background.
///
/// # Example
///
/// ```rust
/// use floodgate::ledger::{AttemptTag, PlatformRateLimitConfig, RateLimitKey, RateLimitLedger};
/// use uuid::Uuid;
///
/// let ledger = RateLimitLedger::new();
/// ledger
///     .load_platform_configs(vec![PlatformRateLimitConfig::for_platform("x").per_minute(1)])
///     .unwrap();
///
/// let key = RateLimitKey::new("acct", "x", "post");
/// assert!(ledger.meter(&key, AttemptTag::new(Uuid::now_v7(), 0)).is_allowed());
/// assert!(!ledger.meter(&key, AttemptTag::new(Uuid::now_v7(), 0)).is_allowed());
/// ```
pub struct RateLimitLedger {
    configs: RwLock<Arc<ConfigMap>>,
    counters: DashMap<RateLimitKey, Arc<CounterCell>, ahash::RandomState>,
    recent_hits: Mutex<VecDeque<RateLimitHit>>,
    total_hits: AtomicU64,
    rng: Mutex<SmallRng>,
    persist: Option<PersistWorker>,
}

impl Default for RateLimitLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitLedger {
    /// In-memory ledger with no platform configs: everything is unmetered.
    pub fn new() -> Self {
        let shards = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(8)
            .next_power_of_two()
            .clamp(4, 64);

        Self {
            configs: RwLock::new(Arc::new(HashMap::new())),
            counters: DashMap::with_hasher_and_shard_amount(ahash::RandomState::new(), shards),
            recent_hits: Mutex::new(VecDeque::with_capacity(RECENT_HITS_CAPACITY)),
            total_hits: AtomicU64::new(0),
            rng: Mutex::new(SmallRng::from_entropy()),
            persist: None,
        }
    }

    /// Ledger backed by `store`.
    ///
    /// Configs already in the store are loaded. An unreachable store is
    /// logged and the ledger starts empty and degraded.
    pub fn with_store(store: Arc<dyn LedgerStore>) -> Result<Self, WorkerError> {
        let stored = store.load_platform_configs();
        let mut ledger = Self::new();
        let worker = PersistWorker::spawn(store)?;

        match stored {
            Ok(configs) if !configs.is_empty() => {
                let valid: Vec<_> = configs
                    .into_iter()
                    .filter(|c| match c.validate() {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(
                                platform = %c.platform,
                                error = %e,
                                "Skipping invalid stored config"
                            );
                            false
                        }
                    })
                    .collect();
                info!(count = valid.len(), "Loaded platform configs from store");
                *ledger.configs.write() = Arc::new(Self::index(valid));
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Ledger store unavailable at startup, counting in memory only");
                worker.state().degraded.store(true, Ordering::Release);
            }
        }

        ledger.persist = Some(worker);
        Ok(ledger)
    }

    fn index(configs: Vec<PlatformRateLimitConfig>) -> ConfigMap {
        configs.into_iter().map(|c| (c.slot(), c)).collect()
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// Replaces every platform config at once.
    ///
    /// All configs are validated before anything is applied. Counters are
    /// kept; burst buckets pick up new sizes on their next use.
    pub fn load_platform_configs(&self, configs: Vec<PlatformRateLimitConfig>) -> ConfigResult<()> {
        let mut seen = std::collections::HashSet::new();
        for config in &configs {
            config.validate()?;
            if !seen.insert(config.slot()) {
                return Err(ConfigError::invalid(
                    "platform",
                    format!(
                        "duplicate config for {}/{}",
                        config.platform, config.endpoint
                    ),
                ));
            }
        }

        info!(count = configs.len(), "Loading platform rate limit configs");
        let snapshot = configs.clone();
        *self.configs.write() = Arc::new(Self::index(configs));
        self.persist_configs(snapshot);
        Ok(())
    }

    /// Adds or replaces one platform config.
    pub fn update_platform_config(&self, config: PlatformRateLimitConfig) -> ConfigResult<()> {
        config.validate()?;

        let snapshot = {
            let mut guard = self.configs.write();
            let mut next = (**guard).clone();
            info!(
                platform = %config.platform,
                endpoint = %config.endpoint,
                "Updating platform rate limit config"
            );
            next.insert(config.slot(), config);
            let snapshot: Vec<_> = next.values().cloned().collect();
            *guard = Arc::new(next);
            snapshot
        };
        self.persist_configs(snapshot);
        Ok(())
    }

    /// Every config, sorted by platform then endpoint.
    pub fn platform_configs(&self) -> Vec<PlatformRateLimitConfig> {
        let mut configs: Vec<_> = self.configs.read().values().cloned().collect();
        configs.sort_by(|a, b| a.slot().cmp(&b.slot()));
        configs
    }

    /// The active config governing `platform`/`endpoint`, if any.
    ///
    /// An exact endpoint match wins over the platform wildcard. An inactive
    /// exact match leaves the endpoint unmetered.
    pub fn config_for(&self, platform: &str, endpoint: &str) -> Option<PlatformRateLimitConfig> {
        let configs = self.configs.read().clone();
        let exact = configs.get(&(platform.to_string(), endpoint.to_string()));
        let found = exact
            .or_else(|| configs.get(&(platform.to_string(), WILDCARD_ENDPOINT.to_string())))?;
        found.active.then(|| found.clone())
    }

    fn persist_configs(&self, configs: Vec<PlatformRateLimitConfig>) {
        if let Some(persist) = &self.persist {
            persist.submit(PersistCommand::Configs(configs));
        }
    }

    // ------------------------------------------------------------------
    // Metering
    // ------------------------------------------------------------------

    /// Meters one send attempt now.
    #[inline]
    pub fn meter(&self, key: &RateLimitKey, tag: AttemptTag) -> MeterDecision {
        self.meter_at(key, tag, current_time_ms())
    }

    /// Meters one send attempt at `now_ms`.
    ///
    /// Allowed attempts are counted in every window and take a burst token.
    /// Limited attempts count nothing and are recorded as hits. Metering a
    /// tag again returns the earlier decision without counting.
    pub fn meter_at(&self, key: &RateLimitKey, tag: AttemptTag, now_ms: u64) -> MeterDecision {
        let Some(config) = self.config_for(&key.platform, &key.endpoint) else {
            return MeterDecision::Unmetered;
        };

        let cell = self.cell(key, &config, now_ms);
        let mut usage = cell.usage.lock();
        if let Some(decision) = usage.cached(tag) {
            debug!(%key, attempt = tag.attempt, "Repeated attempt, returning cached decision");
            return decision;
        }

        cell.sync_burst(&config, now_ms);
        usage.roll(now_ms);

        let limited = usage.exhausted(&config, now_ms).or_else(|| {
            let capacity = config.burst_limit?;
            (!cell.burst.try_acquire_at(now_ms))
                .then(|| (LimitWindow::Burst, capacity, cell.burst.retry_after_ms(now_ms)))
        });

        let decision = match limited {
            None => {
                usage.charge();
                MeterDecision::Allowed
            }
            Some((window, _, retry_after_ms)) => {
                usage.total_limited += 1;
                MeterDecision::Limited {
                    window,
                    retry_after_ms,
                }
            }
        };
        usage.remember(tag, decision);
        drop(usage);

        if let Some((window, limit, _)) = limited {
            self.record_hit(RateLimitHit {
                key: key.clone(),
                window,
                limit,
                attempt: tag,
                timestamp_ms: now_ms,
            });
        }
        decision
    }

    fn cell(
        &self,
        key: &RateLimitKey,
        config: &PlatformRateLimitConfig,
        now_ms: u64,
    ) -> Arc<CounterCell> {
        if let Some(cell) = self.counters.get(key) {
            return cell.value().clone();
        }
        self.counters
            .entry(key.clone())
            .or_insert_with(|| Arc::new(CounterCell::new(config, now_ms)))
            .value()
            .clone()
    }

    fn record_hit(&self, hit: RateLimitHit) {
        debug!(key = %hit.key, window = %hit.window, limit = hit.limit, "Rate limit hit");
        self.total_hits.fetch_add(1, Ordering::Relaxed);
        {
            let mut recent = self.recent_hits.lock();
            if recent.len() >= RECENT_HITS_CAPACITY {
                recent.pop_front();
            }
            recent.push_back(hit.clone());
        }
        if let Some(persist) = &self.persist {
            persist.submit(PersistCommand::Hit(hit));
        }
    }

    /// Random pre-send delay for `key`, zero when unmetered.
    pub fn jitter(&self, key: &RateLimitKey) -> Duration {
        let Some(config) = self.config_for(&key.platform, &key.endpoint) else {
            return Duration::ZERO;
        };
        if config.jitter_max_ms == 0 {
            return Duration::ZERO;
        }
        let ms = self
            .rng
            .lock()
            .gen_range(config.jitter_min_ms..=config.jitter_max_ms);
        Duration::from_millis(ms)
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Clears counters of `credential`, optionally narrowed to one platform
    /// and endpoint. Returns how many keys were reset.
    pub fn reset_rate_limits(
        &self,
        credential: &str,
        platform: Option<&str>,
        endpoint: Option<&str>,
    ) -> usize {
        let now = current_time_ms();
        let mut reset = 0;
        for entry in self.counters.iter() {
            let key = entry.key();
            if key.credential != credential
                || platform.map_or(false, |p| key.platform != p)
                || endpoint.map_or(false, |e| key.endpoint != e)
            {
                continue;
            }
            entry.value().usage.lock().reset();
            entry.value().burst.reset(now);
            reset += 1;
        }
        info!(credential, ?platform, ?endpoint, reset, "Rate limits reset");
        reset
    }

    /// Remaining budget of `key` now.
    pub fn get_rate_limit_status(&self, key: &RateLimitKey) -> RateLimitStatus {
        self.get_rate_limit_status_at(key, current_time_ms())
    }

    /// Remaining budget of `key` at `now_ms`.
    pub fn get_rate_limit_status_at(&self, key: &RateLimitKey, now_ms: u64) -> RateLimitStatus {
        let config = self.config_for(&key.platform, &key.endpoint);
        let cell = self.counters.get(key).map(|c| c.value().clone());

        let limit = |window| config.as_ref().and_then(|c| limit_of(c, window));
        let empty = UsageCounter::default();
        let usage_guard = cell.as_ref().map(|c| c.usage.lock());
        let usage = usage_guard.as_deref().unwrap_or(&empty);

        let window_status = |window: LimitWindow| {
            let length = window.length_ms().unwrap_or(60_000);
            usage.window(window).status(limit(window), now_ms, length)
        };

        let burst = config.as_ref().and_then(|c| {
            let capacity = c.burst_limit?;
            let available = cell.as_ref().map_or(capacity, |cell| {
                cell.sync_burst(c, now_ms);
                cell.burst.available_at(now_ms)
            });
            Some(BurstStatus {
                capacity,
                available,
                window_ms: c.burst_window_seconds.saturating_mul(1000),
            })
        });

        RateLimitStatus {
            key: key.clone(),
            metered: config.is_some(),
            minute: window_status(LimitWindow::Minute),
            hour: window_status(LimitWindow::Hour),
            day: window_status(LimitWindow::Day),
            burst,
            total_allowed: usage.total_allowed,
            total_limited: usage.total_limited,
        }
    }

    /// Most recent hits, newest first.
    pub fn recent_hits(&self, limit: usize) -> Vec<RateLimitHit> {
        self.recent_hits.lock().iter().rev().take(limit).cloned().collect()
    }

    /// Hits recorded since creation.
    pub fn total_hits(&self) -> u64 {
        self.total_hits.load(Ordering::Relaxed)
    }

    /// Keys with live counters.
    pub fn tracked_keys(&self) -> usize {
        self.counters.len()
    }

    /// Whether the last store write failed.
    pub fn persistence_degraded(&self) -> bool {
        self.persist
            .as_ref()
            .map_or(false, |p| p.state().degraded.load(Ordering::Acquire))
    }

    /// Waits until queued hits and configs reached the store.
    /// Returns `true` immediately when there is no store.
    pub fn flush_persistence(&self, timeout: Duration) -> bool {
        self.persist.as_ref().map_or(true, |p| p.flush(timeout))
    }
}

impl std::fmt::Debug for RateLimitLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitLedger")
            .field("platform_configs", &self.configs.read().len())
            .field("tracked_keys", &self.counters.len())
            .field("total_hits", &self.total_hits())
            .field("persistence", &self.persist)
            .finish()
    }
}
