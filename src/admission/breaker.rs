//! # Circuit Breaker Registry
//!
//! One breaker per subject, created lazily the first time a subject is
//! opened or has a send outcome recorded. Breakers are never removed, only
//! reset by `close`.
//!
//! ```text
//!                 failure rate >= threshold
//!     ┌────────┐  (min samples reached)      ┌──────┐
//!     │ Closed │ ──────────────────────────► │ Open │ ◄──── manual open
//!     └────────┘                             └──────┘       (no auto probe)
//!         ▲  ▲                                  │  ▲
//!         │  │ probe success     cooldown elapsed │  │ probe failure
//!         │  │                                  ▼  │
//!         │  └─────────────────────────────── ┌──────────┐
//!         │                                   │ HalfOpen │
//!         └──── manual close (any state) ──── └──────────┘
//! ```
//!
//! All methods return the transition event (if any) instead of emitting
//! it, so callers can dispatch after releasing their own locks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::config::BackpressureConfig;
use super::events::ControllerEvent;

/// Outcomes kept per subject, whatever the window length.
const MAX_OUTCOMES_PER_SUBJECT: usize = 4_096;

/// State of one subject's breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Traffic flows normally.
    Closed,
    /// Every publish for the subject is rejected.
    Open,
    /// A fraction of publishes is admitted as recovery probes.
    HalfOpen,
}

/// Outcome of consulting a breaker for one publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerAdmission {
    /// Closed (or unknown) subject.
    Allowed,
    /// Half-open and selected as a probe.
    Probe,
    /// Open, or half-open and not selected.
    Rejected,
}

impl BreakerAdmission {
    /// True unless the breaker rejected the publish.
    #[inline]
    pub fn is_admitted(self) -> bool {
        !matches!(self, Self::Rejected)
    }
}

/// Point-in-time view of a breaker, for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    /// Subject the breaker guards.
    pub subject: String,
    /// Current state.
    pub state: BreakerState,
    /// When the breaker last opened.
    pub opened_at_ms: Option<u64>,
    /// Opened by an operator; suppresses automatic half-open.
    pub manual_override: bool,
    /// Failures currently inside the rolling window.
    pub window_failures: usize,
    /// Total outcomes currently inside the rolling window.
    pub window_samples: usize,
    /// Lifetime number of openings.
    pub total_opens: u64,
}

#[derive(Debug)]
struct BreakerEntry {
    state: BreakerState,
    opened_at_ms: Option<u64>,
    manual_override: bool,
    // (timestamp, success)
    outcomes: VecDeque<(u64, bool)>,
    total_opens: u64,
}

impl BreakerEntry {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            opened_at_ms: None,
            manual_override: false,
            outcomes: VecDeque::new(),
            total_opens: 0,
        }
    }

    fn prune(&mut self, window_ms: u64, now_ms: u64) {
        let cutoff = now_ms.saturating_sub(window_ms);
        while self.outcomes.front().is_some_and(|(ts, _)| *ts < cutoff) {
            self.outcomes.pop_front();
        }
    }

    fn push_outcome(&mut self, now_ms: u64, success: bool) {
        if self.outcomes.len() >= MAX_OUTCOMES_PER_SUBJECT {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back((now_ms, success));
    }

    fn failures(&self) -> usize {
        self.outcomes.iter().filter(|(_, ok)| !ok).count()
    }

    fn maybe_half_open(&mut self, config: &BackpressureConfig, now_ms: u64) {
        if self.state == BreakerState::Open && !self.manual_override {
            let opened = self.opened_at_ms.unwrap_or(now_ms);
            if now_ms.saturating_sub(opened) >= config.breaker_cooldown_ms {
                self.state = BreakerState::HalfOpen;
            }
        }
    }
}

/// Per-subject circuit breakers.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Mutex<BreakerEntry>, ahash::RandomState>,
    // breakers not in the Closed state
    tripped: AtomicUsize,
}

impl CircuitBreakerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        let shards = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(8)
            .next_power_of_two()
            .clamp(4, 64);
        Self {
            breakers: DashMap::with_hasher_and_shard_amount(ahash::RandomState::new(), shards),
            tripped: AtomicUsize::new(0),
        }
    }

    /// Decides whether a publish for `subject` may pass.
    ///
    /// `draw` is a uniform sample in `[0, 1)` used for half-open probing.
    pub fn admit(
        &self,
        subject: &str,
        config: &BackpressureConfig,
        now_ms: u64,
        draw: f64,
    ) -> BreakerAdmission {
        let Some(slot) = self.breakers.get(subject) else {
            return BreakerAdmission::Allowed;
        };
        let mut entry = slot.lock();
        entry.maybe_half_open(config, now_ms);
        match entry.state {
            BreakerState::Closed => BreakerAdmission::Allowed,
            BreakerState::Open => BreakerAdmission::Rejected,
            BreakerState::HalfOpen if draw < config.half_open_probe_fraction => {
                BreakerAdmission::Probe
            }
            BreakerState::HalfOpen => BreakerAdmission::Rejected,
        }
    }

    /// Opens the breaker for `subject` on operator request.
    ///
    /// Idempotent: only the first call on a closed breaker yields an event.
    pub fn open(&self, subject: &str, now_ms: u64) -> Option<ControllerEvent> {
        let slot = self
            .breakers
            .entry(subject.to_string())
            .or_insert_with(|| Mutex::new(BreakerEntry::new()));
        let mut entry = slot.lock();
        entry.manual_override = true;
        if entry.state == BreakerState::Open {
            return None;
        }
        if entry.state == BreakerState::Closed {
            self.tripped.fetch_add(1, Ordering::AcqRel);
        }
        entry.state = BreakerState::Open;
        entry.opened_at_ms = Some(now_ms);
        entry.total_opens += 1;
        warn!(subject, "Circuit breaker opened manually");
        Some(ControllerEvent::CircuitBreakerOpened {
            subject: subject.to_string(),
            manual: true,
        })
    }

    /// Closes and resets the breaker for `subject`.
    ///
    /// Idempotent: closing a closed (or unknown) breaker yields no event.
    pub fn close(&self, subject: &str) -> Option<ControllerEvent> {
        let slot = self.breakers.get(subject)?;
        let mut entry = slot.lock();
        entry.outcomes.clear();
        entry.manual_override = false;
        if entry.state == BreakerState::Closed {
            return None;
        }
        entry.state = BreakerState::Closed;
        entry.opened_at_ms = None;
        self.tripped.fetch_sub(1, Ordering::AcqRel);
        info!(subject, "Circuit breaker closed");
        Some(ControllerEvent::CircuitBreakerClosed {
            subject: subject.to_string(),
        })
    }

    /// Records a successful downstream send.
    ///
    /// A success while half-open closes the breaker.
    pub fn record_success(
        &self,
        subject: &str,
        config: &BackpressureConfig,
        now_ms: u64,
    ) -> Option<ControllerEvent> {
        let slot = self.slot(subject);
        let mut entry = slot.lock();
        entry.maybe_half_open(config, now_ms);
        entry.prune(config.failure_window_ms, now_ms);
        entry.push_outcome(now_ms, true);

        if entry.state != BreakerState::HalfOpen {
            return None;
        }
        entry.state = BreakerState::Closed;
        entry.opened_at_ms = None;
        entry.outcomes.clear();
        self.tripped.fetch_sub(1, Ordering::AcqRel);
        info!(subject, "Circuit breaker closed after successful probe");
        Some(ControllerEvent::CircuitBreakerClosed {
            subject: subject.to_string(),
        })
    }

    /// Records a failed downstream send.
    ///
    /// Opens a closed breaker once the failure rate over the window reaches
    /// the threshold; re-opens a half-open one immediately.
    pub fn record_failure(
        &self,
        subject: &str,
        config: &BackpressureConfig,
        now_ms: u64,
    ) -> Option<ControllerEvent> {
        let slot = self.slot(subject);
        let mut entry = slot.lock();
        entry.maybe_half_open(config, now_ms);
        entry.prune(config.failure_window_ms, now_ms);
        entry.push_outcome(now_ms, false);

        match entry.state {
            BreakerState::Open => None,
            BreakerState::HalfOpen => {
                entry.state = BreakerState::Open;
                entry.opened_at_ms = Some(now_ms);
                entry.total_opens += 1;
                warn!(subject, "Circuit breaker re-opened after failed probe");
                Some(ControllerEvent::CircuitBreakerOpened {
                    subject: subject.to_string(),
                    manual: false,
                })
            }
            BreakerState::Closed => {
                let samples = entry.outcomes.len();
                if samples < config.min_failure_samples.max(1) {
                    return None;
                }
                let failure_pct = entry.failures() as f64 * 100.0 / samples as f64;
                if failure_pct < config.failure_threshold_percent {
                    return None;
                }
                entry.state = BreakerState::Open;
                entry.opened_at_ms = Some(now_ms);
                entry.total_opens += 1;
                self.tripped.fetch_add(1, Ordering::AcqRel);
                warn!(
                    subject,
                    failure_pct,
                    samples,
                    "Circuit breaker opened on failure rate"
                );
                Some(ControllerEvent::CircuitBreakerOpened {
                    subject: subject.to_string(),
                    manual: false,
                })
            }
        }
    }

    /// Returns `true` if any breaker is open or half-open.
    #[inline]
    pub fn any_open(&self) -> bool {
        self.tripped.load(Ordering::Acquire) > 0
    }

    /// Number of breakers that are open or half-open.
    #[inline]
    pub fn open_count(&self) -> usize {
        self.tripped.load(Ordering::Acquire)
    }

    /// Number of subjects with a breaker.
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// True when no breaker was ever created.
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Current state of `subject`'s breaker; unknown subjects are closed.
    pub fn state(&self, subject: &str) -> BreakerState {
        self.breakers
            .get(subject)
            .map(|slot| slot.lock().state)
            .unwrap_or(BreakerState::Closed)
    }

    /// Snapshot of one breaker, if it exists.
    pub fn snapshot(&self, subject: &str) -> Option<BreakerSnapshot> {
        let slot = self.breakers.get(subject)?;
        let entry = slot.lock();
        Some(Self::to_snapshot(subject, &entry))
    }

    /// Snapshots of every breaker that is not closed.
    pub fn open_subjects(&self) -> Vec<BreakerSnapshot> {
        let mut out: Vec<BreakerSnapshot> = self
            .breakers
            .iter()
            .filter_map(|item| {
                let entry = item.value().lock();
                (entry.state != BreakerState::Closed)
                    .then(|| Self::to_snapshot(item.key(), &entry))
            })
            .collect();
        out.sort_by(|a, b| a.subject.cmp(&b.subject));
        out
    }

    fn slot(&self, subject: &str) -> dashmap::mapref::one::Ref<'_, String, Mutex<BreakerEntry>> {
        if let Some(slot) = self.breakers.get(subject) {
            return slot;
        }
        debug!(subject, "Creating circuit breaker");
        self.breakers
            .entry(subject.to_string())
            .or_insert_with(|| Mutex::new(BreakerEntry::new()))
            .downgrade()
    }

    fn to_snapshot(subject: &str, entry: &BreakerEntry) -> BreakerSnapshot {
        BreakerSnapshot {
            subject: subject.to_string(),
            state: entry.state,
            opened_at_ms: entry.opened_at_ms,
            manual_override: entry.manual_override,
            window_failures: entry.failures(),
            window_samples: entry.outcomes.len(),
            total_opens: entry.total_opens,
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("breakers", &self.breakers.len())
            .field("tripped", &self.open_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BackpressureConfig {
        BackpressureConfig {
            min_failure_samples: 4,
            failure_threshold_percent: 50.0,
            failure_window_ms: 1_000,
            breaker_cooldown_ms: 100,
            half_open_probe_fraction: 0.5,
            ..Default::default()
        }
    }

    #[test]
    fn test_unknown_subject_is_closed() {
        let registry = CircuitBreakerRegistry::new();
        let cfg = config();
        assert_eq!(registry.admit("x", &cfg, 0, 0.0), BreakerAdmission::Allowed);
        assert_eq!(registry.state("x"), BreakerState::Closed);
        assert!(registry.is_empty());
        assert!(registry.close("x").is_none());
    }

    #[test]
    fn test_manual_open_is_idempotent() {
        let registry = CircuitBreakerRegistry::new();
        assert!(registry.open("x", 10).is_some());
        assert!(registry.open("x", 20).is_none());
        assert_eq!(registry.open_count(), 1);
        let snap = registry.snapshot("x").unwrap();
        assert_eq!(snap.state, BreakerState::Open);
        assert_eq!(snap.opened_at_ms, Some(10));
        assert_eq!(snap.total_opens, 1);
    }

    #[test]
    fn test_manual_open_blocks_auto_probe() {
        let registry = CircuitBreakerRegistry::new();
        let cfg = config();
        registry.open("x", 0);
        // long after the cooldown, still rejected
        assert_eq!(registry.admit("x", &cfg, 1_000_000, 0.0), BreakerAdmission::Rejected);
        assert!(registry.close("x").is_some());
        assert!(registry.close("x").is_none());
        assert_eq!(registry.admit("x", &cfg, 1_000_001, 0.0), BreakerAdmission::Allowed);
        assert!(!registry.any_open());
    }

    #[test]
    fn test_auto_open_needs_min_samples() {
        let registry = CircuitBreakerRegistry::new();
        let cfg = config();
        for t in 0..3 {
            assert!(registry.record_failure("x", &cfg, t).is_none());
        }
        let event = registry.record_failure("x", &cfg, 3);
        assert!(matches!(
            event,
            Some(ControllerEvent::CircuitBreakerOpened { manual: false, .. })
        ));
        assert!(registry.any_open());
    }

    #[test]
    fn test_successes_keep_breaker_closed() {
        let registry = CircuitBreakerRegistry::new();
        let cfg = config();
        for t in 0..10 {
            registry.record_success("x", &cfg, t);
        }
        for t in 10..14 {
            assert!(registry.record_failure("x", &cfg, t).is_none());
        }
        assert_eq!(registry.state("x"), BreakerState::Closed);
    }

    #[test]
    fn test_old_failures_leave_the_window() {
        let registry = CircuitBreakerRegistry::new();
        let cfg = config();
        for t in 0..3 {
            registry.record_failure("x", &cfg, t);
        }
        // window is 1s; earlier failures are gone
        assert!(registry.record_failure("x", &cfg, 5_000).is_none());
        assert_eq!(registry.snapshot("x").unwrap().window_samples, 1);
    }

    #[test]
    fn test_half_open_probe_success_closes() {
        let registry = CircuitBreakerRegistry::new();
        let cfg = config();
        for t in 0..4 {
            registry.record_failure("x", &cfg, t);
        }
        assert_eq!(registry.admit("x", &cfg, 50, 0.0), BreakerAdmission::Rejected);
        // cooldown elapsed: draw below the probe fraction is a probe
        assert_eq!(registry.admit("x", &cfg, 200, 0.1), BreakerAdmission::Probe);
        assert_eq!(registry.admit("x", &cfg, 200, 0.9), BreakerAdmission::Rejected);
        assert_eq!(registry.state("x"), BreakerState::HalfOpen);

        let event = registry.record_success("x", &cfg, 210);
        assert!(matches!(event, Some(ControllerEvent::CircuitBreakerClosed { .. })));
        assert_eq!(registry.open_count(), 0);
    }

    #[test]
    fn test_half_open_probe_failure_reopens() {
        let registry = CircuitBreakerRegistry::new();
        let cfg = config();
        for t in 0..4 {
            registry.record_failure("x", &cfg, t);
        }
        registry.admit("x", &cfg, 200, 0.0);
        let event = registry.record_failure("x", &cfg, 201);
        assert!(matches!(event, Some(ControllerEvent::CircuitBreakerOpened { .. })));
        assert_eq!(registry.state("x"), BreakerState::Open);
        assert_eq!(registry.open_count(), 1);
        assert_eq!(registry.snapshot("x").unwrap().total_opens, 2);
    }

    #[test]
    fn test_open_subjects_sorted() {
        let registry = CircuitBreakerRegistry::new();
        registry.open("b", 0);
        registry.open("a", 0);
        registry.open("c", 0);
        registry.close("c");
        let subjects: Vec<_> = registry.open_subjects().into_iter().map(|s| s.subject).collect();
        assert_eq!(subjects, vec!["a", "b"]);
    }

    #[test]
    fn test_concurrent_opens_emit_once() {
        use std::sync::Arc;
        use std::thread;

        let registry = Arc::new(CircuitBreakerRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || registry.open("shared", 1).is_some() as usize)
            })
            .collect();
        let events: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(events, 1);
        assert_eq!(registry.open_count(), 1);
    }
}
