//! Weighted fair-share tracking per platform.

use std::collections::{HashMap, VecDeque};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ConfigError, ConfigResult};
use crate::utils::current_time_ms;

/// Weight given to credentials that were never tuned.
pub const DEFAULT_WEIGHT: f64 = 1.0;
/// Priority given to credentials that were never tuned.
pub const DEFAULT_PRIORITY: u8 = 5;
/// Accepted credential priorities.
pub const PRIORITY_RANGE: std::ops::RangeInclusive<u8> = 1..=10;

/// Consumption is bucketed per second inside the rolling window.
const BUCKET_MS: u64 = 1_000;

/// Scheduler tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FairShareConfig {
    /// Largest accepted spread between the highest and lowest fairness
    /// ratio of active credentials on a platform.
    pub tolerance: f64,
    /// Length of the rolling consumption window.
    pub window_ms: u64,
}

impl Default for FairShareConfig {
    fn default() -> Self {
        Self {
            tolerance: 5.0,
            window_ms: 60_000,
        }
    }
}

impl FairShareConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if !self.tolerance.is_finite() || self.tolerance <= 0.0 {
            return Err(ConfigError::invalid(
                "tolerance",
                "must be a positive finite number",
            ));
        }
        if self.window_ms == 0 {
            return Err(ConfigError::invalid("window_ms", "must be greater than 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct CredentialShare {
    weight: f64,
    priority: u8,
    active: bool,
    buckets: VecDeque<(u64, u64)>,
    lifetime_consumed: u64,
}

impl Default for CredentialShare {
    fn default() -> Self {
        Self {
            weight: DEFAULT_WEIGHT,
            priority: DEFAULT_PRIORITY,
            active: true,
            buckets: VecDeque::new(),
            lifetime_consumed: 0,
        }
    }
}

impl CredentialShare {
    fn consumed_since(&self, cutoff_ms: u64) -> u64 {
        self.buckets
            .iter()
            .filter(|(start, _)| *start >= cutoff_ms)
            .map(|(_, units)| units)
            .sum()
    }

    fn ratio_since(&self, cutoff_ms: u64) -> f64 {
        self.consumed_since(cutoff_ms) as f64 / self.weight
    }

    fn record(&mut self, units: u64, now_ms: u64) {
        let slot = now_ms - now_ms % BUCKET_MS;
        match self.buckets.back_mut() {
            Some((start, total)) if *start == slot => *total += units,
            _ => self.buckets.push_back((slot, units)),
        }
        self.lifetime_consumed = self.lifetime_consumed.saturating_add(units);
    }

    fn prune(&mut self, cutoff_ms: u64) {
        while self.buckets.front().map_or(false, |(start, _)| *start < cutoff_ms) {
            self.buckets.pop_front();
        }
    }
}

#[derive(Debug, Default)]
struct PlatformShare {
    credentials: HashMap<String, CredentialShare>,
    last_rebalance_at_ms: Option<u64>,
}

impl PlatformShare {
    fn credential(&mut self, credential: &str) -> &mut CredentialShare {
        self.credentials.entry(credential.to_string()).or_default()
    }

    /// (min, max, most under-served) over active credentials.
    fn spread(&self, cutoff_ms: u64) -> Option<(f64, f64, &str)> {
        let mut active = self
            .credentials
            .iter()
            .filter(|(_, share)| share.active)
            .map(|(name, share)| (name.as_str(), share.ratio_since(cutoff_ms), share.priority));

        let (name, ratio, priority) = active.next()?;
        let (mut min, mut max, mut under, mut under_priority) = (ratio, ratio, name, priority);
        for (name, ratio, priority) in active {
            max = max.max(ratio);
            let better = ratio < min
                || (ratio == min
                    && (priority > under_priority
                        || (priority == under_priority && name < under)));
            if better {
                min = ratio;
                under = name;
                under_priority = priority;
            }
        }
        Some((min, max, under))
    }
}

/// Result of [`FairShareScheduler::check_fairness`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FairnessCheck {
    /// Platform checked.
    pub platform: String,
    /// `false` when the ratio spread exceeds the tolerance.
    pub fair: bool,
    /// Highest minus lowest fairness ratio among active credentials.
    pub spread: f64,
    /// Configured tolerance.
    pub tolerance: f64,
    /// Active credential with the lowest ratio.
    pub most_underserved: Option<String>,
    /// Active credentials considered.
    pub active_credentials: usize,
}

/// One credential in a [`FairShareSnapshot`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CredentialShareSnapshot {
    /// Credential name.
    pub credential: String,
    /// Scheduling weight.
    pub weight: f64,
    /// Tie-break priority, 1..=10.
    pub priority: u8,
    /// Whether it takes part in fairness checks.
    pub active: bool,
    /// Units consumed inside the rolling window.
    pub consumed: u64,
    /// `consumed / weight`.
    pub fairness_ratio: f64,
    /// Units consumed since registration.
    pub lifetime_consumed: u64,
}

/// Raw per-credential numbers of one platform.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FairShareSnapshot {
    /// Platform name.
    pub platform: String,
    /// Credentials sorted by name.
    pub credentials: Vec<CredentialShareSnapshot>,
    /// Last call to `rebalance`, if any.
    pub last_rebalance_at_ms: Option<u64>,
    /// Window the consumption figures cover.
    pub window_ms: u64,
}

/// Keeps credentials sharing a platform budget close to their weighted
/// fair share.
///
/// Each credential accumulates consumption over a rolling window. Its
/// fairness ratio is `consumed / weight`; the platform is unfair when the
/// ratios of active credentials spread further apart than the tolerance.
/// [`next_credential`](Self::next_credential) always services the lowest
/// ratio first, which keeps the spread bounded under sustained contention.
///
/// ```rust
/// use floodgate::fairness::FairShareScheduler;
///
/// let scheduler = FairShareScheduler::default();
/// scheduler.record_consumption("x", "big", 10);
/// scheduler.record_consumption("x", "small", 1);
///
/// let next = scheduler.next_credential("x", [("big", 1), ("small", 2)]);
/// assert_eq!(next.as_deref(), Some("small"));
/// ```
#[derive(Debug)]
pub struct FairShareScheduler {
    config: FairShareConfig,
    platforms: DashMap<String, PlatformShare, ahash::RandomState>,
}

impl Default for FairShareScheduler {
    fn default() -> Self {
        Self::new(FairShareConfig::default())
    }
}

impl FairShareScheduler {
    /// Creates a scheduler.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid. Use [`try_new`](Self::try_new)
    /// to handle the error instead.
    pub fn new(config: FairShareConfig) -> Self {
        match Self::try_new(config) {
            Ok(scheduler) => scheduler,
            Err(e) => panic!("invalid fair-share configuration: {e}"),
        }
    }

    /// Creates a scheduler, rejecting an invalid configuration.
    pub fn try_new(config: FairShareConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            platforms: DashMap::with_hasher(ahash::RandomState::new()),
        })
    }

    /// Scheduler tunables.
    pub fn config(&self) -> &FairShareConfig {
        &self.config
    }

    fn cutoff(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.config.window_ms)
    }

    fn with_credential<R>(
        &self,
        platform: &str,
        credential: &str,
        f: impl FnOnce(&mut CredentialShare) -> R,
    ) -> R {
        let mut share = self.platforms.entry(platform.to_string()).or_default();
        f(share.credential(credential))
    }

    // ------------------------------------------------------------------
    // Credential administration
    // ------------------------------------------------------------------

    /// Registers `credential` on `platform` with default weight and
    /// priority. No-op if already known.
    pub fn register_credential(&self, platform: &str, credential: &str) {
        self.with_credential(platform, credential, |_| ());
    }

    /// Sets the scheduling weight. Must be positive and finite.
    pub fn set_weight(&self, platform: &str, credential: &str, weight: f64) -> ConfigResult<()> {
        if !weight.is_finite() || weight <= 0.0 {
            return Err(ConfigError::invalid("weight", "must be a positive finite number"));
        }
        self.with_credential(platform, credential, |share| share.weight = weight);
        info!(platform, credential, weight, "Credential weight updated");
        Ok(())
    }

    /// Sets the tie-break priority, 1 (lowest) to 10 (highest).
    pub fn set_priority(&self, platform: &str, credential: &str, priority: u8) -> ConfigResult<()> {
        if !PRIORITY_RANGE.contains(&priority) {
            return Err(ConfigError::invalid("priority", "must be between 1 and 10"));
        }
        self.with_credential(platform, credential, |share| share.priority = priority);
        info!(platform, credential, priority, "Credential priority updated");
        Ok(())
    }

    /// Includes or excludes `credential` from fairness checks.
    pub fn set_active(&self, platform: &str, credential: &str, active: bool) {
        self.with_credential(platform, credential, |share| share.active = active);
        info!(platform, credential, active, "Credential activity updated");
    }

    // ------------------------------------------------------------------
    // Accounting
    // ------------------------------------------------------------------

    /// Charges `units` of platform budget to `credential`.
    #[inline]
    pub fn record_consumption(&self, platform: &str, credential: &str, units: u64) {
        self.record_consumption_at(platform, credential, units, current_time_ms());
    }

    /// Charges `units` to `credential` at `now_ms`.
    pub fn record_consumption_at(&self, platform: &str, credential: &str, units: u64, now_ms: u64) {
        let cutoff = self.cutoff(now_ms);
        self.with_credential(platform, credential, |share| {
            share.prune(cutoff);
            share.record(units, now_ms);
        });
    }

    /// `consumed / weight` of `credential`, `None` if unknown.
    pub fn fairness_ratio(&self, platform: &str, credential: &str) -> Option<f64> {
        self.fairness_ratio_at(platform, credential, current_time_ms())
    }

    /// `consumed / weight` of `credential` at `now_ms`.
    pub fn fairness_ratio_at(&self, platform: &str, credential: &str, now_ms: u64) -> Option<f64> {
        let cutoff = self.cutoff(now_ms);
        self.platforms
            .get(platform)?
            .credentials
            .get(credential)
            .map(|share| share.ratio_since(cutoff))
    }

    /// Compares the fairness ratios of active credentials on `platform`.
    pub fn check_fairness(&self, platform: &str) -> FairnessCheck {
        self.check_fairness_at(platform, current_time_ms())
    }

    /// Fairness check at `now_ms`.
    pub fn check_fairness_at(&self, platform: &str, now_ms: u64) -> FairnessCheck {
        let cutoff = self.cutoff(now_ms);
        let tolerance = self.config.tolerance;
        let state = self.platforms.get(platform);

        let (spread, under, active) = state
            .as_deref()
            .and_then(|s| {
                let active = s.credentials.values().filter(|c| c.active).count();
                s.spread(cutoff)
                    .map(|(min, max, under)| (max - min, Some(under.to_string()), active))
            })
            .unwrap_or((0.0, None, 0));

        let fair = spread <= tolerance;
        if !fair {
            debug!(platform, spread, tolerance, "Platform is outside fair share");
        }
        FairnessCheck {
            platform: platform.to_string(),
            fair,
            spread,
            tolerance,
            most_underserved: under,
            active_credentials: active,
        }
    }

    /// Whether `credential` is within the tolerance of the most
    /// under-served active credential. Unknown credentials are.
    pub fn is_within_fair_share(&self, platform: &str, credential: &str) -> bool {
        let cutoff = self.cutoff(current_time_ms());
        let Some(state) = self.platforms.get(platform) else {
            return true;
        };
        let Some(share) = state.credentials.get(credential) else {
            return true;
        };
        match state.spread(cutoff) {
            Some((min, _, _)) => share.ratio_since(cutoff) - min <= self.config.tolerance,
            None => true,
        }
    }

    // ------------------------------------------------------------------
    // Selection
    // ------------------------------------------------------------------

    /// Picks which credential to service next among `candidates`, given as
    /// `(credential, oldest_enqueued_at_ms)`.
    ///
    /// Order: active before inactive, then lowest fairness ratio, then
    /// higher priority, then earliest enqueue. Unknown candidates are
    /// registered with defaults.
    pub fn next_credential<'a, I>(&self, platform: &str, candidates: I) -> Option<String>
    where
        I: IntoIterator<Item = (&'a str, u64)>,
    {
        self.next_credential_at(platform, candidates, current_time_ms())
    }

    /// [`next_credential`](Self::next_credential) at `now_ms`.
    pub fn next_credential_at<'a, I>(
        &self,
        platform: &str,
        candidates: I,
        now_ms: u64,
    ) -> Option<String>
    where
        I: IntoIterator<Item = (&'a str, u64)>,
    {
        let cutoff = self.cutoff(now_ms);
        let mut state = self.platforms.entry(platform.to_string()).or_default();

        let mut best: Option<(bool, f64, u8, u64, &'a str)> = None;
        for (credential, enqueued_at) in candidates {
            let share = state.credential(credential);
            let candidate = (
                share.active,
                share.ratio_since(cutoff),
                share.priority,
                enqueued_at,
                credential,
            );
            let better = match &best {
                None => true,
                Some(current) => ranks_before(&candidate, current),
            };
            if better {
                best = Some(candidate);
            }
        }
        best.map(|(.., credential)| credential.to_string())
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Raw per-credential numbers of `platform`.
    pub fn get_fair_share_state(&self, platform: &str) -> Option<FairShareSnapshot> {
        let cutoff = self.cutoff(current_time_ms());
        let state = self.platforms.get(platform)?;

        let mut credentials: Vec<_> = state
            .credentials
            .iter()
            .map(|(name, share)| {
                let consumed = share.consumed_since(cutoff);
                CredentialShareSnapshot {
                    credential: name.clone(),
                    weight: share.weight,
                    priority: share.priority,
                    active: share.active,
                    consumed,
                    fairness_ratio: consumed as f64 / share.weight,
                    lifetime_consumed: share.lifetime_consumed,
                }
            })
            .collect();
        credentials.sort_by(|a, b| a.credential.cmp(&b.credential));

        Some(FairShareSnapshot {
            platform: platform.to_string(),
            credentials,
            last_rebalance_at_ms: state.last_rebalance_at_ms,
            window_ms: self.config.window_ms,
        })
    }

    /// Drops consumption older than the window and stamps the rebalance
    /// time. Returns the resulting fairness check.
    pub fn rebalance(&self, platform: &str) -> FairnessCheck {
        let now = current_time_ms();
        let cutoff = self.cutoff(now);
        if let Some(mut state) = self.platforms.get_mut(platform) {
            for share in state.credentials.values_mut() {
                share.prune(cutoff);
            }
            state.last_rebalance_at_ms = Some(now);
        }
        self.check_fairness_at(platform, now)
    }

    /// Platforms with at least one registered credential, sorted.
    pub fn platforms(&self) -> Vec<String> {
        let mut names: Vec<_> = self.platforms.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

/// Selection order of `next_credential`.
fn ranks_before(a: &(bool, f64, u8, u64, &str), b: &(bool, f64, u8, u64, &str)) -> bool {
    if a.0 != b.0 {
        return a.0;
    }
    if a.1 != b.1 {
        return a.1 < b.1;
    }
    if a.2 != b.2 {
        return a.2 > b.2;
    }
    a.3 < b.3
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn scheduler(tolerance: f64) -> FairShareScheduler {
        FairShareScheduler::new(FairShareConfig {
            tolerance,
            window_ms: 60_000,
        })
    }

    #[test]
    fn test_config_validation() {
        assert!(FairShareConfig::default().validate().is_ok());
        assert!(FairShareScheduler::try_new(FairShareConfig {
            tolerance: 0.0,
            ..Default::default()
        })
        .is_err());
        assert!(FairShareScheduler::try_new(FairShareConfig {
            window_ms: 0,
            ..Default::default()
        })
        .is_err());
    }

    #[test]
    fn test_ratio_uses_weight() {
        let s = scheduler(1.0);
        s.set_weight("x", "a", 2.0).unwrap();
        s.record_consumption_at("x", "a", 10, 0);
        s.record_consumption_at("x", "b", 10, 0);
        assert_eq!(s.fairness_ratio_at("x", "a", 0), Some(5.0));
        assert_eq!(s.fairness_ratio_at("x", "b", 0), Some(10.0));
        assert_eq!(s.fairness_ratio_at("x", "c", 0), None);
        assert_eq!(s.fairness_ratio_at("y", "a", 0), None);
    }

    #[test]
    fn test_rejects_bad_admin_values() {
        let s = scheduler(1.0);
        assert!(s.set_weight("x", "a", 0.0).is_err());
        assert!(s.set_weight("x", "a", -1.0).is_err());
        assert!(s.set_weight("x", "a", f64::NAN).is_err());
        assert!(s.set_priority("x", "a", 0).is_err());
        assert!(s.set_priority("x", "a", 11).is_err());
        assert!(s.set_priority("x", "a", 10).is_ok());
    }

    #[test]
    fn test_check_fairness_flags_spread() {
        let s = scheduler(3.0);
        s.record_consumption_at("x", "heavy", 10, 0);
        s.record_consumption_at("x", "light", 2, 0);

        let check = s.check_fairness_at("x", 0);
        assert!(!check.fair);
        assert_eq!(check.spread, 8.0);
        assert_eq!(check.most_underserved.as_deref(), Some("light"));
        assert_eq!(check.active_credentials, 2);

        s.set_active("x", "light", false);
        let check = s.check_fairness_at("x", 0);
        assert!(check.fair);
        assert_eq!(check.active_credentials, 1);
    }

    #[test]
    fn test_unknown_platform_is_fair() {
        let check = scheduler(1.0).check_fairness("nope");
        assert!(check.fair);
        assert_eq!(check.most_underserved, None);
        assert_eq!(check.active_credentials, 0);
    }

    #[test]
    fn test_window_expires_consumption() {
        let s = scheduler(1.0);
        s.record_consumption_at("x", "a", 50, 0);
        assert_eq!(s.fairness_ratio_at("x", "a", 59_000), Some(50.0));
        assert_eq!(s.fairness_ratio_at("x", "a", 61_000), Some(0.0));
    }

    #[test]
    fn test_next_credential_order() {
        let s = scheduler(1.0);
        s.record_consumption_at("x", "a", 5, 0);
        s.record_consumption_at("x", "b", 1, 0);
        s.record_consumption_at("x", "c", 1, 0);

        // lowest ratio wins
        assert_eq!(
            s.next_credential_at("x", [("a", 1), ("b", 5)], 0).as_deref(),
            Some("b")
        );
        // equal ratio: earliest enqueue
        assert_eq!(
            s.next_credential_at("x", [("b", 9), ("c", 3)], 0).as_deref(),
            Some("c")
        );
        // equal ratio: priority beats enqueue time
        s.set_priority("x", "b", 9).unwrap();
        assert_eq!(
            s.next_credential_at("x", [("b", 9), ("c", 3)], 0).as_deref(),
            Some("b")
        );
        // inactive loses to any active candidate
        s.set_active("x", "b", false);
        assert_eq!(
            s.next_credential_at("x", [("a", 0), ("b", 0)], 0).as_deref(),
            Some("a")
        );
        assert_eq!(s.next_credential_at("x", Vec::<(&str, u64)>::new(), 0), None);
    }

    #[test]
    fn test_next_credential_registers_unknown() {
        let s = scheduler(1.0);
        assert_eq!(s.next_credential("x", [("new", 0)]).as_deref(), Some("new"));
        assert_eq!(s.get_fair_share_state("x").unwrap().credentials.len(), 1);
    }

    #[test]
    fn test_within_fair_share() {
        let s = scheduler(2.0);
        s.record_consumption("x", "a", 10);
        s.record_consumption("x", "b", 9);
        assert!(s.is_within_fair_share("x", "a"));
        s.record_consumption("x", "a", 5);
        assert!(!s.is_within_fair_share("x", "a"));
        assert!(s.is_within_fair_share("x", "b"));
        assert!(s.is_within_fair_share("x", "unknown"));
    }

    #[test]
    fn test_snapshot_and_rebalance() {
        let s = scheduler(1.0);
        s.set_weight("x", "b", 4.0).unwrap();
        s.record_consumption("x", "a", 3);
        s.record_consumption("x", "b", 8);

        let state = s.get_fair_share_state("x").unwrap();
        assert_eq!(state.last_rebalance_at_ms, None);
        assert_eq!(state.credentials[0].credential, "a");
        assert_eq!(state.credentials[1].fairness_ratio, 2.0);
        assert_eq!(state.credentials[1].lifetime_consumed, 8);

        let check = s.rebalance("x");
        assert!(check.fair);
        assert!(s.get_fair_share_state("x").unwrap().last_rebalance_at_ms.is_some());
        assert!(s.get_fair_share_state("missing").is_none());
        assert_eq!(s.platforms(), vec!["x".to_string()]);
    }

    fn weights() -> impl Strategy<Value = Vec<f64>> {
        proptest::collection::vec(1u32..=10, 2..=12)
            .prop_map(|w| w.into_iter().map(f64::from).collect())
    }

    proptest! {
        /// Under sustained contention every active credential stays within
        /// the tolerance of every other.
        #[test]
        fn test_fairness_invariant_holds(weights in weights(), rounds in 50usize..400) {
            let s = scheduler(1.0);
            let names: Vec<String> = (0..weights.len()).map(|i| format!("cred_{i}")).collect();
            for (name, weight) in names.iter().zip(&weights) {
                s.set_weight("p", name, *weight).unwrap();
            }

            for _ in 0..rounds {
                let candidates = names.iter().map(|n| (n.as_str(), 0));
                let next = s.next_credential_at("p", candidates, 0).unwrap();
                s.record_consumption_at("p", &next, 1, 0);

                let check = s.check_fairness_at("p", 0);
                prop_assert!(check.fair, "spread {} after serving {}", check.spread, next);
            }
        }
    }
}
