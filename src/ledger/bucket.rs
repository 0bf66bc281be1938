//! Lock-free burst bucket.
//!
//! A token bucket holding at most `capacity` tokens that refills
//! continuously, becoming full again `window_ms` after being emptied.
//!
//! ```text
//!     tokens ──► CAS decrement (bounded retries, ABA repeat detection)
//!     last_refill_ms ──► CAS claim, winner adds the elapsed share
//! ```
//!
//! Status reads (`available_at`) never take a lock, so admin status
//! queries do not contend with the send path.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::utils::{cpu_relax, Backoff, CacheAligned};

/// Maximum CAS retries before giving up.
const MAX_CAS_RETRIES: u32 = 16;

/// Retries before switching from a single relax to exponential backoff.
const CAS_BACKOFF_THRESHOLD: u32 = 4;

/// Identical reads in a row before falling back to a strong CAS.
const MAX_REPEAT_COUNT: u32 = 3;

/// Burst control for one rate limit key.
pub(crate) struct BurstBucket {
    tokens: CacheAligned<AtomicU64>,
    last_refill_ms: CacheAligned<AtomicU64>,
    capacity: AtomicU64,
    window_ms: AtomicU64,
}

impl BurstBucket {
    /// Creates a full bucket.
    pub(crate) fn new(capacity: u64, window_ms: u64, now_ms: u64) -> Self {
        Self {
            tokens: CacheAligned::new(AtomicU64::new(capacity)),
            last_refill_ms: CacheAligned::new(AtomicU64::new(now_ms)),
            capacity: AtomicU64::new(capacity),
            window_ms: AtomicU64::new(window_ms.max(1)),
        }
    }

    pub(crate) fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Acquire)
    }

    pub(crate) fn window_ms(&self) -> u64 {
        self.window_ms.load(Ordering::Acquire)
    }

    /// Applies new limits. Tokens above the new capacity are discarded.
    pub(crate) fn reconfigure(&self, capacity: u64, window_ms: u64) {
        self.capacity.store(capacity, Ordering::Release);
        self.window_ms.store(window_ms.max(1), Ordering::Release);
        self.tokens.get().fetch_min(capacity, Ordering::AcqRel);
    }

    /// Tokens currently available, after accounting for refill.
    pub(crate) fn available_at(&self, now_ms: u64) -> u64 {
        self.refill_if_needed(now_ms);
        self.tokens.get().load(Ordering::Acquire)
    }

    /// Milliseconds until the next token arrives, 0 when one is available.
    pub(crate) fn retry_after_ms(&self, now_ms: u64) -> u64 {
        if self.available_at(now_ms) > 0 {
            return 0;
        }
        let per_token = self.ms_per_token();
        let elapsed = now_ms.saturating_sub(self.last_refill_ms.get().load(Ordering::Acquire));
        per_token.saturating_sub(elapsed).max(1)
    }

    /// Refills the bucket completely.
    pub(crate) fn reset(&self, now_ms: u64) {
        self.last_refill_ms.get().store(now_ms, Ordering::Release);
        self.tokens.get().store(self.capacity(), Ordering::Release);
    }

    /// Takes one token if available.
    pub(crate) fn try_acquire_at(&self, now_ms: u64) -> bool {
        self.refill_if_needed(now_ms);
        self.try_acquire_with_bounded_cas(1)
    }

    fn ms_per_token(&self) -> u64 {
        let capacity = self.capacity().max(1);
        (self.window_ms() / capacity).max(1)
    }

    fn try_acquire_with_bounded_cas(&self, n: u64) -> bool {
        let tokens = self.tokens.get();
        let mut retries = 0;
        let mut last_seen = u64::MAX;
        let mut repeat_count = 0;

        loop {
            let current = tokens.load(Ordering::Acquire);

            if current == last_seen {
                repeat_count += 1;
                if repeat_count >= MAX_REPEAT_COUNT {
                    return current >= n
                        && tokens
                            .compare_exchange(
                                current,
                                current - n,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok();
                }
            } else {
                last_seen = current;
                repeat_count = 0;
            }

            if current < n {
                return false;
            }

            match tokens.compare_exchange_weak(
                current,
                current - n,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => {
                    if actual < n {
                        return false;
                    }

                    retries += 1;
                    if retries >= MAX_CAS_RETRIES {
                        warn!("Burst bucket CAS retry limit reached after {} attempts", retries);
                        return false;
                    }

                    if retries > CAS_BACKOFF_THRESHOLD {
                        for _ in 0..(1 << (retries - CAS_BACKOFF_THRESHOLD).min(4)) {
                            cpu_relax();
                        }
                    } else {
                        cpu_relax();
                    }
                }
            }
        }
    }

    fn refill_if_needed(&self, now_ms: u64) {
        let last_refill = self.last_refill_ms.get().load(Ordering::Acquire);
        let elapsed = now_ms.saturating_sub(last_refill);
        if elapsed == 0 {
            return;
        }

        let capacity = self.capacity();
        let window = self.window_ms();
        let earned = (elapsed as u128 * capacity as u128 / window as u128) as u64;
        if earned == 0 {
            return;
        }

        // A partial token's worth of time stays on the clock.
        let (tokens_to_add, new_refill_time) = if earned >= capacity {
            (capacity, now_ms)
        } else {
            let consumed = (earned as u128 * window as u128 / capacity as u128) as u64;
            (earned, last_refill + consumed)
        };

        if self
            .last_refill_ms
            .get()
            .compare_exchange(last_refill, new_refill_time, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.add_tokens(tokens_to_add, capacity);
        }
        // Losing the claim means another thread is refilling.
    }

    fn add_tokens(&self, amount: u64, capacity: u64) {
        let tokens = self.tokens.get();
        let mut backoff = Backoff::new(MAX_CAS_RETRIES);
        let mut current = tokens.load(Ordering::Acquire);

        loop {
            let new_tokens = current.saturating_add(amount).min(capacity);
            match tokens.compare_exchange_weak(
                current,
                new_tokens,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    debug!("Refilled {} burst tokens", new_tokens.saturating_sub(current));
                    return;
                }
                Err(actual) => {
                    current = actual;
                    if backoff.is_at_max() {
                        warn!("Burst bucket refill CAS retry limit reached");
                        return;
                    }
                    backoff.backoff();
                }
            }
        }
    }
}

impl std::fmt::Debug for BurstBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BurstBucket")
            .field("tokens", &self.tokens.get().load(Ordering::Relaxed))
            .field("capacity", &self.capacity())
            .field("window_ms", &self.window_ms())
            .finish()
    }
}
