//! # Utility Functions
//!
//! Clock and CPU helpers shared by every subsystem.
//!
//! ```text
//!     current_time_ms() ─► wall-clock base captured once, advanced by Instant
//!     cpu_relax()       ─► PAUSE (x86_64) / YIELD (aarch64) in CAS loops
//!     Backoff           ─► spin, then yield, for contended CAS retries
//!     CacheAligned<T>   ─► keeps hot counters on their own cache line
//! ```

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Cache line size for x86_64 processors (Intel/AMD).
#[cfg(target_arch = "x86_64")]
pub const CACHE_LINE_SIZE: usize = 64;

/// Cache line size for ARM64 processors.
#[cfg(target_arch = "aarch64")]
pub const CACHE_LINE_SIZE: usize = 128;

/// Default cache line size for other architectures.
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub const CACHE_LINE_SIZE: usize = 64;

// Wall-clock epoch milliseconds at first use, advanced by a monotonic
// Instant so that clock jumps never move windows backwards.
static START_TIME_BASE: OnceLock<(Instant, u64)> = OnceLock::new();

fn time_base() -> &'static (Instant, u64) {
    START_TIME_BASE.get_or_init(|| {
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        (Instant::now(), epoch_ms)
    })
}

/// Returns the current time in milliseconds since UNIX epoch.
///
/// Used for window starts, enqueue stamps, breaker cooldowns and
/// hysteresis timers.
///
/// # Example
///
/// ```rust
/// use floodgate::current_time_ms;
///
/// let now = current_time_ms();
/// assert!(now > 0);
/// ```
#[inline(always)]
pub fn current_time_ms() -> u64 {
    let (start, base_ms) = time_base();
    base_ms.saturating_add(start.elapsed().as_millis() as u64)
}

/// CPU-specific relaxation hint for spin loops.
///
/// - **x86_64**: PAUSE
/// - **ARM64**: YIELD
/// - **Others**: standard spin loop hint
#[inline(always)]
pub fn cpu_relax() {
    #[cfg(target_arch = "x86_64")]
    {
        #[cfg(any(target_feature = "sse2", target_feature = "sse"))]
        unsafe {
            std::arch::x86_64::_mm_pause();
        }
        #[cfg(not(any(target_feature = "sse2", target_feature = "sse")))]
        {
            std::hint::spin_loop();
        }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        std::hint::spin_loop();
    }
}

/// Cache-aligned wrapper for values to prevent false sharing.
///
/// The controller's publish counters are bumped by every caller thread;
/// keeping each on its own line stops them from invalidating each other.
#[cfg(target_arch = "x86_64")]
#[repr(C, align(64))]
pub(crate) struct CacheAligned<T>(pub T);
#[cfg(target_arch = "aarch64")]
#[repr(C, align(128))]
pub(crate) struct CacheAligned<T>(pub T);
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[repr(C, align(64))]
pub(crate) struct CacheAligned<T>(pub T);

impl<T> CacheAligned<T> {
    /// Creates a new cache-aligned value.
    #[inline(always)]
    pub(crate) const fn new(value: T) -> Self {
        Self(value)
    }

    /// Gets a reference to the inner value.
    #[inline(always)]
    pub(crate) fn get(&self) -> &T {
        &self.0
    }
}

impl<T: Default> Default for CacheAligned<T> {
    fn default() -> Self {
        Self(T::default())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for CacheAligned<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Exponential backoff helper for CAS retry loops.
///
/// ```text
///     Attempt 1: Spin 1 time
///     Attempt 2: Spin 2 times
///     Attempt 3: Spin 4 times
///     Attempt 4: Spin 8 times
///     Attempt 5+: Yield to scheduler
/// ```
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    step: u32,
    max_step: u32,
}

impl Backoff {
    /// Creates a new backoff helper with specified maximum steps.
    pub(crate) fn new(max_step: u32) -> Self {
        Self { step: 0, max_step }
    }

    /// Performs one round of backoff and advances the step.
    #[inline]
    pub(crate) fn backoff(&mut self) {
        if self.step < 4 {
            for _ in 0..(1 << self.step) {
                cpu_relax();
            }
        } else {
            std::thread::yield_now();
        }
        self.step = (self.step + 1).min(self.max_step);
    }

    /// Checks if we've reached the maximum backoff level.
    #[inline]
    pub(crate) fn is_at_max(&self) -> bool {
        self.step >= self.max_step
    }
}

/// Computes an exponential retry delay capped at `max_ms`.
///
/// `attempt` 0 yields `base_ms`; each further attempt doubles it.
pub(crate) fn exponential_delay_ms(base_ms: u64, attempt: u32, max_ms: u64) -> u64 {
    let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
    base_ms.saturating_mul(factor).min(max_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_line_size() {
        assert!(CACHE_LINE_SIZE >= 32);
        assert!(CACHE_LINE_SIZE <= 256);
        assert!(CACHE_LINE_SIZE.is_power_of_two());
    }

    #[test]
    fn test_time_functions() {
        let ms1 = current_time_ms();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let ms2 = current_time_ms();

        assert!(ms2 >= ms1 + 10);
    }

    #[test]
    fn test_cache_aligned() {
        use std::sync::atomic::{AtomicU64, Ordering};

        let aligned = CacheAligned::new(AtomicU64::new(42));
        assert_eq!(aligned.get().load(Ordering::Relaxed), 42);
        assert_eq!(std::mem::align_of::<CacheAligned<u8>>(), CACHE_LINE_SIZE);
    }

    #[test]
    fn test_backoff_progression() {
        let mut backoff = Backoff::new(3);

        assert!(!backoff.is_at_max());
        backoff.backoff();
        backoff.backoff();
        backoff.backoff();
        assert!(backoff.is_at_max());

        // Should stay at max
        backoff.backoff();
        assert!(backoff.is_at_max());
    }

    #[test]
    fn test_exponential_delay() {
        assert_eq!(exponential_delay_ms(10, 0, 1_000), 10);
        assert_eq!(exponential_delay_ms(10, 3, 1_000), 80);
        assert_eq!(exponential_delay_ms(10, 10, 1_000), 1_000);
        assert_eq!(exponential_delay_ms(10, 200, 1_000), 1_000);
    }
}
