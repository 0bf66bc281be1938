//! Resource sampling for the degradation state machine.
//!
//! ```text
//!     SystemProbe ──► process RSS (MB) + global CPU (%)   via sysinfo
//!     FixedProbe  ──► values set by hand, for tests and demos
//!     RateTracker ──► publish attempts per second over a bucketed window
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::{Pid, ProcessesToUpdate, System};

/// One reading of the host resources the controller budgets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceUsage {
    /// Resident memory of this process, in MB.
    pub memory_mb: f64,
    /// CPU usage across all cores, in percent.
    pub cpu_percent: f64,
}

/// Source of memory and CPU readings.
pub trait ResourceProbe: Send + Sync {
    /// Takes a fresh reading. Called from the monitor thread only.
    fn sample(&self) -> ResourceUsage;
}

/// Reads this process's memory and the global CPU load via `sysinfo`.
pub struct SystemProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SystemProbe {
    /// Creates a probe for the current process.
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SystemProbe {
    fn sample(&self) -> ResourceUsage {
        let mut sys = self.system.lock();
        // CPU usage is a delta between refreshes; the first reading is 0.
        sys.refresh_cpu_usage();
        let cpu_percent = sys.global_cpu_usage() as f64;

        let memory_mb = match self.pid {
            Some(pid) => {
                sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
                sys.process(pid)
                    .map(|p| p.memory() as f64 / (1024.0 * 1024.0))
                    .unwrap_or(0.0)
            }
            None => 0.0,
        };

        ResourceUsage {
            memory_mb,
            cpu_percent,
        }
    }
}

impl std::fmt::Debug for SystemProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemProbe").field("pid", &self.pid).finish()
    }
}

/// Probe returning values set by the caller.
#[derive(Debug, Default)]
pub struct FixedProbe {
    memory_mb_bits: AtomicU64,
    cpu_percent_bits: AtomicU64,
}

impl FixedProbe {
    /// Creates a probe reporting the given values.
    pub fn new(memory_mb: f64, cpu_percent: f64) -> Self {
        let probe = Self::default();
        probe.set(memory_mb, cpu_percent);
        probe
    }

    /// Changes the reported values.
    pub fn set(&self, memory_mb: f64, cpu_percent: f64) {
        self.memory_mb_bits.store(memory_mb.to_bits(), Ordering::Relaxed);
        self.cpu_percent_bits.store(cpu_percent.to_bits(), Ordering::Relaxed);
    }
}

impl ResourceProbe for FixedProbe {
    fn sample(&self) -> ResourceUsage {
        ResourceUsage {
            memory_mb: f64::from_bits(self.memory_mb_bits.load(Ordering::Relaxed)),
            cpu_percent: f64::from_bits(self.cpu_percent_bits.load(Ordering::Relaxed)),
        }
    }
}

/// Events per second over a sliding window of fixed-width buckets.
///
/// Bucket `i` covers `[slot * width, (slot + 1) * width)` where
/// `slot % buckets == i`; stale buckets are zeroed lazily.
#[derive(Debug)]
pub struct RateTracker {
    bucket_width_ms: u64,
    // (slot number, count) per bucket
    buckets: Mutex<Vec<(u64, u64)>>,
}

impl RateTracker {
    /// Tracker covering `window_ms` split into `buckets` buckets.
    pub fn new(window_ms: u64, buckets: usize) -> Self {
        let buckets = buckets.max(1);
        Self {
            bucket_width_ms: (window_ms / buckets as u64).max(1),
            buckets: Mutex::new(vec![(u64::MAX, 0); buckets]),
        }
    }

    fn window_ms(&self, buckets: usize) -> u64 {
        self.bucket_width_ms * buckets as u64
    }

    /// Records `count` events at `now_ms`.
    pub fn record_at(&self, now_ms: u64, count: u64) {
        let slot = now_ms / self.bucket_width_ms;
        let mut buckets = self.buckets.lock();
        let len = buckets.len();
        let bucket = &mut buckets[(slot % len as u64) as usize];
        if bucket.0 != slot {
            *bucket = (slot, 0);
        }
        bucket.1 += count;
    }

    /// Events inside the window ending at `now_ms`.
    pub fn total_at(&self, now_ms: u64) -> u64 {
        let current = now_ms / self.bucket_width_ms;
        let buckets = self.buckets.lock();
        let len = buckets.len() as u64;
        buckets
            .iter()
            .filter(|(slot, _)| *slot != u64::MAX && *slot <= current && current - slot < len)
            .map(|(_, count)| count)
            .sum()
    }

    /// Events per second over the window ending at `now_ms`.
    pub fn rate_at(&self, now_ms: u64) -> f64 {
        let len = self.buckets.lock().len();
        self.total_at(now_ms) as f64 * 1000.0 / self.window_ms(len) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_probe() {
        let probe = FixedProbe::new(128.0, 42.5);
        assert_eq!(probe.sample().memory_mb, 128.0);
        probe.set(1.0, 2.0);
        assert_eq!(
            probe.sample(),
            ResourceUsage {
                memory_mb: 1.0,
                cpu_percent: 2.0
            }
        );
    }

    #[test]
    fn test_system_probe_reads_something() {
        let probe = SystemProbe::new();
        let usage = probe.sample();
        assert!(usage.memory_mb >= 0.0);
        assert!(usage.cpu_percent >= 0.0);
    }

    #[test]
    fn test_rate_tracker_window() {
        let tracker = RateTracker::new(1_000, 10);
        for t in 0..10 {
            tracker.record_at(10_000 + t * 100, 5);
        }
        assert_eq!(tracker.total_at(10_900), 50);
        assert!((tracker.rate_at(10_900) - 50.0).abs() < f64::EPSILON);
        // half the buckets slide out of the window
        assert_eq!(tracker.total_at(11_400), 25);
        // everything is stale after a full window of silence
        assert_eq!(tracker.total_at(20_000), 0);
    }

    #[test]
    fn test_rate_tracker_reuses_stale_bucket() {
        let tracker = RateTracker::new(1_000, 4);
        tracker.record_at(0, 7);
        tracker.record_at(1_000, 1);
        assert_eq!(tracker.total_at(1_000), 1);
    }
}
