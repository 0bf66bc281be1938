//! Ledger decisions, hits and status views.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::config::RateLimitKey;

/// Identifies one send attempt of one queued message.
///
/// Metering the same tag twice charges the counters once; the second call
/// returns the first decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptTag {
    /// Queued message id.
    pub message_id: Uuid,
    /// Attempt number, starting at 0.
    pub attempt: u32,
}

impl AttemptTag {
    /// Tag for `attempt` of `message_id`.
    pub fn new(message_id: Uuid, attempt: u32) -> Self {
        Self { message_id, attempt }
    }

    /// Tag for the next attempt of the same message.
    pub fn next(self) -> Self {
        Self::new(self.message_id, self.attempt.saturating_add(1))
    }
}

/// The limit that stopped a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitWindow {
    /// Clock-minute window.
    Minute,
    /// Clock-hour window.
    Hour,
    /// UTC-day window.
    Day,
    /// Burst bucket.
    Burst,
}

impl LimitWindow {
    /// Length of the fixed window, `None` for the burst bucket.
    pub fn length_ms(&self) -> Option<u64> {
        match self {
            LimitWindow::Minute => Some(60_000),
            LimitWindow::Hour => Some(3_600_000),
            LimitWindow::Day => Some(86_400_000),
            LimitWindow::Burst => None,
        }
    }

    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitWindow::Minute => "minute",
            LimitWindow::Hour => "hour",
            LimitWindow::Day => "day",
            LimitWindow::Burst => "burst",
        }
    }
}

impl fmt::Display for LimitWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of metering one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum MeterDecision {
    /// Counted against the configured limits.
    Allowed,
    /// No active config covers the key; nothing was counted.
    Unmetered,
    /// A limit is exhausted; nothing was counted.
    Limited {
        /// Which limit.
        window: LimitWindow,
        /// Time until that limit frees a slot.
        retry_after_ms: u64,
    },
}

impl MeterDecision {
    /// Whether the send may proceed.
    #[inline]
    pub fn is_allowed(&self) -> bool {
        !matches!(self, MeterDecision::Limited { .. })
    }
}

/// A recorded rate limit rejection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitHit {
    /// Key that was limited.
    pub key: RateLimitKey,
    /// Limit that was exhausted.
    pub window: LimitWindow,
    /// Configured value of that limit.
    pub limit: u64,
    /// Attempt that was refused.
    pub attempt: AttemptTag,
    /// When it happened.
    pub timestamp_ms: u64,
}

/// Usage of one fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowStatus {
    /// Configured limit, `None` when unlimited.
    pub limit: Option<u64>,
    /// Sends counted in the current window.
    pub used: u64,
    /// Sends left, `None` when unlimited.
    pub remaining: Option<u64>,
    /// When the current window ends.
    pub resets_at_ms: u64,
}

/// Burst bucket view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BurstStatus {
    /// Bucket capacity.
    pub capacity: u64,
    /// Tokens available now.
    pub available: u64,
    /// Time for an empty bucket to refill.
    pub window_ms: u64,
}

/// Full usage picture of one key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitStatus {
    /// The key.
    pub key: RateLimitKey,
    /// Whether an active config covers the key.
    pub metered: bool,
    /// Minute window.
    pub minute: WindowStatus,
    /// Hour window.
    pub hour: WindowStatus,
    /// Day window.
    pub day: WindowStatus,
    /// Burst bucket, when configured.
    pub burst: Option<BurstStatus>,
    /// Sends allowed since the counters were created or reset.
    pub total_allowed: u64,
    /// Attempts refused since the counters were created or reset.
    pub total_limited: u64,
}

impl RateLimitStatus {
    /// Whether the next attempt would be allowed, ignoring jitter.
    pub fn has_capacity(&self) -> bool {
        let windows_open = [self.minute, self.hour, self.day]
            .iter()
            .all(|w| w.remaining != Some(0));
        let burst_open = self.burst.map_or(true, |b| b.available > 0);
        windows_open && burst_open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_tag_next() {
        let tag = AttemptTag::new(Uuid::nil(), 0);
        assert_eq!(tag.next().attempt, 1);
        assert_eq!(tag.next().message_id, tag.message_id);
        assert_ne!(tag, tag.next());
    }

    #[test]
    fn test_decision_allowed() {
        assert!(MeterDecision::Allowed.is_allowed());
        assert!(MeterDecision::Unmetered.is_allowed());
        assert!(!MeterDecision::Limited {
            window: LimitWindow::Minute,
            retry_after_ms: 10
        }
        .is_allowed());
    }

    #[test]
    fn test_window_lengths() {
        assert_eq!(LimitWindow::Minute.length_ms(), Some(60_000));
        assert_eq!(LimitWindow::Burst.length_ms(), None);
        assert_eq!(LimitWindow::Day.to_string(), "day");
    }
}
