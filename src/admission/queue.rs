//! Priority queue behind the controller.
//!
//! ```text
//!     lanes[critical] ─► [m m m]        dequeue order: critical → low,
//!     lanes[high]     ─► [m]                           FIFO inside a lane
//!     lanes[medium]   ─► [m m]
//!     lanes[low]      ─► [m m m m]  ◄── eviction victim: oldest lowest-priority
//! ```
//!
//! Capacity is counted in entries; a coalesced batch is one entry.
//! Not synchronized: the controller owns it behind its admission mutex.

use std::collections::VecDeque;

use super::types::{Priority, QueuedMessage};

/// Newest entries examined when looking for a batch to join.
const BATCH_SCAN_LIMIT: usize = 32;

/// Result of inserting into a bounded queue.
#[derive(Debug)]
pub(crate) enum PushOutcome {
    /// Room was available.
    Enqueued,
    /// The queue was full; this lower-priority entry made room.
    Evicted(QueuedMessage),
    /// The queue was full and nothing queued had lower priority.
    Rejected(QueuedMessage),
}

#[derive(Debug, Default)]
pub(crate) struct MessageQueue {
    lanes: [VecDeque<QueuedMessage>; 4],
    len: usize,
    payloads: usize,
    bytes: usize,
}

impl MessageQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Entries queued.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Payloads queued, counting every member of a batch.
    #[inline]
    pub(crate) fn payload_count(&self) -> usize {
        self.payloads
    }

    #[inline]
    pub(crate) fn estimated_bytes(&self) -> usize {
        self.bytes
    }

    /// Entries per priority, indexed like [`Priority::index`].
    pub(crate) fn depth_by_priority(&self) -> [usize; 4] {
        [
            self.lanes[0].len(),
            self.lanes[1].len(),
            self.lanes[2].len(),
            self.lanes[3].len(),
        ]
    }

    /// Appends `payload` to a recent entry with the same subject and
    /// priority, if one is young enough and has room.
    ///
    /// Hands the payload back when no entry qualifies.
    pub(crate) fn try_coalesce(
        &mut self,
        subject: &str,
        payload: serde_json::Value,
        priority: Priority,
        now_ms: u64,
        window_ms: u64,
        max_batch: usize,
    ) -> Result<(), serde_json::Value> {
        let lane = &mut self.lanes[priority.index()];
        let target = lane.iter_mut().rev().take(BATCH_SCAN_LIMIT).find(|m| {
            m.subject == subject
                && m.payloads.len() < max_batch
                && now_ms.saturating_sub(m.enqueued_at_ms) <= window_ms
        });
        match target {
            Some(entry) => {
                let before = entry.estimated_bytes();
                entry.payloads.push(payload);
                self.bytes = self.bytes - before + entry.estimated_bytes();
                self.payloads += 1;
                Ok(())
            }
            None => Err(payload),
        }
    }

    /// Inserts `message`, evicting the oldest lower-priority entry when
    /// the queue already holds `capacity` entries.
    pub(crate) fn push(&mut self, message: QueuedMessage, capacity: usize) -> PushOutcome {
        if self.len < capacity {
            self.push_unchecked(message);
            return PushOutcome::Enqueued;
        }

        let lowest = self.lanes.iter().position(|lane| !lane.is_empty());
        match lowest {
            Some(idx) if idx < message.priority.index() => match self.lanes[idx].pop_front() {
                Some(victim) => {
                    self.account_removed(&victim);
                    self.push_unchecked(message);
                    PushOutcome::Evicted(victim)
                }
                None => PushOutcome::Rejected(message),
            },
            _ => PushOutcome::Rejected(message),
        }
    }

    fn push_unchecked(&mut self, message: QueuedMessage) {
        self.len += 1;
        self.payloads += message.batch_size();
        self.bytes += message.estimated_bytes();
        self.lanes[message.priority.index()].push_back(message);
    }

    fn account_removed(&mut self, message: &QueuedMessage) {
        self.len -= 1;
        self.payloads -= message.batch_size();
        self.bytes = self.bytes.saturating_sub(message.estimated_bytes());
    }

    /// Removes up to `max` entries, highest priority first.
    pub(crate) fn pop(&mut self, max: usize) -> Vec<QueuedMessage> {
        let mut out = Vec::with_capacity(max.min(self.len));
        for priority in Priority::DESCENDING {
            while out.len() < max {
                let Some(message) = self.lanes[priority.index()].pop_front() else {
                    break;
                };
                self.account_removed(&message);
                out.push(message);
            }
        }
        out
    }

    /// Like [`pop`](Self::pop), but only takes entries `accept` approves.
    /// Rejected entries stay queued in their original order.
    pub(crate) fn pop_where<F>(&mut self, max: usize, mut accept: F) -> Vec<QueuedMessage>
    where
        F: FnMut(&QueuedMessage) -> bool,
    {
        let mut out = Vec::new();
        for priority in Priority::DESCENDING {
            if out.len() >= max {
                break;
            }
            let lane = &mut self.lanes[priority.index()];
            let mut kept = VecDeque::with_capacity(lane.len());
            while out.len() < max {
                let Some(message) = lane.pop_front() else {
                    break;
                };
                if accept(&message) {
                    out.push(message);
                } else {
                    kept.push_back(message);
                }
            }
            kept.append(lane);
            *lane = kept;
        }
        for message in &out {
            self.account_removed(message);
        }
        out
    }

    /// Removes everything, highest priority first.
    pub(crate) fn take_all(&mut self) -> Vec<QueuedMessage> {
        let mut out = Vec::with_capacity(self.len);
        for priority in Priority::DESCENDING {
            out.extend(self.lanes[priority.index()].drain(..));
        }
        self.len = 0;
        self.payloads = 0;
        self.bytes = 0;
        out
    }

    /// Discards everything and returns the number of entries discarded.
    pub(crate) fn clear(&mut self) -> usize {
        let cleared = self.len;
        for lane in &mut self.lanes {
            lane.clear();
        }
        self.len = 0;
        self.payloads = 0;
        self.bytes = 0;
        cleared
    }

    /// Removes entries older than `max_residency_ms`.
    pub(crate) fn expire(&mut self, now_ms: u64, max_residency_ms: u64) -> Vec<QueuedMessage> {
        let mut expired = Vec::new();
        for idx in 0..self.lanes.len() {
            let lane = std::mem::take(&mut self.lanes[idx]);
            let (stale, fresh): (VecDeque<_>, VecDeque<_>) = lane
                .into_iter()
                .partition(|m| now_ms.saturating_sub(m.enqueued_at_ms) > max_residency_ms);
            self.lanes[idx] = fresh;
            expired.extend(stale);
        }
        for message in &expired {
            self.account_removed(message);
        }
        expired
    }
}
