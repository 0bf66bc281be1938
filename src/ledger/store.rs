//! Durable side of the ledger.
//!
//! Counting always happens in memory. Hits and config snapshots are
//! handed to a background writer over a bounded channel so a slow or
//! unavailable store never blocks a send.
//!
//! ```text
//!     meter() ──► try_send(PersistCommand) ──► floodgate-ledger-persist
//!                       │ full                        │
//!                       ▼                             ▼
//!                 dropped + warn              LedgerStore::record_hit
//!                                             Err ─► warn, degraded = true
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::config::PlatformRateLimitConfig;
use super::types::RateLimitHit;
use crate::error::{StoreError, WorkerError};

/// Commands buffered between the send path and the writer.
pub(crate) const PERSIST_QUEUE_CAPACITY: usize = 4096;

/// Storage for rate limit hits and platform configs.
pub trait LedgerStore: Send + Sync {
    /// Appends one hit.
    fn record_hit(&self, hit: &RateLimitHit) -> Result<(), StoreError>;

    /// Replaces the stored platform configs.
    fn save_platform_configs(&self, configs: &[PlatformRateLimitConfig]) -> Result<(), StoreError>;

    /// Reads the stored platform configs.
    fn load_platform_configs(&self) -> Result<Vec<PlatformRateLimitConfig>, StoreError>;
}

/// Store kept in process memory. Records are kept as JSON rows.
///
/// `set_available(false)` makes every call fail, which is how tests
/// exercise the degraded path.
#[derive(Debug)]
pub struct InMemoryStore {
    hits: Mutex<Vec<serde_json::Value>>,
    configs: Mutex<Vec<serde_json::Value>>,
    available: AtomicBool,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Empty, available store.
    pub fn new() -> Self {
        Self {
            hits: Mutex::new(Vec::new()),
            configs: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulates the store going away or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Number of hits stored.
    pub fn hit_count(&self) -> usize {
        self.hits.lock().len()
    }

    /// Stored hits, decoded.
    pub fn hits(&self) -> Vec<RateLimitHit> {
        self.hits
            .lock()
            .iter()
            .filter_map(|row| serde_json::from_value(row.clone()).ok())
            .collect()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store disabled".into()))
        }
    }
}

impl LedgerStore for InMemoryStore {
    fn record_hit(&self, hit: &RateLimitHit) -> Result<(), StoreError> {
        self.check()?;
        let row = serde_json::to_value(hit)?;
        self.hits.lock().push(row);
        Ok(())
    }

    fn save_platform_configs(&self, configs: &[PlatformRateLimitConfig]) -> Result<(), StoreError> {
        self.check()?;
        let rows = configs
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        *self.configs.lock() = rows;
        Ok(())
    }

    fn load_platform_configs(&self) -> Result<Vec<PlatformRateLimitConfig>, StoreError> {
        self.check()?;
        self.configs
            .lock()
            .iter()
            .map(|row| serde_json::from_value(row.clone()).map_err(StoreError::from))
            .collect()
    }
}

pub(crate) enum PersistCommand {
    Hit(RateLimitHit),
    Configs(Vec<PlatformRateLimitConfig>),
    Flush(Sender<()>),
}

/// Health flags shared between the ledger and its writer.
#[derive(Debug, Default)]
pub(crate) struct PersistState {
    pub(crate) degraded: AtomicBool,
    pub(crate) failures: AtomicU64,
    pub(crate) dropped: AtomicU64,
}

/// Handle to the background writer. Dropping it closes the channel and
/// joins the thread after the backlog is written.
pub(crate) struct PersistWorker {
    tx: Option<Sender<PersistCommand>>,
    handle: Option<JoinHandle<()>>,
    state: Arc<PersistState>,
}

impl PersistWorker {
    pub(crate) fn spawn(store: Arc<dyn LedgerStore>) -> Result<Self, WorkerError> {
        let (tx, rx) = crossbeam_channel::bounded(PERSIST_QUEUE_CAPACITY);
        let state = Arc::new(PersistState::default());
        let thread_state = Arc::clone(&state);

        let handle = thread::Builder::new()
            .name("floodgate-ledger-persist".to_string())
            .spawn(move || persist_loop(store, rx, thread_state))
            .map_err(|e| WorkerError::Spawn(e.to_string()))?;

        info!("Ledger persistence started");
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
            state,
        })
    }

    pub(crate) fn state(&self) -> &PersistState {
        &self.state
    }

    /// Queues a command without blocking.
    pub(crate) fn submit(&self, command: PersistCommand) {
        let Some(tx) = &self.tx else { return };
        if tx.try_send(command).is_err() {
            let dropped = self.state.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped.is_power_of_two() {
                warn!(dropped, "Ledger persistence backlog full, dropping records");
            }
        }
    }

    /// Waits until everything queued so far has been handed to the store.
    pub(crate) fn flush(&self, timeout: Duration) -> bool {
        let Some(tx) = &self.tx else { return true };
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        if tx.send_timeout(PersistCommand::Flush(ack_tx), timeout).is_err() {
            return false;
        }
        ack_rx.recv_timeout(timeout).is_ok()
    }
}

impl Drop for PersistWorker {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for PersistWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistWorker")
            .field("state", &self.state)
            .finish()
    }
}

fn persist_loop(
    store: Arc<dyn LedgerStore>,
    rx: Receiver<PersistCommand>,
    state: Arc<PersistState>,
) {
    for command in rx.iter() {
        let result = match command {
            PersistCommand::Hit(hit) => store.record_hit(&hit),
            PersistCommand::Configs(configs) => store.save_platform_configs(&configs),
            PersistCommand::Flush(ack) => {
                let _ = ack.send(());
                continue;
            }
        };

        match result {
            Ok(()) => {
                if state.degraded.swap(false, Ordering::AcqRel) {
                    info!("Ledger store recovered");
                }
            }
            Err(e) => {
                state.failures.fetch_add(1, Ordering::Relaxed);
                if !state.degraded.swap(true, Ordering::AcqRel) {
                    warn!(error = %e, "Ledger store write failed, counting continues in memory");
                }
            }
        }
    }
    debug!("Ledger persistence stopped");
}
