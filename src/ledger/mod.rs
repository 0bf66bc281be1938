//! # Rate Limit Ledger
//!
//! Per-(credential, platform, endpoint) quota counters consulted before
//! every downstream send.
//!
//! ```text
//!     ledger/
//!     ├── mod.rs      (Module organization)
//!     ├── config.rs   (PlatformRateLimitConfig, RateLimitKey)
//!     ├── types.rs    (Attempt tags, decisions, hits, status views)
//!     ├── bucket.rs   (Lock-free burst bucket)
//!     ├── meter.rs    (RateLimitLedger)
//!     └── store.rs    (LedgerStore trait, in-memory store, writer thread)
//! ```
//!
//! Each key carries minute, hour and day fixed windows aligned to the
//! clock plus an optional burst bucket. An attempt is allowed only when
//! every configured window has room and a burst token is available.

mod bucket;
mod config;
mod meter;
mod store;
mod types;

pub use config::{PlatformRateLimitConfig, RateLimitKey, WILDCARD_ENDPOINT};
pub use meter::{RateLimitLedger, RECENT_HITS_CAPACITY};
pub use store::{InMemoryStore, LedgerStore};
pub use types::{
    AttemptTag, BurstStatus, LimitWindow, MeterDecision, RateLimitHit, RateLimitStatus,
    WindowStatus,
};
