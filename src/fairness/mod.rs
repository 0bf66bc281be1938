//! # Fair-Share Scheduler
//!
//! Keeps credentials that share one platform's rate budget close to their
//! weighted share of it.
//!
//! ```text
//!     record_consumption ──► rolling window per credential
//!                                   │
//!             consumed / weight ────┴──► fairness ratio
//!                                         │
//!     check_fairness:  max - min > tolerance ─► unfair
//!     next_credential: lowest ratio, then priority, then oldest enqueue
//! ```

mod scheduler;

pub use scheduler::{
    CredentialShareSnapshot, FairShareConfig, FairShareScheduler, FairShareSnapshot,
    FairnessCheck, DEFAULT_PRIORITY, DEFAULT_WEIGHT, PRIORITY_RANGE,
};
