//! # Worker Pool
//!
//! Moves accepted messages from the controller queue to the downstream
//! [`Transport`], one lane of workers per platform.
//!
//! ```text
//!     workers/
//!     ├── mod.rs         (Module organization)
//!     ├── transport.rs   (Transport trait, subject routing)
//!     └── pool.rs        (WorkerPoolManager, lanes, scaling, health)
//! ```

mod pool;
mod transport;

pub use pool::{
    LaneHealth, PoolHealth, PoolStats, WorkerHealth, WorkerPoolConfig, WorkerPoolManager,
};
pub use transport::{Route, Transport, DEFAULT_ENDPOINT, DEFAULT_PLATFORM};
