//! # Error Types
//!
//! Admission decisions never fail: `publish` resolves every problem to a
//! boolean plus a `message_dropped` event. The types here cover the other
//! boundaries of the crate:
//!
//! ```text
//!     Boundary                    Error
//!     ─────────────────────────   ──────────────
//!     admin-supplied settings  ─► ConfigError
//!     ledger persistence       ─► StoreError
//!     downstream transport     ─► SendError
//!     operational tooling      ─► AdminError
//!     worker lifecycle         ─► WorkerError
//! ```

/// Invalid configuration supplied at the admin boundary.
///
/// Rejected synchronously; nothing from the offending input is applied.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// A field holds a value outside its accepted range.
    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue {
        /// Name of the offending field.
        field: &'static str,
        /// Human readable explanation of the accepted range.
        reason: String,
    },

    /// The requested preset name is not known.
    #[error("unknown preset: {0}")]
    UnknownPreset(String),

    /// The configuration text could not be parsed.
    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

/// Failures of the relational store behind the rate limit ledger.
///
/// Always transient from the ledger's point of view: counting continues
/// in memory while the store is unavailable.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("ledger store unavailable: {0}")]
    Unavailable(String),

    /// A record could not be encoded for the store.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// A downstream send failed.
///
/// Fed back into the circuit breaker registry; never surfaced to the
/// original publisher, which already received its accept/drop answer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The destination refused the message.
    #[error("destination rejected message: {0}")]
    Rejected(String),

    /// The destination did not answer in time.
    #[error("send timed out after {0}ms")]
    Timeout(u64),

    /// The destination is not reachable at all.
    #[error("destination unavailable: {0}")]
    Unavailable(String),
}

/// Errors reported synchronously to operational tooling.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AdminError {
    /// The operation conflicts with one already in progress.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The supplied settings were invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A worker operation failed.
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

/// Worker lifecycle failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    /// The OS refused to spawn a worker thread.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),

    /// The worker pool has been shut down.
    #[error("worker pool is shut down")]
    ShutDown,
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result alias for admin operations.
pub type AdminResult<T> = std::result::Result<T, AdminError>;
