//! Per-platform rate limit configuration and counter keys.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::workers::Route;

/// Endpoint value matching every endpoint of a platform.
pub const WILDCARD_ENDPOINT: &str = "*";

/// Limits for one platform endpoint (or every endpoint, with `*`).
///
/// `None` limits are unlimited. Loadable from TOML:
///
/// ```rust
/// use floodgate::ledger::PlatformRateLimitConfig;
///
/// let configs = PlatformRateLimitConfig::list_from_toml_str(r#"
///     [[platform]]
///     platform = "instagram"
///     limit_per_hour = 200
///     burst_limit = 10
///     burst_window_seconds = 60
///
///     [[platform]]
///     platform = "reddit"
///     endpoint = "submit"
///     limit_per_minute = 1
/// "#).unwrap();
///
/// assert_eq!(configs.len(), 2);
/// assert_eq!(configs[0].endpoint, "*");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformRateLimitConfig {
    /// Platform name, e.g. `instagram`.
    pub platform: String,
    /// Endpoint name, or `*` for the whole platform.
    pub endpoint: String,
    /// Sends per credential per clock minute.
    pub limit_per_minute: Option<u64>,
    /// Sends per credential per clock hour.
    pub limit_per_hour: Option<u64>,
    /// Sends per credential per UTC day.
    pub limit_per_day: Option<u64>,
    /// Burst bucket capacity, `None` for no burst control.
    pub burst_limit: Option<u64>,
    /// Time for an empty burst bucket to refill completely.
    pub burst_window_seconds: u64,
    /// Lower bound of the random delay applied before each send.
    pub jitter_min_ms: u64,
    /// Upper bound of the random delay applied before each send.
    pub jitter_max_ms: u64,
    /// Inactive configs are ignored: the endpoint becomes unmetered.
    pub active: bool,
}

impl Default for PlatformRateLimitConfig {
    fn default() -> Self {
        Self {
            platform: String::new(),
            endpoint: WILDCARD_ENDPOINT.to_string(),
            limit_per_minute: None,
            limit_per_hour: None,
            limit_per_day: None,
            burst_limit: None,
            burst_window_seconds: 60,
            jitter_min_ms: 0,
            jitter_max_ms: 0,
            active: true,
        }
    }
}

#[derive(Deserialize)]
struct PlatformConfigFile {
    #[serde(default)]
    platform: Vec<PlatformRateLimitConfig>,
}

impl PlatformRateLimitConfig {
    /// Config covering every endpoint of `platform`, no limits set.
    pub fn for_platform(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            ..Self::default()
        }
    }

    /// Sets the endpoint.
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Sets the per-minute limit.
    pub fn per_minute(mut self, limit: u64) -> Self {
        self.limit_per_minute = Some(limit);
        self
    }

    /// Sets the per-hour limit.
    pub fn per_hour(mut self, limit: u64) -> Self {
        self.limit_per_hour = Some(limit);
        self
    }

    /// Sets the per-day limit.
    pub fn per_day(mut self, limit: u64) -> Self {
        self.limit_per_day = Some(limit);
        self
    }

    /// Sets the burst bucket.
    pub fn burst(mut self, limit: u64, window_seconds: u64) -> Self {
        self.burst_limit = Some(limit);
        self.burst_window_seconds = window_seconds;
        self
    }

    /// Sets the jitter range.
    pub fn jitter(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.jitter_min_ms = min_ms;
        self.jitter_max_ms = max_ms;
        self
    }

    /// Parses a TOML document of `[[platform]]` tables and validates each.
    pub fn list_from_toml_str(text: &str) -> ConfigResult<Vec<Self>> {
        let file: PlatformConfigFile = toml::from_str(text)?;
        for config in &file.platform {
            config.validate()?;
        }
        Ok(file.platform)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.platform.trim().is_empty() {
            return Err(ConfigError::invalid("platform", "must not be empty"));
        }
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::invalid(
                "endpoint",
                "must not be empty (use \"*\" for every endpoint)",
            ));
        }
        for (field, limit) in [
            ("limit_per_minute", self.limit_per_minute),
            ("limit_per_hour", self.limit_per_hour),
            ("limit_per_day", self.limit_per_day),
            ("burst_limit", self.burst_limit),
        ] {
            if limit == Some(0) {
                return Err(ConfigError::invalid(
                    field,
                    "must be greater than 0 (omit it for no limit)",
                ));
            }
        }
        if self.burst_limit.is_some() && self.burst_window_seconds == 0 {
            return Err(ConfigError::invalid(
                "burst_window_seconds",
                "must be greater than 0 when burst_limit is set",
            ));
        }
        if self.jitter_min_ms > self.jitter_max_ms {
            return Err(ConfigError::invalid(
                "jitter_min_ms",
                "must not exceed jitter_max_ms",
            ));
        }
        Ok(())
    }

    /// Lookup key of this config.
    pub(crate) fn slot(&self) -> (String, String) {
        (self.platform.clone(), self.endpoint.clone())
    }
}

/// Counter key: one credential against one platform endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RateLimitKey {
    /// Credential (account) being charged.
    pub credential: String,
    /// Platform name.
    pub platform: String,
    /// Endpoint name.
    pub endpoint: String,
}

impl RateLimitKey {
    /// Builds a key from its parts.
    pub fn new(
        credential: impl Into<String>,
        platform: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            credential: credential.into(),
            platform: platform.into(),
            endpoint: endpoint.into(),
        }
    }

    /// The key a routed send is charged against.
    pub fn from_route(route: &Route) -> Self {
        Self::new(&route.credential, &route.platform, &route.endpoint)
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{}", self.credential, self.platform, self.endpoint)
    }
}
