//! Downstream send seam and subject routing.

use std::fmt;

use serde::Serialize;

use crate::admission::QueuedMessage;
use crate::error::SendError;

/// Platform used for subjects that do not name one.
pub const DEFAULT_PLATFORM: &str = "default";
/// Endpoint used when a subject names none.
pub const DEFAULT_ENDPOINT: &str = "default";

/// Where a message goes: which platform, on behalf of which credential,
/// against which endpoint's rate limits.
///
/// Parsed from subjects shaped `platform:credential[:endpoint]`.
///
/// ```rust
/// use floodgate::Route;
///
/// let route = Route::parse("instagram:acct-7:media");
/// assert_eq!(route.platform, "instagram");
/// assert_eq!(route.credential, "acct-7");
/// assert_eq!(route.endpoint, "media");
///
/// let plain = Route::parse("orders");
/// assert_eq!(plain.platform, "default");
/// assert_eq!(plain.credential, "orders");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Route {
    /// Destination platform.
    pub platform: String,
    /// Credential (account) the send is charged to.
    pub credential: String,
    /// Platform endpoint, `default` when unspecified.
    pub endpoint: String,
}

impl Route {
    /// Builds a route from its parts.
    pub fn new(
        platform: impl Into<String>,
        credential: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            platform: platform.into(),
            credential: credential.into(),
            endpoint: endpoint.into(),
        }
    }

    /// Parses a subject. Never fails: subjects without a usable
    /// `platform:credential` prefix route to the default platform with the
    /// whole subject as credential.
    pub fn parse(subject: &str) -> Self {
        let mut parts = subject.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(platform), Some(credential), endpoint)
                if !platform.is_empty() && !credential.is_empty() =>
            {
                let endpoint = endpoint
                    .filter(|e| !e.is_empty())
                    .unwrap_or(DEFAULT_ENDPOINT);
                Self::new(platform, credential, endpoint)
            }
            _ => Self::new(DEFAULT_PLATFORM, subject, DEFAULT_ENDPOINT),
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.platform, self.credential, self.endpoint)
    }
}

/// Sends accepted messages downstream.
///
/// Implementations must be thread-safe; workers and drains call `send`
/// concurrently. Any closure `Fn(&Route, &QueuedMessage) -> Result<(), SendError>`
/// is a transport.
pub trait Transport: Send + Sync {
    /// Delivers one queued entry (possibly a batch) to `route`.
    fn send(&self, route: &Route, message: &QueuedMessage) -> Result<(), SendError>;
}

impl<F> Transport for F
where
    F: Fn(&Route, &QueuedMessage) -> Result<(), SendError> + Send + Sync,
{
    fn send(&self, route: &Route, message: &QueuedMessage) -> Result<(), SendError> {
        self(route, message)
    }
}
