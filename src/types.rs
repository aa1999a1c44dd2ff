use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, self::Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The pool limit was reached and waiting is disabled.
    #[error("too many active clients")]
    TooManyActiveClients,

    /// The client (or its owning pool) has been closed.
    #[error("client is closed")]
    Closed,

    /// Constructor-time option validation failed.
    #[error("invalid pool options: {0}")]
    InvalidOptions(&'static str),

    /// A reply on the invalidation subscription had an unexpected shape.
    #[error("unexpected invalidation reply: {0}")]
    Parse(String),

    /// Transport or command error from the Redis connection.
    #[error(transparent)]
    Redis(#[from] redis::RedisError),

    /// Borrowing or building the underlying connection pool failed.
    #[error("connection pool error: {0}")]
    ConnectionPool(#[from] r2d2::Error),

    /// Spawning a background task failed.
    #[error("background task error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration shared by [`crate::TrackingPool`] and
/// [`crate::BroadcastingPool`].
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// `host:port` of the Redis server. A bare `:port` targets 127.0.0.1.
    pub redis_address: String,
    /// Database selected on every connection.
    pub redis_database: i64,
    /// Upper bound on simultaneously vended clients (tracking) or on
    /// borrowed data connections (broadcasting). Zero means unlimited.
    pub max_active: usize,
    /// With a positive `max_active`, makes `get` block until a slot frees
    /// up instead of failing with [`Error::TooManyActiveClients`].
    pub wait: bool,
    /// Capacity of each local cache. Must be positive.
    pub max_entries: usize,
    /// Prefix applied to every key crossing the client boundary. In
    /// broadcasting mode it is also registered server-side as the BCAST
    /// prefix, so invalidations cover exactly the cached keyspace.
    pub key_prefix: String,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            redis_address: "127.0.0.1:6379".into(),
            redis_database: 0,
            max_active: 0,
            wait: false,
            max_entries: 10_000,
            key_prefix: String::new(),
        }
    }
}

impl PoolOptions {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(Error::InvalidOptions(
                "max_entries must be greater than zero",
            ));
        }
        Ok(())
    }

    pub(crate) fn connection_url(&self) -> String {
        let address = if self.redis_address.starts_with(':') {
            format!("127.0.0.1{}", self.redis_address)
        } else {
            self.redis_address.clone()
        };
        if self.redis_database > 0 {
            format!("redis://{address}/{}", self.redis_database)
        } else {
            format!("redis://{address}")
        }
    }

    pub(crate) fn prefixed(&self, key: &str) -> String {
        if self.key_prefix.is_empty() {
            key.to_owned()
        } else {
            format!("{}{key}", self.key_prefix)
        }
    }
}

/// One result slot from [`crate::Client::get_entry`] or
/// [`crate::Client::get_entries`].
#[derive(Debug, Clone, Default)]
pub struct Entry {
    data: Option<Vec<u8>>,
    expires_at: Option<Instant>,
    cached: bool,
}

impl Entry {
    pub(crate) fn miss() -> Self {
        Entry::default()
    }

    pub(crate) fn cached(data: Vec<u8>, expires_at: Option<Instant>) -> Self {
        Entry {
            data: Some(data),
            expires_at,
            cached: true,
        }
    }

    pub(crate) fn fetched(data: Vec<u8>, ttl_secs: i64) -> Self {
        let expires_at =
            (ttl_secs > 0).then(|| Instant::now() + Duration::from_secs(ttl_secs as u64));
        Entry {
            data: Some(data),
            expires_at,
            cached: false,
        }
    }

    /// The value, or `None` when the key was absent on the server.
    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    /// Consumes the entry, yielding the value.
    pub fn into_data(self) -> Option<Vec<u8>> {
        self.data
    }

    /// True when the key was absent on the server.
    pub fn is_miss(&self) -> bool {
        self.data.is_none()
    }

    /// True when the value was served from the local cache rather than
    /// fetched from the server.
    pub fn was_cached(&self) -> bool {
        self.cached
    }

    /// Local expiry deadline, when the entry carries one.
    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }
}

/// Point-in-time snapshot of a cache's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired: u64,
    pub num_entries: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_url_fills_in_loopback_host() {
        let options = PoolOptions {
            redis_address: ":6379".into(),
            ..Default::default()
        };
        assert_eq!(options.connection_url(), "redis://127.0.0.1:6379");
    }

    #[test]
    fn connection_url_selects_database() {
        let options = PoolOptions {
            redis_address: "cache.internal:6380".into(),
            redis_database: 2,
            ..Default::default()
        };
        assert_eq!(options.connection_url(), "redis://cache.internal:6380/2");
    }

    #[test]
    fn prefix_is_applied_only_when_configured() {
        let mut options = PoolOptions::default();
        assert_eq!(options.prefixed("foo"), "foo");

        options.key_prefix = "app:".into();
        assert_eq!(options.prefixed("foo"), "app:foo");
    }

    #[test]
    fn zero_max_entries_is_rejected() {
        let options = PoolOptions {
            max_entries: 0,
            ..Default::default()
        };
        assert!(matches!(
            options.validate(),
            Err(Error::InvalidOptions(_))
        ));
    }

    #[test]
    fn entry_miss_carries_no_data() {
        let entry = Entry::miss();
        assert!(entry.is_miss());
        assert!(entry.data().is_none());
        assert!(!entry.was_cached());

        let entry = Entry::fetched(b"123456".to_vec(), -1);
        assert!(!entry.is_miss());
        assert_eq!(entry.data(), Some(&b"123456"[..]));
        assert!(entry.expires_at().is_none());
    }
}
