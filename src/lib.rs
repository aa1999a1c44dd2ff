//! Server-assisted client-side caching for Redis.
//!
//! Redis can notify a client when a key it has read is modified (`CLIENT
//! TRACKING`). This crate layers an in-process cache on top of that feature:
//! reads are served locally whenever possible, and invalidation messages
//! pushed by the server evict local entries so the next read refetches.
//!
//! Two pool flavors are provided:
//!
//! * [`TrackingPool`] vends clients that each own a private cache and a pair
//!   of connections registered with `REDIRECT <id> NOLOOP`. The server
//!   records per-key read interest and pushes invalidations for writes made
//!   by other connections.
//! * [`BroadcastingPool`] owns a single cache shared by every client it
//!   vends, registered with `REDIRECT <id> BCAST`. The server broadcasts
//!   invalidations for the whole keyspace (or a configured prefix) without
//!   per-read bookkeeping.
//!
//! ```no_run
//! use redis_csc::{PoolOptions, TrackingPool};
//!
//! fn run() -> redis_csc::Result<()> {
//!     let pool = TrackingPool::new(PoolOptions {
//!         redis_address: "127.0.0.1:6379".into(),
//!         max_entries: 10_000,
//!         ..Default::default()
//!     })?;
//!
//!     let mut client = pool.get()?;
//!     client.set("user:42", b"alice", 60)?;
//!     if let Some(value) = client.get("user:42")? {
//!         println!("{}", String::from_utf8_lossy(&value));
//!     }
//!     Ok(())
//! }
//! ```
//!
//! Values fetched through a client are committed to the local cache only if
//! no invalidation arrived while the fetch was in flight, so a read never
//! pins a stale value past its invalidation.
//!
//! Setting the `__CSC_DEBUG` environment variable (to any value) enables a
//! verbose per-operation debug channel on top of the usual `tracing` output.

use std::sync::OnceLock;

/// Verbose debug logging, emitted only when `__CSC_DEBUG` is set.
macro_rules! dlog {
    ($($arg:tt)*) => {
        if $crate::debug_enabled() {
            tracing::debug!($($arg)*);
        }
    };
}
pub(crate) use dlog;

mod broadcast;
mod cache;
mod client;
mod expiry;
mod invalidation;
mod pool;
mod types;

pub use broadcast::BroadcastingPool;
pub use cache::NO_EXPIRE;
pub use client::Client;
pub use pool::TrackingPool;
pub use types::{Entry, Error, PoolOptions, Result, Stats};

static DEBUG_MODE: OnceLock<bool> = OnceLock::new();

pub(crate) fn debug_enabled() -> bool {
    *DEBUG_MODE.get_or_init(|| std::env::var_os("__CSC_DEBUG").is_some())
}
