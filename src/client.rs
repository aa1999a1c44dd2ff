use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use redis::{Connection, RedisResult};

use crate::broadcast::BroadcastShared;
use crate::cache::{LocalCache, NO_EXPIRE};
use crate::dlog;
use crate::expiry::SweeperGuard;
use crate::pool::TrackingShared;
use crate::types::{Entry, Error, PoolOptions, Stats};

/// Planted in the local cache while a fetch is in flight. An invalidation
/// that races the fetch deletes it, which is how the fetch learns it lost
/// and must not commit. Never a legitimate value.
pub(crate) const IN_FLIGHT_SENTINEL: &[u8] = b"__csc:cip__";

/// Sentinels carry a TTL so an abandoned fetch cannot wedge a key.
const SENTINEL_TTL_SECS: i64 = 30;

/// A cache-backed handle onto Redis, vended by one of the two pools.
///
/// Reads consult the local cache first and fall through to the server on a
/// miss; writes always go to the server. Dropping the client returns it to
/// its pool (or hands the borrowed connection back, in broadcasting mode).
pub struct Client {
    inner: Option<ClientInner>,
}

pub(crate) struct ClientInner {
    pub(crate) conn: ClientConn,
    pub(crate) cache: Arc<LocalCache>,
    pub(crate) closed: Arc<AtomicBool>,
    pub(crate) pool: PoolHandle,
    pub(crate) _sweeper: Option<SweeperGuard>,
}

pub(crate) enum ClientConn {
    /// Dialed for this client and torn down with it (tracking mode).
    Dedicated(Connection),
    /// Borrowed from the shared pool for the lifetime of the client
    /// (broadcasting mode).
    Pooled(r2d2::PooledConnection<redis::Client>),
}

impl ClientConn {
    fn as_mut(&mut self) -> &mut Connection {
        match self {
            ClientConn::Dedicated(conn) => conn,
            ClientConn::Pooled(conn) => &mut **conn,
        }
    }
}

#[derive(Clone)]
pub(crate) enum PoolHandle {
    Tracking(Arc<TrackingShared>),
    Broadcasting(Arc<BroadcastShared>),
}

impl PoolHandle {
    fn options(&self) -> &PoolOptions {
        match self {
            PoolHandle::Tracking(shared) => shared.options(),
            PoolHandle::Broadcasting(shared) => shared.options(),
        }
    }
}

impl Client {
    pub(crate) fn from_inner(inner: ClientInner) -> Self {
        Client { inner: Some(inner) }
    }

    /// Fetches a value, serving from the local cache when possible.
    ///
    /// `None` means the key does not exist on the server.
    pub fn get(&mut self, key: &str) -> crate::Result<Option<Vec<u8>>> {
        Ok(self.get_entry(key)?.into_data())
    }

    /// Like [`Client::get`], additionally reporting the entry's local expiry
    /// and whether it was served from the cache.
    pub fn get_entry(&mut self, key: &str) -> crate::Result<Entry> {
        let inner = self.usable_inner()?;
        let key = inner.pool.options().prefixed(key);
        dlog!(key = key.as_str(), "client.get");

        if let Some(entry) = inner.cache.get_entry(&key) {
            if entry.data != IN_FLIGHT_SENTINEL {
                return Ok(Entry::cached(entry.data, entry.expires));
            }
        }

        inner
            .cache
            .set(&key, IN_FLIGHT_SENTINEL.to_vec(), SENTINEL_TTL_SECS);

        let ClientInner { conn, cache, .. } = inner;
        let conn = conn.as_mut();

        let data: Option<Vec<u8>> = match redis::cmd("GET").arg(&key).query(conn) {
            Ok(data) => data,
            Err(err) => {
                discard_keys(conn, cache, &[&key]);
                return Err(err.into());
            }
        };
        let Some(data) = data else {
            cache.delete(&[&key]);
            return Ok(Entry::miss());
        };
        let ttl: i64 = match redis::cmd("TTL").arg(&key).query(conn) {
            Ok(ttl) => ttl,
            Err(err) => {
                discard_keys(conn, cache, &[&key]);
                return Err(err.into());
            }
        };

        // commit only while our sentinel survived; anything else means an
        // invalidation arrived mid-fetch and wins
        if cache.get(&key).as_deref() == Some(IN_FLIGHT_SENTINEL) {
            cache.set(&key, data.clone(), ttl.max(NO_EXPIRE));
        }
        Ok(Entry::fetched(data, ttl))
    }

    /// Batched lookup. The result has one entry per input key, in input
    /// order; keys absent on the server come back as misses. Cache misses
    /// are fetched with a single `MGET` plus one transaction of `TTL`s.
    pub fn get_entries<S: AsRef<str>>(&mut self, keys: &[S]) -> crate::Result<Vec<Entry>> {
        let inner = self.usable_inner()?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let options = inner.pool.options();
        let keys: Vec<String> = keys.iter().map(|key| options.prefixed(key.as_ref())).collect();
        dlog!(count = keys.len(), "client.get_entries");

        let mut results: Vec<Entry> = Vec::with_capacity(keys.len());
        let mut missed: Vec<usize> = Vec::new();
        for (index, slot) in inner.cache.get_many(&keys).into_iter().enumerate() {
            match slot {
                Some(entry) if entry.data != IN_FLIGHT_SENTINEL => {
                    results.push(Entry::cached(entry.data, entry.expires));
                }
                _ => {
                    missed.push(index);
                    results.push(Entry::miss());
                }
            }
        }
        if missed.is_empty() {
            return Ok(results);
        }

        let missed_keys: Vec<&str> = missed.iter().map(|&index| keys[index].as_str()).collect();
        for key in &missed_keys {
            inner
                .cache
                .set(key, IN_FLIGHT_SENTINEL.to_vec(), SENTINEL_TTL_SECS);
        }

        let ClientInner { conn, cache, .. } = inner;
        let conn = conn.as_mut();

        let mut mget = redis::cmd("MGET");
        for key in &missed_keys {
            mget.arg(*key);
        }
        let values: Vec<Option<Vec<u8>>> = match mget.query(conn) {
            Ok(values) => values,
            Err(err) => {
                discard_keys(conn, cache, &missed_keys);
                return Err(err.into());
            }
        };

        let mut ttl_pipe = redis::pipe();
        ttl_pipe.atomic();
        for key in &missed_keys {
            ttl_pipe.cmd("TTL").arg(*key);
        }
        let ttls: Vec<i64> = match ttl_pipe.query(conn) {
            Ok(ttls) => ttls,
            Err(err) => {
                discard_keys(conn, cache, &missed_keys);
                return Err(err.into());
            }
        };

        if values.len() != missed.len() || ttls.len() != missed.len() {
            discard_keys(conn, cache, &missed_keys);
            return Err(Error::Parse("short reply to batched fetch".into()));
        }

        for (slot, &index) in missed.iter().enumerate() {
            let key = keys[index].as_str();
            match &values[slot] {
                None => cache.delete(&[key]),
                Some(data) => {
                    if cache.get(key).as_deref() == Some(IN_FLIGHT_SENTINEL) {
                        cache.set(key, data.clone(), ttls[slot].max(NO_EXPIRE));
                    }
                    results[index] = Entry::fetched(data.clone(), ttls[slot]);
                }
            }
        }
        Ok(results)
    }

    /// `SETEX` on the server. The local cache is intentionally not
    /// populated; the next read pulls the value through and registers
    /// tracking interest for it.
    pub fn set(&mut self, key: &str, value: &[u8], ttl_secs: i64) -> crate::Result<()> {
        let inner = self.usable_inner()?;
        let key = inner.pool.options().prefixed(key);
        dlog!(key = key.as_str(), ttl_secs, "client.set");

        redis::cmd("SETEX")
            .arg(&key)
            .arg(ttl_secs)
            .arg(value)
            .query::<()>(inner.conn.as_mut())?;
        Ok(())
    }

    /// Deletes the keys on the server, then locally.
    pub fn delete<S: AsRef<str>>(&mut self, keys: &[S]) -> crate::Result<()> {
        let inner = self.usable_inner()?;
        if keys.is_empty() {
            return Ok(());
        }
        let options = inner.pool.options();
        let keys: Vec<String> = keys.iter().map(|key| options.prefixed(key.as_ref())).collect();
        dlog!(count = keys.len(), "client.delete");

        let mut del = redis::cmd("DEL");
        for key in &keys {
            del.arg(key);
        }
        del.query::<()>(inner.conn.as_mut())?;
        inner.cache.delete(&keys);
        Ok(())
    }

    /// Empties the client's cache: its own in tracking mode, the pool-wide
    /// one in broadcasting mode.
    pub fn flush(&self) {
        if let Some(inner) = &self.inner {
            inner.cache.flush();
        }
    }

    pub fn stats(&self) -> Stats {
        self.inner
            .as_ref()
            .map(|inner| inner.cache.stats())
            .unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.inner
            .as_ref()
            .map_or(true, |inner| inner.closed.load(Ordering::Relaxed))
    }

    /// Returns the client to its pool, or tears its connections down when it
    /// has been marked closed. Equivalent to dropping the client.
    pub fn close(self) {}

    fn usable_inner(&mut self) -> crate::Result<&mut ClientInner> {
        let inner = self.inner.as_mut().ok_or(Error::Closed)?;
        if inner.closed.load(Ordering::Relaxed) {
            return Err(Error::Closed);
        }
        Ok(inner)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.release();
        }
    }
}

impl ClientInner {
    fn release(self) {
        let pool = self.pool.clone();
        match pool {
            PoolHandle::Tracking(shared) => {
                if self.closed.load(Ordering::Relaxed) {
                    // tear the client down for good, but hand its slot back
                    drop(self);
                    shared.release_slot();
                } else {
                    shared.put_free(self);
                }
            }
            // the borrowed data connection goes back to the shared pool
            PoolHandle::Broadcasting(_) => drop(self),
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        // a torn-down tracking client flags its invalidation consumer to
        // exit; broadcasting clients share the pool's flag and leave it alone
        if matches!(self.pool, PoolHandle::Tracking(_)) {
            self.closed.store(true, Ordering::Relaxed);
        }
    }
}

/// Cleanup after a failed fetch: the local entries (sentinel or stale) go
/// away and the remote keys are best-effort deleted so the server's tracking
/// state cannot outlive the cache entries.
fn discard_keys<S: AsRef<str>>(conn: &mut Connection, cache: &LocalCache, keys: &[S]) {
    cache.delete(keys);
    let mut del = redis::cmd("DEL");
    for key in keys {
        del.arg(key.as_ref());
    }
    let _: RedisResult<()> = del.query(conn);
}
