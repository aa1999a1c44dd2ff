use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;

use crate::dlog;
use crate::types::Stats;

/// Passing this as a TTL stores a value without a local expiry.
pub const NO_EXPIRE: i64 = 0;

const EVICT_SIZE_FACTOR: f64 = 0.05;
const INITIAL_CAPACITY: usize = 128;

#[derive(Debug, Clone)]
pub(crate) struct StoredEntry {
    pub(crate) data: Vec<u8>,
    pub(crate) expires: Option<Instant>,
}

/// Bounded in-process key/value store backing one tracking client or one
/// broadcasting pool. `entries` sits behind a single mutex; the counters are
/// atomics so stats readers never contend with writers.
pub(crate) struct LocalCache {
    max_entries: usize,
    now: fn() -> Instant,
    entries: Mutex<HashMap<String, StoredEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
}

impl LocalCache {
    pub(crate) fn new(max_entries: usize) -> Self {
        Self::with_clock(max_entries, Instant::now)
    }

    /// The clock is a capability so expiry behavior can be exercised with a
    /// displaced "now" in tests.
    pub(crate) fn with_clock(max_entries: usize, now: fn() -> Instant) -> Self {
        assert!(max_entries > 0, "max entries must be greater than zero");
        LocalCache {
            max_entries,
            now,
            entries: Mutex::new(HashMap::with_capacity(INITIAL_CAPACITY.min(max_entries))),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    #[cfg(test)]
    fn set_clock(&mut self, now: fn() -> Instant) {
        self.now = now;
    }

    pub(crate) fn set(&self, key: &str, data: Vec<u8>, ttl_secs: i64) {
        dlog!(key, ttl_secs, "cache.set");

        let mut entries = self.entries.lock();
        if entries.len() >= self.max_entries {
            self.evict_keys(&mut entries);
        }

        let expires = (ttl_secs > NO_EXPIRE)
            .then(|| (self.now)() + Duration::from_secs(ttl_secs as u64));
        entries.insert(key.to_owned(), StoredEntry { data, expires });
    }

    pub(crate) fn get(&self, key: &str) -> Option<Vec<u8>> {
        Some(self.get_entry(key)?.data)
    }

    pub(crate) fn get_entry(&self, key: &str) -> Option<StoredEntry> {
        let entry = self.entries.lock().get(key).cloned();
        match entry {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                dlog!(key, "cache.get hit");
                Some(entry)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                dlog!(key, "cache.get miss");
                None
            }
        }
    }

    /// Looks every key up under one lock acquisition. Slots come back in
    /// input order; absent keys yield `None` and count as misses.
    pub(crate) fn get_many<S: AsRef<str>>(&self, keys: &[S]) -> Vec<Option<StoredEntry>> {
        let entries = self.entries.lock();
        keys.iter()
            .map(|key| {
                let found = entries.get(key.as_ref()).cloned();
                if found.is_some() {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                }
                found
            })
            .collect()
    }

    pub(crate) fn delete<S: AsRef<str>>(&self, keys: &[S]) {
        dlog!(count = keys.len(), "cache.delete");

        let mut entries = self.entries.lock();
        for key in keys {
            entries.remove(key.as_ref());
        }
    }

    /// Crude eviction for a full cache: drops roughly 5% of the population
    /// (at least one entry), walking the map in iteration order from a
    /// random start offset. Callers hold the entries lock.
    fn evict_keys(&self, entries: &mut HashMap<String, StoredEntry>) {
        let len = entries.len();
        if len == 0 {
            return;
        }
        let batch = evict_size(len);
        let start = if len > batch {
            rand::thread_rng().gen_range(0..len - batch)
        } else {
            0
        };
        dlog!(start, batch, len, "cache.evict");

        let doomed: Vec<String> = entries.keys().skip(start).take(batch).cloned().collect();
        for key in &doomed {
            entries.remove(key);
        }
        self.evictions.fetch_add(doomed.len() as u64, Ordering::Relaxed);
    }

    pub(crate) fn evict_expired(&self) {
        let now = (self.now)();
        let doomed: Vec<String> = {
            let entries = self.entries.lock();
            entries
                .iter()
                .filter(|(_, entry)| entry.expires.is_some_and(|at| at < now))
                .map(|(key, _)| key.clone())
                .collect()
        };
        if doomed.is_empty() {
            return;
        }
        dlog!(count = doomed.len(), "cache.expire");
        self.expired.fetch_add(doomed.len() as u64, Ordering::Relaxed);
        self.delete(&doomed);
    }

    pub(crate) fn flush(&self) {
        dlog!("cache.flush");

        let mut entries = self.entries.lock();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.expired.store(0, Ordering::Relaxed);
        entries.clear();
    }

    pub(crate) fn stats(&self) -> Stats {
        let num_entries = self.entries.lock().len();
        Stats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            num_entries,
        }
    }
}

fn evict_size(len: usize) -> usize {
    (((len as f64) * EVICT_SIZE_FACTOR).ceil() as usize).max(1)
}
