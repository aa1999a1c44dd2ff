use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::cache::LocalCache;
use crate::client::{Client, ClientConn, ClientInner, PoolHandle};
use crate::dlog;
use crate::expiry;
use crate::invalidation;
use crate::types::{Error, PoolOptions};

/// Factory and free list of tracking clients.
///
/// Every client dialed by the pool owns a private cache and two connections:
/// a data connection registered with `CLIENT TRACKING ON REDIRECT <id>
/// NOLOOP`, and the invalidation connection the redirect points at. Returned
/// clients are parked on a free list for reuse; their caches stay live and
/// coherent while parked.
pub struct TrackingPool {
    shared: Arc<TrackingShared>,
}

pub(crate) struct TrackingShared {
    options: PoolOptions,
    /// Clients dialed over the pool's lifetime, vended or parked.
    active: AtomicUsize,
    /// Times a `get` found no slot immediately available.
    waited: AtomicU64,
    slots: Option<Slots>,
    free: Mutex<VecDeque<ClientInner>>,
}

/// Slot tokens bounding the number of simultaneously vended clients. The
/// channel starts pre-filled with `max_active` tokens; `get` takes one and
/// returning a client puts one back.
struct Slots {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl TrackingShared {
    pub(crate) fn options(&self) -> &PoolOptions {
        &self.options
    }

    pub(crate) fn put_free(&self, client: ClientInner) {
        self.free.lock().push_back(client);
        self.release_slot();
    }

    pub(crate) fn release_slot(&self) {
        if let Some(slots) = &self.slots {
            let _ = slots.tx.try_send(());
        }
    }
}

impl TrackingPool {
    /// Creates the pool without dialing; connections are established lazily
    /// by [`TrackingPool::get`].
    pub fn new(options: PoolOptions) -> crate::Result<Self> {
        options.validate()?;

        let slots = (options.wait && options.max_active > 0).then(|| {
            let (tx, rx) = bounded(options.max_active);
            for _ in 0..options.max_active {
                let _ = tx.try_send(());
            }
            Slots { tx, rx }
        });

        Ok(TrackingPool {
            shared: Arc::new(TrackingShared {
                options,
                active: AtomicUsize::new(0),
                waited: AtomicU64::new(0),
                slots,
                free: Mutex::new(VecDeque::new()),
            }),
        })
    }

    /// Vends a client, reusing the free list when possible.
    ///
    /// With `wait` enabled this blocks until a slot frees up; otherwise a
    /// full pool fails with [`Error::TooManyActiveClients`]. A client whose
    /// invalidation stream died is handed out as-is and fails every call
    /// with [`Error::Closed`]; discarding it is the caller's move.
    pub fn get(&self) -> crate::Result<Client> {
        let shared = &self.shared;
        if let Some(slots) = &shared.slots {
            if slots.rx.is_empty() {
                shared.waited.fetch_add(1, Ordering::Relaxed);
                dlog!("pool.get waiting for a slot");
            }
            slots.rx.recv().map_err(|_| Error::Closed)?;
        } else if shared.options.max_active > 0
            && shared.active.load(Ordering::Relaxed) >= shared.options.max_active
        {
            return Err(Error::TooManyActiveClients);
        }

        if let Some(client) = shared.free.lock().pop_front() {
            return Ok(Client::from_inner(client));
        }

        match self.dial() {
            Ok(client) => {
                shared.active.fetch_add(1, Ordering::Relaxed);
                Ok(Client::from_inner(client))
            }
            Err(err) => {
                // give the slot back so a failed dial cannot shrink the pool
                shared.release_slot();
                Err(err)
            }
        }
    }

    fn dial(&self) -> crate::Result<ClientInner> {
        let options = &self.shared.options;
        let redis_client = redis::Client::open(options.connection_url())?;
        let mut conn = redis_client.get_connection()?;
        let mut iconn = redis_client.get_connection()?;

        let redirect_id: i64 = redis::cmd("CLIENT").arg("ID").query(&mut iconn)?;
        redis::cmd("CLIENT")
            .arg("TRACKING")
            .arg("ON")
            .arg("REDIRECT")
            .arg(redirect_id)
            .arg("NOLOOP")
            .query::<()>(&mut conn)?;
        dlog!(redirect_id, "pool.dial tracking registered");

        let cache = Arc::new(LocalCache::new(options.max_entries));
        let closed = Arc::new(AtomicBool::new(false));

        let stop = {
            let closed = closed.clone();
            move || closed.load(Ordering::Relaxed)
        };
        let on_failure = {
            let closed = closed.clone();
            move || closed.store(true, Ordering::Relaxed)
        };
        invalidation::spawn(iconn, cache.clone(), stop, on_failure)?;
        let sweeper = expiry::spawn(cache.clone())?;

        Ok(ClientInner {
            conn: ClientConn::Dedicated(conn),
            cache,
            closed,
            pool: PoolHandle::Tracking(self.shared.clone()),
            _sweeper: Some(sweeper),
        })
    }

    /// Tears down every client parked in the free list. Vended clients keep
    /// working until they are returned or dropped.
    pub fn close(&self) {
        let mut free = self.shared.free.lock();
        free.drain(..);
    }

    /// Clients dialed over the pool's lifetime.
    pub fn active(&self) -> usize {
        self.shared.active.load(Ordering::Relaxed)
    }

    /// Times `get` had to wait for a slot.
    pub fn waited(&self) -> u64 {
        self.shared.waited.load(Ordering::Relaxed)
    }

    pub fn options(&self) -> &PoolOptions {
        &self.shared.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_max_entries_fails_construction() {
        let result = TrackingPool::new(PoolOptions {
            max_entries: 0,
            ..Default::default()
        });
        assert!(matches!(result, Err(Error::InvalidOptions(_))));
    }

    #[test]
    fn construction_does_not_dial() {
        // a pool pointed at a dead address still constructs
        let pool = TrackingPool::new(PoolOptions {
            redis_address: "127.0.0.1:1".into(),
            max_entries: 100,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(pool.active(), 0);
        assert_eq!(pool.waited(), 0);
    }
}
