use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::tick;
use tracing::{info, warn};

use crate::cache::LocalCache;
use crate::client::{Client, ClientConn, ClientInner, PoolHandle};
use crate::dlog;
use crate::expiry::{self, SweeperGuard};
use crate::invalidation;
use crate::types::{Error, PoolOptions, Stats};

const PING_INTERVAL: Duration = Duration::from_secs(5);
const MAX_PING_FAILURES: u32 = 5;
const RESYNC_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Pool with one cache shared by every client it vends.
///
/// The pool holds two long-lived connections: a data connection registered
/// with `CLIENT TRACKING ON REDIRECT <id> BCAST` and the invalidation
/// connection the redirect points at. Clients borrow their data connections
/// from an underlying `r2d2` pool (validated with PING on borrow) and share
/// the pool cache.
///
/// Reads on borrowed connections do not register per-key interest; coherence
/// rests entirely on the broadcast invalidations. Configure
/// [`PoolOptions::key_prefix`] so the server-side BCAST prefix matches the
/// cached keyspace.
pub struct BroadcastingPool {
    shared: Arc<BroadcastShared>,
    _sweeper: SweeperGuard,
}

pub(crate) struct BroadcastShared {
    options: PoolOptions,
    redis_client: redis::Client,
    rpool: r2d2::Pool<redis::Client>,
    cache: Arc<LocalCache>,
    /// Shared with every vended client; set once by `close`.
    closed: Arc<AtomicBool>,
    /// Raised when the stream or the pinger gives up; the supervisor flushes
    /// and re-registers, then lowers it.
    out_of_sync: AtomicBool,
    /// Bumped on every registration. Consumer and pinger retire themselves
    /// once the epoch they were spawned under is no longer current.
    epoch: AtomicU64,
}

impl BroadcastShared {
    pub(crate) fn options(&self) -> &PoolOptions {
        &self.options
    }

    fn is_stale(&self, epoch: u64) -> bool {
        self.closed.load(Ordering::Relaxed) || self.epoch.load(Ordering::Relaxed) != epoch
    }

    fn mark_out_of_sync(&self, epoch: u64) {
        if !self.is_stale(epoch) {
            self.out_of_sync.store(true, Ordering::Relaxed);
        }
    }

    /// Dials the two long-lived connections, registers BCAST tracking and
    /// starts the invalidation consumer and the pinger under a fresh epoch.
    ///
    /// The connections are dialed directly rather than borrowed: a
    /// connection left in subscribe state must never find its way back to a
    /// later borrower.
    fn register(self: &Arc<Self>) -> crate::Result<()> {
        let mut conn = self.redis_client.get_connection()?;
        let mut iconn = self.redis_client.get_connection()?;

        let redirect_id: i64 = redis::cmd("CLIENT").arg("ID").query(&mut iconn)?;
        let mut tracking = redis::cmd("CLIENT");
        tracking
            .arg("TRACKING")
            .arg("ON")
            .arg("REDIRECT")
            .arg(redirect_id)
            .arg("BCAST");
        if !self.options.key_prefix.is_empty() {
            tracking.arg("PREFIX").arg(&self.options.key_prefix);
        }
        tracking.query::<()>(&mut conn)?;

        let epoch = self.epoch.fetch_add(1, Ordering::Relaxed) + 1;
        dlog!(epoch, redirect_id, "broadcast.registered");

        let stop = {
            let shared = self.clone();
            move || shared.is_stale(epoch)
        };
        let on_failure = {
            let shared = self.clone();
            move || shared.mark_out_of_sync(epoch)
        };
        invalidation::spawn(iconn, self.cache.clone(), stop, on_failure)?;

        let pinger = self.clone();
        thread::Builder::new()
            .name("csc-pinger".into())
            .spawn(move || run_pinger(conn, pinger, epoch))?;
        Ok(())
    }
}

impl BroadcastingPool {
    /// Builds the pool, dials and registers immediately, and starts the
    /// background jobs. Fails if the server is unreachable or registration
    /// is rejected.
    pub fn new(options: PoolOptions) -> crate::Result<Self> {
        options.validate()?;

        let redis_client = redis::Client::open(options.connection_url())?;
        // zero means unlimited, so leave the borrow pool effectively unbounded
        let max_size = if options.max_active > 0 {
            options.max_active as u32
        } else {
            u32::MAX
        };
        let rpool = r2d2::Pool::builder()
            .min_idle(Some(1))
            .max_size(max_size)
            .build(redis_client.clone())?;

        let cache = Arc::new(LocalCache::new(options.max_entries));
        let shared = Arc::new(BroadcastShared {
            options,
            redis_client,
            rpool,
            cache: cache.clone(),
            closed: Arc::new(AtomicBool::new(false)),
            out_of_sync: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
        });

        let started: crate::Result<SweeperGuard> = (|| {
            shared.register()?;
            let supervisor = shared.clone();
            thread::Builder::new()
                .name("csc-resync".into())
                .spawn(move || run_supervisor(supervisor))?;
            expiry::spawn(cache)
        })();

        match started {
            Ok(sweeper) => Ok(BroadcastingPool {
                shared,
                _sweeper: sweeper,
            }),
            Err(err) => {
                // retire whatever already spawned
                shared.closed.store(true, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    /// Vends a lightweight client over a borrowed data connection, sharing
    /// the pool cache.
    pub fn get(&self) -> crate::Result<Client> {
        if self.shared.closed.load(Ordering::Relaxed) {
            return Err(Error::Closed);
        }
        let conn = self.shared.rpool.get()?;
        Ok(Client::from_inner(ClientInner {
            conn: ClientConn::Pooled(conn),
            cache: self.shared.cache.clone(),
            closed: self.shared.closed.clone(),
            pool: PoolHandle::Broadcasting(self.shared.clone()),
            _sweeper: None,
        }))
    }

    /// Shuts the pool down: vended clients start failing with
    /// [`Error::Closed`], the cache is emptied, and the background jobs
    /// retire, dropping the long-lived connections.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Relaxed);
        self.shared.cache.flush();
    }

    /// Snapshot of the shared cache.
    pub fn stats(&self) -> Stats {
        self.shared.cache.stats()
    }

    /// Empties the shared cache.
    pub fn flush(&self) {
        self.shared.cache.flush()
    }

    pub fn options(&self) -> &PoolOptions {
        &self.shared.options
    }
}

impl Drop for BroadcastingPool {
    fn drop(&mut self) {
        self.close();
    }
}

/// Health-checks the tracking-registered data connection. Five consecutive
/// failures mark the pool out of sync and end the task.
fn run_pinger(mut conn: redis::Connection, shared: Arc<BroadcastShared>, epoch: u64) {
    let ticker = tick(PING_INTERVAL);
    let mut failures = 0u32;
    loop {
        if ticker.recv().is_err() || shared.is_stale(epoch) {
            return;
        }
        match redis::cmd("PING").query::<String>(&mut conn) {
            Ok(_) => failures = 0,
            Err(err) => {
                failures += 1;
                dlog!(failures, error = %err, "broadcast.ping failed");
                if failures >= MAX_PING_FAILURES {
                    warn!("broadcasting data connection failed, resynchronizing");
                    shared.mark_out_of_sync(epoch);
                    return;
                }
            }
        }
    }
}

/// Once a second: when the pool is out of sync, flush the shared cache and
/// re-register. Superseded consumer/pinger tasks notice the epoch bump and
/// retire, dropping their connections.
fn run_supervisor(shared: Arc<BroadcastShared>) {
    let ticker = tick(RESYNC_CHECK_INTERVAL);
    loop {
        if ticker.recv().is_err() || shared.closed.load(Ordering::Relaxed) {
            return;
        }
        if !shared.out_of_sync.load(Ordering::Relaxed) {
            continue;
        }
        shared.cache.flush();
        match shared.register() {
            Ok(()) => {
                shared.out_of_sync.store(false, Ordering::Relaxed);
                info!("broadcasting pool resynchronized");
            }
            Err(err) => warn!("failed to resynchronize broadcasting pool: {err}"),
        }
    }
}
