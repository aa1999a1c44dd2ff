use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, tick, Receiver, Sender};

use crate::cache::LocalCache;

pub(crate) const EXPIRE_CHECK_INTERVAL: Duration = Duration::from_millis(3000);

/// Cancels the owning cache's sweeper when dropped.
pub(crate) struct SweeperGuard {
    _stop: Sender<()>,
}

pub(crate) fn spawn(cache: Arc<LocalCache>) -> crate::Result<SweeperGuard> {
    let (stop_tx, stop_rx) = bounded(0);
    thread::Builder::new()
        .name("csc-expire-sweeper".into())
        .spawn(move || run(cache, stop_rx, EXPIRE_CHECK_INTERVAL))?;
    Ok(SweeperGuard { _stop: stop_tx })
}

fn run(cache: Arc<LocalCache>, stop: Receiver<()>, every: Duration) {
    let ticker = tick(every);
    loop {
        crossbeam_channel::select! {
            recv(stop) -> _ => return,
            recv(ticker) -> _ => cache.evict_expired(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweeper_evicts_expired_entries_until_cancelled() {
        let cache = Arc::new(LocalCache::new(10));
        for i in 0..5 {
            cache.set(&format!("key:{i}"), b"fooobar".to_vec(), 1);
        }
        cache.set("immortal", b"fooobar".to_vec(), crate::NO_EXPIRE);

        let (stop_tx, stop_rx) = bounded(0);
        let sweeper = {
            let cache = cache.clone();
            thread::spawn(move || run(cache, stop_rx, Duration::from_millis(50)))
        };

        // nothing has expired yet, live entries stay put
        thread::sleep(Duration::from_millis(200));
        assert_eq!(cache.stats().expired, 0);
        assert_eq!(cache.stats().num_entries, 6);

        // the one-second entries lapse, the untimed one survives
        thread::sleep(Duration::from_millis(1200));
        assert_eq!(cache.stats().expired, 5);
        assert_eq!(cache.stats().num_entries, 1);

        drop(stop_tx);
        sweeper.join().unwrap();
    }
}
