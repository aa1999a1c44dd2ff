use std::sync::Arc;
use std::thread;
use std::time::Duration;

use redis::{from_redis_value, Connection, Value};
use tracing::warn;

use crate::cache::LocalCache;
use crate::dlog;
use crate::types::Error;

/// Channel Redis publishes key invalidations on for redirected clients.
pub(crate) const INVALIDATION_CHANNEL: &str = "__redis__:invalidate";

const MAX_RECEIVE_FAILURES: u32 = 5;

/// How long a blocked receive may sit before the stop condition is polled.
const STOP_POLL_INTERVAL: Duration = Duration::from_secs(1);

enum StreamEvent {
    Invalidate(Vec<String>),
    Reset,
}

/// Spawns the consumer loop on its own thread. `on_failure` runs if the
/// stream dies (five consecutive receive failures or a subscribe error), so
/// the owner can mark itself closed or out of sync.
pub(crate) fn spawn(
    conn: Connection,
    cache: Arc<LocalCache>,
    stop: impl Fn() -> bool + Send + 'static,
    on_failure: impl FnOnce() + Send + 'static,
) -> crate::Result<()> {
    thread::Builder::new()
        .name("csc-invalidations".into())
        .spawn(move || {
            if let Err(err) = run(conn, cache, stop) {
                warn!("invalidation stream closed: {err}");
                on_failure();
            }
        })?;
    Ok(())
}

/// Subscribes and consumes pushed invalidations until `stop` reports true,
/// the server ends the session with `RESET`, or the stream fails.
fn run(
    mut conn: Connection,
    cache: Arc<LocalCache>,
    stop: impl Fn() -> bool,
) -> crate::Result<()> {
    conn.set_read_timeout(Some(STOP_POLL_INTERVAL))?;
    redis::cmd("SUBSCRIBE")
        .arg(INVALIDATION_CHANNEL)
        .query::<()>(&mut conn)?;

    let mut failures = 0u32;
    loop {
        if stop() {
            return Ok(());
        }
        let reply = match conn.recv_response() {
            Ok(reply) => reply,
            Err(err) if err.is_timeout() => continue,
            Err(err) => {
                failures += 1;
                warn!("failed to receive from invalidation subscription: {err}");
                if failures >= MAX_RECEIVE_FAILURES {
                    return Err(Error::Closed);
                }
                continue;
            }
        };
        failures = 0;

        match parse_push(&reply) {
            Ok(StreamEvent::Reset) => return Ok(()),
            Ok(StreamEvent::Invalidate(keys)) => {
                if !keys.is_empty() {
                    dlog!(count = keys.len(), "invalidation.delete");
                    cache.delete(&keys);
                }
            }
            // malformed pushes are dropped, the stream stays up
            Err(err) => warn!("skipping invalidation reply: {err}"),
        }
    }
}

fn parse_push(reply: &Value) -> Result<StreamEvent, Error> {
    if let Value::Status(status) = reply {
        if status == "RESET" {
            return Ok(StreamEvent::Reset);
        }
        return Err(Error::Parse(format!("unexpected status reply: {status}")));
    }

    let items = match reply {
        Value::Bulk(items) if items.len() >= 3 => items,
        other => {
            return Err(Error::Parse(format!("unexpected reply shape: {other:?}")));
        }
    };

    let kind: String =
        from_redis_value(&items[0]).map_err(|err| Error::Parse(err.to_string()))?;
    if kind != "message" {
        return Err(Error::Parse(format!("reply is not a message: {kind}")));
    }

    // items[1] is the channel name; a nil key array accompanies flushes
    let keys = match &items[2] {
        Value::Nil => Vec::new(),
        keys => from_redis_value(keys).map_err(|err| Error::Parse(err.to_string()))?,
    };
    Ok(StreamEvent::Invalidate(keys))
}
