//! Tracking-pool tests against a live Redis server on 127.0.0.1:6379.
//!
//! These are ignored by default; start `redis-server` and run
//! `cargo test -- --ignored`.

use std::thread;
use std::time::Duration;

use redis_csc::{Error, PoolOptions, TrackingPool};

fn test_options() -> PoolOptions {
    PoolOptions {
        redis_address: "127.0.0.1:6379".into(),
        max_entries: 10_000,
        ..Default::default()
    }
}

const INVALIDATION_SETTLE: Duration = Duration::from_millis(100);

#[test]
#[ignore = "requires a local redis-server"]
fn set_then_get_counts_miss_then_hit() {
    let key = "csc:tracking:roundtrip";
    let pool = TrackingPool::new(test_options()).unwrap();

    let mut writer = pool.get().unwrap();
    writer.set(key, b"123456", 60).unwrap();

    let mut reader = pool.get().unwrap();
    let value = reader.get(key).unwrap().expect("value must exist");
    assert_eq!(value, b"123456");

    let stats = reader.stats();
    assert_eq!(stats.num_entries, 1);
    assert_eq!(stats.misses, 1);

    let hits_before = reader.stats().hits;
    assert_eq!(reader.get(key).unwrap().unwrap(), b"123456");
    assert_eq!(reader.stats().hits - hits_before, 1);

    writer.delete(&[key]).unwrap();
    thread::sleep(INVALIDATION_SETTLE);

    // the pushed invalidation must have evicted the reader's copy
    assert_eq!(reader.stats().num_entries, 0);
    assert_eq!(reader.get(key).unwrap(), None);
}

#[test]
#[ignore = "requires a local redis-server"]
fn deletes_invalidate_other_clients() {
    let key = "csc:tracking:invalidate";
    let pool = TrackingPool::new(test_options()).unwrap();

    let mut c1 = pool.get().unwrap();
    let mut c2 = pool.get().unwrap();

    c1.set(key, b"123", 60).unwrap();
    assert_eq!(c2.get(key).unwrap().unwrap(), b"123");
    assert_eq!(c2.stats().num_entries, 1);

    c1.delete(&[key]).unwrap();
    thread::sleep(INVALIDATION_SETTLE);
    assert_eq!(c2.stats().num_entries, 0);
}

#[test]
#[ignore = "requires a local redis-server"]
fn wait_mode_blocks_until_a_slot_frees_up() {
    let pool = TrackingPool::new(PoolOptions {
        wait: true,
        max_active: 1,
        max_entries: 100,
        ..test_options()
    })
    .unwrap();

    let c1 = pool.get().unwrap();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        c1.close();
    });

    let c2 = pool.get().unwrap();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        c2.close();
    });

    let _c3 = pool.get().unwrap();

    assert_eq!(pool.waited(), 2);
    assert_eq!(pool.active(), 1);
}

#[test]
#[ignore = "requires a local redis-server"]
fn full_pool_without_wait_fails_fast() {
    let pool = TrackingPool::new(PoolOptions {
        max_active: 1,
        max_entries: 100,
        ..test_options()
    })
    .unwrap();

    let _held = pool.get().unwrap();
    assert!(matches!(pool.get(), Err(Error::TooManyActiveClients)));
}

#[test]
#[ignore = "requires a local redis-server"]
fn missing_keys_read_as_none() {
    let pool = TrackingPool::new(test_options()).unwrap();
    let mut client = pool.get().unwrap();

    client.delete(&["csc:tracking:nosuchkey"]).unwrap();
    assert_eq!(client.get("csc:tracking:nosuchkey").unwrap(), None);

    let entry = client.get_entry("csc:tracking:nosuchkey").unwrap();
    assert!(entry.is_miss());
    assert!(!entry.was_cached());
}

#[test]
#[ignore = "requires a local redis-server"]
fn key_prefix_is_transparent_to_callers() {
    let key = "csc:tracking:prefixed";
    let pool = TrackingPool::new(PoolOptions {
        key_prefix: "__csc:".into(),
        ..test_options()
    })
    .unwrap();

    let mut client = pool.get().unwrap();
    client.set(key, b"123456", 60).unwrap();
    assert_eq!(client.get(key).unwrap().unwrap(), b"123456");
    assert_eq!(client.stats().num_entries, 1);

    client.delete(&[key]).unwrap();
    assert_eq!(client.stats().num_entries, 0);
}
