//! Broadcasting-pool tests against a live Redis server on 127.0.0.1:6379.
//!
//! These are ignored by default; start `redis-server` and run
//! `cargo test -- --ignored`.

use std::thread;
use std::time::Duration;

use redis_csc::{BroadcastingPool, PoolOptions};

fn test_options() -> PoolOptions {
    PoolOptions {
        redis_address: "127.0.0.1:6379".into(),
        max_entries: 100,
        ..Default::default()
    }
}

const INVALIDATION_SETTLE: Duration = Duration::from_millis(100);

#[test]
#[ignore = "requires a local redis-server"]
fn clients_share_one_cache() {
    let key = "csc:broadcast:shared";
    let pool = BroadcastingPool::new(test_options()).unwrap();

    let mut c1 = pool.get().unwrap();
    c1.set(key, b"123456", 60).unwrap();

    let mut c2 = pool.get().unwrap();
    assert_eq!(c2.get(key).unwrap().unwrap(), b"123456");

    let stats = pool.stats();
    assert_eq!(stats.num_entries, 1);
    assert_eq!(stats.misses, 1);

    // a second read, through either client, hits the shared cache
    let hits_before = pool.stats().hits;
    assert_eq!(c1.get(key).unwrap().unwrap(), b"123456");
    assert_eq!(pool.stats().hits - hits_before, 1);

    c1.delete(&[key]).unwrap();
    thread::sleep(INVALIDATION_SETTLE);
    assert_eq!(pool.stats().num_entries, 0);
    assert_eq!(c2.get(key).unwrap(), None);
}

#[test]
#[ignore = "requires a local redis-server"]
fn key_prefix_scopes_the_broadcast() {
    let key = "csc:broadcast:prefixed";
    let pool = BroadcastingPool::new(PoolOptions {
        key_prefix: "__csc:".into(),
        ..test_options()
    })
    .unwrap();

    let mut c1 = pool.get().unwrap();
    c1.set(key, b"123456", 60).unwrap();

    let mut c2 = pool.get().unwrap();
    assert_eq!(c2.get(key).unwrap().unwrap(), b"123456");
    assert_eq!(pool.stats().num_entries, 1);
    assert_eq!(pool.stats().misses, 1);

    c1.delete(&[key]).unwrap();
    thread::sleep(INVALIDATION_SETTLE);
    assert_eq!(pool.stats().num_entries, 0);
}

#[test]
#[ignore = "requires a local redis-server"]
fn get_entries_preserves_order_and_reports_misses() {
    let pool = BroadcastingPool::new(test_options()).unwrap();
    let mut client = pool.get().unwrap();

    let mut keys = Vec::new();
    for i in 0..10 {
        let key = format!("csc:broadcast:batch-{i}");
        client.set(&key, b"123456", 60).unwrap();
        keys.push(key);
    }
    for i in 0..3 {
        let key = format!("csc:broadcast:batch-missing-{i}");
        client.delete(&[key.as_str()]).unwrap();
        keys.push(key);
    }

    let entries = client.get_entries(&keys).unwrap();
    assert_eq!(entries.len(), 13);
    for entry in &entries[..10] {
        assert_eq!(entry.data(), Some(&b"123456"[..]));
    }
    for entry in &entries[10..] {
        assert!(entry.is_miss());
    }

    // everything fetched is now local; a second batch is all cache hits
    let entries = client.get_entries(&keys[..10]).unwrap();
    assert!(entries.iter().all(|entry| entry.was_cached()));
}

#[test]
#[ignore = "requires a local redis-server"]
fn flush_empties_the_shared_cache() {
    let key = "csc:broadcast:flush";
    let pool = BroadcastingPool::new(test_options()).unwrap();

    let mut client = pool.get().unwrap();
    client.set(key, b"123456", 60).unwrap();
    assert_eq!(client.get(key).unwrap().unwrap(), b"123456");
    assert_eq!(pool.stats().num_entries, 1);

    pool.flush();
    assert_eq!(pool.stats().num_entries, 0);
}

#[test]
#[ignore = "requires a local redis-server"]
fn closed_pool_stops_vending() {
    let pool = BroadcastingPool::new(test_options()).unwrap();
    let mut held = pool.get().unwrap();

    pool.close();
    assert!(pool.get().is_err());
    assert!(held.get("csc:broadcast:closed").is_err());
    assert!(held.is_closed());
}
