//! Integration tests for the shared-bitmap primitives and the distributed
//! allocator, run against the in-process store.

use ipam::store::{get_bit, NOT_FOUND};
use ipam::{
    BitmapStore, DistributedIpAllocator, Error, InMemoryStore, LockOptions, LockRegistry,
    NetworkAddressSpace, SpaceQuery,
};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Helper to express a `find_space` result the way the wire contract does
fn wire_offset(found: Option<u64>) -> i64 {
    found.map_or(NOT_FOUND, |offset| offset as i64)
}

// ============================================================================
// Primitive Scenarios
// ============================================================================

#[tokio::test]
async fn test_fill_on_zero_bitmap() {
    let store = InMemoryStore::new();
    store.put_raw("bitmap", vec![0; 4]);

    assert_eq!(store.fill("bitmap", true, 5, 3).await.unwrap(), 3);

    let raw = store.read("bitmap").await.unwrap();
    for bit in 0..32 {
        assert_eq!(get_bit(&raw, bit), (5..8).contains(&bit), "bit {}", bit);
    }
}

#[tokio::test]
async fn test_find_space_known_run() {
    let store = InMemoryStore::new();
    store.fill("bitmap", true, 0, 32).await.unwrap();
    store.fill("bitmap", false, 12, 4).await.unwrap();

    let query = SpaceQuery::new(4, false, 0, 32);
    let found = store.find_space("bitmap", &query).await.unwrap();
    assert_eq!(wire_offset(found), 12);

    store.fill("bitmap", true, 14, 1).await.unwrap();
    let found = store.find_space("bitmap", &query).await.unwrap();
    assert_eq!(wire_offset(found), -1);
}

#[tokio::test]
async fn test_find_space_window_must_fit_range() {
    let store = InMemoryStore::new();
    store.fill("bitmap", true, 0, 30).await.unwrap();

    // Bits 30..32 are clear but a 4-bit window would run past end = 32
    let query = SpaceQuery::new(4, false, 0, 32);
    assert_eq!(store.find_space("bitmap", &query).await.unwrap(), None);

    let wider = SpaceQuery::new(4, false, 0, 34);
    assert_eq!(store.find_space("bitmap", &wider).await.unwrap(), Some(30));
}

#[tokio::test]
async fn test_separate_find_and_fill_can_collide() {
    let store = InMemoryStore::new();
    let query = SpaceQuery::new(1, false, 0, 16);

    // Two clients scan before either fills: both see the same offset
    let a = store.find_space("bitmap", &query).await.unwrap();
    let b = store.find_space("bitmap", &query).await.unwrap();
    assert_eq!(a, b);

    // The combined primitive never hands out the same window twice
    let c = store.find_and_fill("bitmap", &query).await.unwrap();
    let d = store.find_and_fill("bitmap", &query).await.unwrap();
    assert_ne!(c, d);
}

// ============================================================================
// Distributed Allocator
// ============================================================================

#[tokio::test]
async fn test_allocators_sharing_a_key_agree() {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let network = NetworkAddressSpace::parse("192.168.1.0/29").unwrap();

    let node_a = DistributedIpAllocator::open(network, "vpn", store.clone()).await.unwrap();
    let node_b = DistributedIpAllocator::open(network, "vpn", store.clone()).await.unwrap();

    let first = node_a.allocate().await.unwrap();
    let second = node_b.allocate().await.unwrap();

    assert_eq!(first, "192.168.1.1".parse::<IpAddr>().unwrap());
    assert_eq!(second, "192.168.1.2".parse::<IpAddr>().unwrap());
    assert_eq!(node_a.used_count().await.unwrap(), 4);
    assert_eq!(node_b.available_count().await.unwrap(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_distributed_allocation_is_unique() {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let network = NetworkAddressSpace::parse("10.50.0.0/24").unwrap();
    let allocator = Arc::new(
        DistributedIpAllocator::open(network, "pool", store.clone())
            .await
            .unwrap(),
    );

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let allocator = Arc::clone(&allocator);
            tokio::spawn(async move {
                let mut mine = Vec::new();
                for _ in 0..15 {
                    mine.push(allocator.allocate().await.unwrap());
                }
                mine
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for task in tasks {
        for ip in task.await.unwrap() {
            assert!(seen.insert(ip), "duplicate allocation of {}", ip);
        }
    }

    assert_eq!(seen.len(), 240);
    assert_eq!(allocator.used_count().await.unwrap(), 242);
}

#[tokio::test]
async fn test_distributed_exhaustion_leaves_bitmap_unchanged() {
    let store = Arc::new(InMemoryStore::new());
    let network = NetworkAddressSpace::parse("10.0.0.0/30").unwrap();
    let allocator = DistributedIpAllocator::open(network, "pool", store.clone())
        .await
        .unwrap();

    allocator.allocate().await.unwrap();
    allocator.allocate().await.unwrap();
    let before = store.read("pool").await.unwrap();

    assert!(matches!(
        allocator.allocate().await,
        Err(Error::NoAddressAvailable(_))
    ));
    assert_eq!(store.read("pool").await.unwrap(), before);
}

#[tokio::test]
async fn test_allocate_in_nearly_full_large_block() {
    let store = Arc::new(InMemoryStore::new());
    let network = NetworkAddressSpace::parse("10.0.0.0/8").unwrap();

    // Every address of the /8 used except 10.255.255.250
    store.put_raw("big", vec![0xff; 1 << 21]);
    let allocator = DistributedIpAllocator::open(network, "big", store.clone())
        .await
        .unwrap();
    let free: IpAddr = "10.255.255.250".parse().unwrap();
    allocator.release(free).await.unwrap();

    assert_eq!(allocator.allocate().await.unwrap(), free);
    assert!(matches!(
        allocator.allocate().await,
        Err(Error::NoAddressAvailable(_))
    ));
}

// ============================================================================
// Locked Workflows
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lock_serializes_find_then_fill() {
    let store = Arc::new(InMemoryStore::new());
    let options = LockOptions::default()
        .with_expiry(Duration::from_secs(5))
        .with_tries(200)
        .with_retry_delay(Duration::from_millis(2));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                // One registry per "process"
                let registry = LockRegistry::with_defaults(store.clone(), options);
                let locker = registry.locker("bitmap").unwrap();
                locker.lock().await.unwrap();

                let query = SpaceQuery::new(2, false, 0, 64);
                let offset = store.find_space("bitmap", &query).await.unwrap().unwrap();
                tokio::task::yield_now().await;
                store.fill("bitmap", true, offset, 2).await.unwrap();

                assert!(locker.unlock().await.unwrap());
                offset
            })
        })
        .collect();

    let mut offsets = HashSet::new();
    for task in tasks {
        assert!(offsets.insert(task.await.unwrap()));
    }
    assert_eq!(offsets.len(), 8);
}
