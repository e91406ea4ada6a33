//! Context cache behavior seen from the outside: single builds, retention,
//! purging and release hooks

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use cmm_core::cache::CacheConfig;
use cmm_core::{CMMError, ContentHash, ContextCache, ContextHandle};

fn hooked(kind: &str, released: &Arc<AtomicUsize>) -> ContextHandle {
    let released = released.clone();
    ContextHandle::builder("test.builder", kind, vec![0u8; 64])
        .size(64)
        .on_release(move |_| {
            released.fetch_add(1, Ordering::SeqCst);
        })
        .build()
}

#[test]
fn test_two_lookups_build_once() {
    let cache = ContextCache::new();
    let builds = AtomicUsize::new(0);
    let build = || {
        builds.fetch_add(1, Ordering::SeqCst);
        Ok(ContextHandle::new("test.builder", "lcm2", 7u32))
    };

    let a = cache.get_or_create("lcm2|intent=0;", build).unwrap();
    let b = cache.get_or_create("lcm2|intent=0;", build).unwrap();

    assert_eq!(builds.load(Ordering::SeqCst), 1);
    assert!(a.same_context(&b));
    let stats = cache.stats();
    assert_eq!((stats.hits, stats.misses), (1, 1));
    assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
}

#[test]
fn test_concurrent_lookups_share_a_single_build() {
    let cache = Arc::new(ContextCache::new());
    let builds = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(8));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let cache = cache.clone();
            let builds = builds.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                cache
                    .get_or_create("shared-key", || {
                        builds.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(std::time::Duration::from_millis(10));
                        Ok(ContextHandle::new("test.builder", "lcm2", String::from("transform")))
                    })
                    .unwrap()
            })
        })
        .collect();

    let handles: Vec<ContextHandle> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    assert_eq!(builds.load(Ordering::SeqCst), 1);
    assert!(handles.windows(2).all(|pair| pair[0].same_context(&pair[1])));
    assert_eq!(handles[0].ref_count(), 9);
}

#[test]
fn test_failed_build_propagates_and_retries() {
    let cache = ContextCache::new();
    let err = cache
        .get_or_create("broken", || Err(CMMError::builder("test.builder", "profile unreadable")))
        .unwrap_err();
    assert!(matches!(err, CMMError::BuilderFailure { ref reason, .. } if reason == "profile unreadable"));
    assert!(!cache.contains("broken"));

    let handle = cache
        .get_or_create("broken", || Ok(ContextHandle::new("test.builder", "lcm2", 1u8)))
        .unwrap();
    assert_eq!(handle.resource_kind(), "lcm2");
    assert_eq!(cache.stats().build_failures, 1);
}

#[test]
fn test_cache_keeps_context_after_callers_release() {
    let released = Arc::new(AtomicUsize::new(0));
    let cache = ContextCache::new();

    let handle = cache.get_or_create("kept", || Ok(hooked("lcm2", &released))).unwrap();
    assert_eq!(handle.release(), 1);
    assert_eq!(released.load(Ordering::SeqCst), 0);
    assert!(cache.get("kept").is_some());

    assert!(cache.invalidate("kept").unwrap());
    assert_eq!(released.load(Ordering::SeqCst), 1);
    assert!(!cache.invalidate("kept").unwrap());
}

#[test]
fn test_purge_unused_spares_held_contexts() {
    let released = Arc::new(AtomicUsize::new(0));
    let cache = ContextCache::new();

    let held = cache.get_or_create("held", || Ok(hooked("lcm2", &released))).unwrap();
    drop(cache.get_or_create("idle", || Ok(hooked("lcm2", &released))).unwrap());

    assert_eq!(cache.purge_unused().unwrap(), 1);
    assert_eq!(released.load(Ordering::SeqCst), 1);
    assert!(cache.contains("held"));

    drop(held);
    cache.clear().unwrap();
    assert_eq!(released.load(Ordering::SeqCst), 2);
    assert!(cache.is_empty());
}

#[test]
fn test_lru_eviction_beyond_capacity() {
    let released = Arc::new(AtomicUsize::new(0));
    let cache = ContextCache::with_config(CacheConfig::default().with_max_entries(2));

    drop(cache.get_or_create("a", || Ok(hooked("lcm2", &released))).unwrap());
    drop(cache.get_or_create("b", || Ok(hooked("lcm2", &released))).unwrap());
    // touch "a" so "b" is the least recently used
    assert!(cache.get("a").is_some());
    drop(cache.get_or_create("c", || Ok(hooked("lcm2", &released))).unwrap());

    assert_eq!(cache.len(), 2);
    assert!(cache.contains("a"));
    assert!(!cache.contains("b"));
    assert!(cache.contains("c"));
    assert_eq!(cache.stats().evictions, 1);
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[test]
fn test_dump_lists_entries() {
    let cache = ContextCache::new();
    let _handle = cache
        .get_or_create("org.cmm.lcm2|lcm2|intent=1;|", || {
            Ok(ContextHandle::new("org.cmm.lcm2", "lcm2", [0u8; 32]))
        })
        .unwrap();

    let entries = cache.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].refs, 2);
    assert_eq!(entries[0].hash, ContentHash::of("org.cmm.lcm2|lcm2|intent=1;|").to_hex());
    assert_eq!(entries[0].size, 32);

    let dump = cache.describe();
    assert!(dump.contains("1/512 entries"));
    assert!(dump.contains("org.cmm.lcm2|lcm2|intent=1;|"));
    assert_eq!(ContentHash::of("x").as_bytes().len(), 32);
}
