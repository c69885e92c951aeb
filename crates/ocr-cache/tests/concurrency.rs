//! Single-flight initialization and concurrent steady-state use.

use std::sync::{Arc, Barrier};
use std::thread;

use ocr_cache::{CacheKey, CacheState, SafeCache};
use serial_test::serial;
use tempfile::tempdir;

mod helpers;
use helpers::*;

const THREADS: usize = 16;

fn race<T: Send + 'static>(cache: &Arc<SafeCache>, f: fn(&SafeCache, usize) -> T) -> Vec<T> {
    let barrier = Arc::new(Barrier::new(THREADS));
    let workers: Vec<_> = (0..THREADS)
        .map(|i| {
            let cache = Arc::clone(cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                f(&cache, i)
            })
        })
        .collect();
    workers.into_iter().map(|w| w.join().unwrap()).collect()
}

/// Test that N concurrent initializers cause exactly one native open.
#[test]
#[serial]
fn test_concurrent_initialize_opens_once() {
    let dir = tempdir().unwrap();
    let before = open_calls();
    let cache = Arc::new(SafeCache::with_loader(temp_config(dir.path()), Arc::new(counting_api())));

    let states = race(&cache, |cache, _| cache.initialize());

    assert_eq!(open_calls() - before, 1);
    assert!(states.iter().all(|s| *s == CacheState::Ready));
}

/// Test that all initializers observe the same failure when the open fails.
#[test]
#[serial]
fn test_concurrent_initialize_shares_failure() {
    let dir = tempdir().unwrap();
    let before = open_calls();
    let cache = Arc::new(SafeCache::with_loader(corrupt_config(dir.path()), Arc::new(counting_api())));

    let states = race(&cache, |cache, _| cache.initialize());

    assert_eq!(open_calls() - before, 1);
    assert!(states.iter().all(|s| *s == CacheState::Degraded));
}

/// Test that lazy first use from many threads also opens once.
#[test]
#[serial]
fn test_concurrent_first_use_opens_once() {
    let dir = tempdir().unwrap();
    let before = open_calls();
    let cache = Arc::new(SafeCache::with_loader(temp_config(dir.path()), Arc::new(counting_api())));

    let saved = race(&cache, |cache, i| cache.save_result(&record(&format!("k{}", i), "text")));

    assert_eq!(open_calls() - before, 1);
    assert!(saved.into_iter().all(|ok| ok));
    assert_eq!(cache.load_all().len(), THREADS);
}

/// Test that concurrent readers and writers see consistent data.
#[test]
fn test_concurrent_reads_and_writes() {
    let dir = tempdir().unwrap();
    let cache = Arc::new(SafeCache::open(temp_config(dir.path())));

    race(&cache, |cache, i| {
        for j in 0..10 {
            let fingerprint = format!("{}-{}", i, j);
            assert!(cache.save_result(&record(&fingerprint, "text")));
            assert!(cache.has_cache(&CacheKey::new("tesseract", fingerprint)));
            assert!(!cache.load_all().is_empty());
        }
    });

    assert_eq!(cache.stats().unwrap().results, (THREADS * 10) as u64);
}

/// Test that closing while other threads operate never panics or reopens.
#[test]
fn test_close_during_use() {
    let dir = tempdir().unwrap();
    let cache = Arc::new(SafeCache::open(temp_config(dir.path())));

    race(&cache, |cache, i| {
        for j in 0..20 {
            if i == 0 && j == 5 {
                cache.close();
            }
            cache.save_result(&record(&format!("{}-{}", i, j), "text"));
            cache.load_all();
        }
    });

    assert_eq!(cache.state(), CacheState::Closed);
    assert!(cache.load_all().is_empty());
}
