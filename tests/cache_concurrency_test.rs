//! Concurrency tests for the cache's reader/writer arbitration, run under
//! real threads rather than single-threaded unit tests. Mirrors the
//! donor's `tests/stress_test.rs` intent (hammer the shared state from
//! multiple threads) but scoped to this crate's read-gate/debounced-save
//! protocol instead of the donor's SQLite connection pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hmcache::cache::{Cache, LoadOptions};
use hmcache::config::VectorLoadMode;
use tempfile::tempdir;

fn opts() -> LoadOptions {
    LoadOptions {
        workspace: "ws".to_string(),
        embedding_model: "test".to_string(),
        embedding_dimension: 4,
        vector_load_mode: VectorLoadMode::Memory,
        save_debounce_ms: 20,
        reader_wait_timeout_ms: 1_000,
        force_save_with_active_readers: false,
    }
}

#[test]
fn concurrent_readers_and_writer_never_panic() {
    let dir = tempdir().unwrap();
    let (cache, _) = Cache::load(dir.path(), opts()).unwrap();

    for i in 0..20 {
        cache.add_to_store(format!("f{i}.rs"), 1, 2, "fn x() {}", vec![0.0; 4]);
    }
    cache.save_now().unwrap();

    let read_failures = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();

    for _ in 0..8 {
        let cache = cache.clone();
        let read_failures = Arc::clone(&read_failures);
        handles.push(thread::spawn(move || {
            for _ in 0..50 {
                match cache.start_read() {
                    Ok(()) => {
                        let _ = cache.len();
                        thread::sleep(Duration::from_micros(50));
                        cache.end_read();
                    }
                    Err(_) => {
                        read_failures.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }));
    }

    let writer_cache = cache.clone();
    handles.push(thread::spawn(move || {
        for i in 0..10 {
            writer_cache.add_to_store(format!("g{i}.rs"), 1, 2, "fn y() {}", vec![1.0; 4]);
            writer_cache.save(true).unwrap();
        }
    }));

    for h in handles {
        h.join().unwrap();
    }

    // Any reads that raced a save were cleanly rejected (SaveInProgress),
    // never corrupted state or panicked.
    assert!(cache.len() >= 20);
}

#[test]
fn save_with_no_mutations_is_a_no_op() {
    let dir = tempdir().unwrap();
    let (cache, _) = Cache::load(dir.path(), opts()).unwrap();
    cache.save(true).unwrap();
    assert_eq!(cache.len(), 0);
}
