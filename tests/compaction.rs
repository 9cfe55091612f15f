//! Compaction tests: on-demand rewrites and the scheduled worker.

use jotdb::{Compactor, Store, StoreConfig, Watchable, WatchOptions, WriteBatch};
use serde_json::json;
use std::fs;
use crossbeam_channel::bounded;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn test_store(dir: &TempDir, name: &str) -> Store {
    Store::open(StoreConfig::new(dir.path().join(name)).sync_writes(false)).unwrap()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn line_count(store: &Store) -> usize {
    fs::read_to_string(store.path()).unwrap().lines().count()
}

#[test]
fn test_compaction_preserves_snapshot() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir, "users.db");

    store.set("ada", json!({"age": 36})).unwrap();
    store.set("ada", json!({"age": 37})).unwrap();
    store.set("bob", json!({"age": 20})).unwrap();
    store.remove("bob").unwrap();
    store.set("eve", json!(null)).unwrap();

    let before = store.read().unwrap();
    let report = Compactor::clean_up(&store).unwrap();

    assert_eq!(report.live_keys, 2);
    assert!(report.bytes_reclaimed() > 0);
    assert_eq!(line_count(&store), 2);
    assert_eq!(store.read().unwrap(), before);

    // The file alone reproduces the snapshot.
    store.close().unwrap();
    store.initialize().unwrap();
    assert_eq!(store.read().unwrap(), before);
}

#[test]
fn test_compaction_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir, "t.db");
    for i in 0..10 {
        store.set("k", json!(i)).unwrap();
    }

    Compactor::clean_up(&store).unwrap();
    let once = fs::read_to_string(store.path()).unwrap();
    let report = Compactor::clean_up(&store).unwrap();
    let twice = fs::read_to_string(store.path()).unwrap();

    assert_eq!(once, twice);
    assert_eq!(report.bytes_reclaimed(), 0);
}

#[test]
fn test_compaction_of_empty_store() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir, "empty.db");

    let report = Compactor::clean_up(&store).unwrap();
    assert_eq!(report.live_keys, 0);
    assert_eq!(fs::read_to_string(store.path()).unwrap(), "");
}

#[test]
fn test_appends_after_compaction_land_in_new_file() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir, "t.db");
    store.set("a", json!(1)).unwrap();
    store.set("a", json!(2)).unwrap();

    Compactor::clean_up(&store).unwrap();
    store
        .write_batch(WriteBatch::new().set("b", json!(3)).remove("a"))
        .unwrap();

    assert_eq!(
        fs::read_to_string(store.path()).unwrap(),
        "a:2\nb:3\na:undefined\n"
    );
    assert!(!dir.path().join("t.db.compact").exists());
}

#[test]
fn test_concurrent_writes_during_compaction() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir, "busy.db");

    let writers: Vec<_> = (0..4)
        .map(|t| {
            let store = store.clone();
            thread::spawn(move || {
                for i in 0..50 {
                    store.set(&format!("w{}", t), json!(i)).unwrap();
                }
            })
        })
        .collect();

    for _ in 0..10 {
        Compactor::clean_up(&store).unwrap();
    }
    for writer in writers {
        writer.join().unwrap();
    }

    let snapshot = store.read().unwrap();
    for t in 0..4 {
        assert_eq!(snapshot[&format!("w{}", t)], json!(49));
    }

    store.close().unwrap();
    store.initialize().unwrap();
    assert_eq!(store.read().unwrap(), snapshot);
}

#[test]
fn test_clean_all_compacts_every_store() {
    let dir = TempDir::new().unwrap();
    let a = test_store(&dir, "a.db");
    let b = test_store(&dir, "b.db");
    for store in [&a, &b] {
        store.set("k", json!(1)).unwrap();
        store.set("k", json!(2)).unwrap();
    }

    let compactor = Compactor::with_stores("0 0 0 * * *", &[a.clone(), b.clone()]).unwrap();
    compactor.clean_all().unwrap();

    assert_eq!(line_count(&a), 1);
    assert_eq!(line_count(&b), 1);
    compactor.kill();
}

#[test]
fn test_scheduled_compaction_runs() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir, "scheduled.db");
    store.set("k", json!(1)).unwrap();
    store.set("k", json!(2)).unwrap();
    store.set("k", json!(3)).unwrap();

    let compactor = Compactor::with_stores("* * * * * *", &[store.clone()]).unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&runs);
    compactor.watch(
        move |_, _, _| {
            sink.fetch_add(1, Ordering::SeqCst);
        },
        WatchOptions::new(),
    );

    thread::sleep(Duration::from_millis(2500));
    compactor.kill();

    assert!(runs.load(Ordering::SeqCst) >= 1);
    assert_eq!(fs::read_to_string(store.path()).unwrap(), "k:3\n");

    // No runs after kill.
    let after_kill = runs.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(1200));
    assert_eq!(runs.load(Ordering::SeqCst), after_kill);
}

#[test]
fn test_store_owned_compactor() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(
        StoreConfig::new(dir.path().join("owned.db"))
            .with_compaction_schedule("0 0 0 * * *")
            .sync_writes(false),
    )
    .unwrap();

    let compactor = store.compactor().unwrap();
    assert!(compactor.is_scheduled());
    assert_eq!(compactor.databases().len(), 1);

    store.close().unwrap();
    assert!(!compactor.is_scheduled());

    // Reopening restarts the same compactor rather than adding another.
    store.initialize().unwrap();
    assert!(compactor.is_scheduled());
    assert_eq!(compactor.expression(), "0 0 0 * * *");
    store.close().unwrap();
}

#[test]
fn test_kill_from_watcher() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir, "t.db");
    let compactor = Compactor::with_stores("* * * * * *", &[store.clone()]).unwrap();

    let runs = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&runs);
    compactor.watch(
        move |_, ctx, _| {
            sink.fetch_add(1, Ordering::SeqCst);
            ctx.compactor.kill();
        },
        WatchOptions::new(),
    );

    thread::sleep(Duration::from_millis(2500));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(!compactor.is_scheduled());
}

#[test]
fn test_kill_waits_for_in_flight_run() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir, "slow.db");
    store.set("k", json!(1)).unwrap();
    store.set("k", json!(2)).unwrap();

    let compactor = Compactor::with_stores("* * * * * *", &[store.clone()]).unwrap();
    let (started_tx, started) = bounded::<()>(1);
    let finished = Arc::new(AtomicBool::new(false));
    let done = Arc::clone(&finished);

    // Runs on the worker before it compacts the store.
    compactor.watch_next(
        move |_, _, _| {
            let _ = started_tx.send(());
            thread::sleep(Duration::from_millis(500));
            done.store(true, Ordering::SeqCst);
        },
        1,
        WatchOptions::new(),
    );

    started.recv_timeout(Duration::from_secs(3)).unwrap();
    let killed_at = Instant::now();
    compactor.kill();

    assert!(killed_at.elapsed() >= Duration::from_millis(300));
    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(fs::read_to_string(store.path()).unwrap(), "k:2\n");
    assert!(!compactor.is_scheduled());
}

#[test]
fn test_failed_compaction_keeps_store_writable() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir, "t.db");
    store.set("a", json!(1)).unwrap();
    store.set("a", json!(2)).unwrap();

    // Block the scratch file so the rewrite fails.
    fs::create_dir(dir.path().join("t.db.compact")).unwrap();
    assert!(Compactor::clean_up(&store).is_err());

    store.set("b", json!(3)).unwrap();
    assert_eq!(
        fs::read_to_string(store.path()).unwrap(),
        "a:1\na:2\nb:3\n"
    );

    fs::remove_dir(dir.path().join("t.db.compact")).unwrap();
    Compactor::clean_up(&store).unwrap();
    store.set("c", json!(4)).unwrap();

    let snapshot = store.read().unwrap();
    store.close().unwrap();
    store.initialize().unwrap();
    assert_eq!(store.read().unwrap(), snapshot);
    assert_eq!(snapshot.len(), 3);
}
