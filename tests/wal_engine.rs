//! End-to-end engine tests through the public journal API.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;

use walrelay::config::{WalConfig, WalMode};
use walrelay::core::{Row, RowType, VClock};
use walrelay::wal::{self, WalCallbacks, WalError};

fn config(dir: &Path, mode: WalMode) -> WalConfig {
    let mut cfg = WalConfig::default();
    cfg.wal_dir = dir.to_path_buf();
    cfg.wal_mode = mode;
    cfg
}

fn dml_row() -> Row {
    Row::new_dml(RowType::Replace, Bytes::from_static(b"value"))
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    check()
}

#[test]
fn writes_assign_signatures_and_survive_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = config(tmp.path(), WalMode::Write);
    let wal = wal::start(&cfg, 1, VClock::new(), WalCallbacks::default()).unwrap();
    assert_eq!(wal.write(vec![dml_row()]).unwrap(), 1);
    assert_eq!(wal.write(vec![dml_row(), dml_row()]).unwrap(), 3);
    let committed = wal.sync().unwrap();
    assert_eq!(committed.get(1), 3);
    assert_eq!(wal.tx_vclock().get(1), 3);
    wal.shutdown().unwrap();

    // restart from the recovered clock; the sealed tail is reopened
    let wal = wal::start(&cfg, 1, committed, WalCallbacks::default()).unwrap();
    assert_eq!(wal.write(vec![dml_row()]).unwrap(), 4);
    wal.shutdown().unwrap();
}

#[test]
fn mode_none_advances_the_clock_without_disk() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = config(tmp.path(), WalMode::None);
    let wal = wal::start(&cfg, 1, VClock::new(), WalCallbacks::default()).unwrap();
    assert_eq!(wal.write(vec![dml_row()]).unwrap(), 1);
    assert_eq!(wal.write(vec![dml_row()]).unwrap(), 2);
    assert_eq!(wal.sync().unwrap().get(1), 2);
    assert_eq!(wal.tx_vclock().get(1), 2);
    let checkpoint = wal.begin_checkpoint().unwrap();
    assert_eq!(checkpoint.vclock.get(1), 2);
    assert_eq!(checkpoint.wal_size, 0);
    wal.shutdown().unwrap();
    assert!(std::fs::read_dir(tmp.path()).unwrap().next().is_none());
}

#[test]
fn failed_write_cascades_then_reopens() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = config(tmp.path(), WalMode::Write);
    let wal = wal::start(&cfg, 1, VClock::new(), WalCallbacks::default()).unwrap();
    assert_eq!(wal.write(vec![dml_row()]).unwrap(), 1);

    // a foreign row that does not advance its component aborts the batch
    let mut poisoned = dml_row();
    poisoned.replica_id = 1;
    poisoned.lsn = 1;
    assert!(matches!(
        wal.write(vec![poisoned]),
        Err(WalError::WriteFailed)
    ));

    // the rollback drains asynchronously, then writes flow again with
    // the clock unchanged by the failed batch
    let mut last = Err(WalError::Shutdown);
    assert!(wait_until(Duration::from_secs(5), || {
        last = wal.write(vec![dml_row()]);
        !matches!(last, Err(WalError::RollbackInProgress))
    }));
    assert_eq!(*last.as_ref().unwrap(), 2);
    wal.shutdown().unwrap();
}

#[test]
fn empty_entries_are_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = config(tmp.path(), WalMode::Write);
    let wal = wal::start(&cfg, 1, VClock::new(), WalCallbacks::default()).unwrap();
    assert!(matches!(wal.write(Vec::new()), Err(WalError::EmptyEntry)));
    wal.shutdown().unwrap();
}

#[test]
fn checkpoint_threshold_callback_fires() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = config(tmp.path(), WalMode::Write);
    let hits = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&hits);
    let callbacks = WalCallbacks {
        on_checkpoint_threshold: Box::new(move || {
            sink.fetch_add(1, Ordering::SeqCst);
        }),
        ..WalCallbacks::default()
    };
    let wal = wal::start(&cfg, 1, VClock::new(), callbacks).unwrap();
    wal.set_checkpoint_threshold(1).unwrap();
    wal.write(vec![dml_row()]).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        hits.load(Ordering::SeqCst) == 1
    }));

    // the trigger latches until the next checkpoint completes
    wal.write(vec![dml_row()]).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let checkpoint = wal.begin_checkpoint().unwrap();
    wal.commit_checkpoint(checkpoint).unwrap();
    wal.write(vec![dml_row()]).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        hits.load(Ordering::SeqCst) == 2
    }));
    wal.shutdown().unwrap();
}

#[test]
fn gc_permission_collects_old_segments() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = config(tmp.path(), WalMode::Write);
    cfg.wal_max_size = 0; // every batch rotates
    let collected: Arc<std::sync::Mutex<Vec<VClock>>> =
        Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&collected);
    let callbacks = WalCallbacks {
        on_garbage_collection: Box::new(move |v| {
            sink.lock().unwrap().push(v.clone());
        }),
        ..WalCallbacks::default()
    };
    let wal = wal::start(&cfg, 1, VClock::new(), callbacks).unwrap();
    for _ in 0..3 {
        wal.write(vec![dml_row()]).unwrap();
    }
    let committed = wal.sync().unwrap();
    wal.set_gc_first_vclock(committed).unwrap();

    // the oldest retained clock reported to tx reaches the permission
    assert!(wait_until(Duration::from_secs(5), || {
        collected
            .lock()
            .unwrap()
            .last()
            .is_some_and(|v| v.get(1) == 2)
    }));
    wal.shutdown().unwrap();
}
