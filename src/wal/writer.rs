//! The WAL writer: turns journal entries into a totally ordered, durably
//! stored row sequence and publishes that order through the writer
//! vector clock.
//!
//! Two service threads are spawned by [`start`]. The `wal` thread owns
//! every segment file, the memory ring and the garbage collection state.
//! The `tx` thread runs commit scheduling, the rollback protocol and the
//! engine callbacks. Client threads talk to both exclusively through the
//! handle, which routes bus envelopes; the only shared mutable state is
//! the ring (read through cursors) and the tx-side vclock mirror.

use std::any::Any;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, bounded};
use uuid::Uuid;

use crate::bus::{Bus, Endpoint, Envelope, Handler, Hop, Pipe};
use crate::config::{WalConfig, WalMode};
use crate::core::vclock::order_crossed;
use crate::core::{ClockError, ClockOrder, INSTANCE_ID_NIL, InstanceId, Row, VClock};
use crate::core::wall_clock_seconds;
use crate::journal::{JOURNAL_ENTRY_ERR, JournalEntry};

use super::dir::SegmentDirectory;
use super::ring::{RingLimits, XrowRing};
use super::segment::{SegmentError, SegmentHeader, SegmentWriter, rename_corrupted};
use super::watcher::{WalEvents, WatcherId, WatcherNotice, WatcherRegistry};
use super::{WalError, WalResult};

/// Disk space preallocated ahead of the write position. Large enough to
/// amortize the syscall, small enough not to stall the write path.
pub const WAL_FALLOCATE_LEN: u64 = 1024 * 1024;

const TX_TICK: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------
// Public API types
// ---------------------------------------------------------------------

/// Checkpoint descriptor exchanged with the transaction engine.
#[derive(Debug, Clone)]
pub struct WalCheckpoint {
    pub vclock: VClock,
    /// WAL bytes written since the previous checkpoint, observed at
    /// `begin_checkpoint` time.
    pub wal_size: i64,
}

/// Callbacks into the transaction engine, invoked on the tx thread.
pub struct WalCallbacks {
    /// ENOSPC or GC removed segments; the argument is the new oldest
    /// retained vclock. Consumers needing older rows must be evicted.
    pub on_garbage_collection: Box<dyn Fn(&VClock) + Send + Sync>,
    /// The checkpoint threshold was exceeded; time to checkpoint.
    pub on_checkpoint_threshold: Box<dyn Fn() + Send + Sync>,
}

impl Default for WalCallbacks {
    fn default() -> Self {
        Self {
            on_garbage_collection: Box::new(|_| {}),
            on_checkpoint_threshold: Box::new(|| {}),
        }
    }
}

// ---------------------------------------------------------------------
// Bus payloads
// ---------------------------------------------------------------------

/// A batch of journal entries travelling tx -> wal -> tx. The handle
/// appends entries while the batch is still open in the staging slot;
/// the WAL thread closes it on receipt.
pub(crate) struct WalBatch {
    open: bool,
    approx_len: usize,
    commit: Vec<JournalEntry>,
    rollback: Vec<JournalEntry>,
    /// Writer vclock after the batch was processed.
    vclock: VClock,
}

impl WalBatch {
    fn new(entry: JournalEntry) -> Self {
        Self {
            open: true,
            approx_len: entry.approx_len,
            commit: vec![entry],
            rollback: Vec::new(),
            vclock: VClock::new(),
        }
    }
}

pub(crate) type BatchRef = Arc<Mutex<WalBatch>>;

struct SyncMsg {
    check_rollback: bool,
    respond: Sender<WalResult<VClock>>,
}

struct BeginCheckpointMsg {
    respond: Sender<WalResult<WalCheckpoint>>,
}

struct CommitCheckpointMsg {
    checkpoint: WalCheckpoint,
    respond: Sender<()>,
}

struct SetThresholdMsg {
    threshold: i64,
    respond: Sender<()>,
}

struct SetGcFirstMsg {
    vclock: VClock,
    respond: Sender<()>,
}

/// Async consumer (relay) progress feed into the matrix clock.
struct ConsumerUpdateMsg {
    replica_id: InstanceId,
    vclock: VClock,
}

struct ConsumerDeleteMsg {
    replica_id: InstanceId,
}

struct AttachWatcherMsg {
    target: Pipe,
    perform: Handler,
    respond: Sender<WatcherId>,
}

struct DetachWatcherMsg {
    id: WatcherId,
    respond: Sender<()>,
}

struct RegisterExitHookMsg {
    id: u64,
    hook: Box<dyn FnOnce() + Send>,
}

struct UnregisterExitHookMsg {
    id: u64,
}

struct ShutdownMsg {
    respond: Sender<()>,
}

struct GcNotifyMsg {
    vclock: VClock,
}

struct CheckpointNotifyMsg;

struct RollbackMsg;

struct TxStopMsg;

// ---------------------------------------------------------------------
// TX side
// ---------------------------------------------------------------------

/// The write-path valve. Non-empty queue or a closed flag rejects new
/// writes until the rollback protocol reopens it.
#[derive(Default)]
struct ValveState {
    queue: Vec<JournalEntry>,
    closed: bool,
}

#[derive(Default)]
pub(crate) struct RollbackValve {
    inner: Mutex<ValveState>,
}

impl RollbackValve {
    fn is_shut(&self) -> bool {
        let state = self.inner.lock().expect("rollback valve lock poisoned");
        state.closed || !state.queue.is_empty()
    }
}

/// Context of the tx endpoint thread.
pub(crate) struct TxWorld {
    pub(crate) wal_pipe: Pipe,
    valve: Arc<RollbackValve>,
    tx_vclock: Arc<RwLock<VClock>>,
    callbacks: WalCallbacks,
    /// True between step 1 and step 3 of the rollback protocol: doomed
    /// entries arriving now will be collected by the scheduled pass.
    rollback_active: bool,
    stop: bool,
}

impl TxWorld {
    fn run(mut self, endpoint: Endpoint) {
        while !self.stop {
            let world: &mut TxWorld = &mut self;
            endpoint.process_for(world, TX_TICK);
        }
        // drain what is left so no completion is lost
        let world: &mut TxWorld = &mut self;
        endpoint.process(world);
    }
}

/// Complete a finished batch: entries that were rolled into the batch's
/// rollback list shut the valve; committed entries complete in FIFO
/// order after the vclock mirror is advanced.
fn tx_schedule_commit(cx: &mut dyn Any, env: &mut Envelope) {
    let tx = cx.downcast_mut::<TxWorld>().expect("tx context");
    let batch = env.payload_mut::<BatchRef>();
    let (commit, rollback, vclock) = {
        let mut b = batch.lock().expect("wal batch lock poisoned");
        (
            std::mem::take(&mut b.commit),
            std::mem::take(&mut b.rollback),
            b.vclock.clone(),
        )
    };
    if !rollback.is_empty() {
        if tx.rollback_active {
            // closes the input valve until the scheduled pass drains it
            let mut valve = tx.valve.inner.lock().expect("rollback valve lock poisoned");
            valve.queue.extend(rollback);
        } else {
            // the pass already ran; these were short-circuited on the wal
            // thread after step 3 and nothing will collect them later
            for entry in rollback.into_iter().rev() {
                entry.complete();
            }
        }
    }
    *tx.tx_vclock.write().expect("tx vclock lock poisoned") = vclock;
    for entry in commit {
        entry.complete();
    }
}

/// Step 1 of the rollback protocol, on tx: nothing to do besides
/// flushing the pipe by travelling through it, but the arrival marks the
/// window in which doomed entries must queue instead of completing.
fn tx_rollback_begin(cx: &mut dyn Any, _env: &mut Envelope) {
    cx.downcast_mut::<TxWorld>()
        .expect("tx context")
        .rollback_active = true;
}

/// Step 3 of the rollback protocol: cascading abort in reverse order,
/// then hand the terminal step to the WAL thread *before* reopening the
/// valve, so pipe FIFO keeps any new batch behind it.
fn tx_schedule_rollback(cx: &mut dyn Any, env: &mut Envelope) {
    let tx = cx.downcast_mut::<TxWorld>().expect("tx context");
    tx.rollback_active = false;
    let mut entries = {
        let mut valve = tx.valve.inner.lock().expect("rollback valve lock poisoned");
        valve.closed = true;
        std::mem::take(&mut valve.queue)
    };
    entries.reverse();
    for mut entry in entries {
        entry.set_res(JOURNAL_ENTRY_ERR);
        entry.complete();
    }
    let rest = env.detach();
    if tx.wal_pipe.push(rest).is_err() {
        tracing::warn!("wal endpoint gone before rollback completion");
    }
    let mut valve = tx.valve.inner.lock().expect("rollback valve lock poisoned");
    valve.closed = false;
}

fn tx_notify_gc(cx: &mut dyn Any, env: &mut Envelope) {
    let tx = cx.downcast_mut::<TxWorld>().expect("tx context");
    let vclock = env.payload_mut::<GcNotifyMsg>().vclock.clone();
    (tx.callbacks.on_garbage_collection)(&vclock);
}

fn tx_notify_checkpoint(cx: &mut dyn Any, env: &mut Envelope) {
    let _ = env.payload_mut::<CheckpointNotifyMsg>();
    let tx = cx.downcast_mut::<TxWorld>().expect("tx context");
    (tx.callbacks.on_checkpoint_threshold)();
}

/// No-op hop used to flush a pipe: the envelope simply travels behind
/// everything already queued.
fn clear_bus(_cx: &mut dyn Any, _env: &mut Envelope) {}

fn tx_stop(cx: &mut dyn Any, _env: &mut Envelope) {
    cx.downcast_mut::<TxWorld>().expect("tx context").stop = true;
}

// ---------------------------------------------------------------------
// WAL side
// ---------------------------------------------------------------------

/// Assign LSNs to the local rows of one entry and track every change in
/// `diff`. Foreign rows only follow; a non-positive delta is a
/// programmer error that aborts the batch.
fn assign_lsn(
    diff: &mut VClock,
    base: &VClock,
    instance_id: InstanceId,
    rows: &mut [Row],
) -> Result<(), ClockError> {
    let now = wall_clock_seconds();
    let last = rows.len().saturating_sub(1);
    let mut tsn = 0i64;
    for (i, row) in rows.iter_mut().enumerate() {
        row.timestamp = now;
        if row.replica_id == INSTANCE_ID_NIL {
            row.lsn = diff.inc(instance_id) + base.get(instance_id);
            row.replica_id = instance_id;
            if tsn == 0 {
                tsn = row.lsn;
            }
            row.tsn = tsn;
            row.is_commit = i == last;
        } else {
            diff.follow(row.replica_id, row.lsn - base.get(row.replica_id))?;
        }
    }
    Ok(())
}

/// Context of the wal endpoint thread.
pub(crate) struct WalWriter {
    mode: WalMode,
    wal_max_size: u64,
    instance_id: InstanceId,
    instance_uuid: Uuid,
    replicaset_uuid: Uuid,

    dir: SegmentDirectory,
    current: Option<SegmentWriter>,
    vclock: VClock,
    checkpoint_vclock: VClock,
    checkpoint_wal_size: i64,
    checkpoint_threshold: i64,
    checkpoint_triggered: bool,
    in_rollback: bool,

    ring: XrowRing,
    mclock: crate::core::MClock,
    /// Cached "second" directory vclock: the earliest point still
    /// possibly required once the first segment is collected.
    gc_wal_vclock: Option<VClock>,
    /// Collection permission frontier from tx; ENOSPC may overrun it.
    gc_first_vclock: VClock,
    gc_pending: bool,

    watchers: WatcherRegistry,
    exit_hooks: HashMap<u64, Box<dyn FnOnce() + Send>>,

    wal_pipe: Pipe,
    tx_prio_pipe: Pipe,
    stop: Option<Sender<()>>,

    #[cfg(test)]
    fallocate_failures: std::cell::Cell<u32>,
}

impl WalWriter {
    pub(crate) fn new(
        config: &WalConfig,
        instance_id: InstanceId,
        ring: XrowRing,
        wal_pipe: Pipe,
        tx_prio_pipe: Pipe,
    ) -> Self {
        let watchers = WatcherRegistry::new(wal_watcher_complete, wal_pipe.clone());
        Self {
            mode: config.wal_mode,
            wal_max_size: config.wal_max_size,
            instance_id,
            instance_uuid: config.instance_uuid,
            replicaset_uuid: config.replicaset_uuid,
            dir: SegmentDirectory::new(&config.wal_dir),
            current: None,
            vclock: VClock::new(),
            checkpoint_vclock: VClock::new(),
            checkpoint_wal_size: 0,
            checkpoint_threshold: i64::MAX,
            checkpoint_triggered: false,
            in_rollback: false,
            ring,
            mclock: crate::core::MClock::new(),
            gc_wal_vclock: None,
            gc_first_vclock: VClock::new(),
            gc_pending: false,
            watchers,
            exit_hooks: HashMap::new(),
            wal_pipe,
            tx_prio_pipe,
            stop: None,
            #[cfg(test)]
            fallocate_failures: std::cell::Cell::new(0),
        }
    }

    /// Startup: index existing segments and re-open the most recent one
    /// for appending. A corrupted tail is renamed aside; the writer then
    /// creates a fresh segment on the first write.
    pub(crate) fn enable(&mut self, start_vclock: VClock) -> WalResult<()> {
        self.vclock = start_vclock;
        self.ring.set_origin(self.vclock.clone());
        std::fs::create_dir_all(self.dir.dirname()).map_err(|source| {
            WalError::Segment(SegmentError::Io {
                path: Some(self.dir.dirname().to_path_buf()),
                source,
            })
        })?;
        self.dir.scan()?;
        self.gc_wal_vclock = self.second_vclock();

        let path = self.dir.path_for(self.vclock.sum());
        if path.exists() {
            match SegmentWriter::open_for_append(&path, self.mode == WalMode::Fsync) {
                Ok(seg) => self.current = Some(seg),
                Err(err) if err.is_corruption() => {
                    tracing::warn!(path = %path.display(), "renaming corrupted segment: {err}");
                    rename_corrupted(&path)?;
                    self.dir.forget(self.vclock.sum());
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn run(&mut self, endpoint: &Endpoint) {
        while self.stop.is_none() {
            endpoint.process_for(self, Duration::from_millis(100));
            if self.gc_pending {
                self.gc_pending = false;
                self.collect_garbage();
            }
        }
        self.shutdown();
    }

    /// Shutdown: force-cancel relays, then leave behind a fresh empty
    /// segment named by the final vclock so restart need not rescan the
    /// old tail.
    fn shutdown(&mut self) {
        for (_, hook) in self.exit_hooks.drain() {
            hook();
        }
        if self.mode != WalMode::None {
            let create_fresh = match &self.current {
                None => true,
                Some(cur) => self.vclock.compare(cur.start_vclock()) == ClockOrder::Greater,
            };
            if create_fresh {
                let header = SegmentHeader::new(
                    self.instance_uuid,
                    self.replicaset_uuid,
                    self.vclock.clone(),
                );
                match SegmentWriter::create(self.dir.dirname(), &header, false) {
                    Ok(seg) => {
                        self.dir.add(self.vclock.clone());
                        seg.close();
                    }
                    Err(err) => tracing::warn!("failed to seal wal on shutdown: {err}"),
                }
            }
            if let Some(cur) = self.current.take() {
                cur.close();
            }
        }
        if let Some(respond) = self.stop.take() {
            let _ = respond.send(());
        }
    }

    /// The directory's second starting vclock; when only one segment
    /// exists and rows were written past its start, the live writer
    /// clock takes that role.
    fn second_vclock(&self) -> Option<VClock> {
        let (first_sig, _) = self.dir.first()?;
        if let Some((_, second)) = self.dir.next_after(first_sig) {
            Some(second.clone())
        } else if first_sig != self.vclock.sum() {
            Some(self.vclock.clone())
        } else {
            None
        }
    }

    fn current_signature(&self) -> Option<i64> {
        self.current.as_ref().map(|c| c.start_vclock().sum())
    }

    /// Close a full segment and open the successor named by the current
    /// writer vclock. Closing happens first so tailing readers see EOF
    /// in the old file before the new one appears.
    fn opt_rotate(&mut self) -> WalResult<()> {
        let full = self
            .current
            .as_ref()
            .is_some_and(|cur| cur.offset() >= self.wal_max_size);
        if full {
            let cur = self.current.take().expect("current segment is open");
            cur.close();
        }
        if self.current.is_some() {
            return Ok(());
        }

        let header = SegmentHeader::new(
            self.instance_uuid,
            self.replicaset_uuid,
            self.vclock.clone(),
        );
        let created = match SegmentWriter::create(
            self.dir.dirname(),
            &header,
            self.mode == WalMode::Fsync,
        ) {
            Ok(seg) => seg,
            Err(SegmentError::Io { source, .. })
                if source.kind() == std::io::ErrorKind::AlreadyExists =>
            {
                // a rolled-back batch left an empty segment at this clock
                let path = self.dir.path_for(self.vclock.sum());
                SegmentWriter::open_for_append(&path, self.mode == WalMode::Fsync)
                    .map_err(WalError::Segment)?
            }
            Err(err) => {
                tracing::error!("failed to create wal segment: {err}");
                return Err(err.into());
            }
        };
        self.dir.add(self.vclock.clone());
        self.current = Some(created);
        if self.gc_wal_vclock.is_none() {
            self.gc_wal_vclock = self.second_vclock();
        }
        self.watchers.notify_all(WalEvents::ROTATE);
        Ok(())
    }

    fn reserve_current(&mut self, need: u64) -> Result<(), SegmentError> {
        #[cfg(test)]
        if self.fallocate_failures.get() > 0 {
            self.fallocate_failures.set(self.fallocate_failures.get() - 1);
            return Err(SegmentError::Io {
                path: None,
                source: std::io::Error::from(std::io::ErrorKind::StorageFull),
            });
        }
        self.current
            .as_mut()
            .expect("current segment is open")
            .reserve(need)
    }

    /// Make sure there is room for the batch. On ENOSPC, delete old
    /// segments not needed for recovery, one at a time, oldest first,
    /// and retry; this may overrun `gc_first_vclock` but never the
    /// checkpoint clock.
    fn fallocate(&mut self, approx_len: usize) -> WalResult<()> {
        // encoded rows can outgrow the estimate; double it
        let need = (approx_len as u64 * 2).max(WAL_FALLOCATE_LEN);
        let gc_signature = self.checkpoint_vclock.sum();
        let mut warned = false;
        let mut notify = false;
        let result = loop {
            match self.reserve_current(need) {
                Ok(()) => break Ok(()),
                Err(SegmentError::Io { source, .. })
                    if source.kind() == std::io::ErrorKind::StorageFull =>
                {
                    if !self.dir.has_garbage(gc_signature, self.current_signature()) {
                        break Err(WalError::NoSpace);
                    }
                    if !warned {
                        tracing::error!("ran out of disk space, deleting old wal segments");
                        warned = true;
                    }
                    self.dir
                        .remove_oldest_one(gc_signature, self.current_signature());
                    self.gc_wal_vclock = self.second_vclock();
                    if let Some(gcv) = &self.gc_wal_vclock
                        && self.gc_first_vclock.compare(gcv) == ClockOrder::Less
                    {
                        self.gc_first_vclock = gcv.clone();
                    }
                    notify = true;
                }
                Err(err) => {
                    tracing::error!("wal preallocation failed: {err}");
                    break Err(err.into());
                }
            }
        };
        if notify {
            // tell tx which consumers just lost their segments
            self.gc_advance_notify();
        }
        result
    }

    fn gc_advance_notify(&mut self) {
        let vclock = self
            .dir
            .first()
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| self.vclock.clone());
        let env = Envelope::new(
            GcNotifyMsg { vclock },
            vec![Hop {
                perform: tx_notify_gc,
                next: None,
            }],
        );
        if self.tx_prio_pipe.push(env).is_err() {
            tracing::warn!("tx endpoint gone, dropping gc notification");
        }
    }

    /// Start the cascading rollback protocol: an empty message walks
    /// tx -> wal -> tx -> wal, flushing both pipes, scheduling the abort
    /// on tx and finally re-opening this writer.
    fn begin_rollback(&mut self) {
        self.in_rollback = true;
        let env = Envelope::new(
            RollbackMsg,
            vec![
                Hop {
                    perform: tx_rollback_begin,
                    next: Some(self.wal_pipe.clone()),
                },
                Hop {
                    perform: clear_bus,
                    next: Some(self.tx_prio_pipe.clone()),
                },
                Hop {
                    // detaches and forwards itself ahead of the valve
                    // reopening; see tx_schedule_rollback
                    perform: tx_schedule_rollback,
                    next: None,
                },
                Hop {
                    perform: wal_end_rollback,
                    next: None,
                },
            ],
        );
        if self.tx_prio_pipe.push(env).is_err() {
            tracing::warn!("tx endpoint gone, rollback protocol aborted");
        }
    }

    /// Process one batch: rotate, preallocate, then drain entries into
    /// the current segment under a ring transaction. The vclock diff
    /// merges only after a successful flush.
    fn process_batch(&mut self, batch: &BatchRef) {
        let (mut input, approx_len) = {
            let mut b = batch.lock().expect("wal batch lock poisoned");
            b.open = false;
            (std::mem::take(&mut b.commit), b.approx_len)
        };

        if self.in_rollback {
            // the whole batch joins the rollback queue on arrival
            let mut b = batch.lock().expect("wal batch lock poisoned");
            for entry in &mut input {
                entry.set_res(JOURNAL_ENTRY_ERR);
            }
            b.rollback.extend(input);
            b.vclock = self.vclock.clone();
            return;
        }

        if let Err(err) = self.opt_rotate() {
            tracing::error!("wal rotation failed: {err}");
            self.fail_batch(batch, input);
            return;
        }
        if let Err(err) = self.fallocate(approx_len) {
            tracing::error!("wal preallocation failed: {err}");
            self.fail_batch(batch, input);
            return;
        }

        let mut diff = VClock::new();
        let mut output: Vec<JournalEntry> = Vec::with_capacity(input.len());
        let mut written: u64 = 0;
        let mut failed = false;
        let batch_start = self
            .current
            .as_ref()
            .expect("current segment is open")
            .offset();

        self.ring.tx_begin();
        let mut pending = input.into_iter();
        for mut entry in pending.by_ref() {
            if let Err(err) = assign_lsn(&mut diff, &self.vclock, self.instance_id, &mut entry.rows)
            {
                tracing::error!("lsn assignment failed: {err}");
                output.push(entry);
                failed = true;
                break;
            }
            entry.set_res(diff.sum() + self.vclock.sum());
            self.ring.tx_append(&entry.rows);
            let res = self
                .current
                .as_mut()
                .expect("current segment is open")
                .append_tx(&entry.rows);
            output.push(entry);
            match res {
                Ok(n) => written += n,
                Err(err) => {
                    tracing::error!("wal write failed: {err}");
                    failed = true;
                    break;
                }
            }
        }

        if failed {
            self.ring.tx_rollback();
            if let Some(cur) = self.current.as_mut()
                && let Err(err) = cur.truncate_to(batch_start)
            {
                tracing::warn!("failed to truncate partial batch: {err}");
            }
            let mut doomed = output;
            doomed.extend(pending);
            for entry in &mut doomed {
                entry.set_res(JOURNAL_ENTRY_ERR);
            }
            let mut b = batch.lock().expect("wal batch lock poisoned");
            b.rollback = doomed;
            b.vclock = self.vclock.clone();
            drop(b);
            self.begin_rollback();
        } else {
            self.ring.tx_commit();
            self.checkpoint_wal_size += written as i64;
            self.vclock.merge(&diff);
            let mut b = batch.lock().expect("wal batch lock poisoned");
            b.commit = output;
            b.vclock = self.vclock.clone();
        }

        if !self.checkpoint_triggered && self.checkpoint_wal_size > self.checkpoint_threshold {
            let env = Envelope::new(
                CheckpointNotifyMsg,
                vec![Hop {
                    perform: tx_notify_checkpoint,
                    next: None,
                }],
            );
            if self.tx_prio_pipe.push(env).is_ok() {
                self.checkpoint_triggered = true;
            }
        }
        self.watchers.notify_all(WalEvents::WRITE);
    }

    /// Rotation or preallocation failed before anything was written:
    /// the whole batch rolls back.
    fn fail_batch(&mut self, batch: &BatchRef, mut input: Vec<JournalEntry>) {
        for entry in &mut input {
            entry.set_res(JOURNAL_ENTRY_ERR);
        }
        let mut b = batch.lock().expect("wal batch lock poisoned");
        b.rollback = input;
        b.vclock = self.vclock.clone();
        drop(b);
        self.begin_rollback();
    }

    /// One garbage collection pass. The frontier starts at the tx
    /// permission (`gc_first_vclock`) and is clamped down by the slowest
    /// consumer; an incomparable minimum also refuses to advance past it.
    fn collect_garbage(&mut self) {
        let mut collect = self.gc_first_vclock.clone();
        if let Some(min) = self.mclock.min() {
            match collect.compare(min) {
                ClockOrder::Greater | ClockOrder::Incomparable => collect = min.clone(),
                ClockOrder::Less | ClockOrder::Equal => {}
            }
        }
        if self.current.is_none() && collect.sum() >= self.vclock.sum() {
            // every segment is sealed and fully consumed
            self.dir.remove_older_than(i64::MAX);
        } else if let Some((signature, _)) = self.dir.match_vclock(&collect) {
            self.dir.remove_older_than(signature);
        }
        self.gc_wal_vclock = self.second_vclock();
        self.gc_advance_notify();
    }
}

// WAL-side bus handlers

fn wal_write_to_disk(cx: &mut dyn Any, env: &mut Envelope) {
    let writer = cx.downcast_mut::<WalWriter>().expect("wal context");
    let batch = env.payload_mut::<BatchRef>().clone();
    writer.process_batch(&batch);
}

fn wal_sync_f(cx: &mut dyn Any, env: &mut Envelope) {
    let writer = cx.downcast_mut::<WalWriter>().expect("wal context");
    let msg = env.take_payload::<SyncMsg>();
    let result = if msg.check_rollback && writer.in_rollback {
        Err(WalError::RollbackInProgress)
    } else {
        Ok(writer.vclock.clone())
    };
    let _ = msg.respond.send(result);
}

fn wal_begin_checkpoint_f(cx: &mut dyn Any, env: &mut Envelope) {
    let writer = cx.downcast_mut::<WalWriter>().expect("wal context");
    let msg = env.take_payload::<BeginCheckpointMsg>();
    if writer.in_rollback {
        // in-memory state contains changes scheduled for rollback; a
        // checkpoint now would persist them
        let _ = msg.respond.send(Err(WalError::RollbackInProgress));
        return;
    }
    // avoid closing the current segment when it has no rows
    let has_rows = writer
        .current
        .as_ref()
        .is_some_and(|cur| cur.start_vclock().sum() != writer.vclock.sum());
    if has_rows {
        let cur = writer.current.take().expect("current segment is open");
        cur.close();
        if writer.gc_wal_vclock.is_none() {
            writer.gc_wal_vclock = writer.second_vclock();
        }
    }
    let _ = msg.respond.send(Ok(WalCheckpoint {
        vclock: writer.vclock.clone(),
        wal_size: writer.checkpoint_wal_size,
    }));
}

fn wal_commit_checkpoint_f(cx: &mut dyn Any, env: &mut Envelope) {
    let writer = cx.downcast_mut::<WalWriter>().expect("wal context");
    let msg = env.take_payload::<CommitCheckpointMsg>();
    writer.checkpoint_vclock = msg.checkpoint.vclock.clone();
    // new rows may have been written while the checkpoint was being
    // built; subtract the observed size instead of zeroing
    writer.checkpoint_wal_size -= msg.checkpoint.wal_size;
    writer.checkpoint_triggered = false;
    let _ = msg.respond.send(());
}

fn wal_set_threshold_f(cx: &mut dyn Any, env: &mut Envelope) {
    let writer = cx.downcast_mut::<WalWriter>().expect("wal context");
    let msg = env.take_payload::<SetThresholdMsg>();
    writer.checkpoint_threshold = msg.threshold;
    let _ = msg.respond.send(());
}

fn wal_set_gc_first_f(cx: &mut dyn Any, env: &mut Envelope) {
    let writer = cx.downcast_mut::<WalWriter>().expect("wal context");
    let msg = env.take_payload::<SetGcFirstMsg>();
    if let Some(gcv) = &writer.gc_wal_vclock
        && order_crossed(&writer.gc_first_vclock, gcv, &msg.vclock)
    {
        writer.gc_pending = true;
    }
    writer.gc_first_vclock = msg.vclock;
    let _ = msg.respond.send(());
}

fn wal_consumer_update_f(cx: &mut dyn Any, env: &mut Envelope) {
    let writer = cx.downcast_mut::<WalWriter>().expect("wal context");
    let msg = env.take_payload::<ConsumerUpdateMsg>();
    let old = writer.mclock.get(msg.replica_id).cloned();
    match old {
        None => writer.gc_pending = true,
        Some(old) => {
            if let Some(gcv) = &writer.gc_wal_vclock
                && order_crossed(&old, gcv, &msg.vclock)
            {
                writer.gc_pending = true;
            }
        }
    }
    writer.mclock.update(msg.replica_id, msg.vclock);
}

/// Envelope feeding one consumer acknowledgement into the matrix clock;
/// pushed onto the wal pipe by the relay status handler on tx.
pub(crate) fn consumer_update_envelope(replica_id: InstanceId, vclock: VClock) -> Envelope {
    Envelope::new(ConsumerUpdateMsg { replica_id, vclock }, vec![Hop {
        perform: wal_consumer_update_f,
        next: None,
    }])
}

fn wal_consumer_delete_f(cx: &mut dyn Any, env: &mut Envelope) {
    let writer = cx.downcast_mut::<WalWriter>().expect("wal context");
    let msg = env.take_payload::<ConsumerDeleteMsg>();
    writer.mclock.remove(msg.replica_id);
    writer.gc_pending = true;
}

fn wal_attach_watcher_f(cx: &mut dyn Any, env: &mut Envelope) {
    let writer = cx.downcast_mut::<WalWriter>().expect("wal context");
    let msg = env.take_payload::<AttachWatcherMsg>();
    let id = writer.watchers.attach(msg.target, msg.perform);
    let _ = msg.respond.send(id);
}

fn wal_detach_watcher_f(cx: &mut dyn Any, env: &mut Envelope) {
    let writer = cx.downcast_mut::<WalWriter>().expect("wal context");
    let msg = env.take_payload::<DetachWatcherMsg>();
    writer.watchers.detach(msg.id);
    let _ = msg.respond.send(());
}

fn wal_watcher_complete(cx: &mut dyn Any, env: &mut Envelope) {
    let writer = cx.downcast_mut::<WalWriter>().expect("wal context");
    let id = env.payload_mut::<WatcherNotice>().watcher_id;
    writer.watchers.on_notify_returned(id);
}

fn wal_register_exit_f(cx: &mut dyn Any, env: &mut Envelope) {
    let writer = cx.downcast_mut::<WalWriter>().expect("wal context");
    let msg = env.take_payload::<RegisterExitHookMsg>();
    writer.exit_hooks.insert(msg.id, msg.hook);
}

fn wal_unregister_exit_f(cx: &mut dyn Any, env: &mut Envelope) {
    let writer = cx.downcast_mut::<WalWriter>().expect("wal context");
    let msg = env.take_payload::<UnregisterExitHookMsg>();
    writer.exit_hooks.remove(&msg.id);
}

fn wal_end_rollback(cx: &mut dyn Any, _env: &mut Envelope) {
    let writer = cx.downcast_mut::<WalWriter>().expect("wal context");
    writer.in_rollback = false;
}

fn wal_shutdown_f(cx: &mut dyn Any, env: &mut Envelope) {
    let writer = cx.downcast_mut::<WalWriter>().expect("wal context");
    let msg = env.take_payload::<ShutdownMsg>();
    writer.stop = Some(msg.respond);
}

// ---------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------

struct NoneState {
    vclock: VClock,
}

struct EngineThreads {
    wal: thread::JoinHandle<()>,
    tx: thread::JoinHandle<()>,
}

struct HandleInner {
    bus: Bus,
    mode: WalMode,
    instance_id: InstanceId,
    wal_dir: PathBuf,
    replication_timeout: Duration,
    replication_disconnect_timeout: Duration,

    wal_pipe: Pipe,
    tx_prio_pipe: Pipe,
    batch_slot: Mutex<Option<BatchRef>>,
    valve: Arc<RollbackValve>,
    tx_vclock: Arc<RwLock<VClock>>,
    none_state: Mutex<NoneState>,
    ring: XrowRing,

    next_hook_id: AtomicU64,
    shut_down: AtomicBool,
    threads: Mutex<Option<EngineThreads>>,
}

/// Clonable handle to the engine; implements the journal API.
#[derive(Clone)]
pub struct WalHandle {
    inner: Arc<HandleInner>,
}

impl WalHandle {
    /// Queue one entry for durable write and block until it completes.
    /// Returns the new writer vclock signature.
    pub fn write(&self, rows: Vec<Row>) -> WalResult<i64> {
        let (entry, done) = JournalEntry::with_channel(rows);
        self.write_entry(entry)?;
        match done.recv() {
            Ok(res) if res >= 0 => Ok(res),
            Ok(_) => Err(WalError::WriteFailed),
            Err(_) => Err(WalError::Shutdown),
        }
    }

    /// Submit one entry; its completion hook fires on the tx thread. If
    /// the rollback valve is shut the entry is completed with an error
    /// immediately, before it can observe doomed state.
    pub fn write_entry(&self, entry: JournalEntry) -> WalResult<()> {
        if entry.rows.is_empty() {
            entry.complete_err();
            return Err(WalError::EmptyEntry);
        }
        if self.inner.mode == WalMode::None {
            return self.write_mode_none(entry);
        }
        if self.inner.valve.is_shut() {
            tracing::error!("aborting transaction during cascading rollback");
            entry.complete_err();
            return Err(WalError::RollbackInProgress);
        }

        let mut slot = self
            .inner
            .batch_slot
            .lock()
            .expect("wal batch slot lock poisoned");
        if let Some(batch) = slot.as_ref() {
            let mut b = batch.lock().expect("wal batch lock poisoned");
            if b.open {
                b.approx_len += entry.approx_len;
                b.commit.push(entry);
                return Ok(());
            }
        }
        let batch: BatchRef = Arc::new(Mutex::new(WalBatch::new(entry)));
        *slot = Some(Arc::clone(&batch));
        let env = Envelope::new(
            Arc::clone(&batch),
            vec![
                Hop {
                    perform: wal_write_to_disk,
                    next: Some(self.inner.tx_prio_pipe.clone()),
                },
                Hop {
                    perform: tx_schedule_commit,
                    next: None,
                },
            ],
        );
        self.inner
            .wal_pipe
            .push(env)
            .map_err(|_| WalError::Shutdown)
    }

    /// The bypassed write path: no disk I/O, but LSNs are assigned and
    /// the writer clock advances, synchronously on the caller thread.
    fn write_mode_none(&self, mut entry: JournalEntry) -> WalResult<()> {
        let mut state = self
            .inner
            .none_state
            .lock()
            .expect("wal none-mode lock poisoned");
        let mut diff = VClock::new();
        if let Err(err) = assign_lsn(
            &mut diff,
            &state.vclock,
            self.inner.instance_id,
            &mut entry.rows,
        ) {
            entry.complete_err();
            return Err(err.into());
        }
        state.vclock.merge(&diff);
        *self
            .inner
            .tx_vclock
            .write()
            .expect("tx vclock lock poisoned") = state.vclock.clone();
        entry.set_res(state.vclock.sum());
        drop(state);
        entry.complete();
        Ok(())
    }

    /// The committed writer vclock. Fails while a rollback is draining.
    pub fn sync(&self) -> WalResult<VClock> {
        if self.inner.mode == WalMode::None {
            let state = self
                .inner
                .none_state
                .lock()
                .expect("wal none-mode lock poisoned");
            return Ok(state.vclock.clone());
        }
        if self.inner.valve.is_shut() {
            return Err(WalError::RollbackInProgress);
        }
        self.call_sync(true)
    }

    /// Writer vclock without the rollback barrier; used by relays that
    /// only need a replay bound.
    pub fn current_vclock(&self) -> WalResult<VClock> {
        if self.inner.mode == WalMode::None {
            let state = self
                .inner
                .none_state
                .lock()
                .expect("wal none-mode lock poisoned");
            return Ok(state.vclock.clone());
        }
        self.call_sync(false)
    }

    fn call_sync(&self, check_rollback: bool) -> WalResult<VClock> {
        let (respond, rx) = bounded(1);
        self.push_wal(
            SyncMsg {
                check_rollback,
                respond,
            },
            wal_sync_f,
        )?;
        rx.recv().map_err(|_| WalError::Shutdown)?
    }

    /// Close the current segment (unless empty) and report the clock and
    /// WAL size a checkpoint would cover.
    pub fn begin_checkpoint(&self) -> WalResult<WalCheckpoint> {
        if self.inner.mode == WalMode::None {
            let state = self
                .inner
                .none_state
                .lock()
                .expect("wal none-mode lock poisoned");
            return Ok(WalCheckpoint {
                vclock: state.vclock.clone(),
                wal_size: 0,
            });
        }
        if self.inner.valve.is_shut() {
            // in-memory indexes may contain changes scheduled for
            // rollback; checkpointing them would persist dirty state
            return Err(WalError::RollbackInProgress);
        }
        let (respond, rx) = bounded(1);
        self.push_wal(BeginCheckpointMsg { respond }, wal_begin_checkpoint_f)?;
        rx.recv().map_err(|_| WalError::Shutdown)?
    }

    /// Publish a completed checkpoint: set the checkpoint clock and
    /// release the segments and accounted size it covered.
    pub fn commit_checkpoint(&self, checkpoint: WalCheckpoint) -> WalResult<()> {
        if self.inner.mode == WalMode::None {
            // no segments exist, so the checkpoint clock pins nothing
            let _ = checkpoint;
            return Ok(());
        }
        let (respond, rx) = bounded(1);
        self.push_wal(
            CommitCheckpointMsg {
                checkpoint,
                respond,
            },
            wal_commit_checkpoint_f,
        )?;
        rx.recv().map_err(|_| WalError::Shutdown)
    }

    pub fn set_checkpoint_threshold(&self, threshold: i64) -> WalResult<()> {
        if self.inner.mode == WalMode::None {
            return Ok(());
        }
        let (respond, rx) = bounded(1);
        self.push_wal(SetThresholdMsg { threshold, respond }, wal_set_threshold_f)?;
        rx.recv().map_err(|_| WalError::Shutdown)
    }

    /// Lower bound on what garbage collection may advance to; pins
    /// segments for on-disk readers. ENOSPC recovery may overrun it.
    pub fn set_gc_first_vclock(&self, vclock: VClock) -> WalResult<()> {
        if self.inner.mode == WalMode::None {
            return Ok(());
        }
        let (respond, rx) = bounded(1);
        self.push_wal(SetGcFirstMsg { vclock, respond }, wal_set_gc_first_f)?;
        rx.recv().map_err(|_| WalError::Shutdown)
    }

    /// Feed a consumer acknowledgement into the matrix clock.
    pub(crate) fn consumer_update(&self, replica_id: InstanceId, vclock: VClock) {
        let _ = self.push_wal(
            ConsumerUpdateMsg { replica_id, vclock },
            wal_consumer_update_f,
        );
    }

    /// A replica was deleted: drop its retention pin and wake GC.
    pub fn relay_delete(&self, replica_id: InstanceId) {
        let _ = self.push_wal(ConsumerDeleteMsg { replica_id }, wal_consumer_delete_f);
    }

    /// Subscribe an endpoint to write/rotate events.
    pub fn attach_watcher(&self, target: Pipe, perform: Handler) -> WalResult<WatcherId> {
        let (respond, rx) = bounded(1);
        self.push_wal(
            AttachWatcherMsg {
                target,
                perform,
                respond,
            },
            wal_attach_watcher_f,
        )?;
        rx.recv().map_err(|_| WalError::Shutdown)
    }

    pub fn detach_watcher(&self, id: WatcherId) -> WalResult<()> {
        let (respond, rx) = bounded(1);
        self.push_wal(DetachWatcherMsg { id, respond }, wal_detach_watcher_f)?;
        rx.recv().map_err(|_| WalError::Shutdown)
    }

    /// Register a hook run on the WAL thread right before it exits; used
    /// by relays to get force-cancelled in bounded time.
    pub(crate) fn register_exit_hook(&self, hook: Box<dyn FnOnce() + Send>) -> u64 {
        let id = self.inner.next_hook_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.push_wal(RegisterExitHookMsg { id, hook }, wal_register_exit_f);
        id
    }

    pub(crate) fn unregister_exit_hook(&self, id: u64) {
        let _ = self.push_wal(UnregisterExitHookMsg { id }, wal_unregister_exit_f);
    }

    fn push_wal<P: Any + Send>(&self, payload: P, perform: Handler) -> WalResult<()> {
        let env = Envelope::new(payload, vec![Hop {
            perform,
            next: None,
        }]);
        self.inner
            .wal_pipe
            .push(env)
            .map_err(|_| WalError::Shutdown)
    }

    /// Mirror of the writer vclock maintained on the tx side.
    pub fn tx_vclock(&self) -> VClock {
        self.inner
            .tx_vclock
            .read()
            .expect("tx vclock lock poisoned")
            .clone()
    }

    pub(crate) fn bus(&self) -> &Bus {
        &self.inner.bus
    }

    pub(crate) fn ring(&self) -> &XrowRing {
        &self.inner.ring
    }

    pub fn wal_dir(&self) -> &Path {
        &self.inner.wal_dir
    }

    pub fn instance_id(&self) -> InstanceId {
        self.inner.instance_id
    }

    pub(crate) fn replication_timeout(&self) -> Duration {
        self.inner.replication_timeout
    }

    pub(crate) fn replication_disconnect_timeout(&self) -> Duration {
        self.inner.replication_disconnect_timeout
    }

    /// Stop both service threads. Active relays are force-cancelled, the
    /// tail segment is sealed, and the call blocks until both threads
    /// joined. Idempotent.
    pub fn shutdown(&self) -> WalResult<()> {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let (respond, rx) = bounded(1);
        if self
            .push_wal(ShutdownMsg { respond }, wal_shutdown_f)
            .is_ok()
        {
            let _ = rx.recv();
        }
        let threads = self
            .inner
            .threads
            .lock()
            .expect("engine threads lock poisoned")
            .take();
        if let Some(threads) = threads {
            let _ = threads.wal.join();
            let stop = Envelope::new(TxStopMsg, vec![Hop {
                perform: tx_stop,
                next: None,
            }]);
            if let Ok(pipe) = self.inner.bus.pipe("tx") {
                let _ = pipe.push(stop);
            }
            let _ = threads.tx.join();
        }
        Ok(())
    }
}

/// Initialize the engine: spawn the wal and tx threads, index the wal
/// directory and re-open the tail segment. `initial_vclock` is the clock
/// recovered by the caller's startup replay.
pub fn start(
    config: &WalConfig,
    instance_id: InstanceId,
    initial_vclock: VClock,
    callbacks: WalCallbacks,
) -> WalResult<WalHandle> {
    let bus = Bus::new();
    let tx_endpoint = bus.endpoint("tx").map_err(|_| WalError::Shutdown)?;
    let wal_endpoint = bus.endpoint("wal").map_err(|_| WalError::Shutdown)?;
    let wal_pipe = bus.pipe("wal").expect("wal endpoint is registered");
    let tx_prio_pipe = bus.prio_pipe("tx").expect("tx endpoint is registered");

    let ring = XrowRing::new(RingLimits {
        max_rows: config.ring_max_rows,
        max_bytes: config.ring_max_bytes,
    });
    let valve = Arc::new(RollbackValve::default());
    let tx_vclock = Arc::new(RwLock::new(initial_vclock.clone()));

    let mut writer = WalWriter::new(
        config,
        instance_id,
        ring.clone(),
        wal_pipe.clone(),
        tx_prio_pipe.clone(),
    );

    let (ready_tx, ready_rx): (Sender<WalResult<()>>, Receiver<WalResult<()>>) = bounded(1);
    let mode = config.wal_mode;
    let enable_vclock = initial_vclock.clone();
    let wal_thread = thread::Builder::new()
        .name("wal".to_string())
        .spawn(move || {
            let enabled = if mode == WalMode::None {
                Ok(())
            } else {
                writer.enable(enable_vclock)
            };
            let failed = enabled.is_err();
            let _ = ready_tx.send(enabled);
            if failed {
                return;
            }
            writer.run(&wal_endpoint);
        })
        .expect("spawn wal thread");

    let world = TxWorld {
        wal_pipe: wal_pipe.clone(),
        valve: Arc::clone(&valve),
        tx_vclock: Arc::clone(&tx_vclock),
        callbacks,
        rollback_active: false,
        stop: false,
    };
    let tx_thread = thread::Builder::new()
        .name("tx".to_string())
        .spawn(move || world.run(tx_endpoint))
        .expect("spawn tx thread");

    match ready_rx.recv() {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            let _ = wal_thread.join();
            // release the tx thread as well
            let stop = Envelope::new(TxStopMsg, vec![Hop {
                perform: tx_stop,
                next: None,
            }]);
            let _ = bus.pipe("tx").and_then(|p| p.push(stop));
            let _ = tx_thread.join();
            return Err(err);
        }
        Err(_) => return Err(WalError::Shutdown),
    }

    Ok(WalHandle {
        inner: Arc::new(HandleInner {
            bus,
            mode: config.wal_mode,
            instance_id,
            wal_dir: config.wal_dir.clone(),
            replication_timeout: config.replication_timeout(),
            replication_disconnect_timeout: config.replication_disconnect_timeout(),
            wal_pipe,
            tx_prio_pipe,
            batch_slot: Mutex::new(None),
            valve,
            tx_vclock,
            none_state: Mutex::new(NoneState {
                vclock: initial_vclock,
            }),
            ring,
            next_hook_id: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
            threads: Mutex::new(Some(EngineThreads {
                wal: wal_thread,
                tx: tx_thread,
            })),
        }),
    })
}
