//! In-memory ring of recently committed rows.
//!
//! The WAL thread appends rows under a ring transaction that commits only
//! after the matching disk flush succeeded, so cursors never observe rows
//! that may still be rolled back, and row boundaries are published
//! atomically. Relays tail the ring to serve followers without touching
//! segment files; a cursor positioned before the retained window fails,
//! which tells the relay to fall back to file streaming.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;

use crate::core::{ClockOrder, Row, VClock};

#[derive(Debug, Clone, Copy)]
pub struct RingLimits {
    pub max_rows: usize,
    pub max_bytes: usize,
}

impl Default for RingLimits {
    fn default() -> Self {
        Self {
            max_rows: 16 * 1024,
            max_bytes: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RingError {
    #[error("requested position {requested} is older than the retained ring window {retained}")]
    OutOfRange { requested: String, retained: String },
}

#[derive(Default)]
struct RingState {
    rows: VecDeque<Arc<Row>>,
    bytes: usize,
    /// Absolute index of `rows[0]` since ring creation.
    start_index: u64,
    /// Clock state right before `rows[0]`.
    first_vclock: VClock,
    staged: Vec<Arc<Row>>,
    staged_bytes: usize,
    /// Absolute index of the first row of the newest committed
    /// transaction batch. Eviction never crosses it.
    last_commit_start: u64,
}

impl RingState {
    fn end_index(&self) -> u64 {
        self.start_index + self.rows.len() as u64
    }
}

struct RingShared {
    state: Mutex<RingState>,
    cond: Condvar,
}

/// Shared handle; the WAL thread is the only writer.
#[derive(Clone)]
pub struct XrowRing {
    shared: Arc<RingShared>,
    limits: RingLimits,
}

impl XrowRing {
    pub fn new(limits: RingLimits) -> Self {
        Self {
            shared: Arc::new(RingShared {
                state: Mutex::new(RingState::default()),
                cond: Condvar::new(),
            }),
            limits,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RingState> {
        self.shared.state.lock().expect("xrow ring lock poisoned")
    }

    /// Anchor the retention window at the writer's clock before the first
    /// append. Cursors asking for older positions are sent to the files.
    pub fn set_origin(&self, vclock: VClock) {
        let mut state = self.lock();
        debug_assert!(state.rows.is_empty() && state.staged.is_empty());
        state.first_vclock = vclock;
    }

    pub fn tx_begin(&self) {
        let mut state = self.lock();
        state.staged.clear();
        state.staged_bytes = 0;
    }

    pub fn tx_append(&self, rows: &[Row]) {
        let mut state = self.lock();
        for row in rows {
            state.staged_bytes += row.encoded_len();
            state.staged.push(Arc::new(row.clone()));
        }
    }

    /// Publish the staged rows and wake waiting cursors.
    pub fn tx_commit(&self) {
        let mut state = self.lock();
        if state.staged.is_empty() {
            return;
        }
        state.last_commit_start = state.end_index();
        state.bytes += state.staged_bytes;
        state.staged_bytes = 0;
        let staged: Vec<Arc<Row>> = state.staged.drain(..).collect();
        state.rows.extend(staged);
        self.evict(&mut state);
        drop(state);
        self.shared.cond.notify_all();
    }

    pub fn tx_rollback(&self) {
        let mut state = self.lock();
        state.staged.clear();
        state.staged_bytes = 0;
    }

    fn evict(&self, state: &mut RingState) {
        while (state.rows.len() > self.limits.max_rows || state.bytes > self.limits.max_bytes)
            && state.start_index < state.last_commit_start
        {
            let row = state.rows.pop_front().expect("rows is non-empty");
            state.bytes -= row.encoded_len();
            state.start_index += 1;
            if let Err(err) = state.first_vclock.follow_row(&row) {
                tracing::warn!("ring eviction clock skew: {err}");
            }
        }
    }

    /// Open a cursor at `from`. Fails when the position was evicted or is
    /// incomparable with the retained window.
    pub fn cursor(&self, from: &VClock) -> Result<RingCursor, RingError> {
        let state = self.lock();
        match from.compare(&state.first_vclock) {
            ClockOrder::Greater | ClockOrder::Equal => Ok(RingCursor {
                shared: Arc::clone(&self.shared),
                index: state.start_index,
                seen: from.clone(),
            }),
            ClockOrder::Less | ClockOrder::Incomparable => Err(RingError::OutOfRange {
                requested: from.to_string(),
                retained: state.first_vclock.to_string(),
            }),
        }
    }

    /// Clock state before the oldest retained row.
    pub fn first_vclock(&self) -> VClock {
        self.lock().first_vclock.clone()
    }
}

pub enum CursorNext {
    Row(Arc<Row>),
    /// Caught up; wait on the ring condition.
    Empty,
    /// The cursor position was evicted; fall back to file streaming.
    Evicted,
}

pub struct RingCursor {
    shared: Arc<RingShared>,
    index: u64,
    /// Creation clock; rows it already covers are skipped.
    seen: VClock,
}

impl RingCursor {
    pub fn next(&mut self) -> CursorNext {
        let state = self.shared.state.lock().expect("xrow ring lock poisoned");
        loop {
            if self.index < state.start_index {
                return CursorNext::Evicted;
            }
            let off = (self.index - state.start_index) as usize;
            let Some(row) = state.rows.get(off) else {
                return CursorNext::Empty;
            };
            let row = Arc::clone(row);
            self.index += 1;
            if row.lsn <= self.seen.get(row.replica_id) {
                // already known to the consumer
                continue;
            }
            return CursorNext::Row(row);
        }
    }

    /// Block until the ring grows past this cursor or `timeout` elapses.
    /// Returns true when rows may be available.
    pub fn wait(&self, timeout: Duration) -> bool {
        let state = self.shared.state.lock().expect("xrow ring lock poisoned");
        if state.end_index() > self.index || self.index < state.start_index {
            return true;
        }
        let (state, result) = self
            .shared
            .cond
            .wait_timeout(state, timeout)
            .expect("xrow ring lock poisoned");
        state.end_index() > self.index || !result.timed_out()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::core::RowType;

    fn committed_row(replica: u32, lsn: i64) -> Row {
        let mut row = Row::new_dml(RowType::Insert, Bytes::from_static(b"r"));
        row.replica_id = replica;
        row.lsn = lsn;
        row.tsn = lsn;
        row.is_commit = true;
        row
    }

    fn clock(pairs: &[(u32, i64)]) -> VClock {
        let mut v = VClock::new();
        for &(id, lsn) in pairs {
            v.follow(id, lsn).unwrap();
        }
        v
    }

    fn ring() -> XrowRing {
        XrowRing::new(RingLimits::default())
    }

    #[test]
    fn staged_rows_invisible_until_commit() {
        let ring = ring();
        let mut cursor = ring.cursor(&VClock::new()).unwrap();
        ring.tx_begin();
        ring.tx_append(&[committed_row(1, 1)]);
        assert!(matches!(cursor.next(), CursorNext::Empty));
        ring.tx_commit();
        assert!(matches!(cursor.next(), CursorNext::Row(_)));
        assert!(matches!(cursor.next(), CursorNext::Empty));
    }

    #[test]
    fn rollback_discards_staged_rows() {
        let ring = ring();
        let mut cursor = ring.cursor(&VClock::new()).unwrap();
        ring.tx_begin();
        ring.tx_append(&[committed_row(1, 1)]);
        ring.tx_rollback();
        ring.tx_commit();
        assert!(matches!(cursor.next(), CursorNext::Empty));
    }

    #[test]
    fn cursor_skips_rows_the_consumer_has() {
        let ring = ring();
        ring.tx_begin();
        ring.tx_append(&[committed_row(1, 1), committed_row(1, 2), committed_row(1, 3)]);
        ring.tx_commit();

        let mut cursor = ring.cursor(&clock(&[(1, 2)])).unwrap();
        match cursor.next() {
            CursorNext::Row(row) => assert_eq!(row.lsn, 3),
            _ => panic!("expected the first unseen row"),
        }
        assert!(matches!(cursor.next(), CursorNext::Empty));
    }

    #[test]
    fn old_position_is_rejected() {
        let ring = ring();
        ring.set_origin(clock(&[(1, 5)]));
        assert!(ring.cursor(&clock(&[(1, 3)])).is_err());
        assert!(ring.cursor(&clock(&[(1, 5)])).is_ok());
    }

    #[test]
    fn eviction_advances_window_and_invalidates_cursors() {
        let ring = XrowRing::new(RingLimits {
            max_rows: 2,
            max_bytes: usize::MAX,
        });
        ring.tx_begin();
        ring.tx_append(&[committed_row(1, 1), committed_row(1, 2)]);
        ring.tx_commit();
        let mut cursor = ring.cursor(&VClock::new()).unwrap();

        ring.tx_begin();
        ring.tx_append(&[committed_row(1, 3), committed_row(1, 4)]);
        ring.tx_commit();

        assert!(matches!(cursor.next(), CursorNext::Evicted));
        assert_eq!(ring.first_vclock().get(1), 2);
        // a fresh cursor from the new window works
        let mut cursor = ring.cursor(&clock(&[(1, 2)])).unwrap();
        match cursor.next() {
            CursorNext::Row(row) => assert_eq!(row.lsn, 3),
            _ => panic!("expected lsn 3"),
        }
    }

    #[test]
    fn eviction_never_removes_the_newest_batch() {
        let ring = XrowRing::new(RingLimits {
            max_rows: 1,
            max_bytes: usize::MAX,
        });
        ring.tx_begin();
        ring.tx_append(&[committed_row(1, 1), committed_row(1, 2), committed_row(1, 3)]);
        ring.tx_commit();
        // over the row limit, but the only committed batch stays whole
        let mut cursor = ring.cursor(&VClock::new()).unwrap();
        assert!(matches!(cursor.next(), CursorNext::Row(_)));
    }

    #[test]
    fn wait_wakes_on_commit() {
        let ring = ring();
        let mut cursor = ring.cursor(&VClock::new()).unwrap();
        assert!(matches!(cursor.next(), CursorNext::Empty));

        let ring2 = ring.clone();
        let handle = std::thread::spawn(move || {
            ring2.tx_begin();
            ring2.tx_append(&[committed_row(1, 1)]);
            ring2.tx_commit();
        });
        let mut woke = false;
        for _ in 0..100 {
            if cursor.wait(Duration::from_millis(50)) {
                if let CursorNext::Row(_) = cursor.next() {
                    woke = true;
                    break;
                }
            }
        }
        handle.join().unwrap();
        assert!(woke);
    }
}
