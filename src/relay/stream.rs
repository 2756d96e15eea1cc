//! Two-phase row streaming: memory ring first, segment files as
//! fallback, alternating until the stop clock is reached or the session
//! dies.

use std::time::{Duration, Instant};

use crate::bus::Endpoint;
use crate::core::{ClockOrder, Row};
use crate::wal::recovery::FileCursor;
use crate::wal::ring::CursorNext;
use crate::wal::watcher::WalEvents;

use super::RelayError;
use super::filter::FilterVerdict;
use super::session::RelaySession;

/// Upper bound on one ring wait, so bus messages and cancellation are
/// observed promptly even under a long heartbeat interval.
const WAIT_SLICE: Duration = Duration::from_millis(100);

enum MemoryOutcome {
    /// The cursor position left the ring; replay from files.
    FellBehind,
    /// `stop_vclock` was reached.
    StopReached,
}

impl RelaySession {
    /// Alternate between the ring and the files until the stop clock is
    /// reached (join-style replays) or the session fails.
    pub(crate) fn stream(&mut self, endpoint: &Endpoint) -> Result<(), RelayError> {
        loop {
            match self.stream_from_memory(endpoint)? {
                MemoryOutcome::StopReached => return Ok(()),
                MemoryOutcome::FellBehind => self.stream_from_file(endpoint)?,
            }
        }
    }

    fn stop_reached(&self) -> bool {
        match &self.stop_vclock {
            Some(stop) => matches!(
                stop.compare(&self.vclock),
                ClockOrder::Less | ClockOrder::Equal
            ),
            None => false,
        }
    }

    /// Hot path: tail the ring. Rows are filtered, written to the
    /// socket, and the relay clock follows the original row identity.
    /// Idle periods wait on the ring condition and heartbeat on the
    /// replication timeout.
    fn stream_from_memory(&mut self, endpoint: &Endpoint) -> Result<MemoryOutcome, RelayError> {
        let mut cursor = match self.wal.ring().cursor(&self.vclock) {
            Ok(cursor) => cursor,
            Err(_) => return Ok(MemoryOutcome::FellBehind),
        };
        loop {
            self.check_cancel()?;
            if self.stop_reached() {
                return Ok(MemoryOutcome::StopReached);
            }
            endpoint.process(self);
            self.maybe_send_status()?;
            match cursor.next() {
                CursorNext::Row(row) => self.relay_row(&row)?,
                CursorNext::Evicted => return Ok(MemoryOutcome::FellBehind),
                CursorNext::Empty => {
                    if !self.wal_events.is_empty() {
                        // the wal signalled progress; re-poll right away
                        self.wal_events = WalEvents::NONE;
                        continue;
                    }
                    let timeout = self.wal.replication_timeout();
                    let deadline = self.relay.last_row_time() + timeout;
                    let now = Instant::now();
                    if now >= deadline {
                        self.send_heartbeat()?;
                        continue;
                    }
                    cursor.wait((deadline - now).min(WAIT_SLICE));
                }
            }
        }
    }

    /// Cold path: replay segments from the relay clock up to the stop
    /// clock, or to the live writer clock when following. Returns to the
    /// memory phase once caught up.
    fn stream_from_file(&mut self, endpoint: &Endpoint) -> Result<(), RelayError> {
        let stop = match &self.stop_vclock {
            Some(stop) => stop.clone(),
            None => self.wal.current_vclock()?,
        };
        let mut cursor = FileCursor::open(self.wal.wal_dir(), &self.vclock)?;
        loop {
            self.check_cancel()?;
            endpoint.process(self);
            self.maybe_send_status()?;
            match cursor.next_row(Some(&stop))? {
                Some(row) => self.relay_row(&row)?,
                None => return Ok(()),
            }
        }
    }

    /// Filter one row and send it. Skipped rows advance nothing; sent
    /// rows advance the relay clock by the original row's identity even
    /// when a rewrite went over the wire.
    fn relay_row(&mut self, row: &Row) -> Result<(), RelayError> {
        match self.filter.apply(row) {
            FilterVerdict::Pass => self.send_row_stamped(row.clone())?,
            FilterVerdict::Rewrite(rewritten) => self.send_row_stamped(rewritten)?,
            FilterVerdict::Skip => return Ok(()),
        }
        self.vclock.follow_row(row)?;
        Ok(())
    }
}
