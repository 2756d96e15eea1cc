//! Initial and final join: bootstrapping a new replica.
//!
//! The initial join ships the engine's frozen read view: sync the WAL
//! for the committed vclock, answer the join request with that clock,
//! then stream the base state, suppressing replica-local rows. The
//! final join replays the segment directory between two clocks so the
//! replica catches up to the read view's position.

use std::net::TcpStream;

use crate::core::{GroupId, Row, VClock};
use crate::wal::recovery::FileCursor;
use crate::wal::writer::WalHandle;

use super::filter::{FilterVerdict, RelayFilter};
use super::{RelayError, send_row};

/// Engine-side contract: stream the rows of a frozen read view.
pub trait JoinSource {
    fn stream(
        &self,
        sink: &mut dyn FnMut(&Row) -> Result<(), RelayError>,
    ) -> Result<(), RelayError>;
}

/// Serve an initial-join request on `socket`. Returns the vclock the
/// read view is consistent with; the caller hands it to the final join
/// as `start_vclock`.
pub fn initial_join(
    wal: &WalHandle,
    mut socket: TcpStream,
    sync: u64,
    source: &dyn JoinSource,
) -> Result<VClock, RelayError> {
    // make sure everything visible from the read view is committed
    let vclock = wal.sync()?;
    send_row(&mut socket, Row::vclock_row(&vclock, sync), sync)?;

    source.stream(&mut |row| {
        if row.group_id == GroupId::Local {
            // no vclock promotion while sending a snapshot
            return Ok(());
        }
        send_row(&mut socket, row.clone(), sync)
    })?;
    Ok(vclock)
}

/// Replay the segment directory from `start_vclock` up to `stop_vclock`
/// inclusive. Every row is relayed, including the peer's own
/// (rebootstrap); local rows go out as no-ops.
pub fn final_join(
    wal: &WalHandle,
    mut socket: TcpStream,
    sync: u64,
    start_vclock: &VClock,
    stop_vclock: &VClock,
) -> Result<(), RelayError> {
    let filter = RelayFilter::final_join();
    let mut cursor = FileCursor::open(wal.wal_dir(), start_vclock)?;
    while let Some(row) = cursor.next_row(Some(stop_vclock))? {
        match filter.apply(&row) {
            FilterVerdict::Pass => send_row(&mut socket, row, sync)?,
            FilterVerdict::Rewrite(rewritten) => send_row(&mut socket, rewritten, sync)?,
            FilterVerdict::Skip => {}
        }
    }
    if cursor.vclock() != stop_vclock {
        return Err(RelayError::JoinIncomplete {
            expected: stop_vclock.to_string(),
            got: cursor.vclock().to_string(),
        });
    }
    Ok(())
}
