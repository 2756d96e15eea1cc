//! Write-ahead log: segments, directory, memory ring, watchers, writer.

pub mod dir;
pub mod recovery;
pub mod ring;
pub mod segment;
pub mod watcher;
pub mod writer;

pub use dir::SegmentDirectory;
pub use recovery::FileCursor;
pub use ring::{CursorNext, RingCursor, RingError, RingLimits, XrowRing};
pub use segment::{SegmentError, SegmentHeader, SegmentReader, SegmentWriter};
pub use watcher::{WalEvents, WatcherId, WatcherNotice};
pub use writer::{WalCallbacks, WalCheckpoint, WalHandle, start};

use thiserror::Error;

use crate::core::ClockError;

pub type WalResult<T> = Result<T, WalError>;

/// User-visible failures of the journal API.
#[derive(Debug, Error)]
pub enum WalError {
    #[error(transparent)]
    Segment(#[from] SegmentError),

    /// ENOSPC recovery exhausted every deletable segment.
    #[error("no space left in wal directory")]
    NoSpace,

    /// `write`, `sync` and `begin_checkpoint` fail with this kind until
    /// the rollback protocol reaches its terminal step.
    #[error("rollback is in progress")]
    RollbackInProgress,

    /// The entry was completed with a negative result.
    #[error("journal entry was rolled back")]
    WriteFailed,

    #[error("journal entry has no rows")]
    EmptyEntry,

    /// A foreign row tried to move a vclock component backwards. Debug
    /// aid; callers observe it like an I/O failure.
    #[error("lsn violation: {0}")]
    LsnViolation(#[from] ClockError),

    #[error("wal writer is shut down")]
    Shutdown,
}
