//! Replication relay: per-replica sender of WAL rows over the network.
//!
//! A relay serves one replica. Three protocols share the machinery: the
//! initial join (engine read view under a frozen vclock), the final join
//! (segment replay between two clocks) and subscribe (endless follow,
//! streaming from the memory ring with file fallback). The subscribe
//! session runs in its own thread with an ack-reader sibling; both talk
//! to tx and wal exclusively through the bus.

pub mod filter;
pub mod join;
pub mod session;
mod stream;

pub use filter::{FilterVerdict, RelayFilter};
pub use join::{JoinSource, final_join, initial_join};
pub use session::subscribe;

use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use thiserror::Error;
use uuid::Uuid;

use crate::bus::BusError;
use crate::core::frame::FrameError;
use crate::core::{ClockError, InstanceId, Row, VClock, encode_frame};
use crate::wal::segment::SegmentError;
use crate::wal::WalError;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Wal(#[from] WalError),

    #[error(transparent)]
    Segment(#[from] SegmentError),

    #[error(transparent)]
    Bus(#[from] BusError),

    /// No acknowledgement arrived within the disconnect timeout.
    #[error("replica connection timed out")]
    Timeout,

    #[error("replica closed the connection")]
    Eof,

    /// The stream produced a row that would move the relay clock
    /// backwards.
    #[error("relay stream out of order: {0}")]
    OutOfOrder(#[from] ClockError),

    #[error("relay was cancelled")]
    Cancelled,

    /// The WAL thread is exiting and force-cancelled this session.
    #[error("wal writer exited")]
    WalExit,

    #[error("relay is already following")]
    AlreadyFollowing,

    #[error("final join ended at {got}, expected {expected}")]
    JoinIncomplete { expected: String, got: String },
}

/// Relay lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Replica is not connected.
    Off,
    /// Subscribe session is streaming.
    Follow,
    /// The session ended; diagnostics hold the reason.
    Stopped,
}

/// The replica this relay serves. Owned by cluster membership; the relay
/// keeps plain copies instead of a back-pointer.
#[derive(Debug, Clone)]
pub struct Replica {
    /// Registered instance id, `INSTANCE_ID_NIL` for anonymous replicas.
    pub id: InstanceId,
    pub anon: bool,
    pub uuid: Uuid,
}

pub(crate) struct RelayInner {
    pub(crate) replica_id: InstanceId,
    pub(crate) anon: bool,
    pub(crate) uuid: Uuid,
    state: Mutex<RelayState>,
    /// Last failure, kept across stop/start for operators. Cleared when
    /// the next session starts.
    diag: Mutex<Option<String>>,
    cancel: AtomicBool,
    /// True when the cancellation came from the WAL-exit hook.
    wal_exit: AtomicBool,
    socket: Mutex<Option<TcpStream>>,
    /// Last vclock acknowledged by the replica, written by the ack
    /// reader.
    pub(crate) recv_vclock: Mutex<VClock>,
    /// TX-side mirror of the acknowledged vclock, written by the status
    /// handler on the tx thread only.
    pub(crate) tx_vclock: RwLock<VClock>,
    pub(crate) status_in_flight: AtomicBool,
    last_row_time: Mutex<Instant>,
}

impl RelayInner {
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub(crate) fn wal_exited(&self) -> bool {
        self.wal_exit.load(Ordering::Acquire)
    }

    /// First error wins; later ones keep the original diagnostic.
    pub(crate) fn set_diag(&self, message: &str) {
        let mut diag = self.diag.lock().expect("relay diag lock poisoned");
        if diag.is_none() {
            *diag = Some(message.to_string());
        }
    }

    pub(crate) fn cancel_session(&self) {
        self.cancel.store(true, Ordering::Release);
        let socket = self.socket.lock().expect("relay socket lock poisoned");
        if let Some(sock) = socket.as_ref() {
            let _ = sock.shutdown(Shutdown::Both);
        }
    }

    /// The WAL thread is exiting; the session must unwind in bounded
    /// time and skip any calls back into the WAL.
    pub(crate) fn cancel_for_wal_exit(&self) {
        self.wal_exit.store(true, Ordering::Release);
        self.cancel_session();
    }

    pub(crate) fn touch_last_row_time(&self) {
        *self
            .last_row_time
            .lock()
            .expect("relay clock lock poisoned") = Instant::now();
    }

    pub(crate) fn last_row_time(&self) -> Instant {
        *self
            .last_row_time
            .lock()
            .expect("relay clock lock poisoned")
    }

    /// Reset for a fresh session.
    pub(crate) fn start(&self, socket: TcpStream) {
        *self.diag.lock().expect("relay diag lock poisoned") = None;
        self.cancel.store(false, Ordering::Release);
        self.wal_exit.store(false, Ordering::Release);
        *self.socket.lock().expect("relay socket lock poisoned") = Some(socket);
        *self
            .recv_vclock
            .lock()
            .expect("relay recv vclock lock poisoned") = VClock::new();
        self.status_in_flight.store(false, Ordering::Release);
        *self.state.lock().expect("relay state lock poisoned") = RelayState::Follow;
        self.touch_last_row_time();
    }

    pub(crate) fn stop(&self) {
        *self.socket.lock().expect("relay socket lock poisoned") = None;
        *self.state.lock().expect("relay state lock poisoned") = RelayState::Stopped;
    }
}

/// Per-replica relay handle. The replica owns it; sessions borrow it.
#[derive(Clone)]
pub struct Relay {
    pub(crate) inner: Arc<RelayInner>,
}

impl Relay {
    pub fn new(replica: &Replica) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                replica_id: replica.id,
                anon: replica.anon,
                uuid: replica.uuid,
                state: Mutex::new(RelayState::Off),
                diag: Mutex::new(None),
                cancel: AtomicBool::new(false),
                wal_exit: AtomicBool::new(false),
                socket: Mutex::new(None),
                recv_vclock: Mutex::new(VClock::new()),
                tx_vclock: RwLock::new(VClock::new()),
                status_in_flight: AtomicBool::new(false),
                last_row_time: Mutex::new(Instant::now()),
            }),
        }
    }

    pub fn state(&self) -> RelayState {
        *self.inner.state.lock().expect("relay state lock poisoned")
    }

    /// The replica's progress as known on the tx thread.
    pub fn vclock(&self) -> VClock {
        self.inner
            .tx_vclock
            .read()
            .expect("relay tx vclock lock poisoned")
            .clone()
    }

    /// The last failure reason; survives session restarts until the next
    /// session starts.
    pub fn last_error(&self) -> Option<String> {
        self.inner
            .diag
            .lock()
            .expect("relay diag lock poisoned")
            .clone()
    }

    /// Time since the last row or heartbeat went out.
    pub fn last_row_age(&self) -> Duration {
        self.inner.last_row_time().elapsed()
    }

    /// Cooperatively cancel the active session, if any.
    pub fn cancel(&self) {
        self.inner.cancel_session();
    }
}

/// Write one row as a single frame, stamping the session correlator.
pub(crate) fn send_row(sock: &mut TcpStream, mut row: Row, sync: u64) -> Result<(), RelayError> {
    row.sync = sync;
    let mut buf = Vec::new();
    encode_frame(&[row], &mut buf);
    sock.write_all(&buf)?;
    Ok(())
}
