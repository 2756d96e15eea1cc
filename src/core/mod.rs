//! Core data model: vector and matrix clocks, log rows, framing.

pub mod frame;
pub mod mclock;
pub mod row;
pub mod vclock;

pub use frame::{FrameError, FrameReader, FrameWriter, encode_frame};
pub use mclock::MClock;
pub use row::{GroupId, Row, RowCodecError, RowType};
pub use vclock::{ClockError, ClockOrder, INSTANCE_ID_NIL, InstanceId, VClock, order_crossed};

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock seconds since the Unix epoch, stamped on rows at write time.
pub fn wall_clock_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
