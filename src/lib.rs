//! Durability and outbound replication engine of a single-writer,
//! multi-reader database node.
//!
//! Two tightly coupled halves: the write-ahead log writer (segment
//! files, LSN assignment over a vector clock, cascading rollback,
//! checkpoint and garbage-collection signalling) and the replication
//! relay (per-replica row streaming from an in-memory ring or from
//! segment files, acknowledgement feedback into log retention).
//!
//! The engine runs one `wal` thread and one `tx` service thread plus a
//! thread pair per connected replica; everything communicates over the
//! in-process bus. [`wal::start`] returns the handle implementing the
//! journal API.

#![forbid(unsafe_code)]

pub mod bus;
pub mod config;
pub mod core;
pub mod error;
pub mod journal;
pub mod relay;
pub mod telemetry;
pub mod wal;

pub use error::{Error, Result};

pub use crate::config::{WalConfig, WalMode};
pub use crate::core::{
    ClockOrder, GroupId, InstanceId, MClock, Row, RowType, VClock,
};
pub use crate::journal::JournalEntry;
pub use crate::relay::{
    JoinSource, Relay, RelayError, RelayState, Replica, final_join, initial_join, subscribe,
};
pub use crate::wal::{WalCallbacks, WalCheckpoint, WalError, WalEvents, WalHandle};
