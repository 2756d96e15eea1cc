//! Crate-level convenience error.
//!
//! A thin wrapper over the capability errors; each subsystem keeps its
//! own structured error type.

use thiserror::Error;

use crate::bus::BusError;
use crate::config::ConfigError;
use crate::relay::RelayError;
use crate::wal::WalError;
use crate::wal::segment::SegmentError;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Wal(#[from] WalError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Segment(#[from] SegmentError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;
