//! Block-allocated messaging backend over a pair of shared memory regions.
//!
//! Two execution contexts that share memory but not coherent caches exchange
//! variable-length messages over named endpoints. Each direction owns one
//! region, split into an area reserved for the underlying notification link
//! followed by an area of fixed-size blocks:
//!
//! ```text
//!  +-----------+-------------+
//!  | link area | blocks area |
//!  +-----------+-------------+
//!       ______/               \_________________________________________
//!      /                                                                \
//!      +-----------+-----------+-----------+-----------+-   -+-----------+
//!      |  block 0  |  block 1  |  block 2  |  block 3  | ... | block N-1 |
//!      +-----------+-----------+-----------+-----------+-   -+-----------+
//!            ____/                                      \_____
//!           /                                                 \
//!           +------+--------------------------------+---------+
//!           | size | data[size] ...                 | padding |
//!           +------+--------------------------------+---------+
//! ```
//!
//! Buffers span one or more contiguous blocks; the first block starts with
//! the payload size. The sender side of a direction owns the allocation
//! bitmap for it; the receiver only tells the sender when a buffer is no
//! longer needed. All cross-boundary coordination happens through 2-byte
//! notifications on the link plus memory-ordering and cache discipline
//! when touching the blocks.
//!
//! The public surface lives on [`Bus`] and [`Endpoint`]: register endpoints
//! by name, wait for the bonding handshake to pair them with their remote
//! counterparts, then exchange payloads with copying ([`Endpoint::send`]) or
//! without ([`Bus::tx_buffer`], [`Endpoint::send_buffer`], [`RxBuffer::hold`]).

mod backend;
mod bitmap;
mod endpoint;
pub mod geometry;
mod proto;
pub mod region;

pub use backend::{Bus, BusConfig, Endpoint, HeldRx, RxBuffer, TxBuffer};
pub use endpoint::{BoundFn, EndpointConfig, ReceiveFn};
pub use geometry::ChannelLayout;
pub use region::{CacheMaintenance, NoCache, Region};

pub use shm_notify::{Link, LinkError, LinkEvent};

use core::time::Duration;
use std::time::Instant;

/// Errors surfaced by the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// A size or argument that can never be satisfied by this configuration.
    InvalidArgument,
    /// Not enough free blocks and the caller asked not to wait.
    OutOfSpace,
    /// The wait for free blocks expired.
    Timeout,
    /// Peer-supplied index or size failed bounds validation.
    Corrupted,
    /// The fixed endpoint table is full.
    TooManyEndpoints,
    /// The fixed table of unmatched incoming handshakes is full.
    TooManyPendingBinds,
    /// The underlying notification link failed to send.
    Link(LinkError),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::InvalidArgument => write!(f, "argument exceeds what this region can hold"),
            Error::OutOfSpace => write!(f, "no free blocks"),
            Error::Timeout => write!(f, "timed out waiting for free blocks"),
            Error::Corrupted => write!(f, "shared block failed validation"),
            Error::TooManyEndpoints => write!(f, "endpoint table is full"),
            Error::TooManyPendingBinds => write!(f, "pending handshake table is full"),
            Error::Link(e) => write!(f, "link send failed: {e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<LinkError> for Error {
    fn from(e: LinkError) -> Self {
        Error::Link(e)
    }
}

/// How long an allocation may wait for blocks to free up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait {
    /// Fail immediately with [`Error::OutOfSpace`] when no run is free.
    NoWait,
    /// Wait at most this long, then fail with [`Error::Timeout`].
    Timeout(Duration),
    /// Wait until blocks free up.
    Forever,
}

impl Wait {
    pub(crate) fn deadline(self) -> Option<Instant> {
        match self {
            Wait::Timeout(d) => Some(Instant::now() + d),
            Wait::NoWait | Wait::Forever => None,
        }
    }
}
