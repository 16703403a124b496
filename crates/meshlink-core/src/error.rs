//! Error types for the meshlink link layer.
//!
//! Expected conditions (full pools, full queues, undersized buffers, counter
//! exhaustion) are reported through these values; none of them panics.
//! Transmission outcomes such as NOACK are not errors at all: they are
//! delivered asynchronously as a [`TxStatus`](crate::rdc::TxStatus).

use std::borrow::Cow;
use thiserror::Error;

/// Link layer errors
#[derive(Debug, Error)]
pub enum Error {
    /// Packet buffer error
    #[error("packet buffer error: {0}")]
    PacketBuf(#[from] PacketBufError),

    /// Send rejected
    #[error("send error: {0}")]
    Send(#[from] SendError),

    /// Frame counter error
    #[error("security error: {0}")]
    Security(#[from] SecurityError),

    /// Neighbor table error
    #[error("neighbor error: {0}")]
    Neighbor(#[from] NeighborError),

    /// Configuration error
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Packet buffer capacity errors.
///
/// All of these are detected before the buffer is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketBufError {
    /// Not enough room to grow the header
    #[error("header overflow: requested {requested} bytes, {available} available")]
    HeaderOverflow {
        /// Bytes requested
        requested: usize,
        /// Bytes still free in the buffer
        available: usize,
    },

    /// Tried to strip more header than present
    #[error("header underflow: requested {requested} bytes, header is {header_len}")]
    HeaderUnderflow {
        /// Bytes requested
        requested: usize,
        /// Current header length
        header_len: usize,
    },

    /// Tried to strip more payload than present
    #[error("payload underflow: requested {requested} bytes, payload is {payload_len}")]
    PayloadUnderflow {
        /// Bytes requested
        requested: usize,
        /// Current payload length
        payload_len: usize,
    },

    /// Payload length exceeds the remaining capacity
    #[error("payload overflow: {requested} bytes requested, {available} available")]
    PayloadOverflow {
        /// Payload length requested
        requested: usize,
        /// Bytes available for payload
        available: usize,
    },

    /// Destination slice cannot hold the assembled frame
    #[error("destination too small: need {needed} bytes, have {available}")]
    DestinationTooSmall {
        /// Bytes needed
        needed: usize,
        /// Bytes available in the destination
        available: usize,
    },
}

/// Reasons a send is rejected synchronously.
///
/// A rejected send never produces a completion report; an accepted one
/// always produces exactly one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// Every neighbor queue slot is in use
    #[error("neighbor queue pool exhausted")]
    NeighborPoolExhausted,

    /// The neighbor's queue already holds its maximum number of packets
    #[error("neighbor queue full ({max} packets)")]
    QueueFull {
        /// Per-neighbor packet limit
        max: usize,
    },

    /// Every queued-packet slot is in use
    #[error("queued packet pool exhausted")]
    PacketPoolExhausted,

    /// The frame counter cannot be advanced
    #[error("security error: {0}")]
    Security(#[from] SecurityError),

    /// The frame does not fit the packet buffer
    #[error("frame error: {0}")]
    Frame(#[from] PacketBufError),
}

impl SendError {
    /// Check if the rejection was caused by a fixed pool or queue limit
    #[must_use]
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(
            self,
            Self::NeighborPoolExhausted | Self::QueueFull { .. } | Self::PacketPoolExhausted
        )
    }

    /// Check if retrying later may succeed.
    ///
    /// Pools drain as transmissions complete; an exhausted frame counter
    /// never recovers.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.is_resource_exhaustion()
    }
}

/// Frame counter errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SecurityError {
    /// The next frame counter would hit the reserved all-ones value
    #[error("frame counter exhausted; refusing to originate secured frames")]
    CounterExhausted,

    /// No replay protection state for the receiver of a unicast frame
    #[error("no anti-replay state for receiver")]
    UnknownNeighbor,
}

/// Neighbor table errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NeighborError {
    /// No free slot for a new neighbor
    #[error("neighbor table full ({0} entries)")]
    TableFull(usize),
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Inconsistent configuration
    #[error("invalid configuration: {0}")]
    Invalid(Cow<'static, str>),

    /// Malformed configuration document
    #[error("failed to parse configuration: {0}")]
    Parse(String),

    /// Configuration file could not be read
    #[error("failed to read configuration: {0}")]
    Io(String),
}

/// Result type for link layer operations
pub type Result<T> = std::result::Result<T, Error>;
