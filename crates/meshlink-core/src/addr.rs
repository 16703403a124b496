//! Link-layer addresses.
//!
//! Nodes are identified by IEEE 802.15.4 extended (EUI-64) addresses. The
//! all-zero address is reserved: as a receiver it denotes a broadcast frame.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Link address size in bytes
pub const LINKADDR_SIZE: usize = 8;

/// Link-layer address of a neighbor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct LinkAddr([u8; LINKADDR_SIZE]);

impl LinkAddr {
    /// Reserved null address (broadcast receiver, unset sender)
    pub const NULL: Self = Self([0u8; LINKADDR_SIZE]);

    /// Create an address from raw bytes
    #[must_use]
    pub const fn new(bytes: [u8; LINKADDR_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create an address whose last two bytes carry `id` (big-endian).
    ///
    /// Convenient for short node numbering in simulations and tests.
    #[must_use]
    pub const fn from_short(id: u16) -> Self {
        let id = id.to_be_bytes();
        Self([0, 0, 0, 0, 0, 0, id[0], id[1]])
    }

    /// Raw address bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; LINKADDR_SIZE] {
        &self.0
    }

    /// Check if this is the reserved null address
    #[must_use]
    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

impl From<[u8; LINKADDR_SIZE]> for LinkAddr {
    fn from(bytes: [u8; LINKADDR_SIZE]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for LinkAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}
