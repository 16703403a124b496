//! Secured neighbor state.
//!
//! The key-establishment layer creates and owns secured neighbors; the link
//! layer only refreshes, checks and deletes them. [`NeighborTable`] is the
//! seam between the two, and [`SecuredNeighborTable`] is a bounded
//! in-memory implementation.

use crate::addr::LinkAddr;
use crate::anti_replay::AntiReplayInfo;
use crate::error::NeighborError;
use crate::time::Timestamp;
use std::time::Duration;
use tracing::debug;

/// Default neighbor table capacity
pub const DEFAULT_TABLE_SIZE: usize = 8;

/// Security state of one neighbor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecuredNeighbor {
    /// Session fully established (as opposed to tentative)
    pub permanent: bool,
    /// Point after which the session is considered stale
    pub expiration: Timestamp,
    /// Replay protection counters
    pub anti_replay: AntiReplayInfo,
}

impl SecuredNeighbor {
    /// Established neighbor expiring at `expiration`
    #[must_use]
    pub fn permanent(expiration: Timestamp) -> Self {
        Self {
            permanent: true,
            expiration,
            anti_replay: AntiReplayInfo::default(),
        }
    }

    /// Neighbor still in key establishment
    #[must_use]
    pub fn tentative(expiration: Timestamp) -> Self {
        Self {
            permanent: false,
            ..Self::permanent(expiration)
        }
    }

    /// Check if the session is past its expiry
    #[must_use]
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expiration
    }

    /// Extend the session to `now + lifetime`
    pub fn prolong(&mut self, now: Timestamp, lifetime: Duration) {
        self.expiration = now + lifetime;
    }
}

/// Lookup and deletion of secured neighbors by address
pub trait NeighborTable {
    /// Look up a neighbor
    fn get(&self, addr: &LinkAddr) -> Option<&SecuredNeighbor>;

    /// Look up a neighbor mutably
    fn get_mut(&mut self, addr: &LinkAddr) -> Option<&mut SecuredNeighbor>;

    /// Delete a neighbor's security state
    fn remove(&mut self, addr: &LinkAddr) -> Option<SecuredNeighbor>;

    /// Addresses of all current neighbors
    fn addresses(&self) -> Vec<LinkAddr>;
}

/// Bounded neighbor table
#[derive(Debug, Clone)]
pub struct SecuredNeighborTable {
    entries: Vec<(LinkAddr, SecuredNeighbor)>,
    capacity: usize,
}

impl SecuredNeighborTable {
    /// Create a table with room for `capacity` neighbors
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Add or replace a neighbor
    ///
    /// # Errors
    ///
    /// Returns [`NeighborError::TableFull`] if `addr` is new and the table
    /// is at capacity.
    pub fn insert(&mut self, addr: LinkAddr, neighbor: SecuredNeighbor) -> Result<(), NeighborError> {
        if let Some(entry) = self.get_mut(&addr) {
            *entry = neighbor;
            return Ok(());
        }
        if self.entries.len() >= self.capacity {
            return Err(NeighborError::TableFull(self.capacity));
        }
        debug!(neighbor = %addr, permanent = neighbor.permanent, "neighbor: added");
        self.entries.push((addr, neighbor));
        Ok(())
    }

    /// Number of neighbors
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of neighbors
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for SecuredNeighborTable {
    fn default() -> Self {
        Self::new(DEFAULT_TABLE_SIZE)
    }
}

impl NeighborTable for SecuredNeighborTable {
    fn get(&self, addr: &LinkAddr) -> Option<&SecuredNeighbor> {
        self.entries.iter().find(|(a, _)| a == addr).map(|(_, n)| n)
    }

    fn get_mut(&mut self, addr: &LinkAddr) -> Option<&mut SecuredNeighbor> {
        self.entries
            .iter_mut()
            .find(|(a, _)| a == addr)
            .map(|(_, n)| n)
    }

    fn remove(&mut self, addr: &LinkAddr) -> Option<SecuredNeighbor> {
        let index = self.entries.iter().position(|(a, _)| a == addr)?;
        Some(self.entries.swap_remove(index).1)
    }

    fn addresses(&self) -> Vec<LinkAddr> {
        self.entries.iter().map(|(a, _)| *a).collect()
    }
}
