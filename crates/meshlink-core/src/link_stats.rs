//! Link quality estimation.
//!
//! Tracks per-neighbor ETX and RSSI as exponentially weighted moving averages
//! in integer fixed point. ETX is scaled by [`ETX_DIVISOR`]; EWMA weights are
//! expressed out of [`EWMA_SCALE`].
//!
//! A freshness counter gates how much weight a new sample gets: while the
//! estimate is not fresh the larger bootstrap alpha applies so that a new
//! link converges quickly. Freshness saturates at the configured maximum and
//! is halved on every aging tick.

use crate::addr::LinkAddr;
use crate::config::LinkStatsConfig;
use crate::rdc::TxStatus;
use crate::time::Timestamp;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, trace};

/// Fixed-point scale of ETX values
pub const ETX_DIVISOR: u16 = 128;

/// ETX assumed for a link with no information
pub const ETX_INIT: u16 = 2;

/// Upper bound of an RSSI-derived initial ETX
pub const ETX_INIT_MAX: u16 = 3;

/// Transmission count charged for a NOACK
pub const ETX_NOACK_PENALTY: u16 = 10;

/// Scale of EWMA weights
pub const EWMA_SCALE: u16 = 100;

/// Steady-state EWMA weight
pub const EWMA_ALPHA: u16 = 15;

/// EWMA weight while an estimate is not fresh
pub const EWMA_BOOTSTRAP_ALPHA: u16 = 30;

/// Freshness needed before an estimate is trusted
pub const FRESHNESS_TARGET: u8 = 4;

/// Saturation value of the freshness counter
pub const FRESHNESS_MAX: u8 = 16;

/// Freshness halving interval
pub const FRESHNESS_HALF_LIFE: Duration = Duration::from_secs(15 * 60);

/// An estimate not updated for this long is never fresh
pub const FRESHNESS_EXPIRATION_TIME: Duration = Duration::from_secs(10 * 60);

/// RSSI at or above which a link is assumed loss free (dBm)
pub const RSSI_HIGH: i16 = -60;

/// RSSI at or below which a link is assumed dead (dBm)
pub const RSSI_LOW: i16 = -90;

const RSSI_DIFF: i32 = (RSSI_HIGH - RSSI_LOW) as i32;

/// Link statistics of one neighbor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkStats {
    /// ETX scaled by [`ETX_DIVISOR`]
    pub etx: u16,
    /// RSSI moving average (dBm)
    pub rssi: i16,
    /// Saturating freshness counter
    pub freshness: u8,
    /// Last transmission that updated the estimate
    pub last_tx_time: Option<Timestamp>,
    /// Transmission attempts
    pub tx_count: u32,
    /// Acknowledged transmissions
    pub ack_count: u32,
    /// Received packets
    pub rx_count: u32,
}

impl LinkStats {
    /// ETX as a floating point transmission count, for display
    #[must_use]
    pub fn etx_f32(&self) -> f32 {
        f32::from(self.etx) / f32::from(ETX_DIVISOR)
    }
}

/// Initial ETX guess derived from the RSSI of the first received packet.
///
/// PRR is taken to grow linearly from 0 at [`RSSI_LOW`] to 1 at
/// [`RSSI_HIGH`]; the result is capped at [`ETX_INIT_MAX`]. Without an RSSI
/// sample the guess is [`ETX_INIT`].
#[must_use]
pub fn guess_etx_from_rssi(stats: &LinkStats) -> u16 {
    if stats.rssi == 0 {
        return ETX_INIT * ETX_DIVISOR;
    }
    let bounded = i32::from(stats.rssi.clamp(RSSI_LOW + 1, RSSI_HIGH));
    let etx = RSSI_DIFF * i32::from(ETX_DIVISOR) / (bounded - i32::from(RSSI_LOW));
    let capped = etx.min(i32::from(ETX_INIT_MAX * ETX_DIVISOR));
    u16::try_from(capped).unwrap_or(ETX_INIT_MAX * ETX_DIVISOR)
}

#[allow(clippy::cast_possible_truncation)]
fn ewma_u16(old: u16, sample: u16, alpha: u16) -> u16 {
    let scale = u32::from(EWMA_SCALE);
    let alpha = u32::from(alpha);
    ((u32::from(old) * (scale - alpha) + u32::from(sample) * alpha) / scale) as u16
}

#[allow(clippy::cast_possible_truncation)]
fn ewma_i16(old: i16, sample: i16, alpha: u16) -> i16 {
    let scale = i32::from(EWMA_SCALE);
    let alpha = i32::from(alpha);
    ((i32::from(old) * (scale - alpha) + i32::from(sample) * alpha) / scale) as i16
}

/// Per-neighbor link statistics table
#[derive(Debug)]
pub struct LinkStatsTable {
    config: LinkStatsConfig,
    entries: HashMap<LinkAddr, LinkStats>,
    capacity: usize,
}

impl LinkStatsTable {
    /// Create a table holding at most `capacity` neighbors
    #[must_use]
    pub fn new(config: LinkStatsConfig, capacity: usize) -> Self {
        Self {
            config,
            entries: HashMap::with_capacity(capacity),
            capacity,
        }
    }

    /// Statistics of `addr`
    #[must_use]
    pub fn get(&self, addr: &LinkAddr) -> Option<&LinkStats> {
        self.entries.get(addr)
    }

    /// Check if the estimate was updated recently and often enough
    #[must_use]
    pub fn is_fresh(&self, stats: &LinkStats, now: Timestamp) -> bool {
        stats.last_tx_time.is_some_and(|last| {
            now.saturating_duration_since(last) < self.config.freshness_expiration()
        }) && stats.freshness >= self.config.freshness_target
    }

    fn entry(&mut self, addr: LinkAddr) -> Option<(&mut LinkStats, bool)> {
        if self.entries.contains_key(&addr) {
            return self.entries.get_mut(&addr).map(|s| (s, false));
        }
        if self.entries.len() >= self.capacity {
            debug!(neighbor = %addr, capacity = self.capacity, "link-stats: table full");
            return None;
        }
        Some((self.entries.entry(addr).or_default(), true))
    }

    /// Fold a transmission outcome into the estimate of `addr`.
    ///
    /// Only OK and NOACK outcomes carry link quality information; anything
    /// else (collisions included) is ignored.
    pub fn packet_sent(&mut self, addr: LinkAddr, status: TxStatus, num_tx: u16, now: Timestamp) {
        if !status.feeds_link_stats() || addr.is_null() {
            return;
        }
        let freshness_max = self.config.freshness_max;
        let noack_penalty = self.config.noack_penalty;
        let Some((stats, created)) = self.entry(addr) else {
            return;
        };
        if created {
            stats.etx = guess_etx_from_rssi(stats);
        }

        stats.last_tx_time = Some(now);
        let added = u8::try_from(num_tx).unwrap_or(u8::MAX);
        stats.freshness = stats.freshness.saturating_add(added).min(freshness_max);
        stats.tx_count = stats.tx_count.saturating_add(u32::from(num_tx));
        if status == TxStatus::Ok {
            stats.ack_count = stats.ack_count.saturating_add(1);
        }

        let packet_etx = if status == TxStatus::NoAck {
            noack_penalty
        } else {
            num_tx
        }
        .saturating_mul(ETX_DIVISOR);

        let stats = *stats;
        let alpha = if self.is_fresh(&stats, now) {
            self.config.alpha
        } else {
            self.config.bootstrap_alpha
        };
        let etx = ewma_u16(stats.etx, packet_etx, alpha);
        if let Some(entry) = self.entries.get_mut(&addr) {
            entry.etx = etx;
        }
        trace!(neighbor = %addr, %status, num_tx, etx, alpha, "link-stats: packet sent");
    }

    /// Fold the RSSI of a received packet into the estimate of `addr`
    pub fn packet_input(&mut self, addr: LinkAddr, rssi: i16) {
        if addr.is_null() {
            return;
        }
        let alpha = self.config.alpha;
        let Some((stats, created)) = self.entry(addr) else {
            return;
        };
        stats.rx_count = stats.rx_count.saturating_add(1);
        if created {
            stats.rssi = rssi;
            stats.etx = guess_etx_from_rssi(stats);
        } else {
            stats.rssi = ewma_i16(stats.rssi, rssi, alpha);
        }
        trace!(neighbor = %addr, rssi, avg = stats.rssi, "link-stats: packet received");
    }

    /// Halve every freshness counter
    pub fn age(&mut self) {
        for stats in self.entries.values_mut() {
            stats.freshness /= 2;
        }
        trace!(neighbors = self.entries.len(), "link-stats: aged");
    }

    /// Forget every neighbor
    pub fn reset(&mut self) {
        self.entries.clear();
        debug!("link-stats: reset");
    }

    /// Number of tracked neighbors
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no neighbor is tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Aging interval
    #[must_use]
    pub fn half_life(&self) -> Duration {
        self.config.freshness_half_life()
    }
}
