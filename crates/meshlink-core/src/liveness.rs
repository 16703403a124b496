//! Liveness sweep over secured neighbors.
//!
//! Permanent neighbors whose session expired are challenged with an UPDATE
//! command. A neighbor that does not refresh itself (by sending an UPDATE or
//! UPDATEACK of its own) within the waiting period loses its security state.
//!
//! The sweep is a single global state machine:
//!
//! ```text
//! Idle ──check timer──▶ Scanning ──candidate──▶ WaitingSend ──sent──▶ WaitingAck
//!  ▲                      │  ▲                      │ send failed        │ wait timer
//!  └──── no candidates ───┘  └──────────────────────┴────────────────────┘
//! ```
//!
//! An UPDATE that went on air counts as sent even without a link-layer ACK:
//! a neighbor that powered off never acknowledges, and it must still be
//! deleted once the waiting period runs out.
//!
//! Candidates are remembered by address only and re-resolved at every step,
//! since other paths may refresh or delete a neighbor while the sweep waits.
//! Each transition returns a [`LivenessAction`] for the owner to carry out.

use crate::addr::LinkAddr;
use crate::config::LivenessConfig;
use crate::neighbor::NeighborTable;
use crate::rdc::TxStatus;
use crate::time::Timestamp;
use rand::Rng;
use rand_core::RngCore;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Base period between sweeps
pub const UPDATE_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Upper bound of the random delay added to each sweep period
pub const UPDATE_CHECK_JITTER: Duration = Duration::from_secs(30);

/// Time a challenged neighbor has to refresh itself
pub const UPDATEACK_WAITING_PERIOD: Duration = Duration::from_secs(15);

/// Retransmissions of an UPDATE command
pub const MAX_RETRANSMISSIONS: u8 = 2;

/// Session extension granted by an UPDATE or UPDATEACK
pub const NEIGHBOR_LIFETIME: Duration = Duration::from_secs(5 * 60);

/// Sweep state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessState {
    /// Waiting for the next sweep
    Idle,
    /// Looking for the next candidate
    Scanning,
    /// UPDATE handed to the scheduler
    WaitingSend(LinkAddr),
    /// UPDATE sent, waiting for the neighbor to refresh
    WaitingAck(LinkAddr),
}

/// What the owner of the sweep has to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessAction {
    /// Nothing
    None,
    /// Send an UPDATE to the neighbor and report the outcome through
    /// [`Liveness::on_update_sent`]
    SendUpdate(LinkAddr),
    /// Call [`Liveness::on_check_timer`] after the delay
    ArmCheck(Duration),
    /// Call [`Liveness::on_wait_timer`] after the delay
    ArmWait(Duration),
}

/// Sweep counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LivenessStats {
    /// Sweeps started
    pub sweeps: u64,
    /// UPDATE commands that went on air, acknowledged or not
    pub updates_sent: u64,
    /// UPDATE commands that never went on air
    pub updates_failed: u64,
    /// Challenged neighbors that refreshed in time
    pub refreshed: u64,
    /// Neighbors deleted
    pub deleted: u64,
}

/// The liveness sweep
#[derive(Debug)]
pub struct Liveness {
    config: LivenessConfig,
    state: LivenessState,
    candidates: VecDeque<LinkAddr>,
    stats: LivenessStats,
}

impl Liveness {
    /// Create an idle sweep
    #[must_use]
    pub fn new(config: LivenessConfig) -> Self {
        Self {
            config,
            state: LivenessState::Idle,
            candidates: VecDeque::new(),
            stats: LivenessStats::default(),
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> LivenessState {
        self.state
    }

    /// Sweep counters
    #[must_use]
    pub fn stats(&self) -> &LivenessStats {
        &self.stats
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &LivenessConfig {
        &self.config
    }

    /// Delay until the next sweep: the base interval plus random jitter
    pub fn check_delay<R: RngCore + ?Sized>(&self, rng: &mut R) -> Duration {
        let jitter_us = u64::try_from(self.config.update_check_jitter().as_micros()).unwrap_or(0);
        let jitter = if jitter_us == 0 {
            0
        } else {
            rng.gen_range(0..=jitter_us)
        };
        self.config.update_check_interval() + Duration::from_micros(jitter)
    }

    /// Start a sweep (check timer fired)
    pub fn on_check_timer<T, R>(&mut self, table: &T, now: Timestamp, rng: &mut R) -> LivenessAction
    where
        T: NeighborTable + ?Sized,
        R: RngCore + ?Sized,
    {
        if self.state != LivenessState::Idle {
            warn!(state = ?self.state, "liveness: check timer fired mid-sweep");
            return LivenessAction::None;
        }
        self.candidates.clear();
        self.candidates.extend(
            table
                .addresses()
                .into_iter()
                .filter(|addr| is_candidate(table, addr, now)),
        );
        self.stats.sweeps += 1;
        self.state = LivenessState::Scanning;
        debug!(candidates = self.candidates.len(), "liveness: sweep started");
        self.next_candidate(table, now, rng)
    }

    /// Outcome of the UPDATE sent to `addr`
    pub fn on_update_sent<T, R>(
        &mut self,
        addr: LinkAddr,
        status: TxStatus,
        table: &T,
        now: Timestamp,
        rng: &mut R,
    ) -> LivenessAction
    where
        T: NeighborTable + ?Sized,
        R: RngCore + ?Sized,
    {
        if self.state != LivenessState::WaitingSend(addr) {
            warn!(neighbor = %addr, state = ?self.state, "liveness: unexpected UPDATE completion");
            return LivenessAction::None;
        }
        if matches!(status, TxStatus::Ok | TxStatus::NoAck) {
            self.stats.updates_sent += 1;
            self.state = LivenessState::WaitingAck(addr);
            debug!(neighbor = %addr, %status, "liveness: UPDATE sent, waiting for refresh");
            LivenessAction::ArmWait(self.config.updateack_waiting_period())
        } else {
            // Left untouched until the next sweep
            self.stats.updates_failed += 1;
            debug!(neighbor = %addr, %status, "liveness: UPDATE not sent");
            self.state = LivenessState::Scanning;
            self.next_candidate(table, now, rng)
        }
    }

    /// Waiting period after an UPDATE elapsed
    pub fn on_wait_timer<T, R>(&mut self, table: &mut T, now: Timestamp, rng: &mut R) -> LivenessAction
    where
        T: NeighborTable + ?Sized,
        R: RngCore + ?Sized,
    {
        let LivenessState::WaitingAck(addr) = self.state else {
            warn!(state = ?self.state, "liveness: wait timer fired outside WaitingAck");
            return LivenessAction::None;
        };
        if is_candidate(&*table, &addr, now) {
            table.remove(&addr);
            self.stats.deleted += 1;
            info!(neighbor = %addr, "liveness: deleted unresponsive neighbor");
        } else {
            self.stats.refreshed += 1;
            debug!(neighbor = %addr, "liveness: neighbor refreshed or gone");
        }
        self.state = LivenessState::Scanning;
        self.next_candidate(&*table, now, rng)
    }

    fn next_candidate<T, R>(&mut self, table: &T, now: Timestamp, rng: &mut R) -> LivenessAction
    where
        T: NeighborTable + ?Sized,
        R: RngCore + ?Sized,
    {
        while let Some(addr) = self.candidates.pop_front() {
            if is_candidate(table, &addr, now) {
                self.state = LivenessState::WaitingSend(addr);
                debug!(neighbor = %addr, "liveness: challenging neighbor");
                return LivenessAction::SendUpdate(addr);
            }
        }
        self.state = LivenessState::Idle;
        let delay = self.check_delay(rng);
        debug!(?delay, "liveness: sweep finished");
        LivenessAction::ArmCheck(delay)
    }
}

fn is_candidate<T: NeighborTable + ?Sized>(table: &T, addr: &LinkAddr, now: Timestamp) -> bool {
    table
        .get(addr)
        .is_some_and(|n| n.permanent && n.is_expired(now))
}
