//! The link layer dispatcher.
//!
//! [`LinkLayer`] owns every component and drives them from one timer queue
//! on a virtual clock. Nothing here blocks: the embedding advances time with
//! [`LinkLayer::advance_to`], feeds RDC completions through
//! [`LinkLayer::rdc_completed`] and received frames through
//! [`LinkLayer::input`], and collects the terminal outcome of each accepted
//! send from [`LinkLayer::drain_reports`].
//!
//! ```text
//!   upper layer ── send ──▶ Csma ── send_list ──▶ Rdc
//!        ▲                   ▲                     │
//!   SendReport ◀─────────────┴──── rdc_completed ◀─┘ (also feeds LinkStatsTable)
//!
//!   Rdc ── input ──▶ LinkStatsTable, AntiReplay, UPDATE/UPDATEACK handling
//!   Liveness ── UPDATE ──▶ Csma
//! ```

use crate::addr::LinkAddr;
use crate::anti_replay::{self, AntiReplay};
use crate::config::LinkConfig;
use crate::csma::{Backoff, Completed, Csma, CsmaStats, QueueState};
use crate::error::{ConfigError, SendError};
use crate::link_stats::{LinkStats, LinkStatsTable};
use crate::liveness::{Liveness, LivenessAction, LivenessState, LivenessStats};
use crate::neighbor::{NeighborTable, SecuredNeighborTable};
use crate::packetbuf::{FRAME_TYPE_CMD, PacketAddr, PacketAttr, PacketBuf};
use crate::rdc::{QueueId, Rdc, TxStatus};
use crate::time::{TimerQueue, Timestamp};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::VecDeque;
use tracing::{debug, trace, warn};

/// Command frame identifier of an UPDATE
pub const CMD_UPDATE: u8 = 0x0E;

/// Command frame identifier of an UPDATEACK
pub const CMD_UPDATEACK: u8 = 0x0F;

/// Security level stamped by [`LinkLayer::send_secured`] when none is set
/// (802.15.4 ENC-MIC-32)
pub const DEFAULT_SECURITY_LEVEL: u16 = 5;

const SUPPRESSED_COMMAND_LEN: usize = 1 + 4 + 4;

/// Identifies an accepted send in its [`SendReport`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SendTicket(u64);

/// Terminal outcome of an accepted send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReport {
    /// Ticket returned by the send
    pub ticket: SendTicket,
    /// Link-layer receiver
    pub dest: LinkAddr,
    /// Final status
    pub status: TxStatus,
    /// Transmission attempts
    pub transmissions: u16,
}

// Not Clone: consumed exactly once when the packet is finalized.
#[derive(Debug)]
struct PendingReport(SendTicket);

impl PendingReport {
    fn complete(self, dest: LinkAddr, status: TxStatus, transmissions: u16) -> SendReport {
        SendReport {
            ticket: self.0,
            dest,
            status,
            transmissions,
        }
    }
}

#[derive(Debug)]
enum Origin {
    Upper(PendingReport),
    LivenessUpdate(LinkAddr),
    UpdateAck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Transmit(QueueId),
    LinkStatsAging,
    LivenessCheck,
    LivenessWait,
}

/// Link-layer command handled internally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Liveness challenge
    Update,
    /// Answer to a liveness challenge
    UpdateAck,
}

impl Command {
    fn from_id(id: u8) -> Option<Self> {
        match id {
            CMD_UPDATE => Some(Self::Update),
            CMD_UPDATEACK => Some(Self::UpdateAck),
            _ => None,
        }
    }

    fn id(self) -> u8 {
        match self {
            Self::Update => CMD_UPDATE,
            Self::UpdateAck => CMD_UPDATEACK,
        }
    }
}

/// Fate of a received frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputVerdict {
    /// Pass the frame up
    Accepted,
    /// Frame counter not fresh; drop silently
    Replayed,
    /// Secured frame from a sender without an established session
    UnknownNeighbor,
    /// Frame too short for its type
    Malformed,
    /// Link-layer command consumed here
    Command(Command),
}

/// The link layer: packet buffer, scheduler, estimator, anti-replay and
/// liveness sweep behind one single-threaded dispatcher
pub struct LinkLayer<R: Rdc, T: NeighborTable = SecuredNeighborTable> {
    config: LinkConfig,
    now: Timestamp,
    timers: TimerQueue<Event>,
    rng: StdRng,
    packetbuf: PacketBuf,
    csma: Csma<Origin>,
    link_stats: LinkStatsTable,
    anti_replay: AntiReplay,
    liveness: Liveness,
    neighbors: T,
    rdc: R,
    reports: VecDeque<SendReport>,
    next_ticket: u64,
}

impl<R: Rdc> LinkLayer<R, SecuredNeighborTable> {
    /// Build a link layer with an in-memory neighbor table
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `config` fails validation.
    pub fn new(config: LinkConfig, rdc: R) -> Result<Self, ConfigError> {
        let table = SecuredNeighborTable::new(config.neighbor_table_size);
        Self::with_neighbor_table(config, rdc, table)
    }
}

impl<R: Rdc, T: NeighborTable> LinkLayer<R, T> {
    /// Build a link layer on top of an existing neighbor table.
    ///
    /// All pools are sized here. The clock starts at [`Timestamp::ZERO`]
    /// with the link stats aging and liveness check timers armed.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `config` fails validation.
    pub fn with_neighbor_table(config: LinkConfig, rdc: R, neighbors: T) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut rng = config
            .rng_seed
            .map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        let liveness = Liveness::new(config.liveness.clone());
        let link_stats = LinkStatsTable::new(config.link_stats.clone(), config.neighbor_table_size);

        let mut timers = TimerQueue::new();
        timers.schedule(Timestamp::ZERO + link_stats.half_life(), Event::LinkStatsAging);
        timers.schedule(
            Timestamp::ZERO + liveness.check_delay(&mut rng),
            Event::LivenessCheck,
        );

        debug!(
            neighbor_queues = config.csma.max_neighbor_queues,
            queued_packets = config.csma.max_queued_packets,
            suppression = config.anti_replay.with_suppression,
            "link layer initialized"
        );
        Ok(Self {
            csma: Csma::new(config.csma.clone()),
            anti_replay: AntiReplay::new(config.anti_replay.with_suppression),
            config,
            now: Timestamp::ZERO,
            timers,
            rng,
            packetbuf: PacketBuf::new(),
            link_stats,
            liveness,
            neighbors,
            rdc,
            reports: VecDeque::new(),
            next_ticket: 0,
        })
    }

    /// Current time
    #[must_use]
    pub fn now(&self) -> Timestamp {
        self.now
    }

    /// Earliest pending timer
    #[must_use]
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.timers.next_deadline()
    }

    /// Run every timer due up to `t`, in deadline order, then move the clock
    /// to `t`. Time never goes backwards.
    pub fn advance_to(&mut self, t: Timestamp) {
        while let Some((deadline, event)) = self.timers.pop_due(t) {
            self.now = self.now.max(deadline);
            self.dispatch(event);
        }
        self.now = self.now.max(t);
    }

    /// Run timers that are already due
    pub fn poll(&mut self) {
        self.advance_to(self.now);
    }

    fn dispatch(&mut self, event: Event) {
        trace!(?event, now = self.now.as_micros(), "dispatch");
        match event {
            Event::Transmit(queue) => self.csma.transmit(queue, &mut self.rdc),
            Event::LinkStatsAging => {
                self.link_stats.age();
                self.timers
                    .schedule(self.now + self.link_stats.half_life(), Event::LinkStatsAging);
            }
            Event::LivenessCheck => {
                let action = self
                    .liveness
                    .on_check_timer(&self.neighbors, self.now, &mut self.rng);
                self.run_liveness(action);
            }
            Event::LivenessWait => {
                let action = self
                    .liveness
                    .on_wait_timer(&mut self.neighbors, self.now, &mut self.rng);
                self.run_liveness(action);
            }
        }
    }

    fn run_liveness(&mut self, mut action: LivenessAction) {
        loop {
            match action {
                LivenessAction::None => return,
                LivenessAction::ArmCheck(delay) => {
                    self.timers.schedule(self.now + delay, Event::LivenessCheck);
                    return;
                }
                LivenessAction::ArmWait(delay) => {
                    self.timers.schedule(self.now + delay, Event::LivenessWait);
                    return;
                }
                LivenessAction::SendUpdate(addr) => {
                    match self.send_command(Command::Update, addr, Origin::LivenessUpdate(addr)) {
                        Ok(()) => return,
                        Err(e) => {
                            warn!(neighbor = %addr, error = %e, "liveness: UPDATE rejected");
                            action = self.liveness.on_update_sent(
                                addr,
                                TxStatus::Err,
                                &self.neighbors,
                                self.now,
                                &mut self.rng,
                            );
                        }
                    }
                }
            }
        }
    }

    fn schedule_backoff(&mut self, backoff: Backoff) {
        self.timers
            .schedule(self.now + backoff.delay, Event::Transmit(backoff.queue));
    }

    fn enqueue(&mut self, max_transmissions: Option<u16>, origin: Origin) -> Result<(), SendError> {
        let check_interval = self.rdc.channel_check_interval();
        let backoff = self.csma.send(
            &mut self.packetbuf,
            max_transmissions,
            origin,
            &mut self.rng,
            check_interval,
        )?;
        if let Some(backoff) = backoff {
            self.schedule_backoff(backoff);
        }
        Ok(())
    }

    fn ticket(&mut self) -> SendTicket {
        self.next_ticket += 1;
        SendTicket(self.next_ticket)
    }

    /// Queue the staged packet for `dest`.
    ///
    /// `max_transmissions` overrides the packet's own limit. An accepted
    /// packet produces exactly one [`SendReport`] carrying the returned
    /// ticket; a rejected one produces none.
    ///
    /// # Errors
    ///
    /// See [`SendError`]; every variant leaves existing queues untouched.
    pub fn send(&mut self, dest: LinkAddr, max_transmissions: Option<u16>) -> Result<SendTicket, SendError> {
        self.packetbuf.set_addr(PacketAddr::Receiver, dest);
        let ticket = self.ticket();
        self.enqueue(max_transmissions, Origin::Upper(PendingReport(ticket)))?;
        Ok(ticket)
    }

    /// Stamp the next frame counter onto the staged packet, then queue it
    /// like [`LinkLayer::send`].
    ///
    /// # Errors
    ///
    /// [`SendError::Security`] if the counter is exhausted or (suppression
    /// mode) the unicast receiver has no session; otherwise as
    /// [`LinkLayer::send`]. Resource errors are detected before the counter
    /// is stamped, so a rejected send consumes no counter value.
    pub fn send_secured(
        &mut self,
        dest: LinkAddr,
        max_transmissions: Option<u16>,
    ) -> Result<SendTicket, SendError> {
        self.packetbuf.set_addr(PacketAddr::Receiver, dest);
        self.csma.admit(dest)?;
        self.stamp_counter(dest)?;
        self.send(dest, max_transmissions)
    }

    fn stamp_counter(&mut self, dest: LinkAddr) -> Result<(), SendError> {
        if self.packetbuf.attr(PacketAttr::SecurityLevel) == 0 {
            self.packetbuf
                .set_attr(PacketAttr::SecurityLevel, DEFAULT_SECURITY_LEVEL);
        }
        let info = if dest.is_null() {
            None
        } else {
            self.neighbors.get_mut(&dest).map(|n| &mut n.anti_replay)
        };
        self.anti_replay.set_counter(&mut self.packetbuf, info)?;
        self.anti_replay.suppress_counter(&mut self.packetbuf);
        Ok(())
    }

    fn send_command(&mut self, command: Command, dest: LinkAddr, origin: Origin) -> Result<(), SendError> {
        self.packetbuf.clear();
        self.packetbuf.set_addr(PacketAddr::Receiver, dest);
        self.packetbuf.set_attr(PacketAttr::FrameType, FRAME_TYPE_CMD);
        if command == Command::Update {
            self.packetbuf.set_attr(
                PacketAttr::MaxMacTransmissions,
                self.liveness.config().update_max_transmissions(),
            );
        }
        self.csma.admit(dest)?;
        self.stamp_counter(dest)?;

        let mut payload = [0u8; SUPPRESSED_COMMAND_LEN];
        payload[0] = command.id();
        let len = if self.anti_replay.with_suppression() {
            payload[1..5].copy_from_slice(&anti_replay::write_counter(&self.packetbuf));
            payload[5..9].copy_from_slice(&self.anti_replay.broadcast_counter().to_be_bytes());
            SUPPRESSED_COMMAND_LEN
        } else {
            1
        };
        self.packetbuf.write_payload(&payload[..len])?;
        debug!(neighbor = %dest, ?command, "sending command");
        self.enqueue(None, origin)
    }

    /// Report the outcome of the last `send_list` for `queue`.
    ///
    /// Link statistics see the outcome first; the scheduler then retries,
    /// finalizes or ignores it. Completions for queues that are not
    /// transmitting are dropped.
    pub fn rdc_completed(&mut self, queue: QueueId, status: TxStatus, num_tx: u16) {
        let Some(dest) = self.csma.in_flight(queue) else {
            warn!(?queue, %status, "stale RDC completion dropped");
            return;
        };
        self.link_stats.packet_sent(dest, status, num_tx, self.now);

        let check_interval = self.rdc.channel_check_interval();
        let outcome = self
            .csma
            .on_completion(queue, status, num_tx, &mut self.rng, check_interval);
        if let Some(backoff) = outcome.backoff {
            self.schedule_backoff(backoff);
        }
        if let Some(completed) = outcome.completed {
            self.complete(completed);
        }
    }

    fn complete(&mut self, completed: Completed<Origin>) {
        let Completed {
            ctx,
            dest,
            status,
            transmissions,
        } = completed;
        match ctx {
            Origin::Upper(pending) => {
                let report = pending.complete(dest, status, transmissions);
                trace!(ticket = ?report.ticket, neighbor = %dest, %status, transmissions, "send completed");
                self.reports.push_back(report);
            }
            Origin::LivenessUpdate(addr) => {
                let action = self.liveness.on_update_sent(
                    addr,
                    status,
                    &self.neighbors,
                    self.now,
                    &mut self.rng,
                );
                self.run_liveness(action);
            }
            Origin::UpdateAck => {
                trace!(neighbor = %dest, %status, "UPDATEACK completed");
            }
        }
    }

    /// Process the frame staged in the packet buffer.
    ///
    /// The sender's RSSI feeds link statistics, secured frames pass
    /// anti-replay, and UPDATE/UPDATEACK commands are consumed here.
    pub fn input(&mut self) -> InputVerdict {
        let sender = self.packetbuf.addr(PacketAddr::Sender);
        #[allow(clippy::cast_possible_wrap)]
        let rssi = self.packetbuf.attr(PacketAttr::Rssi) as i16;
        self.link_stats.packet_input(sender, rssi);

        if self.packetbuf.attr(PacketAttr::FrameType) == FRAME_TYPE_CMD {
            if let Some(command) = self.packetbuf.payload().first().copied().and_then(Command::from_id) {
                return self.on_command(command, sender);
            }
        }

        if self.packetbuf.attr(PacketAttr::SecurityLevel) == 0 {
            return InputVerdict::Accepted;
        }
        let Some(neighbor) = self.neighbors.get_mut(&sender).filter(|n| n.permanent) else {
            debug!(neighbor = %sender, "secured frame from unknown neighbor");
            return InputVerdict::UnknownNeighbor;
        };
        if self.anti_replay.with_suppression() {
            self.anti_replay
                .restore_counter(&mut self.packetbuf, &neighbor.anti_replay);
        }
        if self
            .anti_replay
            .was_replayed(&self.packetbuf, &mut neighbor.anti_replay)
        {
            return InputVerdict::Replayed;
        }
        InputVerdict::Accepted
    }

    fn on_command(&mut self, command: Command, sender: LinkAddr) -> InputVerdict {
        let suppression = self.anti_replay.with_suppression();
        if suppression && self.packetbuf.payload_len() < SUPPRESSED_COMMAND_LEN {
            warn!(neighbor = %sender, ?command, "truncated command");
            return InputVerdict::Malformed;
        }
        let Some(neighbor) = self.neighbors.get_mut(&sender).filter(|n| n.permanent) else {
            warn!(neighbor = %sender, ?command, "command from unknown neighbor");
            return InputVerdict::UnknownNeighbor;
        };

        let mut broadcast_counter = None;
        if suppression {
            let payload = self.packetbuf.payload();
            let mut counter = [0u8; 4];
            counter.copy_from_slice(&payload[1..5]);
            let mut broadcast = [0u8; 4];
            broadcast.copy_from_slice(&payload[5..9]);
            broadcast_counter = Some(u32::from_be_bytes(broadcast));
            anti_replay::parse_counter(&mut self.packetbuf, counter);
        }
        if self
            .anti_replay
            .was_replayed(&self.packetbuf, &mut neighbor.anti_replay)
        {
            return InputVerdict::Replayed;
        }

        neighbor.prolong(self.now, self.liveness.config().neighbor_lifetime());
        if let Some(counter) = broadcast_counter {
            neighbor.anti_replay.last_broadcast_counter = counter;
        }
        debug!(neighbor = %sender, ?command, "neighbor refreshed");

        if command == Command::Update {
            if let Err(e) = self.send_command(Command::UpdateAck, sender, Origin::UpdateAck) {
                warn!(neighbor = %sender, error = %e, "UPDATEACK rejected");
            }
        }
        InputVerdict::Command(command)
    }

    /// Seed the anti-replay state of `addr` from the staged frame's counter.
    ///
    /// Returns `false` if `addr` is not in the neighbor table.
    pub fn init_anti_replay(&mut self, addr: &LinkAddr) -> bool {
        match self.neighbors.get_mut(addr) {
            Some(neighbor) => {
                self.anti_replay
                    .init_info(&self.packetbuf, &mut neighbor.anti_replay);
                true
            }
            None => false,
        }
    }

    /// Pop every pending send report, oldest first
    pub fn drain_reports(&mut self) -> impl Iterator<Item = SendReport> + '_ {
        self.reports.drain(..)
    }

    /// Pop the oldest pending send report
    pub fn poll_report(&mut self) -> Option<SendReport> {
        self.reports.pop_front()
    }

    /// The packet buffer
    #[must_use]
    pub fn packetbuf(&self) -> &PacketBuf {
        &self.packetbuf
    }

    /// The packet buffer, for composing or staging a frame
    pub fn packetbuf_mut(&mut self) -> &mut PacketBuf {
        &mut self.packetbuf
    }

    /// Link statistics of `addr`
    #[must_use]
    pub fn link_stats_from_addr(&self, addr: &LinkAddr) -> Option<LinkStats> {
        self.link_stats.get(addr).copied()
    }

    /// Check if the estimate of `addr` is fresh
    #[must_use]
    pub fn link_stats_is_fresh(&self, addr: &LinkAddr) -> bool {
        self.link_stats
            .get(addr)
            .is_some_and(|stats| self.link_stats.is_fresh(stats, self.now))
    }

    /// Forget all link statistics
    pub fn reset_link_stats(&mut self) {
        self.link_stats.reset();
    }

    /// Packets queued for `addr`
    #[must_use]
    pub fn queued_packets(&self, addr: LinkAddr) -> usize {
        self.csma.queued_packets(addr)
    }

    /// Scheduling state of the queue for `addr`
    #[must_use]
    pub fn queue_state(&self, addr: LinkAddr) -> Option<QueueState> {
        self.csma.queue_state(addr)
    }

    /// Live neighbor queues
    #[must_use]
    pub fn neighbor_queue_count(&self) -> usize {
        self.csma.neighbor_queue_count()
    }

    /// Scheduler counters
    #[must_use]
    pub fn csma_stats(&self) -> &CsmaStats {
        self.csma.stats()
    }

    /// Liveness sweep state
    #[must_use]
    pub fn liveness_state(&self) -> LivenessState {
        self.liveness.state()
    }

    /// Liveness sweep counters
    #[must_use]
    pub fn liveness_stats(&self) -> &LivenessStats {
        self.liveness.stats()
    }

    /// Frame counter state
    #[must_use]
    pub fn anti_replay(&self) -> &AntiReplay {
        &self.anti_replay
    }

    /// The neighbor table
    #[must_use]
    pub fn neighbors(&self) -> &T {
        &self.neighbors
    }

    /// The neighbor table, mutably
    pub fn neighbors_mut(&mut self) -> &mut T {
        &mut self.neighbors
    }

    /// The RDC collaborator
    #[must_use]
    pub fn rdc(&self) -> &R {
        &self.rdc
    }

    /// The RDC collaborator, mutably
    pub fn rdc_mut(&mut self) -> &mut R {
        &mut self.rdc
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }
}
