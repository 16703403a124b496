//! Per-neighbor CSMA scheduler.
//!
//! Every outgoing packet lands in the FIFO of its link-layer receiver. Each
//! FIFO is drained one packet at a time with slotted exponential backoff:
//!
//! ```text
//!            send                  timer fired               completion
//!   Idle ───────────▶ BackoffScheduled ───────▶ Transmitting ────────────┐
//!    ▲                      ▲                                            │
//!    │ (queue destroyed)    └──────── retry / next head ─────────────────┤
//!    └───────────────────────────── queue drained ───────────────────────┘
//! ```
//!
//! Acknowledgment packets jump the queue so acks never wait behind data.
//! Every accepted packet yields exactly one [`Completed`] value.
//!
//! The scheduler does not own a clock; it hands [`Backoff`] requests to its
//! owner, which calls [`Csma::transmit`] once the delay has elapsed.

use crate::addr::LinkAddr;
use crate::config::CsmaConfig;
use crate::error::SendError;
use crate::packetbuf::{PACKET_TYPE_ACK, PacketAddr, PacketAttr, PacketBuf, Snapshot};
use crate::pool::{Handle, Pool};
use crate::rdc::{FrameList, QueueId, Rdc, TxStatus};
use rand::Rng;
use rand_core::RngCore;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Initial backoff exponent
pub const MIN_BE: u8 = 0;

/// Maximum backoff exponent
pub const MAX_BE: u8 = 4;

/// Collisions tolerated before a transmission attempt is charged
pub const MAX_BACKOFF: u8 = 5;

/// Retransmissions after the first attempt
pub const MAX_FRAME_RETRIES: u8 = 7;

/// Concurrent neighbor queues
pub const MAX_NEIGHBOR_QUEUES: usize = 2;

/// Packets queued per neighbor
pub const MAX_PACKET_PER_NEIGHBOR: usize = 8;

/// Packets queued in total
pub const MAX_QUEUED_PACKETS: usize = 8;

/// 802.15.4 unit backoff period (20 symbols at 62.5 ksym/s)
pub const FALLBACK_BACKOFF_PERIOD_US: u64 = 320;

/// Largest accepted backoff exponent
pub const MAX_BE_LIMIT: u8 = 16;

/// Scheduling state of a neighbor queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// No attempt pending
    Idle,
    /// Waiting for the backoff timer
    BackoffScheduled,
    /// Head handed to the RDC layer, completion pending
    Transmitting,
}

/// Request to call [`Csma::transmit`] for `queue` after `delay`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Queue to transmit from
    pub queue: QueueId,
    /// Delay before the attempt
    pub delay: Duration,
}

/// Terminal outcome of one packet
#[derive(Debug)]
pub struct Completed<C> {
    /// Completion context supplied with the packet
    pub ctx: C,
    /// Link-layer receiver
    pub dest: LinkAddr,
    /// Final status
    pub status: TxStatus,
    /// Transmission attempts charged to the packet
    pub transmissions: u16,
}

/// Result of feeding one RDC completion to the scheduler
#[derive(Debug)]
pub struct CompletionOutcome<C> {
    /// Set when the head packet was finalized
    pub completed: Option<Completed<C>>,
    /// Set when the queue needs another attempt (retry or next head)
    pub backoff: Option<Backoff>,
}

impl<C> Default for CompletionOutcome<C> {
    fn default() -> Self {
        Self {
            completed: None,
            backoff: None,
        }
    }
}

/// Scheduler counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CsmaStats {
    /// Packets accepted
    pub queued: u64,
    /// Packets finalized OK
    pub ok: u64,
    /// Packets finalized NOACK
    pub noack: u64,
    /// Packets finalized COLLISION
    pub collision: u64,
    /// Packets finalized with an RDC error
    pub error: u64,
    /// Sends rejected for lack of resources
    pub dropped: u64,
}

struct QueuedPacket<C> {
    snapshot: Snapshot,
    max_transmissions: u16,
    ctx: Option<C>,
}

// Borrowed view of a queue handed to the RDC layer
struct QueueFrames<'a, C> {
    packets: &'a Pool<QueuedPacket<C>>,
    order: &'a VecDeque<Handle>,
}

impl<C> FrameList for QueueFrames<'_, C> {
    fn len(&self) -> usize {
        self.order.len()
    }

    fn get(&self, index: usize) -> Option<&Snapshot> {
        let handle = *self.order.get(index)?;
        self.packets.get(handle).map(|p| &p.snapshot)
    }
}

#[derive(Debug)]
struct NeighborQueue {
    addr: LinkAddr,
    packets: VecDeque<Handle>,
    transmissions: u16,
    collisions: u8,
    state: QueueState,
}

/// Random backoff delay for a queue that has seen `collisions` collisions.
///
/// Uniform in `[0, (2^min(collisions, max_be) - 1) * period)`; zero when the
/// window is empty.
pub fn backoff_delay<R: RngCore + ?Sized>(
    rng: &mut R,
    collisions: u8,
    max_be: u8,
    period: Duration,
) -> Duration {
    let exponent = u32::from(collisions.min(max_be).min(MAX_BE_LIMIT));
    let slots = (1u64 << exponent) - 1;
    let period_us = u64::try_from(period.as_micros()).unwrap_or(u64::MAX);
    let window = slots.saturating_mul(period_us);
    if window == 0 {
        return Duration::ZERO;
    }
    Duration::from_micros(rng.gen_range(0..window))
}

/// The CSMA scheduler, generic over the completion context `C`
pub struct Csma<C> {
    config: CsmaConfig,
    queues: Pool<NeighborQueue>,
    packets: Pool<QueuedPacket<C>>,
    seqno: u8,
    stats: CsmaStats,
}

impl<C> Csma<C> {
    /// Create a scheduler with pools sized from `config`
    #[must_use]
    pub fn new(config: CsmaConfig) -> Self {
        let per_neighbor = config.max_packet_per_neighbor;
        let queues = Pool::with_capacity_and(config.max_neighbor_queues, || NeighborQueue {
            addr: LinkAddr::NULL,
            packets: VecDeque::with_capacity(per_neighbor),
            transmissions: 0,
            collisions: MIN_BE,
            state: QueueState::Idle,
        });
        let packets = Pool::with_capacity_and(config.max_queued_packets, || QueuedPacket {
            snapshot: Snapshot::new(),
            max_transmissions: 0,
            ctx: None,
        });
        Self {
            config,
            queues,
            packets,
            seqno: 0,
            stats: CsmaStats::default(),
        }
    }

    /// Queue the packet staged in `packetbuf`.
    ///
    /// The receiver address, ack flag and transmission limit are taken from
    /// the packet's attributes unless `max_transmissions` overrides the
    /// limit. A sequence number is assigned when none is set.
    ///
    /// Returns a backoff request when the packet's queue was idle.
    ///
    /// # Errors
    ///
    /// Fails before any state changes (sequence number included) when a pool
    /// or the neighbor's queue is full. A rejected packet never completes.
    /// The check is [`Csma::admit`].
    pub fn send<R: RngCore + ?Sized>(
        &mut self,
        packetbuf: &mut PacketBuf,
        max_transmissions: Option<u16>,
        ctx: C,
        rng: &mut R,
        check_interval: Option<Duration>,
    ) -> Result<Option<Backoff>, SendError> {
        let dest = packetbuf.addr(PacketAddr::Receiver);
        self.admit(dest)?;

        if packetbuf.attr(PacketAttr::MacSeqno) == 0 {
            self.seqno = self.seqno.wrapping_add(1);
            if self.seqno == 0 {
                self.seqno = 1;
            }
            packetbuf.set_attr(PacketAttr::MacSeqno, u16::from(self.seqno));
        }

        let max_transmissions = max_transmissions
            .filter(|&n| n > 0)
            .or_else(|| Some(packetbuf.attr(PacketAttr::MaxMacTransmissions)).filter(|&n| n > 0))
            .unwrap_or_else(|| self.config.default_max_transmissions());

        let (queue, created) = match self.find_queue(dest) {
            Some(handle) => (handle, false),
            None => {
                let min_be = self.config.min_be;
                let handle = self
                    .queues
                    .alloc_with(|q| {
                        q.addr = dest;
                        q.packets.clear();
                        q.transmissions = 0;
                        q.collisions = min_be;
                        q.state = QueueState::Idle;
                    })
                    .ok_or(SendError::NeighborPoolExhausted)?;
                debug!(neighbor = %dest, "csma: queue created");
                (handle, true)
            }
        };

        let Some(packet) = self.packets.alloc_with(|p| {
            p.snapshot.capture(packetbuf);
            p.max_transmissions = max_transmissions;
            p.ctx = Some(ctx);
        }) else {
            if created {
                self.queues.free(queue);
            }
            return Err(SendError::PacketPoolExhausted);
        };

        let is_ack = packetbuf.attr(PacketAttr::PacketType) == PACKET_TYPE_ACK;
        let Some(q) = self.queues.get_mut(queue) else {
            self.packets.free(packet);
            return Err(SendError::NeighborPoolExhausted);
        };
        if is_ack {
            // An in-flight head keeps its place; the ack goes right behind it
            let at = usize::from(q.state == QueueState::Transmitting).min(q.packets.len());
            q.packets.insert(at, packet);
        } else {
            q.packets.push_back(packet);
        }
        self.stats.queued += 1;
        trace!(
            neighbor = %dest,
            seqno = packetbuf.attr(PacketAttr::MacSeqno),
            max_transmissions,
            is_ack,
            queued = q.packets.len(),
            "csma: packet queued"
        );

        if q.state == QueueState::Idle {
            Ok(Some(self.schedule(queue, rng, check_interval)))
        } else {
            Ok(None)
        }
    }

    /// Check that a packet for `dest` would be accepted right now.
    ///
    /// Callers that stamp a packet before sending it (frame counters) check
    /// here first so that a rejected send consumes nothing. A refusal counts
    /// as a dropped send.
    ///
    /// # Errors
    ///
    /// The resource error [`Csma::send`] would fail with.
    pub fn admit(&mut self, dest: LinkAddr) -> Result<(), SendError> {
        let result = match self.find_queue(dest).and_then(|h| self.queues.get(h)) {
            Some(q) if q.packets.len() >= self.config.max_packet_per_neighbor => {
                Err(SendError::QueueFull {
                    max: self.config.max_packet_per_neighbor,
                })
            }
            None if self.queues.is_full() => Err(SendError::NeighborPoolExhausted),
            _ if self.packets.is_full() => Err(SendError::PacketPoolExhausted),
            _ => Ok(()),
        };
        if let Err(e) = &result {
            warn!(neighbor = %dest, error = %e, "csma: send rejected");
            self.stats.dropped += 1;
        }
        result
    }

    /// Hand the queue's frames to the RDC layer (backoff timer fired).
    ///
    /// Ignored unless the queue still exists and is waiting for its backoff.
    pub fn transmit<R: Rdc + ?Sized>(&mut self, queue: QueueId, rdc: &mut R) {
        let Some(q) = self.queues.get_mut(queue.0) else {
            warn!(?queue, "csma: backoff fired for a destroyed queue");
            return;
        };
        if q.state != QueueState::BackoffScheduled {
            warn!(?queue, state = ?q.state, "csma: unexpected backoff expiry");
            return;
        }
        q.state = QueueState::Transmitting;

        let Some(q) = self.queues.get(queue.0) else {
            return;
        };
        let frames = QueueFrames {
            packets: &self.packets,
            order: &q.packets,
        };
        trace!(
            neighbor = %q.addr,
            frames = frames.len(),
            transmissions = q.transmissions,
            "csma: transmitting"
        );
        rdc.send_list(queue, &frames);
    }

    /// Process the RDC outcome of the head packet of `queue`
    pub fn on_completion<R: RngCore + ?Sized>(
        &mut self,
        queue: QueueId,
        status: TxStatus,
        num_tx: u16,
        rng: &mut R,
        check_interval: Option<Duration>,
    ) -> CompletionOutcome<C> {
        let min_be = self.config.min_be;
        let max_backoff = self.config.max_backoff;

        let Some(q) = self.queues.get_mut(queue.0) else {
            warn!(?queue, %status, "csma: completion for a destroyed queue");
            return CompletionOutcome::default();
        };
        if q.state != QueueState::Transmitting {
            warn!(?queue, state = ?q.state, %status, "csma: completion while not transmitting");
            return CompletionOutcome::default();
        }
        let Some(&head) = q.packets.front() else {
            warn!(?queue, "csma: completion for an empty queue");
            return CompletionOutcome::default();
        };
        let max_transmissions = self.packets.get(head).map_or(1, |p| p.max_transmissions);

        let finalize = match status {
            TxStatus::Deferred => {
                trace!(neighbor = %q.addr, "csma: transmission deferred");
                return CompletionOutcome::default();
            }
            TxStatus::Ok => {
                q.collisions = min_be;
                q.transmissions = q.transmissions.saturating_add(num_tx);
                true
            }
            TxStatus::NoAck => {
                q.transmissions = q.transmissions.saturating_add(num_tx);
                q.transmissions >= max_transmissions
            }
            TxStatus::Collision => {
                let added = u8::try_from(num_tx).unwrap_or(u8::MAX);
                q.collisions = q.collisions.saturating_add(added);
                if q.collisions > max_backoff {
                    q.collisions = min_be;
                    q.transmissions = q.transmissions.saturating_add(1);
                }
                q.transmissions >= max_transmissions
            }
            TxStatus::Err | TxStatus::ErrFatal => true,
        };

        if finalize {
            self.finalize(queue, status, rng, check_interval)
        } else {
            debug!(
                neighbor = %q.addr,
                %status,
                transmissions = q.transmissions,
                collisions = q.collisions,
                "csma: retransmitting"
            );
            CompletionOutcome {
                completed: None,
                backoff: Some(self.schedule(queue.0, rng, check_interval)),
            }
        }
    }

    fn finalize<R: RngCore + ?Sized>(
        &mut self,
        queue: QueueId,
        status: TxStatus,
        rng: &mut R,
        check_interval: Option<Duration>,
    ) -> CompletionOutcome<C> {
        let min_be = self.config.min_be;
        let Some(q) = self.queues.get_mut(queue.0) else {
            return CompletionOutcome::default();
        };
        let dest = q.addr;
        let transmissions = q.transmissions;
        let head = q.packets.pop_front();
        let remaining = q.packets.len();
        q.transmissions = 0;
        q.collisions = min_be;
        q.state = QueueState::Idle;

        let ctx = head.and_then(|h| {
            let ctx = self.packets.get_mut(h).and_then(|p| {
                p.snapshot.reset();
                p.ctx.take()
            });
            self.packets.free(h);
            ctx
        });

        match status {
            TxStatus::Ok => self.stats.ok += 1,
            TxStatus::NoAck => self.stats.noack += 1,
            TxStatus::Collision => self.stats.collision += 1,
            _ => self.stats.error += 1,
        }
        debug!(neighbor = %dest, %status, transmissions, remaining, "csma: packet finalized");

        let backoff = if remaining > 0 {
            Some(self.schedule(queue.0, rng, check_interval))
        } else {
            self.queues.free(queue.0);
            debug!(neighbor = %dest, "csma: queue destroyed");
            None
        };

        CompletionOutcome {
            completed: ctx.map(|ctx| Completed {
                ctx,
                dest,
                status,
                transmissions,
            }),
            backoff,
        }
    }

    fn schedule<R: RngCore + ?Sized>(
        &mut self,
        queue: Handle,
        rng: &mut R,
        check_interval: Option<Duration>,
    ) -> Backoff {
        let period = self.backoff_period(check_interval);
        let max_be = self.config.max_be;
        let mut delay = Duration::ZERO;
        if let Some(q) = self.queues.get_mut(queue) {
            delay = backoff_delay(rng, q.collisions, max_be, period);
            q.state = QueueState::BackoffScheduled;
            trace!(neighbor = %q.addr, collisions = q.collisions, ?delay, "csma: backoff scheduled");
        }
        Backoff {
            queue: QueueId(queue),
            delay,
        }
    }

    /// Backoff unit for the given RDC channel check interval
    #[must_use]
    pub fn backoff_period(&self, check_interval: Option<Duration>) -> Duration {
        check_interval
            .filter(|d| !d.is_zero())
            .unwrap_or_else(|| self.config.backoff_period())
    }

    fn find_queue(&self, addr: LinkAddr) -> Option<Handle> {
        self.queues
            .iter()
            .find(|(_, q)| q.addr == addr)
            .map(|(handle, _)| handle)
    }

    /// Queue of `addr`, if any
    #[must_use]
    pub fn queue_id(&self, addr: LinkAddr) -> Option<QueueId> {
        self.find_queue(addr).map(QueueId)
    }

    /// Receiver address of a live queue
    #[must_use]
    pub fn queue_addr(&self, queue: QueueId) -> Option<LinkAddr> {
        self.queues.get(queue.0).map(|q| q.addr)
    }

    /// Receiver of a queue whose head is with the RDC layer
    #[must_use]
    pub fn in_flight(&self, queue: QueueId) -> Option<LinkAddr> {
        self.queues
            .get(queue.0)
            .filter(|q| q.state == QueueState::Transmitting)
            .map(|q| q.addr)
    }

    /// Scheduling state of the queue for `addr`
    #[must_use]
    pub fn queue_state(&self, addr: LinkAddr) -> Option<QueueState> {
        self.find_queue(addr)
            .and_then(|h| self.queues.get(h))
            .map(|q| q.state)
    }

    /// Number of packets queued for `addr`
    #[must_use]
    pub fn queued_packets(&self, addr: LinkAddr) -> usize {
        self.find_queue(addr)
            .and_then(|h| self.queues.get(h))
            .map_or(0, |q| q.packets.len())
    }

    /// Number of live neighbor queues
    #[must_use]
    pub fn neighbor_queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Number of packets queued across all neighbors
    #[must_use]
    pub fn total_queued(&self) -> usize {
        self.packets.len()
    }

    /// Scheduler counters
    #[must_use]
    pub fn stats(&self) -> &CsmaStats {
        &self.stats
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &CsmaConfig {
        &self.config
    }
}
