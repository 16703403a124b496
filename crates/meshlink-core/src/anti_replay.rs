//! Frame counters and replay protection.
//!
//! Outgoing secured frames carry a 32-bit frame counter split over two
//! packet attributes ([`PacketAttr::FrameCounterBytes01`] and
//! [`PacketAttr::FrameCounterBytes23`]). Receivers accept a frame only if
//! its counter is strictly greater than the last one accepted from the same
//! neighbor for the same traffic class (unicast or broadcast).
//!
//! With suppression enabled only the counter's low byte travels on the wire
//! (in the MAC sequence number). Senders keep one counter per neighbor for
//! unicast plus a global broadcast counter, and receivers rebuild the full
//! value from the last accepted one, assuming the low byte wrapped at most
//! once in between.

use crate::error::SecurityError;
use crate::packetbuf::{PacketAttr, PacketBuf};
use tracing::{trace, warn};

/// Whether counters are suppressed by default
pub const WITH_SUPPRESSION: bool = false;

/// Reserved counter value that must never be sent
pub const RESERVED_COUNTER: u32 = u32::MAX;

/// Marker set above the low byte when a suppressed counter is written into
/// the MAC sequence number, keeping the attribute non-zero so that the
/// scheduler does not replace it.
pub const SEQNO_ASSIGNED: u16 = 0x0100;

/// Per-neighbor replay protection state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AntiReplayInfo {
    /// Last accepted broadcast counter
    pub last_broadcast_counter: u32,
    /// Last accepted unicast counter
    pub last_unicast_counter: u32,
    /// Counter of our own unicast frames to this neighbor (suppression only)
    pub my_unicast_counter: u32,
}

/// Frame counter state of this node
#[derive(Debug)]
pub struct AntiReplay {
    with_suppression: bool,
    counter: u32,
    broadcast_counter: u32,
    exhausted: bool,
}

impl AntiReplay {
    /// Create counter state starting at zero
    #[must_use]
    pub fn new(with_suppression: bool) -> Self {
        Self {
            with_suppression,
            counter: 0,
            broadcast_counter: 0,
            exhausted: false,
        }
    }

    /// Check if counters are suppressed on the wire
    #[must_use]
    pub fn with_suppression(&self) -> bool {
        self.with_suppression
    }

    /// Our current broadcast counter (suppression) or global counter
    #[must_use]
    pub fn broadcast_counter(&self) -> u32 {
        if self.with_suppression {
            self.broadcast_counter
        } else {
            self.counter
        }
    }

    /// Check if the counter ran out; no secured frame can be sent anymore
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    #[cfg(test)]
    pub(crate) fn resume_at(mut self, counter: u32, broadcast_counter: u32) -> Self {
        self.counter = counter;
        self.broadcast_counter = broadcast_counter;
        self
    }

    fn advance(exhausted: &mut bool, counter: &mut u32) -> Result<u32, SecurityError> {
        let next = counter.wrapping_add(1);
        if *exhausted || next == RESERVED_COUNTER {
            if !*exhausted {
                warn!("anti-replay: frame counter exhausted");
            }
            *exhausted = true;
            return Err(SecurityError::CounterExhausted);
        }
        *counter = next;
        Ok(next)
    }

    /// Stamp the next frame counter onto the staged packet.
    ///
    /// `info` is the receiver's state; it is required for unicast frames in
    /// suppression mode and ignored otherwise.
    ///
    /// # Errors
    ///
    /// [`SecurityError::CounterExhausted`] once the next value would be the
    /// reserved one; the refusal is permanent. In suppression mode a unicast
    /// frame without `info` yields [`SecurityError::UnknownNeighbor`].
    pub fn set_counter(
        &mut self,
        packetbuf: &mut PacketBuf,
        info: Option<&mut AntiReplayInfo>,
    ) -> Result<u32, SecurityError> {
        let value = if !self.with_suppression {
            Self::advance(&mut self.exhausted, &mut self.counter)?
        } else if packetbuf.holds_broadcast() {
            Self::advance(&mut self.exhausted, &mut self.broadcast_counter)?
        } else {
            let info = info.ok_or(SecurityError::UnknownNeighbor)?;
            Self::advance(&mut self.exhausted, &mut info.my_unicast_counter)?
        };
        write_counter_attrs(packetbuf, value);
        trace!(counter = value, broadcast = packetbuf.holds_broadcast(), "anti-replay: counter set");
        Ok(value)
    }

    /// Move the counter's low byte into the MAC sequence number.
    ///
    /// No-op unless suppression is enabled.
    pub fn suppress_counter(&self, packetbuf: &mut PacketBuf) {
        if self.with_suppression {
            let low = u16::from(get_counter(packetbuf).to_le_bytes()[0]);
            packetbuf.set_attr(PacketAttr::MacSeqno, SEQNO_ASSIGNED | low);
        }
    }

    /// Rebuild a suppressed counter from the sequence number and `info`.
    ///
    /// The high 24 bits come from the last accepted counter of the frame's
    /// traffic class. A received low byte smaller than the stored one means
    /// the low byte wrapped, so a carry ripples into the upper bytes.
    pub fn restore_counter(&self, packetbuf: &mut PacketBuf, info: &AntiReplayInfo) {
        let last = if packetbuf.holds_broadcast() {
            info.last_broadcast_counter
        } else {
            info.last_unicast_counter
        };
        let mut bytes = last.to_le_bytes();
        let received = packetbuf.attr(PacketAttr::MacSeqno).to_le_bytes()[0];
        if received < bytes[0] {
            bytes[1] = bytes[1].wrapping_add(1);
            if bytes[1] == 0 {
                bytes[2] = bytes[2].wrapping_add(1);
                if bytes[2] == 0 {
                    bytes[3] = bytes[3].wrapping_add(1);
                }
            }
        }
        bytes[0] = received;
        write_counter_attrs(packetbuf, u32::from_le_bytes(bytes));
    }

    /// Check the staged frame's counter against `info`.
    ///
    /// Returns `true` for a replay. Otherwise the counter is recorded as
    /// the last accepted one of its traffic class. The counter attributes
    /// must hold the full value (see [`AntiReplay::restore_counter`]).
    pub fn was_replayed(&self, packetbuf: &PacketBuf, info: &mut AntiReplayInfo) -> bool {
        let received = get_counter(packetbuf);
        let last = if packetbuf.holds_broadcast() {
            &mut info.last_broadcast_counter
        } else {
            &mut info.last_unicast_counter
        };
        if received <= *last {
            warn!(received, last = *last, "anti-replay: replayed frame");
            true
        } else {
            *last = received;
            false
        }
    }

    /// Seed a new neighbor's state from the staged frame's counter
    pub fn init_info(&self, packetbuf: &PacketBuf, info: &mut AntiReplayInfo) {
        let counter = get_counter(packetbuf);
        *info = AntiReplayInfo {
            last_broadcast_counter: counter,
            last_unicast_counter: counter,
            my_unicast_counter: 0,
        };
    }
}

/// Full frame counter held in the staged packet's attributes
#[must_use]
pub fn get_counter(packetbuf: &PacketBuf) -> u32 {
    u32::from(packetbuf.attr(PacketAttr::FrameCounterBytes01))
        | (u32::from(packetbuf.attr(PacketAttr::FrameCounterBytes23)) << 16)
}

/// Wire encoding (little-endian) of the staged packet's frame counter
#[must_use]
pub fn write_counter(packetbuf: &PacketBuf) -> [u8; 4] {
    get_counter(packetbuf).to_le_bytes()
}

/// Load a wire-encoded (little-endian) frame counter into the attributes
pub fn parse_counter(packetbuf: &mut PacketBuf, bytes: [u8; 4]) {
    write_counter_attrs(packetbuf, u32::from_le_bytes(bytes));
}

#[allow(clippy::cast_possible_truncation)]
fn write_counter_attrs(packetbuf: &mut PacketBuf, value: u32) {
    packetbuf.set_attr(PacketAttr::FrameCounterBytes01, value as u16);
    packetbuf.set_attr(PacketAttr::FrameCounterBytes23, (value >> 16) as u16);
}
