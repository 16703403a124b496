//! Packet staging buffer.
//!
//! A single [`PacketBuf`] holds the frame currently being composed or
//! dissected, together with a fixed attribute/address side-table through
//! which layers exchange metadata without reparsing wire bytes.
//!
//! ```text
//! 0        hdr_start        hdr_start+hdr_len   data_start          data_start+data_len   CAP
//! |  slack  |     header        |     gap          |      payload           |   free      |
//! ```
//!
//! Header growth ([`PacketBuf::header_alloc`]) always happens at the front of
//! a compacted buffer. Stripping bytes ([`PacketBuf::header_reduce`],
//! [`PacketBuf::payload_reduce`]) only moves offsets; [`PacketBuf::compact`]
//! closes the slack and the gap again.
//!
//! Nothing may hold on to buffer contents across a `clear()`: anything that
//! must survive is copied into a [`Snapshot`].

use crate::addr::LinkAddr;
use crate::error::PacketBufError;
use tracing::trace;

/// Packet buffer capacity in bytes (one 802.15.4 PSDU)
pub const PACKETBUF_SIZE: usize = 128;

/// `PacketType` attribute value for ordinary data
pub const PACKET_TYPE_DATA: u16 = 0;
/// `PacketType` attribute value for link-layer acknowledgments
pub const PACKET_TYPE_ACK: u16 = 1;

/// `FrameType` attribute value for 802.15.4 data frames
pub const FRAME_TYPE_DATA: u16 = 1;
/// `FrameType` attribute value for 802.15.4 command frames
pub const FRAME_TYPE_CMD: u16 = 3;

/// Packet attribute keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketAttr {
    /// Radio channel
    Channel,
    /// Link quality indicator
    LinkQuality,
    /// Received signal strength (dBm, two's complement)
    Rssi,
    /// Reception timestamp
    Timestamp,
    /// Per-packet transmission limit (0 = scheduler default)
    MaxMacTransmissions,
    /// MAC sequence number (low byte goes on the wire; 0 = unassigned)
    MacSeqno,
    /// Acknowledgment requested
    MacAck,
    /// [`PACKET_TYPE_DATA`] or [`PACKET_TYPE_ACK`]
    PacketType,
    /// 802.15.4 frame type
    FrameType,
    /// Security level (0 = unsecured)
    SecurityLevel,
    /// Key identifier mode
    KeyIdMode,
    /// Key index
    KeyIndex,
    /// Frame counter bits 0..16
    FrameCounterBytes01,
    /// Frame counter bits 16..32
    FrameCounterBytes23,
    /// Sender's index in the receiver's neighbor table
    NeighborIndex,
    /// Number of leading payload bytes left unencrypted
    UnencryptedBytes,
}

impl PacketAttr {
    /// Number of attribute keys
    pub const COUNT: usize = 16;

    const fn index(self) -> usize {
        self as usize
    }
}

/// Packet address keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketAddr {
    /// Link-layer sender
    Sender,
    /// Link-layer receiver (null = broadcast)
    Receiver,
    /// Originating sender of a multi-hop packet
    Esender,
    /// Final receiver of a multi-hop packet
    Ereceiver,
}

impl PacketAddr {
    /// Number of address keys
    pub const COUNT: usize = 4;

    const fn index(self) -> usize {
        self as usize
    }
}

/// Attribute and address side-table of a packet
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes {
    values: [u16; PacketAttr::COUNT],
    addrs: [LinkAddr; PacketAddr::COUNT],
}

impl Attributes {
    /// Read an attribute
    #[must_use]
    pub fn get(&self, attr: PacketAttr) -> u16 {
        self.values[attr.index()]
    }

    /// Write an attribute
    pub fn set(&mut self, attr: PacketAttr, value: u16) {
        self.values[attr.index()] = value;
    }

    /// Read an address
    #[must_use]
    pub fn addr(&self, addr: PacketAddr) -> LinkAddr {
        self.addrs[addr.index()]
    }

    /// Write an address
    pub fn set_addr(&mut self, addr: PacketAddr, value: LinkAddr) {
        self.addrs[addr.index()] = value;
    }

    /// Reset every attribute and address
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Check if the receiver is the broadcast (null) address
    #[must_use]
    pub fn holds_broadcast(&self) -> bool {
        self.addr(PacketAddr::Receiver).is_null()
    }
}

/// The packet staging buffer
#[derive(Debug, Clone)]
pub struct PacketBuf {
    buf: [u8; PACKETBUF_SIZE],
    hdr_start: usize,
    hdr_len: usize,
    data_start: usize,
    data_len: usize,
    attrs: Attributes,
}

impl PacketBuf {
    /// Create an empty packet buffer
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: [0u8; PACKETBUF_SIZE],
            hdr_start: 0,
            hdr_len: 0,
            data_start: 0,
            data_len: 0,
            attrs: Attributes::default(),
        }
    }

    /// Reset lengths, attributes and addresses.
    ///
    /// Must be called before composing or dissecting any packet.
    pub fn clear(&mut self) {
        self.hdr_start = 0;
        self.hdr_len = 0;
        self.data_start = 0;
        self.data_len = 0;
        self.attrs.clear();
    }

    /// Clear the buffer and copy `bytes` in as payload.
    ///
    /// Oversized input is truncated to the buffer capacity. Returns the
    /// number of bytes copied.
    pub fn copy_in(&mut self, bytes: &[u8]) -> usize {
        self.clear();
        let len = bytes.len().min(PACKETBUF_SIZE);
        if len < bytes.len() {
            trace!(offered = bytes.len(), copied = len, "packetbuf: truncating input");
        }
        self.buf[..len].copy_from_slice(&bytes[..len]);
        self.data_len = len;
        len
    }

    /// Copy header then payload into `dest`.
    ///
    /// # Errors
    ///
    /// Returns [`PacketBufError::DestinationTooSmall`] if `dest` cannot hold
    /// the assembled frame. `dest` is left untouched in that case.
    pub fn copy_out(&self, dest: &mut [u8]) -> Result<usize, PacketBufError> {
        let total = self.total_len();
        if total > PACKETBUF_SIZE || total > dest.len() {
            return Err(PacketBufError::DestinationTooSmall {
                needed: total,
                available: dest.len(),
            });
        }
        dest[..self.hdr_len].copy_from_slice(self.header());
        dest[self.hdr_len..total].copy_from_slice(self.payload());
        Ok(total)
    }

    /// Grow the header by `size` bytes at the front.
    ///
    /// The buffer is compacted and existing contents shift right; the new
    /// header bytes are zeroed.
    ///
    /// # Errors
    ///
    /// Returns [`PacketBufError::HeaderOverflow`] if the frame would exceed
    /// the capacity. The buffer is unchanged in that case.
    pub fn header_alloc(&mut self, size: usize) -> Result<(), PacketBufError> {
        let total = self.total_len();
        if size > PACKETBUF_SIZE - total {
            return Err(PacketBufError::HeaderOverflow {
                requested: size,
                available: PACKETBUF_SIZE - total,
            });
        }
        self.compact();
        self.buf.copy_within(0..total, size);
        self.buf[..size].fill(0);
        self.hdr_len += size;
        self.data_start = self.hdr_len;
        Ok(())
    }

    /// Strip `size` bytes from the front of the header.
    ///
    /// # Errors
    ///
    /// Returns [`PacketBufError::HeaderUnderflow`] if the header is shorter
    /// than `size`.
    pub fn header_reduce(&mut self, size: usize) -> Result<(), PacketBufError> {
        if size > self.hdr_len {
            return Err(PacketBufError::HeaderUnderflow {
                requested: size,
                header_len: self.hdr_len,
            });
        }
        self.hdr_start += size;
        self.hdr_len -= size;
        Ok(())
    }

    /// Strip `size` already-parsed bytes from the front of the payload
    ///
    /// # Errors
    ///
    /// Returns [`PacketBufError::PayloadUnderflow`] if the payload is shorter
    /// than `size`.
    pub fn payload_reduce(&mut self, size: usize) -> Result<(), PacketBufError> {
        if size > self.data_len {
            return Err(PacketBufError::PayloadUnderflow {
                requested: size,
                payload_len: self.data_len,
            });
        }
        self.data_start += size;
        self.data_len -= size;
        Ok(())
    }

    /// Move header to offset 0 and the payload right behind it
    pub fn compact(&mut self) {
        if self.hdr_start != 0 {
            self.buf
                .copy_within(self.hdr_start..self.hdr_start + self.hdr_len, 0);
            self.hdr_start = 0;
        }
        if self.data_start != self.hdr_len {
            self.buf
                .copy_within(self.data_start..self.data_start + self.data_len, self.hdr_len);
            self.data_start = self.hdr_len;
        }
    }

    /// Replace the payload with `bytes`, keeping the header
    ///
    /// # Errors
    ///
    /// Returns [`PacketBufError::PayloadOverflow`] if header plus payload
    /// would exceed the capacity.
    pub fn write_payload(&mut self, bytes: &[u8]) -> Result<(), PacketBufError> {
        self.set_payload_len(bytes.len())?;
        self.payload_mut().copy_from_slice(bytes);
        Ok(())
    }

    /// Set the payload length (contents of newly exposed bytes unspecified)
    ///
    /// # Errors
    ///
    /// Returns [`PacketBufError::PayloadOverflow`] if header plus payload
    /// would exceed the capacity.
    pub fn set_payload_len(&mut self, len: usize) -> Result<(), PacketBufError> {
        let available = PACKETBUF_SIZE - self.hdr_len;
        if len > available {
            return Err(PacketBufError::PayloadOverflow {
                requested: len,
                available,
            });
        }
        self.compact();
        self.data_len = len;
        Ok(())
    }

    /// Header bytes
    #[must_use]
    pub fn header(&self) -> &[u8] {
        &self.buf[self.hdr_start..self.hdr_start + self.hdr_len]
    }

    /// Mutable header bytes
    pub fn header_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.hdr_start..self.hdr_start + self.hdr_len]
    }

    /// Payload bytes
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.buf[self.data_start..self.data_start + self.data_len]
    }

    /// Mutable payload bytes
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.data_start..self.data_start + self.data_len]
    }

    /// Header length in bytes
    #[must_use]
    pub fn header_len(&self) -> usize {
        self.hdr_len
    }

    /// Payload length in bytes
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.data_len
    }

    /// Header plus payload length
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.hdr_len + self.data_len
    }

    /// Bytes still available for header growth
    #[must_use]
    pub fn remaining(&self) -> usize {
        PACKETBUF_SIZE - self.total_len()
    }

    /// Read an attribute
    #[must_use]
    pub fn attr(&self, attr: PacketAttr) -> u16 {
        self.attrs.get(attr)
    }

    /// Write an attribute
    pub fn set_attr(&mut self, attr: PacketAttr, value: u16) {
        self.attrs.set(attr, value);
    }

    /// Read an address
    #[must_use]
    pub fn addr(&self, addr: PacketAddr) -> LinkAddr {
        self.attrs.addr(addr)
    }

    /// Write an address
    pub fn set_addr(&mut self, addr: PacketAddr, value: LinkAddr) {
        self.attrs.set_addr(addr, value);
    }

    /// The whole attribute/address side-table
    #[must_use]
    pub fn attributes(&self) -> &Attributes {
        &self.attrs
    }

    /// Check if the receiver is the broadcast (null) address
    #[must_use]
    pub fn holds_broadcast(&self) -> bool {
        self.attrs.holds_broadcast()
    }
}

impl Default for PacketBuf {
    fn default() -> Self {
        Self::new()
    }
}

/// Independent copy of a packet that outlives the staging buffer.
///
/// Snapshots are preallocated once (one per queued-packet pool slot) and
/// overwritten in place.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    bytes: Vec<u8>,
    header_len: usize,
    attrs: Attributes,
}

impl Snapshot {
    /// Create an empty snapshot with room for a full packet
    #[must_use]
    pub fn new() -> Self {
        Self {
            bytes: Vec::with_capacity(PACKETBUF_SIZE),
            header_len: 0,
            attrs: Attributes::default(),
        }
    }

    /// Copy the assembled frame and its side-table out of `packetbuf`
    pub fn capture(&mut self, packetbuf: &PacketBuf) {
        self.bytes.clear();
        self.bytes.extend_from_slice(packetbuf.header());
        self.bytes.extend_from_slice(packetbuf.payload());
        self.header_len = packetbuf.header_len();
        self.attrs = packetbuf.attributes().clone();
    }

    /// Load this snapshot back into `packetbuf` (clearing it first)
    pub fn restore(&self, packetbuf: &mut PacketBuf) {
        packetbuf.copy_in(&self.bytes);
        packetbuf.hdr_len = self.header_len;
        packetbuf.data_start = self.header_len;
        packetbuf.data_len = self.bytes.len() - self.header_len;
        packetbuf.attrs = self.attrs.clone();
    }

    /// Frame bytes (header followed by payload)
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Header length within [`Snapshot::bytes`]
    #[must_use]
    pub fn header_len(&self) -> usize {
        self.header_len
    }

    /// Side-table captured with the frame
    #[must_use]
    pub fn attributes(&self) -> &Attributes {
        &self.attrs
    }

    /// Read a captured attribute
    #[must_use]
    pub fn attr(&self, attr: PacketAttr) -> u16 {
        self.attrs.get(attr)
    }

    /// Drop the contents, keeping the allocation
    pub fn reset(&mut self) {
        self.bytes.clear();
        self.header_len = 0;
        self.attrs.clear();
    }
}
