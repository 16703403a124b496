//! Radio duty-cycling collaborator interface.
//!
//! The RDC layer keys the transceiver. The scheduler hands it the frames of
//! one neighbor queue and later learns the outcome through
//! [`LinkLayer::rdc_completed`](crate::stack::LinkLayer::rdc_completed).

use crate::packetbuf::Snapshot;
use crate::pool::Handle;
use std::fmt;
use std::time::Duration;

/// Outcome of one transmission attempt as reported by the RDC layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxStatus {
    /// Frame acknowledged (or broadcast sent)
    Ok,
    /// Channel busy or collision detected
    Collision,
    /// No acknowledgment received
    NoAck,
    /// Frame accepted, final outcome reported later
    Deferred,
    /// Transmission failed
    Err,
    /// Transmission failed, retrying is pointless
    ErrFatal,
}

impl TxStatus {
    /// Check if the outcome updates link quality statistics
    #[must_use]
    pub fn feeds_link_stats(self) -> bool {
        matches!(self, Self::Ok | Self::NoAck)
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ok => "ok",
            Self::Collision => "collision",
            Self::NoAck => "noack",
            Self::Deferred => "deferred",
            Self::Err => "err",
            Self::ErrFatal => "err-fatal",
        };
        f.write_str(s)
    }
}

/// Identifies the neighbor queue a `send_list` call belongs to.
///
/// Handed back unchanged with the completion; a completion whose queue has
/// since been torn down is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(pub(crate) Handle);

/// Frames of one neighbor queue, head first.
///
/// A borrowed view into the scheduler's pools; nothing is copied or
/// allocated to build it.
pub trait FrameList {
    /// Number of frames
    fn len(&self) -> usize;

    /// Frame at `index`, counting from the head
    fn get(&self, index: usize) -> Option<&Snapshot>;

    /// Check if the list holds no frame
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The frame the completion will refer to
    fn head(&self) -> Option<&Snapshot> {
        self.get(0)
    }
}

impl dyn FrameList + '_ {
    /// Iterate over the frames, head first
    pub fn iter(&self) -> impl Iterator<Item = &Snapshot> + '_ {
        (0..self.len()).filter_map(move |i| self.get(i))
    }
}

impl FrameList for Vec<Snapshot> {
    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn get(&self, index: usize) -> Option<&Snapshot> {
        self.as_slice().get(index)
    }
}

/// Radio duty-cycling layer
pub trait Rdc {
    /// Transmit the head of `frames`.
    ///
    /// `frames` is the neighbor's whole queue, so that burst capable
    /// implementations may look ahead. Exactly one completion must be
    /// reported per call and it refers to the head.
    fn send_list(&mut self, queue: QueueId, frames: &dyn FrameList);

    /// Channel check interval, used to size the backoff period.
    ///
    /// `None` (or zero) selects the fixed fallback period.
    fn channel_check_interval(&self) -> Option<Duration> {
        None
    }
}

impl<R: Rdc + ?Sized> Rdc for &mut R {
    fn send_list(&mut self, queue: QueueId, frames: &dyn FrameList) {
        (**self).send_list(queue, frames);
    }

    fn channel_check_interval(&self) -> Option<Duration> {
        (**self).channel_check_interval()
    }
}
