//! Monotonic time and the timer queue driving every state machine.
//!
//! The link layer runs single-threaded and cooperatively: components never
//! block, they schedule a timer and return. The owner of a [`TimerQueue`]
//! pops due events in deadline order (ties broken by scheduling order) and
//! dispatches them, one run-to-completion step at a time.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::ops::Add;
use std::time::Duration;

/// Point in time, in microseconds since the node booted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Boot time
    pub const ZERO: Self = Self(0);

    /// Create a timestamp from microseconds since boot
    #[must_use]
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Create a timestamp from milliseconds since boot
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis.saturating_mul(1_000))
    }

    /// Create a timestamp from seconds since boot
    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1_000_000))
    }

    /// Microseconds since boot
    #[must_use]
    pub const fn as_micros(self) -> u64 {
        self.0
    }

    /// Time elapsed since `earlier`, or zero if `earlier` is in the future
    #[must_use]
    pub fn saturating_duration_since(self, earlier: Timestamp) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    #[allow(clippy::cast_possible_truncation)]
    fn add(self, rhs: Duration) -> Timestamp {
        let micros = rhs.as_micros().min(u128::from(u64::MAX)) as u64;
        Timestamp(self.0.saturating_add(micros))
    }
}

struct Entry<E> {
    deadline: Timestamp,
    // Schedule order, breaks deadline ties
    seq: u64,
    event: E,
}

impl<E> PartialEq for Entry<E> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<E> Eq for Entry<E> {}

impl<E> PartialOrd for Entry<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for Entry<E> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Deadline-ordered queue of pending timer events.
///
/// Events with equal deadlines fire in schedule order. There is no
/// cancellation: an event that is no longer wanted still fires, and its
/// handler drops it after checking the owner's current state.
pub struct TimerQueue<E> {
    heap: BinaryHeap<Reverse<Entry<E>>>,
    next_seq: u64,
}

impl<E> TimerQueue<E> {
    /// Create an empty timer queue
    #[must_use]
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// Schedule `event` to fire at `deadline`
    pub fn schedule(&mut self, deadline: Timestamp, event: E) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Entry {
            deadline,
            seq,
            event,
        }));
    }

    /// Earliest pending deadline
    #[must_use]
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.heap.peek().map(|Reverse(entry)| entry.deadline)
    }

    /// Remove and return the earliest event if it is due at `now`
    pub fn pop_due(&mut self, now: Timestamp) -> Option<(Timestamp, E)> {
        if self.next_deadline()? > now {
            return None;
        }
        self.heap
            .pop()
            .map(|Reverse(entry)| (entry.deadline, entry.event))
    }

    /// Number of pending events, stale ones included
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Check if no events are pending
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl<E> Default for TimerQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_arithmetic() {
        let t = Timestamp::from_millis(10);
        assert_eq!((t + Duration::from_micros(5)).as_micros(), 10_005);
        assert_eq!(
            Timestamp::from_secs(2).saturating_duration_since(Timestamp::from_secs(1)),
            Duration::from_secs(1)
        );
        assert_eq!(
            Timestamp::ZERO.saturating_duration_since(Timestamp::from_secs(1)),
            Duration::ZERO
        );
    }

    #[test]
    fn test_timer_ordering() {
        let mut timers = TimerQueue::new();
        timers.schedule(Timestamp::from_millis(30), "c");
        timers.schedule(Timestamp::from_millis(10), "a");
        timers.schedule(Timestamp::from_millis(20), "b");

        let now = Timestamp::from_millis(100);
        let order: Vec<_> = std::iter::from_fn(|| timers.pop_due(now).map(|(_, e)| e)).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_timer_ties_fire_in_schedule_order() {
        let mut timers = TimerQueue::new();
        let at = Timestamp::from_millis(5);
        timers.schedule(at, 1);
        timers.schedule(at, 2);
        timers.schedule(at, 3);

        assert_eq!(timers.pop_due(at).map(|(_, e)| e), Some(1));
        assert_eq!(timers.pop_due(at).map(|(_, e)| e), Some(2));
        assert_eq!(timers.pop_due(at).map(|(_, e)| e), Some(3));
    }

    #[test]
    fn test_timer_not_due() {
        let mut timers = TimerQueue::new();
        timers.schedule(Timestamp::from_millis(50), ());
        assert!(timers.pop_due(Timestamp::from_millis(49)).is_none());
        assert_eq!(timers.next_deadline(), Some(Timestamp::from_millis(50)));
        assert!(timers.pop_due(Timestamp::from_millis(50)).is_some());
        assert!(timers.is_empty());
    }
}
