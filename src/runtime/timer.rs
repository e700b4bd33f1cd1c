//! Deadline tracking for the worker poll loop.
//!
//! Delay-gate expiries are kept in a min-heap; the earliest deadline drives
//! the poll timeout, and due entries are drained after each wakeup. Entries
//! carry the connection's epoch so that timers armed for a connection that
//! has since closed (or whose slab slot was reused) are dropped instead of
//! firing into the wrong connection.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Deadline {
    at: Instant,
    /// Insertion order tie-break so equal deadlines fire FIFO.
    seq: u64,
    conn_id: usize,
    epoch: u64,
}

#[derive(Debug, Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Reverse<Deadline>>,
    seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            seq: 0,
        }
    }

    pub fn schedule(&mut self, at: Instant, conn_id: usize, epoch: u64) {
        let seq = self.seq;
        self.seq += 1;
        self.heap.push(Reverse(Deadline {
            at,
            seq,
            conn_id,
            epoch,
        }));
    }

    /// Earliest pending deadline, for computing the poll timeout.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(deadline)| deadline.at)
    }

    /// Pop one entry due at or before `now`, if any. Call repeatedly to
    /// drain everything that expired during a wakeup.
    pub fn pop_due(&mut self, now: Instant) -> Option<(usize, u64)> {
        match self.heap.peek() {
            Some(Reverse(deadline)) if deadline.at <= now => {}
            _ => return None,
        }
        self.heap
            .pop()
            .map(|Reverse(deadline)| (deadline.conn_id, deadline.epoch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_earliest_deadline_first() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();
        timers.schedule(now + Duration::from_millis(30), 3, 1);
        timers.schedule(now + Duration::from_millis(10), 1, 1);
        timers.schedule(now + Duration::from_millis(20), 2, 1);

        assert_eq!(timers.next_deadline(), Some(now + Duration::from_millis(10)));

        let later = now + Duration::from_millis(25);
        assert_eq!(timers.pop_due(later), Some((1, 1)));
        assert_eq!(timers.pop_due(later), Some((2, 1)));
        assert_eq!(timers.pop_due(later), None);
        assert_eq!(timers.next_deadline(), Some(now + Duration::from_millis(30)));
    }

    #[test]
    fn test_nothing_due_before_deadline() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();
        timers.schedule(now + Duration::from_secs(60), 1, 1);
        assert_eq!(timers.pop_due(now), None);
    }

    #[test]
    fn test_equal_deadlines_fire_in_order() {
        let mut timers = TimerQueue::new();
        let at = Instant::now();
        timers.schedule(at, 7, 1);
        timers.schedule(at, 8, 1);
        timers.schedule(at, 9, 1);
        assert_eq!(timers.pop_due(at), Some((7, 1)));
        assert_eq!(timers.pop_due(at), Some((8, 1)));
        assert_eq!(timers.pop_due(at), Some((9, 1)));
        assert_eq!(timers.next_deadline(), None);
    }

    #[test]
    fn test_epoch_travels_with_entry() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();
        timers.schedule(now, 4, 17);
        assert_eq!(timers.pop_due(now), Some((4, 17)));
    }
}
