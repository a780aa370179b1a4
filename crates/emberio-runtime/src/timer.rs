//! Reactor timers.
//!
//! Min-heap of deadlines over a slab of timer slots. Cancellation is lazy:
//! cancelling releases the slot, and heap entries whose slot id has gone
//! stale are skipped when they surface. Due timers fire in deadline order;
//! ties break by registration order.
//!
//! A repeating timer carries `(interval, remaining)`: `remaining == -1`
//! repeats until cancelled, otherwise it counts firings down to zero.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use emberio_core::error::Result;
use emberio_core::pool::{SlabPool, SlotId};

use crate::reactor::Reactor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) SlotId);

pub(crate) type TimerFn = Box<dyn FnMut(&mut Reactor)>;

pub(crate) struct TimerSlot {
    /// Taken out while the callback runs, restored by `finish_fire`.
    cb: Option<TimerFn>,
    interval: Option<Duration>,
    /// Firings left; -1 = unbounded.
    remaining: i32,
    seq: u64,
}

struct HeapEntry {
    deadline: Instant,
    seq: u64,
    id: SlotId,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap: earliest deadline first, then lowest seq
        match other.deadline.cmp(&self.deadline) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}

pub(crate) struct TimerWheel {
    heap: BinaryHeap<HeapEntry>,
    slots: SlabPool<TimerSlot>,
    next_seq: u64,
}

impl TimerWheel {
    pub fn new(cap: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(64),
            slots: SlabPool::new(cap),
            next_seq: 0,
        }
    }

    /// Register a timer. `interval == None` means one-shot (the
    /// negative-repeat-interval convention maps here); `max_repeats == -1`
    /// with an interval repeats until cancelled.
    pub fn insert(
        &mut self,
        cb: TimerFn,
        delay: Duration,
        interval: Option<Duration>,
        max_repeats: i32,
    ) -> Result<TimerId> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let remaining = match interval {
            None => 1,
            Some(_) if max_repeats < 0 => -1,
            Some(_) => max_repeats.max(1),
        };
        let id = self.slots.alloc(TimerSlot {
            cb: Some(cb),
            interval,
            remaining,
            seq,
        })?;
        self.heap.push(HeapEntry {
            deadline: Instant::now() + delay,
            seq,
            id,
        });
        Ok(TimerId(id))
    }

    /// Lazy cancel: release the slot, leave the heap entry to be skipped.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.slots.release(id.0).is_some()
    }

    /// Earliest live deadline, trimming stale (cancelled) heads.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(head) = self.heap.peek() {
            if self.slots.get(head.id).is_some() {
                return Some(head.deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Pop the next due timer, taking its callback out of the slot. The
    /// caller runs the callback without borrowing the wheel, then hands it
    /// back through [`finish_fire`].
    pub fn pop_due(&mut self, now: Instant) -> Option<(TimerId, TimerFn)> {
        loop {
            let head = self.heap.peek()?;
            if self.slots.get(head.id).is_none() {
                self.heap.pop();
                continue;
            }
            if head.deadline > now {
                return None;
            }
            let entry = self.heap.pop()?;
            // Slot verified live above; the callback may still be absent if
            // a nested fire is somehow in flight, in which case skip.
            let slot = match self.slots.get_mut(entry.id) {
                Some(s) => s,
                None => continue,
            };
            match slot.cb.take() {
                Some(cb) => return Some((TimerId(entry.id), cb)),
                None => continue,
            }
        }
    }

    /// Return a callback after firing: reschedule repeating timers that are
    /// still live, release everything else. No-op if the timer was cancelled
    /// inside its own callback.
    pub fn finish_fire(&mut self, id: TimerId, cb: TimerFn, now: Instant) {
        let Some(slot) = self.slots.get_mut(id.0) else {
            return; // cancelled during the callback
        };
        if slot.remaining > 0 {
            slot.remaining -= 1;
        }
        let reschedule = match (slot.interval, slot.remaining) {
            (Some(interval), -1) => Some(interval),
            (Some(interval), n) if n > 0 => Some(interval),
            _ => None,
        };
        match reschedule {
            Some(interval) => {
                slot.cb = Some(cb);
                let seq = slot.seq;
                self.heap.push(HeapEntry {
                    deadline: now + interval,
                    seq,
                    id: id.0,
                });
            }
            None => {
                self.slots.release(id.0);
            }
        }
    }

    /// Live (registered, uncancelled) timer count.
    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    fn noop() -> TimerFn {
        Box::new(|_| {})
    }

    #[test]
    fn deadline_order_with_ties() {
        let mut wheel = TimerWheel::new(16);
        let now = Instant::now();
        // Same delay: registration order must win
        let mut order = Vec::new();
        for _ in 0..3 {
            wheel
                .insert(noop(), Duration::from_millis(5), None, 0)
                .unwrap();
        }
        while let Some((id, cb)) = wheel.pop_due(now + Duration::from_millis(10)) {
            order.push(id);
            wheel.finish_fire(id, cb, now);
        }
        assert_eq!(order.len(), 3);
        // seq order == registration order, observable through slot indices
        assert!(order[0].0.index() < order[1].0.index());
        assert!(order[1].0.index() < order[2].0.index());
    }

    #[test]
    fn one_shot_fires_once() {
        let mut wheel = TimerWheel::new(16);
        let now = Instant::now();
        wheel.insert(noop(), Duration::ZERO, None, -1).unwrap();
        let (id, cb) = wheel.pop_due(now + Duration::from_millis(1)).unwrap();
        wheel.finish_fire(id, cb, now);
        assert_eq!(wheel.len(), 0);
        assert!(wheel.pop_due(now + Duration::from_secs(10)).is_none());
    }

    #[test]
    fn repeat_reschedules_until_count() {
        let mut wheel = TimerWheel::new(16);
        let now = Instant::now();
        wheel
            .insert(noop(), Duration::ZERO, Some(Duration::from_millis(1)), 3)
            .unwrap();
        let mut fires = 0;
        let mut probe = now;
        for _ in 0..10 {
            probe += Duration::from_millis(5);
            while let Some((id, cb)) = wheel.pop_due(probe) {
                fires += 1;
                wheel.finish_fire(id, cb, probe);
            }
        }
        assert_eq!(fires, 3);
        assert_eq!(wheel.len(), 0);
    }

    #[test]
    fn unbounded_repeat_until_cancel() {
        let mut wheel = TimerWheel::new(16);
        let now = Instant::now();
        let id = wheel
            .insert(noop(), Duration::ZERO, Some(Duration::from_millis(1)), -1)
            .unwrap();
        let mut probe = now;
        for _ in 0..5 {
            probe += Duration::from_millis(2);
            if let Some((tid, cb)) = wheel.pop_due(probe) {
                wheel.finish_fire(tid, cb, probe);
            }
        }
        assert_eq!(wheel.len(), 1);
        assert!(wheel.cancel(id));
        assert!(!wheel.cancel(id));
        assert!(wheel.pop_due(probe + Duration::from_secs(1)).is_none());
        assert!(wheel.next_deadline().is_none());
    }

    #[test]
    fn cancelled_head_is_trimmed() {
        let mut wheel = TimerWheel::new(16);
        let early = wheel
            .insert(noop(), Duration::from_millis(1), None, 0)
            .unwrap();
        wheel
            .insert(noop(), Duration::from_millis(50), None, 0)
            .unwrap();
        wheel.cancel(early);
        let dl = wheel.next_deadline().unwrap();
        assert!(dl >= Instant::now() + Duration::from_millis(20));
    }
}
