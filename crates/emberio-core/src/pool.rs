//! Slab-style resource pool.
//!
//! Hands out fixed-shape slots identified by `SlotId` (index + generation).
//! Freed slots go onto a LIFO free stack for cache-friendly reuse; the
//! generation counter is bumped on release so a stale id from a completed
//! operation can never reach a recycled slot.
//!
//! Allocation and release are O(1). The pool grows lazily up to a hard
//! capacity; allocation past the cap returns `EngineError::PoolExhausted`
//! rather than blocking or touching the heap allocator per-operation.

use crate::error::{EngineError, Result};

/// Index + generation pair naming one pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    index: u32,
    gen: u32,
}

impl SlotId {
    #[inline]
    pub fn index(&self) -> usize {
        self.index as usize
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        self.gen
    }

    /// Rebuild an id from its parts. Intended for token schemes (epoll user
    /// data) that round-trip ids through a u64; a mismatched generation
    /// fails closed on lookup.
    #[inline]
    pub fn from_raw(index: u32, gen: u32) -> Self {
        Self { index, gen }
    }
}

struct Slot<T> {
    gen: u32,
    val: Option<T>,
}

pub struct SlabPool<T> {
    slots: Vec<Slot<T>>,
    // LIFO stack of free slot indices
    free: Vec<u32>,
    live: usize,
    cap: usize,
}

impl<T> SlabPool<T> {
    pub fn new(cap: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            cap,
        }
    }

    /// Place `val` into a slot. Prefers recycled slots, grows otherwise,
    /// errors at capacity.
    pub fn alloc(&mut self, val: T) -> Result<SlotId> {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.val.is_none());
            slot.val = Some(val);
            self.live += 1;
            return Ok(SlotId { index, gen: slot.gen });
        }
        if self.slots.len() >= self.cap {
            return Err(EngineError::PoolExhausted);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot { gen: 0, val: Some(val) });
        self.live += 1;
        Ok(SlotId { index, gen: 0 })
    }

    /// Borrow the slot value; `None` for stale or freed ids.
    pub fn get(&self, id: SlotId) -> Option<&T> {
        self.slots
            .get(id.index())
            .filter(|s| s.gen == id.gen)
            .and_then(|s| s.val.as_ref())
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut T> {
        self.slots
            .get_mut(id.index())
            .filter(|s| s.gen == id.gen)
            .and_then(|s| s.val.as_mut())
    }

    /// Take the value out and recycle the slot. `None` for stale ids;
    /// double release is therefore harmless.
    pub fn release(&mut self, id: SlotId) -> Option<T> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.gen != id.gen {
            return None;
        }
        let val = slot.val.take()?;
        slot.gen = slot.gen.wrapping_add(1);
        self.free.push(id.index as u32);
        self.live -= 1;
        Some(val)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Ids of all live slots, in index order. Used for drain-style sweeps.
    pub fn live_ids(&self) -> Vec<SlotId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.val.is_some())
            .map(|(i, s)| SlotId { index: i as u32, gen: s.gen })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_get_release() {
        let mut pool: SlabPool<String> = SlabPool::new(4);
        let id = pool.alloc("hello".to_string()).unwrap();
        assert_eq!(pool.get(id).unwrap(), "hello");
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.release(id).unwrap(), "hello");
        assert!(pool.is_empty());
    }

    #[test]
    fn exhaustion_is_an_error() {
        let mut pool: SlabPool<u32> = SlabPool::new(2);
        pool.alloc(1).unwrap();
        pool.alloc(2).unwrap();
        match pool.alloc(3) {
            Err(EngineError::PoolExhausted) => {}
            other => panic!("expected PoolExhausted, got {:?}", other.err()),
        }
    }

    #[test]
    fn stale_id_fails_closed() {
        let mut pool: SlabPool<u32> = SlabPool::new(2);
        let id = pool.alloc(7).unwrap();
        pool.release(id);
        // Slot gets recycled with a bumped generation
        let id2 = pool.alloc(8).unwrap();
        assert_eq!(id2.index(), id.index());
        assert_ne!(id2.generation(), id.generation());
        assert!(pool.get(id).is_none());
        assert!(pool.release(id).is_none()); // double release is a no-op
        assert_eq!(*pool.get(id2).unwrap(), 8);
    }

    #[test]
    fn lifo_reuse() {
        let mut pool: SlabPool<u32> = SlabPool::new(8);
        let a = pool.alloc(1).unwrap();
        let _b = pool.alloc(2).unwrap();
        pool.release(a);
        let c = pool.alloc(3).unwrap();
        assert_eq!(c.index(), a.index());
    }

    #[test]
    fn live_ids_in_index_order() {
        let mut pool: SlabPool<u32> = SlabPool::new(8);
        let a = pool.alloc(1).unwrap();
        let b = pool.alloc(2).unwrap();
        let c = pool.alloc(3).unwrap();
        pool.release(b);
        let ids = pool.live_ids();
        assert_eq!(ids, vec![a, c]);
    }
}
