//! Fixed-capacity, index-addressed pools for passing frames and messages between layers
//!
//! Only the small `PoolIndex` crosses the message fabric. The producer owns a
//! slot from `alloc` until it sends the index; the consumer `take`s the item,
//! which also releases the slot.

use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::RadioError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolIndex(u16);

impl PoolIndex {
    pub fn get(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PoolIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
struct PoolSlot<T> {
    item: Option<T>,
    in_use: bool,
    valid: bool,
}

#[derive(Debug)]
pub struct Pool<T> {
    slots: Vec<PoolSlot<T>>,
    in_use: usize,
    high_water: usize,
}

impl<T> Pool<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(u16::MAX as usize);
        Self {
            slots: (0..capacity)
                .map(|_| PoolSlot {
                    item: None,
                    in_use: false,
                    valid: false,
                })
                .collect(),
            in_use: 0,
            high_water: 0,
        }
    }

    /// Lowest free index.
    pub fn alloc(&mut self) -> Result<PoolIndex, RadioError> {
        let idx = self
            .slots
            .iter()
            .position(|s| !s.in_use)
            .ok_or(RadioError::PoolFull)?;
        let slot = &mut self.slots[idx];
        slot.in_use = true;
        slot.valid = false;
        slot.item = None;
        self.in_use += 1;
        self.high_water = self.high_water.max(self.in_use);
        Ok(PoolIndex(idx as u16))
    }

    /// Fills an allocated slot and marks it valid.
    pub fn set(&mut self, idx: PoolIndex, item: T) -> Result<(), RadioError> {
        match self.slots.get_mut(idx.get()) {
            Some(slot) if slot.in_use => {
                slot.item = Some(item);
                slot.valid = true;
                Ok(())
            }
            _ => Err(RadioError::UnallocatedSlot(idx.get())),
        }
    }

    /// `alloc` followed by `set`.
    pub fn store(&mut self, item: T) -> Result<PoolIndex, RadioError> {
        let idx = self.alloc()?;
        self.set(idx, item)?;
        Ok(idx)
    }

    pub fn get(&self, idx: PoolIndex) -> Option<&T> {
        self.slots
            .get(idx.get())
            .filter(|s| s.in_use && s.valid)
            .and_then(|s| s.item.as_ref())
    }

    /// Consumes the item and releases the slot. An index whose slot was never
    /// marked valid is a spurious wakeup: the slot is released and `None` returned.
    pub fn take(&mut self, idx: PoolIndex) -> Option<T> {
        let slot = self.slots.get_mut(idx.get())?;
        if !slot.in_use {
            return None;
        }
        let item = if slot.valid { slot.item.take() } else { None };
        self.release(idx);
        item
    }

    pub fn release(&mut self, idx: PoolIndex) {
        if let Some(slot) = self.slots.get_mut(idx.get()) {
            if slot.in_use {
                self.in_use -= 1;
            }
            slot.in_use = false;
            slot.valid = false;
            slot.item = None;
        }
    }

    pub fn is_in_use(&self, idx: PoolIndex) -> bool {
        self.slots.get(idx.get()).map_or(false, |s| s.in_use)
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn high_water(&self) -> usize {
        self.high_water
    }
}

pub type SharedPool<T> = Arc<Mutex<Pool<T>>>;

pub fn shared_pool<T>(capacity: usize) -> SharedPool<T> {
    Arc::new(Mutex::new(Pool::new(capacity)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_lowest_free_index() {
        let mut pool: Pool<u32> = Pool::new(3);
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        let c = pool.alloc().unwrap();
        assert_eq!((a.get(), b.get(), c.get()), (0, 1, 2));
        assert_eq!(pool.alloc(), Err(RadioError::PoolFull));

        pool.release(b);
        assert_eq!(pool.alloc().unwrap().get(), 1);
        assert_eq!(pool.high_water(), 3);
    }

    #[test]
    fn test_set_requires_allocation() {
        let mut pool: Pool<u32> = Pool::new(2);
        let idx = pool.alloc().unwrap();
        pool.release(idx);
        assert_eq!(pool.set(idx, 5), Err(RadioError::UnallocatedSlot(idx.get())));
    }

    #[test]
    fn test_take_releases_slot() {
        let mut pool: Pool<&str> = Pool::new(1);
        let idx = pool.store("frame").unwrap();
        assert!(pool.is_in_use(idx));
        assert_eq!(pool.get(idx), Some(&"frame"));
        assert_eq!(pool.take(idx), Some("frame"));
        assert!(!pool.is_in_use(idx));
        assert_eq!(pool.take(idx), None);
    }

    #[test]
    fn test_unfilled_slot_is_spurious_wakeup() {
        let mut pool: Pool<u8> = Pool::new(1);
        let idx = pool.alloc().unwrap();
        assert_eq!(pool.get(idx), None);
        assert_eq!(pool.take(idx), None);
        assert_eq!(pool.in_use(), 0);
    }
}
