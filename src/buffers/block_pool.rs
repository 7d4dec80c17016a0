//! A fixed-block pool: a preallocated arena of `capacity` slots with O(1) allocation and release
//!  through a free list, and no allocation or fragmentation after construction.
//!
//! Slots are addressed by a [PoolKey] that pairs the slot index with a generation counter. The
//!  generation is bumped whenever a slot is released, so a key that outlived its value never
//!  resolves to whatever value reuses the slot later.

use crate::conn::ConnId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolKey {
    index: u32,
    generation: u32,
}

impl PoolKey {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl From<PoolKey> for ConnId {
    fn from(key: PoolKey) -> ConnId {
        ConnId::from_raw(((key.generation as u64) << 32) | key.index as u64)
    }
}

impl From<ConnId> for PoolKey {
    fn from(id: ConnId) -> PoolKey {
        let raw = id.to_raw();
        PoolKey {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

pub struct BlockPool<T> {
    slots: Vec<Slot<T>>,
    free_list: Vec<u32>,
}

impl<T> BlockPool<T> {
    pub fn new(capacity: usize) -> BlockPool<T> {
        let capacity = u32::try_from(capacity).unwrap_or(u32::MAX);

        let slots = (0..capacity)
            .map(|_| Slot { generation: 0, value: None })
            .collect();

        BlockPool {
            slots,
            // reverse order so that the lowest index is handed out first
            free_list: (0..capacity).rev().collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free_list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stores `value` in a free slot, or hands it back if the pool is exhausted
    #[cfg(test)]
    pub fn alloc(&mut self, value: T) -> Result<PoolKey, T> {
        let Some(index) = self.free_list.pop() else {
            return Err(value);
        };

        let slot = &mut self.slots[index as usize];
        slot.value = Some(value);
        Ok(PoolKey { index, generation: slot.generation })
    }

    /// Stores the value `create` builds from the key it will be stored under. `create` is not
    ///  called if the pool is exhausted.
    pub fn alloc_with(&mut self, create: impl FnOnce(PoolKey) -> T) -> Option<(PoolKey, &mut T)> {
        let index = self.free_list.pop()?;

        let slot = &mut self.slots[index as usize];
        let key = PoolKey { index, generation: slot.generation };
        Some((key, slot.value.insert(create(key))))
    }

    fn slot(&self, key: PoolKey) -> Option<&Slot<T>> {
        self.slots.get(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
    }

    pub fn get(&self, key: PoolKey) -> Option<&T> {
        self.slot(key)
            .and_then(|slot| slot.value.as_ref())
    }

    pub fn get_mut(&mut self, key: PoolKey) -> Option<&mut T> {
        self.slots.get_mut(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    /// Releases the slot, returning its value. Freeing a stale or already freed key is a no-op
    ///  that returns `None`.
    pub fn free(&mut self, key: PoolKey) -> Option<T> {
        let slot = self.slots.get_mut(key.index as usize)
            .filter(|slot| slot.generation == key.generation)?;

        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(key.index);
        Some(value)
    }

    /// keys of all occupied slots, in slot order
    pub fn keys(&self) -> Vec<PoolKey> {
        self.slots.iter()
            .enumerate()
            .filter(|(_, slot)| slot.value.is_some())
            .map(|(index, slot)| PoolKey { index: index as u32, generation: slot.generation })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_until_exhausted() {
        let mut pool = BlockPool::new(2);
        assert_eq!(pool.capacity(), 2);
        assert!(pool.is_empty());

        let a = pool.alloc("a").unwrap();
        let b = pool.alloc("b").unwrap();
        assert_eq!(pool.alloc("c"), Err("c"));

        assert_eq!(pool.len(), 2);
        assert_eq!(pool.get(a), Some(&"a"));
        assert_eq!(pool.get(b), Some(&"b"));
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
    }

    #[test]
    fn test_free_and_reuse() {
        let mut pool = BlockPool::new(1);
        let a = pool.alloc(1).unwrap();

        assert_eq!(pool.free(a), Some(1));
        assert!(pool.is_empty());

        let b = pool.alloc(2).unwrap();
        assert_eq!(a.index(), b.index());
        assert_ne!(a.generation(), b.generation());

        // the stale key must not reach the new value
        assert_eq!(pool.get(a), None);
        assert_eq!(pool.get_mut(a), None);
        assert_eq!(pool.free(a), None);
        assert_eq!(pool.get(b), Some(&2));
    }

    #[test]
    fn test_double_free() {
        let mut pool = BlockPool::new(2);
        let a = pool.alloc('a').unwrap();

        assert_eq!(pool.free(a), Some('a'));
        assert_eq!(pool.free(a), None);
        assert_eq!(pool.len(), 0);

        // the free list must not contain the slot twice
        assert!(pool.alloc('b').is_ok());
        assert!(pool.alloc('c').is_ok());
        assert!(pool.alloc('d').is_err());
    }

    #[test]
    fn test_alloc_with() {
        let mut pool = BlockPool::new(1);

        let (key, value) = pool.alloc_with(|key| ConnId::from(key)).unwrap();
        assert_eq!(*value, ConnId::from(key));
        assert_eq!(pool.get(key), Some(&ConnId::from(key)));

        let mut called = false;
        assert!(pool.alloc_with(|key| { called = true; ConnId::from(key) }).is_none());
        assert!(!called);
    }

    #[test]
    fn test_get_mut() {
        let mut pool = BlockPool::new(1);
        let key = pool.alloc(vec![1]).unwrap();
        pool.get_mut(key).unwrap().push(2);
        assert_eq!(pool.get(key), Some(&vec![1, 2]));
    }

    #[test]
    fn test_keys() {
        let mut pool = BlockPool::new(4);
        let a = pool.alloc(1).unwrap();
        let b = pool.alloc(2).unwrap();
        let c = pool.alloc(3).unwrap();
        pool.free(b);

        assert_eq!(pool.keys(), vec![a, c]);
    }

    #[test]
    fn test_conn_id_round_trip() {
        let mut pool = BlockPool::new(3);
        let key = pool.alloc(()).unwrap();
        pool.free(key);
        let key = pool.alloc(()).unwrap();

        let id = ConnId::from(key);
        assert_eq!(PoolKey::from(id), key);
        assert_eq!(id.to_raw(), 1u64 << 32);
    }
}
