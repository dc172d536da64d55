//! Unordered in-place container over inline slots and pool chunks
//!
//! Elements are constructed in place and never move between `add` and
//! removal, so stored values may be linked into intrusive structures or
//! referenced by stable pointers. The first `N` slots live inline in the
//! container; further elements go to chunks of `C` slots lazily allocated
//! from the pool. An empty chunk is returned to the pool as soon as its last
//! element is removed.
//!
//! The container itself must stay put while occupied (it is only ever
//! embedded in pool-pinned owners). Iteration order is unspecified.

use core::marker::PhantomData;
use core::mem::MaybeUninit;
use core::ptr::NonNull;

use crate::pool::{self, PoolAllocator};

struct Slot<T> {
    engaged: bool,
    value: MaybeUninit<T>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            engaged: false,
            value: MaybeUninit::uninit(),
        }
    }

    /// # Safety
    ///
    /// The slot must be engaged.
    unsafe fn value_ptr(&mut self) -> NonNull<T> {
        unsafe { NonNull::new_unchecked(self.value.as_mut_ptr()) }
    }
}

struct Chunk<T, const C: usize> {
    next: Option<NonNull<Chunk<T, C>>>,
    slots: [Slot<T>; C],
}

impl<T, const C: usize> Chunk<T, C> {
    fn is_empty(&self) -> bool {
        self.slots.iter().all(|slot| !slot.engaged)
    }
}

pub(crate) struct Multiset<'p, T, const N: usize, const C: usize = 2> {
    pool: NonNull<dyn PoolAllocator + 'p>,
    inline: [Slot<T>; N],
    chunks: Option<NonNull<Chunk<T, C>>>,
    len: usize,
    _pool: PhantomData<&'p dyn PoolAllocator>,
}

impl<'p, T, const N: usize, const C: usize> Multiset<'p, T, N, C> {
    /// # Safety contract
    ///
    /// The pool must outlive the container; this follows from the lifecycle
    /// rule that every owner of a container dies before the transport's pool.
    pub fn new(pool: &(dyn PoolAllocator + 'p)) -> Self {
        Self {
            pool: NonNull::from(pool),
            inline: core::array::from_fn(|_| Slot::new()),
            chunks: None,
            len: 0,
            _pool: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn pool(&self) -> &(dyn PoolAllocator + 'p) {
        // SAFETY: the pool outlives the container per the construction
        // contract.
        unsafe { self.pool.as_ref() }
    }

    /// Constructs `value` in the first free slot and returns a pointer that
    /// stays valid until the element is removed.
    ///
    /// Gives the value back when both the inline slots and the pool are
    /// exhausted.
    pub fn add(&mut self, value: T) -> Result<NonNull<T>, T> {
        if let Some(slot) = self.inline.iter_mut().find(|slot| !slot.engaged) {
            self.len += 1;
            return Ok(Self::engage(slot, value));
        }

        let mut cursor = self.chunks;
        while let Some(mut chunk) = cursor {
            let chunk = unsafe { chunk.as_mut() };
            if let Some(slot) = chunk.slots.iter_mut().find(|slot| !slot.engaged) {
                self.len += 1;
                return Ok(Self::engage(slot, value));
            }
            cursor = chunk.next;
        }

        let Some(chunk_ptr) = pool::allocate_for::<Chunk<T, C>>(self.pool()) else {
            return Err(value);
        };
        unsafe {
            chunk_ptr.as_ptr().write(Chunk {
                next: self.chunks,
                slots: core::array::from_fn(|_| Slot::new()),
            });
        }
        self.chunks = Some(chunk_ptr);

        let chunk = unsafe { &mut *chunk_ptr.as_ptr() };
        self.len += 1;
        Ok(Self::engage(&mut chunk.slots[0], value))
    }

    fn engage(slot: &mut Slot<T>, value: T) -> NonNull<T> {
        slot.value.write(value);
        slot.engaged = true;
        // SAFETY: just engaged.
        unsafe { slot.value_ptr() }
    }

    /// Returns a pointer to the first element satisfying the predicate.
    pub fn find_first(&mut self, mut pred: impl FnMut(&T) -> bool) -> Option<NonNull<T>> {
        for slot in self.inline.iter_mut() {
            if slot.engaged && pred(unsafe { slot.value.assume_init_ref() }) {
                return Some(unsafe { slot.value_ptr() });
            }
        }

        let mut cursor = self.chunks;
        while let Some(mut chunk) = cursor {
            let chunk = unsafe { chunk.as_mut() };
            for slot in chunk.slots.iter_mut() {
                if slot.engaged && pred(unsafe { slot.value.assume_init_ref() }) {
                    return Some(unsafe { slot.value_ptr() });
                }
            }
            cursor = chunk.next;
        }
        None
    }

    /// Removes and returns the first element satisfying the predicate.
    pub fn remove_first_matching(&mut self, mut pred: impl FnMut(&T) -> bool) -> Option<T> {
        for slot in self.inline.iter_mut() {
            if slot.engaged && pred(unsafe { slot.value.assume_init_ref() }) {
                slot.engaged = false;
                self.len -= 1;
                return Some(unsafe { slot.value.assume_init_read() });
            }
        }

        let mut cursor = self.chunks;
        while let Some(chunk_ptr) = cursor {
            let chunk = unsafe { &mut *chunk_ptr.as_ptr() };
            for slot in chunk.slots.iter_mut() {
                if slot.engaged && pred(unsafe { slot.value.assume_init_ref() }) {
                    slot.engaged = false;
                    self.len -= 1;
                    let value = unsafe { slot.value.assume_init_read() };
                    if chunk.is_empty() {
                        self.release_chunk(chunk_ptr);
                    }
                    return Some(value);
                }
            }
            cursor = chunk.next;
        }
        None
    }

    /// Removes every element satisfying the predicate; returns the count.
    pub fn remove_all_matching(&mut self, mut pred: impl FnMut(&T) -> bool) -> usize {
        let mut removed = 0;

        for slot in self.inline.iter_mut() {
            if slot.engaged && pred(unsafe { slot.value.assume_init_ref() }) {
                slot.engaged = false;
                unsafe { slot.value.assume_init_drop() };
                removed += 1;
            }
        }

        let mut cursor = self.chunks;
        while let Some(chunk_ptr) = cursor {
            let chunk = unsafe { &mut *chunk_ptr.as_ptr() };
            for slot in chunk.slots.iter_mut() {
                if slot.engaged && pred(unsafe { slot.value.assume_init_ref() }) {
                    slot.engaged = false;
                    unsafe { slot.value.assume_init_drop() };
                    removed += 1;
                }
            }
            cursor = chunk.next;
            if chunk.is_empty() {
                self.release_chunk(chunk_ptr);
            }
        }

        self.len -= removed;
        removed
    }

    fn release_chunk(&mut self, chunk_ptr: NonNull<Chunk<T, C>>) {
        let mut link = &mut self.chunks;
        while let Some(current) = *link {
            if current == chunk_ptr {
                *link = unsafe { current.as_ref() }.next;
                // SAFETY: the chunk came from this pool and all slots are
                // disengaged, so dropping it is a no-op for the values.
                unsafe { pool::destroy(self.pool(), chunk_ptr) };
                return;
            }
            link = unsafe { &mut (*current.as_ptr()).next };
        }
        debug_assert!(false, "chunk not linked");
    }
}

impl<'p, T, const N: usize, const C: usize> Drop for Multiset<'p, T, N, C> {
    fn drop(&mut self) {
        for slot in self.inline.iter_mut() {
            if slot.engaged {
                unsafe { slot.value.assume_init_drop() };
            }
        }

        let mut cursor = self.chunks;
        while let Some(chunk_ptr) = cursor {
            let chunk = unsafe { &mut *chunk_ptr.as_ptr() };
            for slot in chunk.slots.iter_mut() {
                if slot.engaged {
                    unsafe { slot.value.assume_init_drop() };
                }
            }
            cursor = chunk.next;
            unsafe { pool::destroy(self.pool(), chunk_ptr) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{PoolStorage, StaticPool};

    #[test]
    fn test_inline_then_chunked() {
        let mut storage: PoolStorage<4> = PoolStorage::new();
        let pool = StaticPool::new(&mut storage);
        let mut set: Multiset<u32, 2, 4> = Multiset::new(&pool);

        let a = set.add(1).unwrap();
        let _b = set.add(2).unwrap();
        assert_eq!(pool.used(), 0, "inline slots first");

        let c = set.add(3).unwrap();
        assert_eq!(pool.used(), 1, "third element forces a chunk");
        assert_eq!(set.len(), 3);

        // Addresses are stable across later insertions.
        set.add(4).unwrap();
        assert_eq!(unsafe { *a.as_ptr() }, 1);
        assert_eq!(unsafe { *c.as_ptr() }, 3);
    }

    #[test]
    fn test_find_and_remove() {
        let mut storage: PoolStorage<4> = PoolStorage::new();
        let pool = StaticPool::new(&mut storage);
        let mut set: Multiset<u32, 1, 4> = Multiset::new(&pool);

        for v in 0..5 {
            set.add(v).unwrap();
        }
        assert!(set.find_first(|&v| v == 4).is_some());
        assert!(set.find_first(|&v| v == 9).is_none());

        assert_eq!(set.remove_first_matching(|&v| v % 2 == 1), Some(1));
        assert_eq!(set.remove_all_matching(|&v| v % 2 == 0), 3);
        assert_eq!(set.len(), 1);
        assert_eq!(set.remove_first_matching(|_| true), Some(3));
        assert!(set.is_empty());
        assert_eq!(pool.used(), 0, "empty chunks returned to the pool");
    }

    #[test]
    fn test_add_fails_when_pool_dry() {
        let mut storage: PoolStorage<1> = PoolStorage::new();
        let pool = StaticPool::new(&mut storage);
        let mut set: Multiset<u64, 1, 8> = Multiset::new(&pool);

        set.add(1).unwrap();
        for v in 2..=9 {
            set.add(v).unwrap();
        }
        assert_eq!(set.add(10), Err(10));
        assert_eq!(set.len(), 9);
    }

    #[test]
    fn test_drop_releases_chunks() {
        let mut storage: PoolStorage<2> = PoolStorage::new();
        let pool = StaticPool::new(&mut storage);
        {
            let mut set: Multiset<u32, 1, 4> = Multiset::new(&pool);
            for v in 0..9 {
                set.add(v).unwrap();
            }
            assert_eq!(pool.used(), 2);
        }
        assert_eq!(pool.used(), 0);
    }
}
