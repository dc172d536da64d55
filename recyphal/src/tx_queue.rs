//! Per-media transmission queue
//!
//! Frames wait in eight intrusive FIFO lists, one per priority level, with a
//! bitmask tracking which levels are occupied. The head of the queue is the
//! front of the highest occupied level, so frames leave in strict priority
//! order with FIFO ties — which also keeps the frames of one transfer in
//! order. Items are pool blocks; the queue enforces a frame budget so one
//! media cannot monopolize the pool.

use core::ptr::NonNull;
use intrusive_collections::{LinkedList, LinkedListLink, UnsafeRef, intrusive_adapter};
use recyphal_core::{Priority, PrioritySet};
use recyphal_driver::frame::Data;
use recyphal_driver::time::Instant;

use crate::pool::{self, PoolAllocator};
use crate::utils::PriorityArray;

pub(crate) struct TxItem {
    link: LinkedListLink,
    pub deadline: Instant,
    pub can_id: u32,
    pub data: Data,
}

intrusive_adapter!(TxItemAdapter = UnsafeRef<TxItem>: TxItem { link: LinkedListLink });

#[derive(Default)]
pub(crate) struct TxQueue {
    lists: PriorityArray<LinkedList<TxItemAdapter>>,
    occupied: PrioritySet,
    len: usize,
}

impl TxQueue {
    pub fn len(&self) -> usize {
        self.len
    }

    /// Appends a frame at its priority level.
    ///
    /// `budget` is the per-media frame capacity; hitting it (or the pool
    /// running dry) fails without side effects.
    pub fn push(
        &mut self,
        pool: &dyn PoolAllocator,
        budget: usize,
        priority: Priority,
        deadline: Instant,
        can_id: u32,
        data: Data,
    ) -> Result<(), ()> {
        if self.len >= budget {
            return Err(());
        }
        let item = pool::allocate_for::<TxItem>(pool).ok_or(())?;
        unsafe {
            item.as_ptr().write(TxItem {
                link: LinkedListLink::new(),
                deadline,
                can_id,
                data,
            });
        }

        // SAFETY: the item is pool-pinned and owned by this list until
        // popped.
        self.lists[priority].push_back(unsafe { UnsafeRef::from_raw(item.as_ptr()) });
        self.occupied.insert(priority);
        self.len += 1;
        Ok(())
    }

    /// The next frame to transmit, without removing it.
    pub fn peek(&self) -> Option<&TxItem> {
        let priority = self.occupied.first()?;
        self.lists[priority].front().get()
    }

    /// Removes and frees the frame returned by [`peek`](Self::peek).
    pub fn pop(&mut self, pool: &dyn PoolAllocator) {
        let Some(priority) = self.occupied.first() else {
            debug_assert!(false, "pop from empty queue");
            return;
        };
        self.remove(pool, priority, false);
    }

    /// Removes and frees the most recently pushed frame of one level; used to
    /// roll back a partially enqueued transfer.
    pub fn remove_newest(&mut self, pool: &dyn PoolAllocator, priority: Priority) {
        self.remove(pool, priority, true);
    }

    fn remove(&mut self, pool: &dyn PoolAllocator, priority: Priority, back: bool) {
        let list = &mut self.lists[priority];
        let item = if back {
            list.pop_back()
        } else {
            list.pop_front()
        };
        let Some(item) = item else {
            debug_assert!(false, "level unexpectedly empty");
            return;
        };

        if list.is_empty() {
            self.occupied.remove(priority);
        }
        self.len -= 1;

        let raw = UnsafeRef::into_raw(item);
        // SAFETY: the item was allocated from this pool in `push` and is no
        // longer linked anywhere.
        unsafe { pool::destroy(pool, NonNull::new_unchecked(raw)) };
    }

    /// Frees every queued frame.
    pub fn flush(&mut self, pool: &dyn PoolAllocator) {
        while self.peek().is_some() {
            self.pop(pool);
        }
    }
}

impl Drop for TxQueue {
    fn drop(&mut self) {
        debug_assert!(self.len == 0, "queue must be flushed before drop");
    }
}
