//! Pool-backed owned payload

use core::marker::PhantomData;
use core::ptr::NonNull;

use crate::pool::PoolAllocator;

/// Assembled transfer payload owning one pool block.
///
/// Returned to the application inside received transfers and promise results;
/// dropping it returns the block to the pool it came from. Empty payloads own
/// no block.
pub struct PayloadBuffer<'p> {
    block: Option<NonNull<u8>>,
    len: usize,
    pool: NonNull<dyn PoolAllocator + 'p>,
    _pool: PhantomData<&'p dyn PoolAllocator>,
}

impl<'p> PayloadBuffer<'p> {
    pub(crate) fn empty(pool: &(dyn PoolAllocator + 'p)) -> Self {
        Self {
            block: None,
            len: 0,
            pool: NonNull::from(pool),
            _pool: PhantomData,
        }
    }

    /// # Safety contract
    ///
    /// `block` must come from `pool` and hold `len` initialized bytes; the
    /// pool outlives the buffer per the transport lifecycle rule.
    pub(crate) fn from_block(
        pool: &(dyn PoolAllocator + 'p),
        block: NonNull<u8>,
        len: usize,
    ) -> Self {
        debug_assert!(len <= pool.block_size());
        Self {
            block: Some(block),
            len,
            pool: NonNull::from(pool),
            _pool: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl core::ops::Deref for PayloadBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        match self.block {
            // SAFETY: the block holds `len` initialized bytes per the
            // construction contract.
            Some(block) => unsafe { core::slice::from_raw_parts(block.as_ptr(), self.len) },
            None => &[],
        }
    }
}

impl core::fmt::Debug for PayloadBuffer<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl Drop for PayloadBuffer<'_> {
    fn drop(&mut self) {
        if let Some(block) = self.block {
            // SAFETY: the block came from this pool and is not referenced
            // anywhere else once the buffer drops.
            unsafe { self.pool.as_ref().deallocate(block) };
        }
    }
}

/// A zero-initialized pool block used as reassembly scratch space, convertible
/// into a [`PayloadBuffer`] once the transfer completes.
pub(crate) struct ScratchBlock<'p> {
    block: NonNull<u8>,
    size: usize,
    pool: NonNull<dyn PoolAllocator + 'p>,
    _pool: PhantomData<&'p dyn PoolAllocator>,
}

impl<'p> ScratchBlock<'p> {
    pub fn allocate(pool: &(dyn PoolAllocator + 'p)) -> Option<Self> {
        let block = pool.allocate()?;
        let size = pool.block_size();
        // Zero-fill so the block can be viewed as an initialized byte slice.
        unsafe { core::ptr::write_bytes(block.as_ptr(), 0, size) };
        Some(Self {
            block,
            size,
            pool: NonNull::from(pool),
            _pool: PhantomData,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: zero-initialized at allocation, exclusively owned.
        unsafe { core::slice::from_raw_parts(self.block.as_ptr(), self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: zero-initialized at allocation, exclusively owned.
        unsafe { core::slice::from_raw_parts_mut(self.block.as_ptr(), self.size) }
    }

    /// Converts into an owned payload of `len` bytes without copying.
    pub fn into_payload(self, len: usize) -> PayloadBuffer<'p> {
        debug_assert!(len <= self.size);
        let this = core::mem::ManuallyDrop::new(self);
        PayloadBuffer {
            block: Some(this.block),
            len,
            pool: this.pool,
            _pool: PhantomData,
        }
    }
}

impl Drop for ScratchBlock<'_> {
    fn drop(&mut self) {
        // SAFETY: the block came from this pool and is exclusively owned.
        unsafe { self.pool.as_ref().deallocate(self.block) };
    }
}
