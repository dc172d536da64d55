//! Subscription registry
//!
//! One red-black tree per transfer kind maps a port id to its single
//! [`Subscription`] record. Records are pool blocks, so their addresses are
//! stable for the lifetime of the session that owns them; the trees are
//! visited in key order when acceptance filters are rebuilt.
//!
//! A record owns the per-source reassembly contexts for its port and the
//! delivery state the owning session observes: the latest-wins transfer slot,
//! the optional on-receive callback, or (for sessions driven by a client) a
//! delegate pointer.

use core::ptr::NonNull;
use intrusive_collections::{KeyAdapter, RBTree, RBTreeLink, UnsafeRef, intrusive_adapter};
use recyphal_core::{NodeId, Priority};
use recyphal_driver::time::{Duration, Instant};

use crate::errors::Error;
use crate::format::{SOT_TOGGLE_BIT, Tail};
use crate::gather::Reassembler;
use crate::payload::ScratchBlock;
use crate::pool::{self, PoolAllocator};
use crate::session::{RxTransfer, RxTransferMetadata};
use crate::utils::{InlineFunction, Multiset};

/// Default transfer-id timeout of a new subscription.
pub(crate) const DEFAULT_TRANSFER_ID_TIMEOUT: Duration = Duration::from_secs(2);

/// Inline capacity of an on-receive callback, in bytes.
pub(crate) const ON_RECEIVE_FUNCTION_SIZE: usize = 32;

/// The closed set of transfer kinds. Filter construction and subscription
/// indexing are parametric over exactly these three.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum TransferKind {
    Message = 0,
    Request = 1,
    Response = 2,
}

/// Receiver of completed transfers on a subscribed port.
pub(crate) trait RxDelegate<'p> {
    fn accept(&self, transfer: RxTransfer<'p>, now: Instant);
}

/// Type- and lifetime-erased pointer to an [`RxDelegate`].
///
/// The target is pool-pinned client state whose lifetime is bracketed by the
/// session that holds this reference, which the type system cannot express;
/// the erasure shim stands in for a trait object.
#[derive(Clone, Copy)]
pub(crate) struct RxDelegateRef<'p> {
    target: NonNull<()>,
    accept_fn: unsafe fn(NonNull<()>, RxTransfer<'p>, Instant),
}

impl<'p> RxDelegateRef<'p> {
    /// # Safety
    ///
    /// `target` must stay valid for as long as this reference is installed.
    pub unsafe fn new<T: RxDelegate<'p>>(target: NonNull<T>) -> Self {
        unsafe fn shim<'p, T: RxDelegate<'p>>(
            target: NonNull<()>,
            transfer: RxTransfer<'p>,
            now: Instant,
        ) {
            unsafe { target.cast::<T>().as_ref() }.accept(transfer, now)
        }

        Self {
            target: target.cast(),
            accept_fn: shim::<T>,
        }
    }

    pub fn accept(&self, transfer: RxTransfer<'p>, now: Instant) {
        // SAFETY: the target outlives the registration per `new`.
        unsafe { (self.accept_fn)(self.target, transfer, now) }
    }
}

pub(crate) type OnReceiveFn<'p> = InlineFunction<RxTransfer<'p>, ON_RECEIVE_FUNCTION_SIZE>;

pub(crate) enum Delivery<'p> {
    /// Plain session: invoke the callback if installed, otherwise replace the
    /// latest-wins slot.
    Session {
        last: Option<RxTransfer<'p>>,
        on_receive: Option<OnReceiveFn<'p>>,
    },
    /// Session driven by an in-crate consumer (a service client); completed
    /// transfers are handed over synchronously.
    Delegate(RxDelegateRef<'p>),
}

pub(crate) struct Subscription<'p> {
    tree_link: RBTreeLink,
    port: u16,
    extent: usize,
    transfer_id_timeout: Duration,
    contexts: Multiset<'p, RxContext<'p>, 1, 2>,
    pub delivery: Delivery<'p>,
}

impl<'p> Subscription<'p> {
    pub fn new(pool: &(dyn PoolAllocator + 'p), port: u16, extent: usize) -> Self {
        Self {
            tree_link: RBTreeLink::new(),
            port,
            extent,
            transfer_id_timeout: DEFAULT_TRANSFER_ID_TIMEOUT,
            contexts: Multiset::new(pool),
            delivery: Delivery::Session {
                last: None,
                on_receive: None,
            },
        }
    }

    pub fn set_transfer_id_timeout(&mut self, timeout: Duration) {
        self.transfer_id_timeout = timeout;
    }

    /// Feeds one received frame; returns a transfer when reassembly
    /// completes.
    pub fn accept_frame(
        &mut self,
        pool: &(dyn PoolAllocator + 'p),
        priority: Priority,
        source: Option<NodeId>,
        data: &[u8],
        timestamp: Instant,
    ) -> Option<RxTransfer<'p>> {
        match source {
            None => self.accept_anonymous(pool, priority, data, timestamp),
            Some(source) => self.accept_from(pool, priority, source, data, timestamp),
        }
    }

    // Anonymous transfers are single-frame; no reassembly state is kept.
    fn accept_anonymous(
        &mut self,
        pool: &(dyn PoolAllocator + 'p),
        priority: Priority,
        data: &[u8],
        timestamp: Instant,
    ) -> Option<RxTransfer<'p>> {
        let (tail_byte, body) = data.split_last()?;
        let tail = Tail::parse(*tail_byte);
        if !(tail.sot && tail.eot && tail.toggle == SOT_TOGGLE_BIT) {
            return None;
        }

        let Some(mut scratch) = ScratchBlock::allocate(pool) else {
            warn!("rx: no memory for anonymous transfer");
            return None;
        };
        let capacity = self.extent.min(scratch.as_mut_slice().len());
        let retain = body.len().min(capacity);
        scratch.as_mut_slice()[..retain].copy_from_slice(&body[..retain]);

        Some(RxTransfer {
            metadata: RxTransferMetadata {
                transfer_id: tail.transfer_id,
                priority,
                timestamp,
                source: None,
            },
            payload: scratch.into_payload(retain),
        })
    }

    fn accept_from(
        &mut self,
        pool: &(dyn PoolAllocator + 'p),
        priority: Priority,
        source: NodeId,
        data: &[u8],
        timestamp: Instant,
    ) -> Option<RxTransfer<'p>> {
        let timeout = self.transfer_id_timeout;
        let extent = self.extent;

        let mut context = self.context_for(source, timestamp)?;
        // SAFETY: contexts are pool- or slab-pinned; nothing else touches
        // them while this record is being fed.
        let RxContext {
            reassembler,
            scratch: scratch_slot,
            ..
        } = unsafe { context.as_mut() };

        if scratch_slot.is_none() {
            *scratch_slot = ScratchBlock::allocate(pool);
            if scratch_slot.is_none() {
                warn!("rx: no memory for reassembly buffer");
                return None;
            }
        }
        let scratch = unwrap!(scratch_slot.as_mut());
        let capacity = extent.min(scratch.as_mut_slice().len());

        let assembled = reassembler.push_frame(
            timeout,
            &mut scratch.as_mut_slice()[..capacity],
            priority,
            data,
            timestamp,
        )?;

        let retain = usize::try_from(assembled.length)
            .unwrap_or(usize::MAX)
            .min(capacity);
        let payload = unwrap!(scratch_slot.take()).into_payload(retain);

        Some(RxTransfer {
            metadata: RxTransferMetadata {
                transfer_id: assembled.transfer_id,
                priority: assembled.priority,
                timestamp: assembled.timestamp,
                source: Some(source),
            },
            payload,
        })
    }

    /// Finds or creates the reassembly context of one source node, sweeping
    /// stale contexts when storage is tight.
    fn context_for(&mut self, source: NodeId, now: Instant) -> Option<NonNull<RxContext<'p>>> {
        if let Some(context) = self.contexts.find_first(|c| c.source == source) {
            return Some(context);
        }

        let fresh = RxContext {
            source,
            reassembler: Reassembler::default(),
            scratch: None,
        };
        match self.contexts.add(fresh) {
            Ok(context) => Some(context),
            Err(fresh) => {
                let timeout = self.transfer_id_timeout;
                self.contexts.remove_all_matching(|c| c.is_stale(now, timeout));
                match self.contexts.add(fresh) {
                    Ok(context) => Some(context),
                    Err(_) => {
                        warn!("rx: no memory for reassembly context");
                        None
                    }
                }
            }
        }
    }
}

struct RxContext<'p> {
    source: NodeId,
    reassembler: Reassembler,
    scratch: Option<ScratchBlock<'p>>,
}

impl RxContext<'_> {
    fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        match self.reassembler.last_activity() {
            Some(at) => now > at + timeout,
            None => true,
        }
    }
}

intrusive_adapter!(SubscriptionAdapter<'p> = UnsafeRef<Subscription<'p>>: Subscription<'p> { tree_link: RBTreeLink });

impl<'p, 'b> KeyAdapter<'b> for SubscriptionAdapter<'p> {
    type Key = u16;

    fn get_key(&self, sub: &'b Subscription<'p>) -> u16 {
        sub.port
    }
}

pub(crate) struct Registry<'p> {
    trees: [RBTree<SubscriptionAdapter<'p>>; 3],
}

impl<'p> Registry<'p> {
    pub fn new() -> Self {
        Self {
            trees: core::array::from_fn(|_| RBTree::default()),
        }
    }

    fn tree(&self, kind: TransferKind) -> &RBTree<SubscriptionAdapter<'p>> {
        &self.trees[kind as usize]
    }

    fn tree_mut(&mut self, kind: TransferKind) -> &mut RBTree<SubscriptionAdapter<'p>> {
        &mut self.trees[kind as usize]
    }

    pub fn find(&self, kind: TransferKind, port: u16) -> Option<NonNull<Subscription<'p>>> {
        self.tree(kind).find(&port).get().map(NonNull::from)
    }

    /// Places a record into pool memory and links it. The caller must have
    /// verified that the port is vacant.
    pub fn insert(
        &mut self,
        pool: &(dyn PoolAllocator + 'p),
        kind: TransferKind,
        sub: Subscription<'p>,
    ) -> Result<NonNull<Subscription<'p>>, Error> {
        debug_assert!(self.find(kind, sub.port).is_none());

        let ptr = pool::allocate_for::<Subscription<'p>>(pool).ok_or(Error::Memory)?;
        unsafe { ptr.as_ptr().write(sub) };
        // SAFETY: the record is pool-pinned and owned by the tree until
        // `remove`.
        self.tree_mut(kind).insert(unsafe { UnsafeRef::from_raw(ptr.as_ptr()) });
        Ok(ptr)
    }

    pub fn remove(&mut self, pool: &(dyn PoolAllocator + 'p), kind: TransferKind, port: u16) {
        let mut cursor = self.tree_mut(kind).find_mut(&port);
        match cursor.remove() {
            Some(record) => {
                let raw = UnsafeRef::into_raw(record);
                // SAFETY: allocated in `insert` from this pool; now unlinked.
                unsafe { pool::destroy(pool, NonNull::new_unchecked(raw)) };
            }
            None => debug_assert!(false, "no subscription at this port"),
        }
    }

    /// Visits the ports of one kind in ascending order.
    pub fn visit_ports(&self, kind: TransferKind, mut f: impl FnMut(u16)) {
        for sub in self.tree(kind).iter() {
            f(sub.port);
        }
    }
}

impl Drop for Registry<'_> {
    fn drop(&mut self) {
        for tree in &self.trees {
            debug_assert!(tree.is_empty(), "sessions must be destroyed before transport");
        }
    }
}
