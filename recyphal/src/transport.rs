//! Transport engine
//!
//! The facade owning the redundant media set, their TX queues, and the
//! subscription registry. Everything is driven by the periodic [`run`]
//! entry point:
//!
//! 1. each media queue is drained in priority order — expired frames are
//!    dropped, a busy interface is retried next run, a failing interface
//!    loses the offending frame only;
//! 2. at most one received frame per media is parsed, reassembled, and the
//!    completed transfer dispatched to the subscribed delivery path;
//! 3. acceptance filters are rebuilt if the active port set changed.
//!
//! Outgoing transfers are fragmented and enqueued on *every* media so that a
//! single failing interface cannot starve healthy peers; the last error is
//! reported after all media were attempted.
//!
//! [`run`]: Transport::run

use core::cell::{Cell, RefCell};
use core::ptr::NonNull;
use heapless::Vec;
use recyphal_core::{NodeId, Priority, ServiceId, SubjectId, TransferId};
use recyphal_driver::frame::DataLength;
use recyphal_driver::media::{Filter, Media, PushResult};
use recyphal_driver::time::Instant;

use crate::errors::{Error, FactoryError};
use crate::format::{self, FrameHeader};
use crate::payload::ScratchBlock;
use crate::pool::PoolAllocator;
use crate::registry::{Delivery, OnReceiveFn, Registry, Subscription, TransferKind};
use crate::scatter::Scatter;
use crate::session::{
    MessageRxParams, MessageRxSession, MessageTxParams, MessageTxSession, RequestRxParams,
    RequestRxSession, RequestTxParams, RequestTxSession, ResponseRxParams, ResponseRxSession,
    ResponseTxParams, ResponseTxSession, RxTransfer, TransferMetadata,
};
use crate::tx_queue::{TxItem, TxQueue};
use crate::Runnable;

/// Maximum number of redundant media interfaces.
pub const MEDIA_CAPACITY: usize = 3;

/// Maximum number of acceptance filters installable at once.
const FILTER_CAPACITY: usize = 32;

/// Transport-wide protocol constants, observed across all media.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ProtocolParams {
    pub transfer_id_modulo: u64,
    /// Smallest MTU across the configured media.
    pub mtu_bytes: usize,
    pub max_nodes: usize,
}

struct MediaEntry<'p> {
    iface: &'p mut (dyn Media + 'p),
    queue: TxQueue,
}

/// The transport core. Sessions and clients borrow it; it borrows the pool
/// and the media, so the lifecycle order media/pool > transport > sessions is
/// enforced by the compiler.
pub struct Transport<'p> {
    pool: &'p (dyn PoolAllocator + 'p),
    media: RefCell<Vec<MediaEntry<'p>, MEDIA_CAPACITY>>,
    registry: RefCell<Registry<'p>>,
    tx_capacity: usize,
    node_id: Cell<Option<NodeId>>,
    filters_dirty: Cell<bool>,
    message_ports: Cell<usize>,
    service_ports: Cell<usize>,
}

/// Creates a transport over `media` (between one and [`MEDIA_CAPACITY`]
/// interfaces), with `tx_capacity` frames of TX queue budget per media and an
/// optional initial node id.
pub fn make_transport<'p>(
    pool: &'p (dyn PoolAllocator + 'p),
    media: impl IntoIterator<Item = &'p mut (dyn Media + 'p)>,
    tx_capacity: usize,
    local_node_id: Option<NodeId>,
) -> Result<Transport<'p>, FactoryError> {
    let mut entries: Vec<MediaEntry<'p>, MEDIA_CAPACITY> = Vec::new();
    for iface in media {
        let entry = MediaEntry {
            iface,
            queue: TxQueue::default(),
        };
        entries.push(entry).map_err(|_| FactoryError::Argument)?;
    }
    if entries.is_empty() || tx_capacity == 0 {
        return Err(FactoryError::Argument);
    }

    let min_block = core::mem::size_of::<TxItem>().max(core::mem::size_of::<Subscription<'p>>());
    if pool.block_size() < min_block {
        return Err(FactoryError::Argument);
    }

    Ok(Transport {
        pool,
        media: RefCell::new(entries),
        registry: RefCell::new(Registry::new()),
        tx_capacity,
        node_id: Cell::new(local_node_id),
        filters_dirty: Cell::new(false),
        message_ports: Cell::new(0),
        service_ports: Cell::new(0),
    })
}

impl<'p> Transport<'p> {
    pub fn local_node_id(&self) -> Option<NodeId> {
        self.node_id.get()
    }

    /// Assigns the local node id. Succeeds when the node is still anonymous
    /// or the id is unchanged; reassignment is an `Argument` error.
    pub fn set_local_node_id(&self, node_id: NodeId) -> Result<(), Error> {
        match self.node_id.get() {
            Some(current) if current == node_id => Ok(()),
            Some(_) => Err(Error::Argument),
            None => {
                self.node_id.set(Some(node_id));
                // Service filters become installable now.
                if self.service_ports.get() > 0 {
                    self.filters_dirty.set(true);
                }
                Ok(())
            }
        }
    }

    pub fn protocol_params(&self) -> ProtocolParams {
        let mut media = self.media.borrow_mut();
        let mtu_bytes = media
            .iter_mut()
            .map(|entry| usize::from(entry.iface.mtu()))
            .min()
            .unwrap_or(0);

        ProtocolParams {
            transfer_id_modulo: TransferId::MODULO,
            mtu_bytes,
            max_nodes: NodeId::CARDINALITY,
        }
    }

    /// Number of live message RX subscriptions.
    pub fn message_rx_port_count(&self) -> usize {
        self.message_ports.get()
    }

    /// Number of live service RX subscriptions (requests and responses).
    pub fn service_rx_port_count(&self) -> usize {
        self.service_ports.get()
    }

    // MARK: session factories

    pub fn make_message_rx_session(
        &self,
        params: MessageRxParams,
    ) -> Result<MessageRxSession<'_, 'p>, Error> {
        MessageRxSession::new(self, params)
    }

    pub fn make_message_tx_session(
        &self,
        params: MessageTxParams,
    ) -> Result<MessageTxSession<'_, 'p>, Error> {
        Ok(MessageTxSession::new(self, params))
    }

    pub fn make_request_rx_session(
        &self,
        params: RequestRxParams,
    ) -> Result<RequestRxSession<'_, 'p>, Error> {
        RequestRxSession::new(self, params)
    }

    pub fn make_request_tx_session(
        &self,
        params: RequestTxParams,
    ) -> Result<RequestTxSession<'_, 'p>, Error> {
        Ok(RequestTxSession::new(self, params))
    }

    pub fn make_response_rx_session(
        &self,
        params: ResponseRxParams,
    ) -> Result<ResponseRxSession<'_, 'p>, Error> {
        ResponseRxSession::new(self, params)
    }

    pub fn make_response_tx_session(
        &self,
        params: ResponseTxParams,
    ) -> Result<ResponseTxSession<'_, 'p>, Error> {
        Ok(ResponseTxSession::new(self, params))
    }

    // MARK: registry plumbing (called by session handles)

    pub(crate) fn subscribe(
        &self,
        kind: TransferKind,
        port: u16,
        extent: usize,
    ) -> Result<NonNull<Subscription<'p>>, Error> {
        let mut registry = self.registry.borrow_mut();
        if registry.find(kind, port).is_some() {
            return Err(Error::AlreadyExists);
        }

        let sub = registry.insert(self.pool, kind, Subscription::new(self.pool, port, extent))?;
        match kind {
            TransferKind::Message => self.message_ports.set(self.message_ports.get() + 1),
            TransferKind::Request | TransferKind::Response => {
                self.service_ports.set(self.service_ports.get() + 1)
            }
        }
        self.filters_dirty.set(true);
        Ok(sub)
    }

    pub(crate) fn unsubscribe(&self, kind: TransferKind, port: u16) {
        self.registry.borrow_mut().remove(self.pool, kind, port);
        let counter = match kind {
            TransferKind::Message => &self.message_ports,
            TransferKind::Request | TransferKind::Response => &self.service_ports,
        };
        debug_assert!(counter.get() > 0);
        counter.set(counter.get().saturating_sub(1));
        self.filters_dirty.set(true);
    }

    pub(crate) fn pool(&self) -> &'p (dyn PoolAllocator + 'p) {
        self.pool
    }

    // MARK: transmission

    pub(crate) fn send_message(
        &self,
        subject: SubjectId,
        metadata: &TransferMetadata,
        deadline: Instant,
        fragments: &[&[u8]],
    ) -> Result<(), Error> {
        self.send_transfer(
            SendTarget::Message { subject },
            metadata.transfer_id,
            metadata.priority,
            deadline,
            fragments,
        )
    }

    pub(crate) fn send_service(
        &self,
        service: ServiceId,
        request: bool,
        destination: NodeId,
        metadata: &TransferMetadata,
        deadline: Instant,
        fragments: &[&[u8]],
    ) -> Result<(), Error> {
        // Anonymous nodes cannot participate in services at all.
        let source = self.node_id.get().ok_or(Error::Argument)?;
        self.send_transfer(
            SendTarget::Service {
                service,
                request,
                source,
                destination,
            },
            metadata.transfer_id,
            metadata.priority,
            deadline,
            fragments,
        )
    }

    /// Fragments one transfer into every media queue.
    ///
    /// Every media is attempted regardless of earlier failures; the last
    /// error (if any) is returned. A partially enqueued transfer is rolled
    /// back on its media so no truncated transfer reaches the bus.
    fn send_transfer(
        &self,
        target: SendTarget,
        transfer_id: TransferId,
        priority: Priority,
        deadline: Instant,
        fragments: &[&[u8]],
    ) -> Result<(), Error> {
        let coalesced = self.coalesce(fragments)?;
        let payload = coalesced.as_slice();

        let crc = format::crc_add(format::CRC_INIT, payload);

        let mut media = self.media.borrow_mut();
        let mut last_error = None;

        for entry in media.iter_mut() {
            let mtu = entry.iface.mtu();
            let scatter = Scatter::new(transfer_id, payload, crc, mtu);

            let can_id = match target {
                SendTarget::Message { subject } => {
                    let source = self.node_id.get();
                    if source.is_none() && !scatter.is_single_frame() {
                        // Multi-frame transfers need a stable source id.
                        last_error = Some(Error::Argument);
                        continue;
                    }
                    let can_id = format::message_can_id(priority, subject, source);
                    if source.is_none() {
                        format::patch_anonymous_source(can_id, crc)
                    } else {
                        can_id
                    }
                }
                SendTarget::Service {
                    service,
                    request,
                    source,
                    destination,
                } => format::service_can_id(priority, service, request, source, destination),
            };

            let mut pushed = 0usize;
            let mut exhausted = false;
            for data in scatter {
                if entry
                    .queue
                    .push(self.pool, self.tx_capacity, priority, deadline, can_id, data)
                    .is_err()
                {
                    exhausted = true;
                    break;
                }
                pushed += 1;
            }

            if exhausted {
                for _ in 0..pushed {
                    entry.queue.remove_newest(self.pool, priority);
                }
                last_error = Some(Error::Memory);
            }
        }

        match last_error {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }

    fn coalesce<'f>(&self, fragments: &[&'f [u8]]) -> Result<CoalescedPayload<'f, 'p>, Error> {
        let mut non_empty = fragments.iter().filter(|f| !f.is_empty());
        let first = non_empty.next();
        if let (Some(first), None) = (first, non_empty.next()) {
            // Single non-empty fragment: no copy.
            return Ok(CoalescedPayload::Borrowed(*first));
        }

        let total: usize = fragments.iter().map(|f| f.len()).sum();
        if total == 0 {
            return Ok(CoalescedPayload::Borrowed(&[]));
        }

        let mut scratch = ScratchBlock::allocate(self.pool).ok_or(Error::Memory)?;
        if total > scratch.as_mut_slice().len() {
            return Err(Error::Memory);
        }
        let mut offset = 0;
        for fragment in fragments {
            scratch.as_mut_slice()[offset..offset + fragment.len()].copy_from_slice(fragment);
            offset += fragment.len();
        }
        Ok(CoalescedPayload::Owned(scratch, total))
    }

    // MARK: periodic work

    fn run_media_transmit(&self, now: Instant) {
        let mut media = self.media.borrow_mut();
        for entry in media.iter_mut() {
            loop {
                let Some(item) = entry.queue.peek() else { break };
                let (deadline, can_id) = (item.deadline, item.can_id);
                let data = item.data.clone();

                // Expired frames are dropped without touching the media.
                if now >= deadline {
                    entry.queue.pop(self.pool);
                    continue;
                }

                match entry.iface.push(deadline, can_id, &data) {
                    Ok(PushResult::Accepted) => entry.queue.pop(self.pool),
                    // Retry the same frame on the next run.
                    Ok(PushResult::Busy) => break,
                    Err(_) => {
                        warn!("tx: frame rejected by media");
                        entry.queue.pop(self.pool);
                    }
                }
            }
        }
    }

    fn run_media_receive(&self, now: Instant) {
        let media_count = self.media.borrow().len();
        let mut frame = [0u8; DataLength::MAX];

        for index in 0..media_count {
            let popped = {
                let mut media = self.media.borrow_mut();
                media[index].iface.pop(&mut frame)
            };
            // The media borrow is released before dispatch so that delivery
            // callbacks may freely send.
            match popped {
                Ok(Some(meta)) if meta.payload_size <= frame.len() => {
                    self.accept_frame(now, meta.can_id, &frame[..meta.payload_size], meta.timestamp);
                }
                Ok(Some(_)) => warn!("rx: oversized frame ignored"),
                Ok(None) => {}
                Err(_) => warn!("rx: media error"),
            }
        }
    }

    fn accept_frame(&self, now: Instant, can_id: u32, payload: &[u8], timestamp: Instant) {
        let Some(header) = format::parse_can_id(can_id) else {
            return;
        };

        let (kind, port, priority, source) = match header {
            FrameHeader::Message {
                priority,
                subject,
                source,
            } => (TransferKind::Message, subject.into_u16(), priority, source),
            FrameHeader::Service {
                priority,
                service,
                request,
                source,
                destination,
            } => {
                // Service frames are point-to-point; accept only our own.
                if Some(destination) != self.node_id.get() {
                    return;
                }
                let kind = if request {
                    TransferKind::Request
                } else {
                    TransferKind::Response
                };
                (kind, service.into_u16(), priority, Some(source))
            }
        };

        let Some(mut sub) = self.registry.borrow().find(kind, port) else {
            return;
        };
        // The registry borrow is released; the record is pool-pinned and can
        // only be removed by its session handle, which no reachable code can
        // drop while we are inside `run`.
        let transfer =
            unsafe { sub.as_mut() }.accept_frame(self.pool, priority, source, payload, timestamp);

        if let Some(transfer) = transfer {
            self.deliver(sub, transfer, now);
        }
    }

    fn deliver(&self, mut sub: NonNull<Subscription<'p>>, transfer: RxTransfer<'p>, now: Instant) {
        enum Action<'p> {
            Store,
            Callback(OnReceiveFn<'p>),
            Delegate(crate::registry::RxDelegateRef<'p>),
        }

        // The callback is taken out before invocation so the callback may
        // re-enter the transport (and even reinstall itself).
        let action = {
            let record = unsafe { sub.as_mut() };
            match &mut record.delivery {
                Delivery::Delegate(delegate) => Action::Delegate(*delegate),
                Delivery::Session { on_receive, .. } => match on_receive.take() {
                    Some(callback) => Action::Callback(callback),
                    None => Action::Store,
                },
            }
        };

        match action {
            Action::Store => {
                let record = unsafe { sub.as_mut() };
                if let Delivery::Session { last, .. } = &mut record.delivery {
                    *last = Some(transfer);
                }
            }
            Action::Callback(mut callback) => {
                callback.call(transfer);
                let record = unsafe { sub.as_mut() };
                if let Delivery::Session { on_receive, .. } = &mut record.delivery {
                    // Keep the callback unless it replaced itself.
                    if on_receive.is_none() {
                        *on_receive = Some(callback);
                    }
                }
            }
            Action::Delegate(delegate) => delegate.accept(transfer, now),
        }
    }

    /// Rebuilds and installs acceptance filters after the active port set
    /// changed. On any failure the dirty flag stays set and the whole pass is
    /// retried on the next run.
    fn run_media_filters(&self) {
        if !self.filters_dirty.get() {
            return;
        }

        let local_node = self.node_id.get();
        let active_ports = self.message_ports.get()
            + if local_node.is_some() {
                self.service_ports.get()
            } else {
                0
            };
        if active_ports > FILTER_CAPACITY {
            warn!("filters: {} active ports exceed capacity", active_ports);
            return;
        }

        let mut filters: Vec<Filter, FILTER_CAPACITY> = Vec::new();
        {
            let registry = self.registry.borrow();
            registry.visit_ports(TransferKind::Message, |port| {
                unwrap!(filters.push(format::filter_for_subject(SubjectId::from_u16_truncating(port))));
            });
            // Anonymous nodes cannot receive service transfers, so their
            // service ports are not active.
            if let Some(local_node) = local_node {
                let mut svc = |port: u16| {
                    unwrap!(filters.push(format::filter_for_service(
                        ServiceId::from_u16_truncating(port),
                        local_node,
                    )));
                };
                registry.visit_ports(TransferKind::Request, &mut svc);
                registry.visit_ports(TransferKind::Response, &mut svc);
            }
        }
        debug_assert!(filters.len() == active_ports);

        let mut media = self.media.borrow_mut();
        let mut all_applied = true;
        for entry in media.iter_mut() {
            if entry.iface.set_filters(&filters).is_err() {
                warn!("filters: media rejected reconfiguration");
                all_applied = false;
            }
        }

        if all_applied {
            self.filters_dirty.set(false);
        }
    }
}

impl Runnable for Transport<'_> {
    /// One cooperative tick: drain TX queues, accept inbound frames,
    /// reconfigure filters.
    fn run(&self, now: Instant) {
        self.run_media_transmit(now);
        self.run_media_receive(now);
        self.run_media_filters();
    }
}

impl Drop for Transport<'_> {
    fn drop(&mut self) {
        for entry in self.media.get_mut().iter_mut() {
            entry.queue.flush(self.pool);
        }
        debug_assert!(
            self.message_ports.get() == 0 && self.service_ports.get() == 0,
            "sessions must be destroyed before transport"
        );
    }
}

#[derive(Clone, Copy)]
enum SendTarget {
    Message {
        subject: SubjectId,
    },
    Service {
        service: ServiceId,
        request: bool,
        source: NodeId,
        destination: NodeId,
    },
}

enum CoalescedPayload<'f, 'p> {
    Borrowed(&'f [u8]),
    Owned(ScratchBlock<'p>, usize),
}

impl CoalescedPayload<'_, '_> {
    fn as_slice(&self) -> &[u8] {
        match self {
            CoalescedPayload::Borrowed(slice) => slice,
            CoalescedPayload::Owned(scratch, len) => &scratch.as_slice()[..*len],
        }
    }
}
