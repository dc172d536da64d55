//! Session handles
//!
//! Sessions are the per-port endpoints produced by the transport factory
//! methods. An RX session registers its subscription record on creation and
//! unregisters it in `Drop`; the borrow checker keeps every session within
//! the transport's lifetime. Handles are plain values and may be moved
//! freely — all registered state lives in pool-pinned records inside the
//! transport.
//!
//! Received transfers reach the application either through the latest-wins
//! [`receive`](MessageRxSession::receive) slot (an unconsumed transfer is
//! replaced by a newer one) or through an on-receive callback, which is
//! invoked from `Transport::run` and suppresses the slot entirely.

use core::ptr::NonNull;
use recyphal_core::{NodeId, Priority, ServiceId, SubjectId, TransferId};
use recyphal_driver::time::{Duration, Instant};

use crate::errors::Error;
use crate::payload::PayloadBuffer;
use crate::registry::{Delivery, OnReceiveFn, RxDelegateRef, Subscription, TransferKind};
use crate::transport::Transport;

/// Default transmission timeout: frames still queued this long after the
/// transfer timestamp are dropped undelivered.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Caller-supplied metadata of an outgoing transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferMetadata {
    pub transfer_id: TransferId,
    /// Send time; the TX deadline is this plus the session send timeout.
    pub timestamp: Instant,
    pub priority: Priority,
}

/// Metadata of an outgoing service response, echoing the request origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ServiceTransferMetadata {
    pub base: TransferMetadata,
    /// The node that sent the request and expects this response.
    pub remote_node_id: NodeId,
}

/// Metadata of a received transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RxTransferMetadata {
    pub transfer_id: TransferId,
    pub priority: Priority,
    /// Bus timestamp of the start-of-transfer frame.
    pub timestamp: Instant,
    /// Origin node; `None` for anonymous messages (service transfers always
    /// carry a source).
    pub source: Option<NodeId>,
}

/// A received transfer with its assembled payload.
#[derive(Debug)]
pub struct RxTransfer<'p> {
    pub metadata: RxTransferMetadata,
    pub payload: PayloadBuffer<'p>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MessageRxParams {
    /// Maximum payload bytes retained per transfer.
    pub extent: usize,
    pub subject_id: SubjectId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MessageTxParams {
    pub subject_id: SubjectId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RequestRxParams {
    pub extent: usize,
    pub service_id: ServiceId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RequestTxParams {
    pub service_id: ServiceId,
    pub server_node_id: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ResponseRxParams {
    pub extent: usize,
    pub service_id: ServiceId,
    pub server_node_id: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ResponseTxParams {
    pub service_id: ServiceId,
}

/// Shared body of the RX session flavors.
struct RxCore<'t, 'p> {
    transport: &'t Transport<'p>,
    sub: NonNull<Subscription<'p>>,
    kind: TransferKind,
    port: u16,
}

impl<'t, 'p> RxCore<'t, 'p> {
    fn new(
        transport: &'t Transport<'p>,
        kind: TransferKind,
        port: u16,
        extent: usize,
    ) -> Result<Self, Error> {
        let sub = transport.subscribe(kind, port, extent)?;
        Ok(Self {
            transport,
            sub,
            kind,
            port,
        })
    }

    fn record(&mut self) -> &mut Subscription<'p> {
        // SAFETY: the record is pool-pinned and stays registered until this
        // handle drops; access is exclusive in the single-threaded core.
        unsafe { self.sub.as_mut() }
    }

    fn receive(&mut self) -> Option<RxTransfer<'p>> {
        match &mut self.record().delivery {
            Delivery::Session { last, .. } => last.take(),
            Delivery::Delegate(_) => None,
        }
    }

    fn set_on_receive(&mut self, function: OnReceiveFn<'p>) {
        if let Delivery::Session { on_receive, .. } = &mut self.record().delivery {
            *on_receive = Some(function);
        }
    }

    fn clear_on_receive(&mut self) {
        if let Delivery::Session { on_receive, .. } = &mut self.record().delivery {
            *on_receive = None;
        }
    }

    fn set_transfer_id_timeout(&mut self, timeout: Duration) {
        self.record().set_transfer_id_timeout(timeout);
    }

    fn set_delegate(&mut self, delegate: RxDelegateRef<'p>) {
        self.record().delivery = Delivery::Delegate(delegate);
    }
}

impl Drop for RxCore<'_, '_> {
    fn drop(&mut self) {
        self.transport.unsubscribe(self.kind, self.port);
    }
}

macro_rules! rx_session_common {
    ($life_t:lifetime, $life_p:lifetime) => {
        /// Takes the most recently delivered transfer, if any.
        ///
        /// While an on-receive callback is installed this always returns
        /// `None`; the callback is the sole delivery path.
        pub fn receive(&mut self) -> Option<RxTransfer<$life_p>> {
            self.core.receive()
        }

        /// Installs the on-receive callback, replacing any previous one.
        ///
        /// The callback runs from `Transport::run` in the tick that completes
        /// the transfer. It must not destroy its own session.
        pub fn set_on_receive<F>(&mut self, function: F)
        where
            F: FnMut(RxTransfer<$life_p>) + $life_t,
        {
            self.core.set_on_receive(OnReceiveFn::new(function));
        }

        /// Removes the on-receive callback; delivery falls back to the
        /// latest-wins slot.
        pub fn clear_on_receive(&mut self) {
            self.core.clear_on_receive();
        }

        /// Adjusts the transfer-id timeout used to separate sessions of the
        /// same source and to expire reassembly state.
        pub fn set_transfer_id_timeout(&mut self, timeout: Duration) {
            self.core.set_transfer_id_timeout(timeout);
        }
    };
}

/// Receives messages on one subject.
pub struct MessageRxSession<'t, 'p> {
    core: RxCore<'t, 'p>,
    params: MessageRxParams,
}

impl<'t, 'p> MessageRxSession<'t, 'p> {
    pub(crate) fn new(transport: &'t Transport<'p>, params: MessageRxParams) -> Result<Self, Error> {
        let core = RxCore::new(
            transport,
            TransferKind::Message,
            params.subject_id.into_u16(),
            params.extent,
        )?;
        Ok(Self { core, params })
    }

    pub fn params(&self) -> MessageRxParams {
        self.params
    }

    rx_session_common!('t, 'p);
}

/// Receives service requests addressed to the local node (server side).
pub struct RequestRxSession<'t, 'p> {
    core: RxCore<'t, 'p>,
    params: RequestRxParams,
}

impl<'t, 'p> RequestRxSession<'t, 'p> {
    pub(crate) fn new(transport: &'t Transport<'p>, params: RequestRxParams) -> Result<Self, Error> {
        let core = RxCore::new(
            transport,
            TransferKind::Request,
            params.service_id.into_u16(),
            params.extent,
        )?;
        Ok(Self { core, params })
    }

    pub fn params(&self) -> RequestRxParams {
        self.params
    }

    rx_session_common!('t, 'p);
}

/// Receives service responses addressed to the local node (client side).
pub struct ResponseRxSession<'t, 'p> {
    core: RxCore<'t, 'p>,
    params: ResponseRxParams,
}

impl<'t, 'p> ResponseRxSession<'t, 'p> {
    pub(crate) fn new(transport: &'t Transport<'p>, params: ResponseRxParams) -> Result<Self, Error> {
        let core = RxCore::new(
            transport,
            TransferKind::Response,
            params.service_id.into_u16(),
            params.extent,
        )?;
        Ok(Self { core, params })
    }

    pub fn params(&self) -> ResponseRxParams {
        self.params
    }

    /// Routes completed transfers to an in-crate consumer instead of the
    /// session slot; used by service clients.
    pub(crate) fn set_delegate(&mut self, delegate: RxDelegateRef<'p>) {
        self.core.set_delegate(delegate);
    }

    rx_session_common!('t, 'p);
}

/// Publishes messages on one subject.
pub struct MessageTxSession<'t, 'p> {
    transport: &'t Transport<'p>,
    params: MessageTxParams,
    send_timeout: Duration,
}

impl<'t, 'p> MessageTxSession<'t, 'p> {
    pub(crate) fn new(transport: &'t Transport<'p>, params: MessageTxParams) -> Self {
        Self {
            transport,
            params,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    pub fn params(&self) -> MessageTxParams {
        self.params
    }

    pub fn set_send_timeout(&mut self, timeout: Duration) {
        self.send_timeout = timeout;
    }

    /// Fragments and enqueues one message transfer on every medium.
    ///
    /// The payload may be supplied in multiple fragments; they are coalesced
    /// as needed. Multi-frame transfers require an identified local node.
    pub fn send(&mut self, metadata: &TransferMetadata, fragments: &[&[u8]]) -> Result<(), Error> {
        self.transport.send_message(
            self.params.subject_id,
            metadata,
            metadata.timestamp + self.send_timeout,
            fragments,
        )
    }
}

/// Sends service requests to one server node.
pub struct RequestTxSession<'t, 'p> {
    transport: &'t Transport<'p>,
    params: RequestTxParams,
    send_timeout: Duration,
}

impl<'t, 'p> RequestTxSession<'t, 'p> {
    pub(crate) fn new(transport: &'t Transport<'p>, params: RequestTxParams) -> Self {
        Self {
            transport,
            params,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    pub fn params(&self) -> RequestTxParams {
        self.params
    }

    pub fn set_send_timeout(&mut self, timeout: Duration) {
        self.send_timeout = timeout;
    }

    /// Sends one request transfer. Fails with `Argument` while the local
    /// node is anonymous.
    pub fn send(&mut self, metadata: &TransferMetadata, fragments: &[&[u8]]) -> Result<(), Error> {
        self.transport.send_service(
            self.params.service_id,
            true,
            self.params.server_node_id,
            metadata,
            metadata.timestamp + self.send_timeout,
            fragments,
        )
    }

    /// Sends with an explicit deadline instead of the session send timeout.
    pub(crate) fn send_with_deadline(
        &mut self,
        metadata: &TransferMetadata,
        deadline: Instant,
        fragments: &[&[u8]],
    ) -> Result<(), Error> {
        self.transport.send_service(
            self.params.service_id,
            true,
            self.params.server_node_id,
            metadata,
            deadline,
            fragments,
        )
    }
}

/// Sends service responses back to requesting nodes.
pub struct ResponseTxSession<'t, 'p> {
    transport: &'t Transport<'p>,
    params: ResponseTxParams,
    send_timeout: Duration,
}

impl<'t, 'p> ResponseTxSession<'t, 'p> {
    pub(crate) fn new(transport: &'t Transport<'p>, params: ResponseTxParams) -> Self {
        Self {
            transport,
            params,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    pub fn params(&self) -> ResponseTxParams {
        self.params
    }

    pub fn set_send_timeout(&mut self, timeout: Duration) {
        self.send_timeout = timeout;
    }

    /// Sends one response transfer. The metadata must echo the transfer-id,
    /// priority and origin of the request being answered.
    pub fn send(
        &mut self,
        metadata: &ServiceTransferMetadata,
        fragments: &[&[u8]],
    ) -> Result<(), Error> {
        self.transport.send_service(
            self.params.service_id,
            false,
            metadata.remote_node_id,
            &metadata.base,
            metadata.base.timestamp + self.send_timeout,
            fragments,
        )
    }
}
