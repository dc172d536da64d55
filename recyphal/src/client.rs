//! Service clients and response promises
//!
//! A client pairs a request-TX session with a response-RX session for one
//! (service, server node) pair. Every request is tagged with the next
//! transfer-id and registers a callback node indexed two ways: by transfer-id
//! for response correlation, and in a deadline-ordered list so the periodic
//! [`Runnable::run`] tick can expire the earliest pending request without
//! scanning.
//!
//! The caller receives a [`ResponsePromise`] that resolves exactly once — to
//! the (optionally deserialized) response or to [`ResponseFailure::Expired`]
//! — and delivers the outcome either by polling (`get_result`/`fetch_result`)
//! or through a one-shot callback. The two delivery paths are mutually
//! exclusive: a result consumed by the callback is never stored, and
//! installing a callback over a stored result fires it immediately.
//!
//! Dropping a promise cancels the exchange; a response arriving afterwards is
//! discarded. Dropping the client requires all of its promises to be gone
//! first, which the borrow checker enforces.

use core::cell::{Cell, RefCell};
use core::marker::PhantomData;
use core::ptr::NonNull;
use intrusive_collections::{LinkedList, LinkedListLink, UnsafeRef, intrusive_adapter};
use recyphal_core::{NodeId, Priority, ServiceId, TransferId};
use recyphal_driver::time::Instant;
use recyphal_encoding::{BufferType, Deserialize, DeserializeError, Serialize};

use crate::Runnable;
use crate::errors::Error;
use crate::payload::PayloadBuffer;
use crate::pool;
use crate::registry::{RxDelegate, RxDelegateRef};
use crate::session::{
    RequestTxParams, RequestTxSession, ResponseRxParams, ResponseRxSession, RxTransfer,
    RxTransferMetadata, TransferMetadata,
};
use crate::transport::Transport;
use crate::utils::{InlineFunction, Multiset};

/// Inline capacity of a promise callback, in bytes.
pub const RESPONSE_FUNCTION_SIZE: usize = 32;

/// Terminal failure of a response promise.
#[derive(Debug)]
pub enum ResponseFailure {
    /// The response deadline passed before a response arrived.
    Expired { deadline: Instant },
    /// Pool exhaustion while handling the response.
    Memory,
    /// The response arrived but could not be deserialized.
    Deserialize(DeserializeError),
}

/// A successfully received response with its transfer metadata.
#[derive(Debug)]
pub struct ResponseSuccess<P> {
    pub response: P,
    pub metadata: RxTransferMetadata,
}

pub type PromiseResult<P> = Result<ResponseSuccess<P>, ResponseFailure>;

type PromiseFn<P> = InlineFunction<(PromiseResult<P>, Instant), RESPONSE_FUNCTION_SIZE>;
type DecodeFn<'p, P> = fn(PayloadBuffer<'p>) -> Result<P, ResponseFailure>;

/// Per-request state, pool-pinned inside the client.
///
/// While unresolved the node is linked into the deadline list; resolution
/// (response or expiry) unlinks it and happens at most once. The node
/// itself lives until its promise handle drops.
struct CallbackNode<P> {
    timeout_link: LinkedListLink,
    transfer_id: TransferId,
    deadline: Instant,
    request_time: Instant,
    /// When the result was produced; echoed to late-installed callbacks.
    resolved_at: Instant,
    resolved: bool,
    result: Option<PromiseResult<P>>,
    callback: Option<PromiseFn<P>>,
}

intrusive_adapter!(NodeAdapter<P> = UnsafeRef<CallbackNode<P>>: CallbackNode<P> { timeout_link: LinkedListLink });

struct ClientState<'p, P> {
    next_transfer_id: TransferId,
    // Dropped before `nodes`: the list only unlinks, the multiset owns.
    timeout_list: LinkedList<NodeAdapter<P>>,
    nodes: Multiset<'p, CallbackNode<P>, 1, 1>,
}

/// Shared core of the typed and raw clients, pool-pinned so the response-RX
/// delegate pointer stays valid while the handle moves around.
struct ClientShared<'t, 'p, P> {
    server_node_id: NodeId,
    priority: Cell<Priority>,
    decode: DecodeFn<'p, P>,
    req_tx: RefCell<RequestTxSession<'t, 'p>>,
    resp_rx: RefCell<ResponseRxSession<'t, 'p>>,
    state: RefCell<ClientState<'p, P>>,
    promises: Cell<usize>,
}

impl<'t, 'p, P> ClientShared<'t, 'p, P> {
    fn create(
        transport: &'t Transport<'p>,
        service_id: ServiceId,
        server_node_id: NodeId,
        extent: usize,
        decode: DecodeFn<'p, P>,
    ) -> Result<NonNull<Self>, Error> {
        // Both the shared state and a node chunk must fit a pool block.
        let block = transport.pool().block_size();
        if core::mem::size_of::<Self>() > block
            || core::mem::size_of::<CallbackNode<P>>() + 2 * core::mem::size_of::<usize>() > block
        {
            return Err(Error::Memory);
        }

        let req_tx = transport.make_request_tx_session(RequestTxParams {
            service_id,
            server_node_id,
        })?;
        let resp_rx = transport.make_response_rx_session(ResponseRxParams {
            extent,
            service_id,
            server_node_id,
        })?;

        let shared = pool::allocate_for::<Self>(transport.pool()).ok_or(Error::Memory)?;
        unsafe {
            shared.as_ptr().write(ClientShared {
                server_node_id,
                priority: Cell::new(Priority::Nominal),
                decode,
                req_tx: RefCell::new(req_tx),
                resp_rx: RefCell::new(resp_rx),
                state: RefCell::new(ClientState {
                    next_transfer_id: TransferId::default(),
                    timeout_list: LinkedList::default(),
                    nodes: Multiset::new(transport.pool()),
                }),
                promises: Cell::new(0),
            });
        }

        // SAFETY: the shared state is pool-pinned and destroyed only after
        // the response session (which holds this reference) is gone.
        let delegate = unsafe { RxDelegateRef::new(shared) };
        unsafe { shared.as_ref() }
            .resp_rx
            .borrow_mut()
            .set_delegate(delegate);
        Ok(shared)
    }

    /// Sends one request and registers its callback node.
    ///
    /// The transfer-id advances even when the send fails, so a retry goes
    /// out under a fresh id.
    fn request_raw(
        &self,
        now: Instant,
        response_deadline: Instant,
        payload: &[u8],
    ) -> Result<NonNull<CallbackNode<P>>, Error> {
        let transfer_id = {
            let mut state = self.state.borrow_mut();
            let transfer_id = state.next_transfer_id;
            state.next_transfer_id = transfer_id.next();
            transfer_id
        };

        let metadata = TransferMetadata {
            transfer_id,
            timestamp: now,
            priority: self.priority.get(),
        };
        self.req_tx
            .borrow_mut()
            .send_with_deadline(&metadata, response_deadline, &[payload])?;

        let mut state = self.state.borrow_mut();
        let node = CallbackNode {
            timeout_link: LinkedListLink::new(),
            transfer_id,
            deadline: response_deadline,
            request_time: now,
            resolved_at: now,
            resolved: false,
            result: None,
            callback: None,
        };
        let node = state.nodes.add(node).map_err(|_| Error::Memory)?;
        Self::link_by_deadline(&mut state.timeout_list, node);
        self.promises.set(self.promises.get() + 1);
        Ok(node)
    }

    fn link_by_deadline(list: &mut LinkedList<NodeAdapter<P>>, node: NonNull<CallbackNode<P>>) {
        let deadline = unsafe { node.as_ref() }.deadline;
        let mut cursor = list.front_mut();
        while let Some(entry) = cursor.get() {
            if entry.deadline > deadline {
                break;
            }
            cursor.move_next();
        }
        // SAFETY: the node is pool-pinned and stays linked until resolution
        // or release.
        cursor.insert_before(unsafe { UnsafeRef::from_raw(node.as_ptr()) });
    }

    /// Expires pending requests from the head of the deadline list.
    fn process_timeouts(&self, now: Instant) {
        loop {
            let (deadline, callback) = {
                let mut state = self.state.borrow_mut();
                match state.timeout_list.front().get() {
                    Some(head) if head.deadline <= now => {}
                    _ => break,
                }

                let head = unwrap!(state.timeout_list.pop_front());
                let raw = UnsafeRef::into_raw(head);
                // SAFETY: nodes are pool-pinned; this is the only live access.
                let node = unsafe { &mut *raw };
                node.resolved = true;
                node.resolved_at = now;
                let callback = node.callback.take();
                if callback.is_none() {
                    node.result = Some(Err(ResponseFailure::Expired {
                        deadline: node.deadline,
                    }));
                }
                (node.deadline, callback)
            };

            // State borrow released: the callback may re-enter the client.
            if let Some(mut callback) = callback {
                callback.call((Err(ResponseFailure::Expired { deadline }), now));
            }
        }
    }
}

impl<'t, 'p, P> RxDelegate<'p> for ClientShared<'t, 'p, P> {
    /// Correlates one completed response transfer with its pending request.
    fn accept(&self, transfer: RxTransfer<'p>, now: Instant) {
        if transfer.metadata.source != Some(self.server_node_id) {
            return;
        }

        let metadata = transfer.metadata;
        let callback = {
            let mut state = self.state.borrow_mut();
            let Some(node) = state
                .nodes
                .find_first(|n| !n.resolved && n.transfer_id == metadata.transfer_id)
            else {
                // No one is waiting (promise dropped or already resolved).
                return;
            };

            // SAFETY: found through the exclusively borrowed container.
            let node = unsafe { &mut *node.as_ptr() };
            unsafe { state.timeout_list.cursor_mut_from_ptr(node) }.remove();
            node.resolved = true;
            node.resolved_at = now;

            let result = (self.decode)(transfer.payload).map(|response| ResponseSuccess {
                response,
                metadata,
            });
            match node.callback.take() {
                Some(callback) => Some((callback, result)),
                None => {
                    node.result = Some(result);
                    None
                }
            }
        };

        if let Some((mut callback, result)) = callback {
            callback.call((result, now));
        }
    }
}

/// Release/re-deadline surface the promise uses, independent of the
/// transport borrow hidden inside the shared state.
trait PromiseHub<P> {
    fn release_node(&self, node: NonNull<CallbackNode<P>>);
    fn relink_deadline(&self, node: NonNull<CallbackNode<P>>, deadline: Instant);
}

impl<'t, 'p, P> PromiseHub<P> for ClientShared<'t, 'p, P> {
    fn release_node(&self, node: NonNull<CallbackNode<P>>) {
        let mut state = self.state.borrow_mut();
        if !unsafe { node.as_ref() }.resolved {
            unsafe { state.timeout_list.cursor_mut_from_ptr(node.as_ptr()) }.remove();
        }
        let removed = state
            .nodes
            .remove_first_matching(|n| core::ptr::eq(n, node.as_ptr()));
        debug_assert!(removed.is_some());
        self.promises.set(self.promises.get().saturating_sub(1));
    }

    fn relink_deadline(&self, node: NonNull<CallbackNode<P>>, deadline: Instant) {
        let mut state = self.state.borrow_mut();
        if unsafe { node.as_ref() }.resolved {
            return;
        }
        unsafe { state.timeout_list.cursor_mut_from_ptr(node.as_ptr()) }.remove();
        // SAFETY: unlinked above; pool-pinned.
        unsafe { (*node.as_ptr()).deadline = deadline };
        Self::link_by_deadline(&mut state.timeout_list, node);
    }
}

/// Handle to the pending result of one request-response exchange.
///
/// Resolves at most once. Dropping the promise cancels the exchange.
pub struct ResponsePromise<'c, P> {
    hub: &'c dyn PromiseHub<P>,
    node: NonNull<CallbackNode<P>>,
}

impl<'c, P> ResponsePromise<'c, P> {
    /// Peeks at the stored result without consuming it.
    pub fn get_result(&self) -> Option<&PromiseResult<P>> {
        unsafe { self.node.as_ref() }.result.as_ref()
    }

    /// Moves the stored result out. At most one fetch observes a value;
    /// subsequent calls (and the callback path) see nothing.
    pub fn fetch_result(&mut self) -> Option<PromiseResult<P>> {
        unsafe { self.node.as_mut() }.result.take()
    }

    /// Installs the result callback, replacing any previous one.
    ///
    /// Runs at most once, from the tick that resolves the promise — or
    /// immediately here, if the promise already holds an unconsumed result.
    /// The callback is released after it fires.
    pub fn set_callback<F>(&mut self, mut function: F)
    where
        F: FnMut(PromiseResult<P>, Instant) + 'c,
    {
        let node = unsafe { self.node.as_mut() };
        if let Some(result) = node.result.take() {
            function(result, node.resolved_at);
            return;
        }
        node.callback = Some(PromiseFn::new(move |(result, now)| function(result, now)));
    }

    /// Removes the callback; delivery falls back to result storage.
    pub fn clear_callback(&mut self) {
        unsafe { self.node.as_mut() }.callback = None;
    }

    /// Moves the expiry deadline. No effect once the promise is resolved;
    /// `Instant::MAX` disables expiry.
    pub fn set_deadline(&mut self, deadline: Instant) {
        self.hub.relink_deadline(self.node, deadline);
    }

    /// The time the request was handed to the transport.
    pub fn request_time(&self) -> Instant {
        unsafe { self.node.as_ref() }.request_time
    }
}

impl<P> Drop for ResponsePromise<'_, P> {
    fn drop(&mut self) {
        self.hub.release_node(self.node);
    }
}

/// Strong-typed service client.
///
/// `Req` is serialized on `request`; responses are deserialized into `Resp`
/// before resolving the promise, so a malformed response resolves it with
/// [`ResponseFailure::Deserialize`].
pub struct Client<'t, 'p, Req, Resp> {
    shared: NonNull<ClientShared<'t, 'p, Resp>>,
    transport: &'t Transport<'p>,
    _request: PhantomData<fn(&Req)>,
}

impl<'t, 'p, Req, Resp> Client<'t, 'p, Req, Resp>
where
    Req: Serialize + BufferType,
    Resp: Deserialize,
{
    /// Creates a client for `service_id` on the server `server_node_id`.
    ///
    /// The response subscription is exclusive: a second client (or response
    /// RX session) for the same service fails with `AlreadyExists`.
    pub fn new(
        transport: &'t Transport<'p>,
        service_id: ServiceId,
        server_node_id: NodeId,
        extent: usize,
    ) -> Result<Self, Error> {
        let shared =
            ClientShared::create(transport, service_id, server_node_id, extent, decode_typed)?;
        Ok(Self {
            shared,
            transport,
            _request: PhantomData,
        })
    }

    fn shared(&self) -> &ClientShared<'t, 'p, Resp> {
        // SAFETY: pool-pinned; freed only in Drop.
        unsafe { self.shared.as_ref() }
    }

    /// Priority applied to subsequent requests.
    pub fn set_priority(&self, priority: Priority) {
        self.shared().priority.set(priority);
    }

    /// Serializes and sends one request; the returned promise resolves with
    /// the deserialized response or expires at `response_deadline`.
    pub fn request(
        &self,
        now: Instant,
        response_deadline: Instant,
        request: &Req,
    ) -> Result<ResponsePromise<'_, Resp>, Error> {
        let mut buffer = Req::Buffer::default();
        request.serialize_to_bytes(buffer.as_mut());
        let length = request.size_bits().div_ceil(8);

        let node = self
            .shared()
            .request_raw(now, response_deadline, &buffer.as_ref()[..length])?;
        Ok(ResponsePromise {
            hub: self.shared(),
            node,
        })
    }
}

impl<Req, Resp> Runnable for Client<'_, '_, Req, Resp> {
    fn run(&self, now: Instant) {
        unsafe { self.shared.as_ref() }.process_timeouts(now);
    }
}

impl<Req, Resp> Drop for Client<'_, '_, Req, Resp> {
    fn drop(&mut self) {
        debug_assert!(
            unsafe { self.shared.as_ref() }.promises.get() == 0,
            "promises must be destroyed before their client"
        );
        // SAFETY: allocated in `create` from this pool; the delegate is
        // unregistered by the session drop inside.
        unsafe { pool::destroy(self.transport.pool(), self.shared) };
    }
}

fn decode_typed<'p, Resp: Deserialize>(payload: PayloadBuffer<'p>) -> Result<Resp, ResponseFailure> {
    Resp::deserialize_from_bytes(&payload).map_err(ResponseFailure::Deserialize)
}

/// Untyped service client: requests and responses are raw byte payloads.
pub struct RawClient<'t, 'p> {
    shared: NonNull<ClientShared<'t, 'p, PayloadBuffer<'p>>>,
    transport: &'t Transport<'p>,
}

impl<'t, 'p> RawClient<'t, 'p> {
    /// Creates an untyped client; `extent` bounds the retained response
    /// payload.
    pub fn new(
        transport: &'t Transport<'p>,
        service_id: ServiceId,
        server_node_id: NodeId,
        extent: usize,
    ) -> Result<Self, Error> {
        let shared =
            ClientShared::create(transport, service_id, server_node_id, extent, decode_raw)?;
        Ok(Self { shared, transport })
    }

    fn shared(&self) -> &ClientShared<'t, 'p, PayloadBuffer<'p>> {
        // SAFETY: pool-pinned; freed only in Drop.
        unsafe { self.shared.as_ref() }
    }

    /// Priority applied to subsequent requests.
    pub fn set_priority(&self, priority: Priority) {
        self.shared().priority.set(priority);
    }

    /// Sends one raw request; the promise resolves with the raw response
    /// payload or expires at `response_deadline`.
    pub fn request(
        &self,
        now: Instant,
        response_deadline: Instant,
        payload: &[u8],
    ) -> Result<ResponsePromise<'_, PayloadBuffer<'p>>, Error> {
        let node = self.shared().request_raw(now, response_deadline, payload)?;
        Ok(ResponsePromise {
            hub: self.shared(),
            node,
        })
    }
}

impl Runnable for RawClient<'_, '_> {
    fn run(&self, now: Instant) {
        unsafe { self.shared.as_ref() }.process_timeouts(now);
    }
}

impl Drop for RawClient<'_, '_> {
    fn drop(&mut self) {
        debug_assert!(
            unsafe { self.shared.as_ref() }.promises.get() == 0,
            "promises must be destroyed before their client"
        );
        // SAFETY: allocated in `create` from this pool; the delegate is
        // unregistered by the session drop inside.
        unsafe { pool::destroy(self.transport.pool(), self.shared) };
    }
}

fn decode_raw<'p>(payload: PayloadBuffer<'p>) -> Result<PayloadBuffer<'p>, ResponseFailure> {
    Ok(payload)
}
