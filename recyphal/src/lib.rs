//! # Recyphal
//!
//! A Cyphal/CAN transport core for no_std environments: redundant media,
//! bounded memory, and a promise-based service client layer. All dynamic
//! state lives in a caller-supplied fixed-block pool; the core never blocks
//! and never allocates from a heap.
//!
//! ## Architecture
//!
//! ```text
//!           application
//!     sessions │  clients ── response promises
//!              ▼      ▼
//!        ┌───────────────────┐
//!        │     Transport     │◄── run(now)
//!        │  registry · codec │
//!        └──┬─────┬─────┬────┘
//!     TX queue TX queue TX queue     (one per media)
//!           │     │     │
//!        media  media  media         (Media trait, driver-provided)
//! ```
//!
//! * The **transport** owns the media set. Its periodic [`Runnable::run`]
//!   drains every per-media TX queue in priority order, accepts at most one
//!   inbound frame per media, and reconfigures hardware acceptance filters
//!   when the subscribed port set changes.
//! * **Sessions** are per-port endpoints created by the transport factory
//!   methods. RX sessions register a subscription record on creation and
//!   unregister it on drop; at most one subscription exists per (kind, port)
//!   pair. Outgoing transfers are fragmented once per media, so each healthy
//!   interface carries the complete transfer regardless of the others.
//! * **Clients** pair a request-TX with a response-RX session and correlate
//!   responses to requests by transfer-id. Each request yields a
//!   [`client::ResponsePromise`] that resolves exactly once — to the
//!   response, or to an expiry once its deadline passes — delivered by
//!   polling or through a one-shot callback.
//!
//! ## Concurrency model
//!
//! Single-threaded and cooperative. One executor calls `run(now)` on the
//! transport and on each client, and invokes session/promise methods from
//! the same context; the core contains no locking and no suspension points.
//! Hosts with threads are expected to wrap the whole stack in one mutex.
//!
//! Delivery callbacks are taken out of shared state before they run, so a
//! callback may freely call back into the stack (send transfers, issue
//! requests, reinstall itself).
//!
//! ## Memory model
//!
//! Every dynamic entity — TX queue items, subscription records, reassembly
//! buffers, client state — is a fixed-size block from the injected
//! [`pool::PoolAllocator`]. Exhaustion surfaces as [`Error::Memory`] on the
//! affected operation and the core keeps running; nothing is ever dropped on
//! the floor silently at sizing time.

#![no_std]

#[cfg(test)]
extern crate std;

pub use recyphal_core as core;
pub use recyphal_driver::{frame, media, time};
pub use recyphal_encoding as encoding;

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod client;
mod errors;
mod format;
mod gather;
mod payload;
pub mod pool;
mod registry;
mod scatter;
pub mod session;
pub mod transport;
mod tx_queue;
mod utils;

pub use errors::{Error, FactoryError};
pub use payload::PayloadBuffer;
pub use transport::{MEDIA_CAPACITY, ProtocolParams, Transport, make_transport};

/// A component driven by periodic invocations from the host executor.
pub trait Runnable {
    /// Performs one bounded tick of work at monotonic time `now`.
    fn run(&self, now: time::Instant);
}
