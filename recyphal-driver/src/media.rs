//! The media interface consumed by the transport core

use embassy_time::Instant;

use crate::frame::Mtu;

/// Opaque media-layer failure.
///
/// The core never interprets the failure; it either drops the offending frame
/// or reports the error to the caller unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MediaError;

/// Outcome of a non-blocking frame push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PushResult {
    /// The interface took ownership of the frame.
    Accepted,
    /// The interface cannot take a frame right now; the core keeps the frame
    /// queued and retries on a later run.
    Busy,
}

/// Hardware acceptance filter: a received extended CAN identifier is accepted
/// when `(can_id & mask) == (id & mask)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Filter {
    pub id: u32,
    pub mask: u32,
}

/// Reception metadata reported by [`Media::pop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RxMetadata {
    /// Extended (29-bit) CAN identifier of the received frame.
    pub can_id: u32,
    /// Number of payload bytes written into the caller's buffer.
    pub payload_size: usize,
    /// Instant the frame appeared on the bus.
    pub timestamp: Instant,
}

/// A single CAN interface.
///
/// All methods must be non-blocking. The MTU may change at runtime (e.g. an
/// FD interface falling back to Classic); the core re-reads it before every
/// fragmentation and drain pass.
pub trait Media {
    fn mtu(&mut self) -> Mtu;

    /// Offers one frame for transmission.
    ///
    /// `deadline` is advisory: an interface that queues internally should
    /// discard the frame once the deadline passes.
    fn push(
        &mut self,
        deadline: Instant,
        can_id: u32,
        payload: &[u8],
    ) -> Result<PushResult, MediaError>;

    /// Fetches one received frame, writing its payload into `payload`.
    ///
    /// Returns `Ok(None)` when no frame is pending. `payload` is at least
    /// [`Mtu::Fd`] bytes long.
    fn pop(&mut self, payload: &mut [u8]) -> Result<Option<RxMetadata>, MediaError>;

    /// Replaces the set of hardware acceptance filters.
    ///
    /// An empty slice clears the filters (nothing is accepted).
    fn set_filters(&mut self, filters: &[Filter]) -> Result<(), MediaError>;
}
