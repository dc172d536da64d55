//! Failure kinds reported by the transport core

use crate::media::MediaError;

/// Failure of a transport or session operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Invalid caller input.
    Argument,
    /// Memory pool exhaustion.
    Memory,
    /// A subscription for the same (kind, port) pair already exists.
    AlreadyExists,
    /// Reserved for stubbed functionality.
    NotImplemented,
    /// A media interface failed; the error is propagated unchanged.
    Media(MediaError),
}

impl From<MediaError> for Error {
    fn from(value: MediaError) -> Self {
        Error::Media(value)
    }
}

/// Failure of the transport factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FactoryError {
    /// No media, too many media, or other invalid configuration.
    Argument,
    /// The pool cannot host the transport's dynamic entities.
    Memory,
}
