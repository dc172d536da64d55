//! (De)serialization boundary of the recyphal stack
//!
//! The transport core moves opaque byte buffers; typed clients and generated
//! DSDL structs meet it through the traits re-exported here. Stack users
//! should prefer the `recyphal::encoding` re-export over depending on this
//! crate directly.

#![no_std]

pub use canadensis_encoding::*;

/// Associates a serializable type with a stack buffer large enough to hold
/// its longest wire image.
pub trait BufferType {
    type Buffer: Sized + Send + Sync + Default + AsMut<[u8]> + AsRef<[u8]> + 'static;
}

pub struct StaticBuffer<const N: usize>([u8; N]);

impl<const N: usize> Default for StaticBuffer<N> {
    fn default() -> Self {
        Self([0; N])
    }
}

impl<const N: usize> AsRef<[u8]> for StaticBuffer<N> {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl<const N: usize> AsMut<[u8]> for StaticBuffer<N> {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}
