//! Recyphal media interface
//!
//! The boundary between CAN device drivers and the recyphal transport core.
//! Driver crates should depend on this crate only; stack users should depend
//! on the `recyphal` crate, which re-exports everything here.
//!
//! A [`media::Media`] implementation wraps one physical interface. The core
//! polls it from its periodic run entry point: outgoing frames are offered
//! with [`media::Media::push`] (which must not block — a busy interface
//! reports [`media::PushResult::Busy`] and the core retries on the next run),
//! incoming frames are collected with [`media::Media::pop`], and hardware
//! acceptance filters are installed with [`media::Media::set_filters`]
//! whenever the set of active ports changes.
//!
//! Redundant transports hold several independent `Media` instances; the core
//! never assumes any ordering between them.

#![no_std]

pub mod frame;
pub mod media;

pub mod time {
    pub use embassy_time::{Duration, Instant};
}
