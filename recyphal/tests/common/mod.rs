//! Scripted media mock shared by the end-to-end tests
//!
//! The mock records every pushed frame and replays queued inbound frames.
//! Tests keep a shared handle to the state so they can script and inspect a
//! media while the transport holds the `&mut dyn Media`.
#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::vec::Vec;

use recyphal::frame::Mtu;
use recyphal::media::{Filter, Media, MediaError, PushResult, RxMetadata};
use recyphal::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushedFrame {
    pub deadline: Instant,
    pub can_id: u32,
    pub payload: Vec<u8>,
}

pub struct MockState {
    pub mtu: Mtu,
    pub pushed: Vec<PushedFrame>,
    /// Number of upcoming pushes to answer with `Busy`.
    pub busy_pushes: usize,
    /// Answer every push with a media error.
    pub failing_push: bool,
    pub rx_queue: VecDeque<(u32, Vec<u8>, Instant)>,
    pub filters: Vec<Filter>,
    pub filter_updates: usize,
    /// Number of upcoming `set_filters` calls to fail.
    pub failing_filter_updates: usize,
}

impl MockState {
    fn new(mtu: Mtu) -> Self {
        Self {
            mtu,
            pushed: Vec::new(),
            busy_pushes: 0,
            failing_push: false,
            rx_queue: VecDeque::new(),
            filters: Vec::new(),
            filter_updates: 0,
            failing_filter_updates: 0,
        }
    }

    /// Queues one inbound frame for the next `pop`.
    pub fn receive(&mut self, can_id: u32, payload: &[u8], timestamp: Instant) {
        self.rx_queue.push_back((can_id, payload.to_vec(), timestamp));
    }
}

pub struct MockMedia {
    state: Rc<RefCell<MockState>>,
}

impl MockMedia {
    pub fn new(mtu: Mtu) -> (Self, Rc<RefCell<MockState>>) {
        let state = Rc::new(RefCell::new(MockState::new(mtu)));
        (
            Self {
                state: state.clone(),
            },
            state,
        )
    }
}

impl Media for MockMedia {
    fn mtu(&mut self) -> Mtu {
        self.state.borrow().mtu
    }

    fn push(
        &mut self,
        deadline: Instant,
        can_id: u32,
        payload: &[u8],
    ) -> Result<PushResult, MediaError> {
        let mut state = self.state.borrow_mut();
        if state.failing_push {
            return Err(MediaError);
        }
        if state.busy_pushes > 0 {
            state.busy_pushes -= 1;
            return Ok(PushResult::Busy);
        }
        state.pushed.push(PushedFrame {
            deadline,
            can_id,
            payload: payload.to_vec(),
        });
        Ok(PushResult::Accepted)
    }

    fn pop(&mut self, payload: &mut [u8]) -> Result<Option<RxMetadata>, MediaError> {
        let mut state = self.state.borrow_mut();
        let Some((can_id, bytes, timestamp)) = state.rx_queue.pop_front() else {
            return Ok(None);
        };
        payload[..bytes.len()].copy_from_slice(&bytes);
        Ok(Some(RxMetadata {
            can_id,
            payload_size: bytes.len(),
            timestamp,
        }))
    }

    fn set_filters(&mut self, filters: &[Filter]) -> Result<(), MediaError> {
        let mut state = self.state.borrow_mut();
        state.filter_updates += 1;
        if state.failing_filter_updates > 0 {
            state.failing_filter_updates -= 1;
            return Err(MediaError);
        }
        state.filters = filters.to_vec();
        Ok(())
    }
}

pub fn ts(us: u64) -> Instant {
    Instant::MIN + Duration::from_micros(us)
}

// Identifier and tail-byte builders, spelled out bit by bit so the tests
// assert the wire format independently of the crate under test.

pub fn msg_can_id(priority: u8, subject: u16, source: Option<u8>) -> u32 {
    let mut can_id =
        u32::from(priority) << 26 | (1 << 22) | (1 << 21) | u32::from(subject) << 8;
    match source {
        Some(node) => can_id |= u32::from(node),
        None => can_id |= 1 << 24,
    }
    can_id
}

pub fn svc_can_id(priority: u8, service: u16, request: bool, source: u8, destination: u8) -> u32 {
    u32::from(priority) << 26
        | (1 << 25)
        | u32::from(request) << 24
        | u32::from(service) << 14
        | u32::from(destination) << 7
        | u32::from(source)
}

pub fn tail_byte(sot: bool, eot: bool, toggle: bool, transfer_id: u8) -> u8 {
    u8::from(sot) << 7 | u8::from(eot) << 6 | u8::from(toggle) << 5 | transfer_id
}

/// CRC-16/CCITT-FALSE over a multi-frame transfer payload.
pub fn transfer_crc(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0xffff;
    for &byte in bytes {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}
