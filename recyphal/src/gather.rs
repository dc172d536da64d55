//! Inbound transfer reassembly
//!
//! One [`Reassembler`] tracks one (subscription, source node) pair. It
//! consumes frame payloads in reception order and produces at most one
//! assembled transfer per transfer-id within the transfer-id timeout, which
//! also suppresses replicas arriving over redundant media.
//!
//! Rules, chosen where the specification leaves slack:
//! * a frame without a tail byte does not exist for reassembly purposes;
//! * a frame that does not continue the tracked transfer-id (or arrives
//!   after the transfer-id timeout) abandons the tracked state — there is no
//!   in-session preemption, so a foreign frame ends any transfer in progress;
//! * a start-of-transfer frame with an inverted toggle, a non-final frame
//!   shorter than a valid MTU, and a final frame with an empty body are all
//!   format errors that abandon the transfer;
//! * a frame repeating the previous toggle value is a duplicate and is
//!   ignored without disturbing the accumulated state;
//! * the payload is accumulated saturating at the buffer length while the
//!   CRC runs over the complete image, so an extent-capped subscription still
//!   validates long transfers.

use recyphal_core::{Priority, TransferId};
use recyphal_driver::frame::Mtu;
use recyphal_driver::time::{Duration, Instant};

use crate::format::{CRC_INIT, CRC_LENGTH, CRC_RESIDUE, SOT_TOGGLE_BIT, Tail, crc_add};

/// A fully reassembled transfer. The payload bytes are in the caller's
/// buffer; `length` is the true payload length, which may exceed what the
/// buffer retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AssembledTransfer {
    pub transfer_id: TransferId,
    pub priority: Priority,
    pub timestamp: Instant,
    pub length: u32,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    /// Nothing tracked; `start_timestamp` and `transfer_id` are unset.
    Idle,
    /// A previous transfer left a timestamp but no tracked transfer-id.
    Seen,
    /// Start frame of a multi-frame transfer accumulated.
    First,
    /// Accumulated through a frame with an inverted toggle.
    Odd,
    /// Accumulated through a frame with the start toggle value.
    Even,
    /// A transfer with the tracked id completed; replicas are ignored.
    Done,
}

pub(crate) struct Reassembler {
    phase: Phase,
    start_timestamp: Option<Instant>,
    transfer_id: Option<TransferId>,
    acc: Accumulator,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            start_timestamp: None,
            transfer_id: None,
            acc: Accumulator::default(),
        }
    }
}

impl Reassembler {
    /// Timestamp of the tracked or last completed transfer, used to judge
    /// staleness of this reassembler as a whole.
    pub fn last_activity(&self) -> Option<Instant> {
        match self.phase {
            Phase::Idle => None,
            _ => self.start_timestamp,
        }
    }

    /// Feeds one frame payload (tail byte included).
    ///
    /// `buffer` must be the same storage across all frames of one transfer.
    #[rustfmt::skip]
    pub fn push_frame(
        &mut self,
        timeout: Duration,
        buffer: &mut [u8],
        priority: Priority,
        data: &[u8],
        timestamp: Instant,
    ) -> Option<AssembledTransfer> {
        let (tail_byte, body) = data.split_last()?;
        let tail = Tail::parse(*tail_byte);

        let tid_match = match self.phase {
            Phase::Idle | Phase::Seen => false,
            Phase::First | Phase::Odd | Phase::Even | Phase::Done => {
                tail.transfer_id == unwrap!(self.transfer_id)
                    && timestamp
                        <= unwrap!(self.start_timestamp)
                            .checked_add(timeout)
                            .unwrap_or(Instant::MAX)
            }
        };

        let odd = tail.toggle ^ SOT_TOGGLE_BIT;
        let frame = Frame { transfer_id: tail.transfer_id, priority, body, timestamp };

        match (self.phase, tail.sot, tail.eot, odd, tid_match) {
            (Phase::Done, _, _, _, true) => None,
            (_, true, _, true, _) => self.abandon(),
            (_, true, true, false, _) => self.complete_single(buffer, frame),
            (_, true, false, false, _) => self.start(buffer, frame),
            (_, _, _, _, false) => self.abandon(),
            (Phase::Idle | Phase::Seen, _, _, _, _) => None,
            (Phase::First, false, false, false, true) => self.abandon(),
            (Phase::First, false, false, true, true) => self.accumulate(buffer, frame, Phase::Odd),
            (Phase::First, false, true, false, true) => self.abandon(),
            (Phase::First, false, true, true, true) => self.complete_multi(buffer, frame),
            (Phase::Odd, false, false, false, true) => self.accumulate(buffer, frame, Phase::Even),
            (Phase::Odd, false, false, true, true) => None,
            (Phase::Odd, false, true, false, true) => self.complete_multi(buffer, frame),
            (Phase::Odd, false, true, true, true) => self.abandon(),
            (Phase::Even, false, false, false, true) => None,
            (Phase::Even, false, false, true, true) => self.accumulate(buffer, frame, Phase::Odd),
            (Phase::Even, false, true, false, true) => self.abandon(),
            (Phase::Even, false, true, true, true) => self.complete_multi(buffer, frame),
        }
    }

    fn complete_single(&mut self, buffer: &mut [u8], frame: Frame) -> Option<AssembledTransfer> {
        let retain = frame.body.len().min(buffer.len());
        buffer[..retain].copy_from_slice(&frame.body[..retain]);

        self.phase = Phase::Done;
        self.start_timestamp = Some(frame.timestamp);
        self.transfer_id = Some(frame.transfer_id);
        self.acc = Accumulator::default();

        Some(AssembledTransfer {
            transfer_id: frame.transfer_id,
            priority: frame.priority,
            timestamp: frame.timestamp,
            length: unwrap!(frame.body.len().try_into()),
        })
    }

    fn start(&mut self, buffer: &mut [u8], frame: Frame) -> Option<AssembledTransfer> {
        if Mtu::try_from(frame.body.len() + 1).is_err() {
            return self.abandon();
        }

        self.phase = Phase::First;
        self.start_timestamp = Some(frame.timestamp);
        self.transfer_id = Some(frame.transfer_id);
        self.acc = Accumulator::default();

        if self.acc.append(buffer, frame.body).is_err() {
            return self.abandon();
        }
        None
    }

    fn accumulate(
        &mut self,
        buffer: &mut [u8],
        frame: Frame,
        next: Phase,
    ) -> Option<AssembledTransfer> {
        if Mtu::try_from(frame.body.len() + 1).is_err() {
            return self.abandon();
        }

        self.phase = next;
        if self.acc.append(buffer, frame.body).is_err() {
            return self.abandon();
        }
        None
    }

    fn complete_multi(&mut self, buffer: &mut [u8], frame: Frame) -> Option<AssembledTransfer> {
        if frame.body.is_empty() {
            return self.abandon();
        }
        if self.acc.append(buffer, frame.body).is_err() {
            return self.abandon();
        }

        let length = match self.acc.finish() {
            Ok(length) => length,
            Err(()) => return self.abandon(),
        };

        self.phase = Phase::Done;
        self.acc = Accumulator::default();

        Some(AssembledTransfer {
            transfer_id: unwrap!(self.transfer_id),
            priority: frame.priority,
            timestamp: unwrap!(self.start_timestamp),
            length,
        })
    }

    fn abandon(&mut self) -> Option<AssembledTransfer> {
        self.phase = if self.start_timestamp.is_some() {
            Phase::Seen
        } else {
            Phase::Idle
        };
        self.transfer_id = None;
        self.acc = Accumulator::default();
        None
    }
}

struct Frame<'a> {
    transfer_id: TransferId,
    priority: Priority,
    body: &'a [u8],
    timestamp: Instant,
}

/// Saturating payload accumulator with a running transfer CRC.
struct Accumulator {
    length: u32,
    crc: u16,
}

impl Default for Accumulator {
    fn default() -> Self {
        Self {
            length: 0,
            crc: CRC_INIT,
        }
    }
}

impl Accumulator {
    fn append(&mut self, buffer: &mut [u8], body: &[u8]) -> Result<(), ()> {
        let new_length = u32::try_from(body.len())
            .ok()
            .and_then(|len| self.length.checked_add(len))
            .ok_or(())?;

        let offset = buffer
            .len()
            .min(usize::try_from(self.length).unwrap_or(usize::MAX));
        let retain = body.len().min(buffer.len() - offset);
        buffer[offset..offset + retain].copy_from_slice(&body[..retain]);

        self.length = new_length;
        self.crc = crc_add(self.crc, body);
        Ok(())
    }

    // The fold over payload plus appended CRC bytes lands on the residue
    // exactly when they agree.
    fn finish(&self) -> Result<u32, ()> {
        let crc_len = CRC_LENGTH as u32;
        if self.length >= crc_len && self.crc == CRC_RESIDUE {
            Ok(self.length - crc_len)
        } else {
            Err(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_micros(2_000_000);
    const PRIORITY: Priority = Priority::Nominal;

    fn ts(us: u64) -> Instant {
        Instant::MIN + Duration::from_micros(us)
    }

    fn push(
        r: &mut Reassembler,
        buffer: &mut [u8],
        data: &[u8],
        at: Instant,
    ) -> Option<AssembledTransfer> {
        r.push_frame(TIMEOUT, buffer, PRIORITY, data, at)
    }

    #[test]
    fn test_single_frame_transfer() {
        let mut r = Reassembler::default();
        let mut buffer = [0xff; 8];

        let out = push(&mut r, &mut buffer, &[0, 1, 2, 3, 0b1110_0000 + 27], ts(10));
        assert_eq!(
            out,
            Some(AssembledTransfer {
                transfer_id: TransferId::new(27).unwrap(),
                priority: PRIORITY,
                timestamp: ts(10),
                length: 4,
            })
        );
        assert_eq!(buffer[..4], [0, 1, 2, 3]);
    }

    #[test]
    fn test_empty_single_frame() {
        let mut r = Reassembler::default();
        let mut buffer = [0xff; 8];

        let out = push(&mut r, &mut buffer, &[0b1110_0000 + 27], ts(10));
        assert_eq!(out.unwrap().length, 0);
    }

    #[test]
    fn test_two_frame_transfer() {
        let mut r = Reassembler::default();
        let mut buffer = [0xff; 16];

        let out = push(
            &mut r,
            &mut buffer,
            &[0, 1, 2, 3, 4, 5, 6, 0b1010_0000 + 27],
            ts(10),
        );
        assert_eq!(out, None);

        let out = push(&mut r, &mut buffer, &[7, 0x17, 0x8d, 0b0100_0000 + 27], ts(12));
        assert_eq!(
            out,
            Some(AssembledTransfer {
                transfer_id: TransferId::new(27).unwrap(),
                priority: PRIORITY,
                timestamp: ts(10),
                length: 8,
            })
        );
        assert_eq!(buffer[..8], [0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_bad_crc_rejected() {
        let mut r = Reassembler::default();
        let mut buffer = [0xff; 16];

        assert!(push(&mut r, &mut buffer, &[0, 1, 2, 3, 4, 5, 6, 0b1010_0000 + 27], ts(10)).is_none());
        assert!(push(&mut r, &mut buffer, &[7, 0x17, 0x8e, 0b0100_0000 + 27], ts(10)).is_none());
    }

    #[test]
    fn test_saturating_accumulation_keeps_crc() {
        // The buffer retains four bytes; the CRC still validates all eight.
        let mut r = Reassembler::default();
        let mut buffer = [0xff; 4];

        assert!(push(&mut r, &mut buffer, &[0, 1, 2, 3, 4, 5, 6, 0b1010_0000 + 27], ts(10)).is_none());
        let out = push(&mut r, &mut buffer, &[7, 0x17, 0x8d, 0b0100_0000 + 27], ts(10));
        assert_eq!(out.unwrap().length, 8);
        assert_eq!(buffer, [0, 1, 2, 3]);
    }

    #[test]
    fn test_duplicate_frames_ignored() {
        let mut r = Reassembler::default();
        let mut buffer = [0xff; 32];

        for data in [
            [0, 1, 2, 3, 4, 5, 6, 0b1010_0000 + 27].as_slice(),
            &[0, 1, 2, 3, 4, 5, 6, 0b1010_0000 + 27],
            &[7, 8, 9, 10, 11, 12, 0xac, 0b0000_0000 + 27],
            &[7, 8, 9, 10, 11, 12, 0xac, 0b0000_0000 + 27],
        ] {
            assert_eq!(push(&mut r, &mut buffer, data, ts(10)), None);
        }

        let out = push(&mut r, &mut buffer, &[0xdd, 0b0110_0000 + 27], ts(10));
        assert_eq!(out.unwrap().length, 13);
        assert_eq!(buffer[..13], [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
    }

    #[test]
    fn test_completed_transfer_replica_suppressed() {
        let mut r = Reassembler::default();
        let mut buffer = [0xff; 8];

        let data = [0, 1, 2, 3, 0b1110_0000 + 27];
        assert!(push(&mut r, &mut buffer, &data, ts(10)).is_some());
        // Replica from a redundant interface within the timeout window.
        assert!(push(&mut r, &mut buffer, &data, ts(20)).is_none());
        // Same id long after the timeout is a new transfer.
        assert!(push(&mut r, &mut buffer, &data, ts(2_000_011)).is_some());
    }

    #[test]
    fn test_interleaved_foreign_frame_aborts() {
        let mut buffer = [0xff; 16];
        let first = [0, 1, 2, 3, 4, 5, 6, 0b1010_0000 + 27];
        let last = [7, 0x17, 0x8d, 0b0100_0000 + 27];
        let foreign = [0b0000_0000 + 28];

        let mut r = Reassembler::default();
        assert!(push(&mut r, &mut buffer, &first, ts(10)).is_none());
        assert!(push(&mut r, &mut buffer, &foreign, ts(11)).is_none());
        assert!(push(&mut r, &mut buffer, &last, ts(12)).is_none());
    }

    #[test]
    fn test_timeout_aborts_reassembly() {
        let mut buffer = [0xff; 16];
        let first = [0, 1, 2, 3, 4, 5, 6, 0b1010_0000 + 27];
        let last = [7, 0x17, 0x8d, 0b0100_0000 + 27];

        let mut r = Reassembler::default();
        assert!(push(&mut r, &mut buffer, &first, ts(10)).is_none());
        assert!(push(&mut r, &mut buffer, &last, ts(2_000_020)).is_none());
    }

    #[test]
    fn test_restart_from_second_replica() {
        let mut buffer = [0xff; 16];
        let first = [0, 1, 2, 3, 4, 5, 6, 0b1010_0000 + 27];
        let last = [7, 0x17, 0x8d, 0b0100_0000 + 27];

        let mut r = Reassembler::default();
        assert!(push(&mut r, &mut buffer, &first, ts(10)).is_none());
        assert!(push(&mut r, &mut buffer, &first, ts(10)).is_none());
        assert!(push(&mut r, &mut buffer, &last, ts(10)).is_some());
    }
}
