//! Outbound transfer fragmentation
//!
//! Splits a contiguous payload into tail-byte-stamped frame payloads for one
//! MTU. Single-frame transfers carry no CRC; multi-frame transfers append the
//! transfer CRC after the payload, possibly straddling frames. Frame lengths
//! are rounded up to a valid DLC with zero padding, and padding inserted
//! before the CRC is folded into the CRC.

use recyphal_core::TransferId;
use recyphal_driver::frame::{Data, DataLength, Mtu};

use crate::format::{CRC_LENGTH, PAD_VALUE, SOT_TOGGLE_BIT, Tail, crc_add};

const TAIL_LENGTH: usize = 1;

/// Iterator over the frame payloads of one transfer.
pub(crate) struct Scatter<'a> {
    payload: &'a [u8],
    transfer_id: TransferId,
    crc: u16,
    mtu: Mtu,
    /// Progress through the logical stream `payload ++ crc`.
    offset: usize,
    toggle: bool,
}

impl<'a> Scatter<'a> {
    pub fn new(transfer_id: TransferId, payload: &'a [u8], crc: u16, mtu: Mtu) -> Self {
        Self {
            payload,
            transfer_id,
            crc,
            mtu,
            offset: 0,
            toggle: SOT_TOGGLE_BIT,
        }
    }

    /// Whether the transfer fits a single frame at this MTU.
    pub fn is_single_frame(&self) -> bool {
        self.payload.len() + TAIL_LENGTH <= usize::from(self.mtu)
    }

    fn single_frame(&mut self) -> Data {
        let frame_length = unwrap!(DataLength::new_ceil(self.payload.len() + TAIL_LENGTH));
        let mut data = Data::new_zeros(frame_length);
        let (tail, body) = unwrap!(data.split_last_mut());

        let (body_payload, body_pad) = body.split_at_mut(self.payload.len());
        body_payload.copy_from_slice(self.payload);
        body_pad.fill(PAD_VALUE);

        *tail = Tail {
            sot: true,
            eot: true,
            toggle: SOT_TOGGLE_BIT,
            transfer_id: self.transfer_id,
        }
        .encode();
        self.offset = self.payload.len() + CRC_LENGTH;
        data
    }

    fn multi_frame(&mut self) -> Data {
        let max_body = usize::from(self.mtu) - TAIL_LENGTH;
        let residual = self.payload.len() + CRC_LENGTH - self.offset;

        let frame_length =
            unwrap!(DataLength::new_ceil(residual.min(max_body) + TAIL_LENGTH));
        let mut data = Data::new_zeros(frame_length);
        let (tail, body) = unwrap!(data.split_last_mut());

        let sot = self.offset == 0;
        if residual >= body.len() {
            self.fill_body(body);
        } else {
            self.fill_padded_body(body);
        }

        *tail = Tail {
            sot,
            eot: self.offset == self.payload.len() + CRC_LENGTH,
            toggle: self.toggle,
            transfer_id: self.transfer_id,
        }
        .encode();
        self.toggle = !self.toggle;
        data
    }

    // The body is fully covered by residual payload and CRC bytes.
    fn fill_body(&mut self, body: &mut [u8]) {
        let residual_payload = &self.payload[self.offset.min(self.payload.len())..];
        let split = residual_payload.len().min(body.len());
        let (body_payload, body_crc) = body.split_at_mut(split);
        body_payload.copy_from_slice(&residual_payload[..split]);

        let crc_offset = self.offset.max(self.payload.len()) - self.payload.len();
        let crc_bytes = self.crc.to_be_bytes();
        body_crc.copy_from_slice(&crc_bytes[crc_offset..crc_offset + body_crc.len()]);

        self.offset += body.len();
    }

    // DLC rounding left room beyond the residual bytes: pad between the
    // payload and the CRC, and extend the CRC over the padding. Padding can
    // only be inserted while no CRC byte has been emitted yet.
    fn fill_padded_body(&mut self, body: &mut [u8]) {
        assert!(self.offset <= self.payload.len());
        let residual_payload = &self.payload[self.offset..];

        let (body_front, body_crc) = unwrap!(body.split_last_chunk_mut::<CRC_LENGTH>());
        let (body_payload, body_pad) = body_front.split_at_mut(residual_payload.len());
        body_payload.copy_from_slice(residual_payload);
        body_pad.fill(PAD_VALUE);

        *body_crc = crc_add(self.crc, body_pad).to_be_bytes();

        self.offset += residual_payload.len() + CRC_LENGTH;
    }
}

impl Iterator for Scatter<'_> {
    type Item = Data;

    fn next(&mut self) -> Option<Data> {
        if self.offset == 0 && self.is_single_frame() {
            return Some(self.single_frame());
        }
        if self.offset == self.payload.len() + CRC_LENGTH {
            return None;
        }
        Some(self.multi_frame())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scatter(payload: &[u8], crc: u16, mtu: Mtu) -> Scatter<'_> {
        Scatter::new(TransferId::new(27).unwrap(), payload, crc, mtu)
    }

    fn collect(s: Scatter<'_>) -> std::vec::Vec<std::vec::Vec<u8>> {
        s.map(|data| data.to_vec()).collect()
    }

    #[test]
    fn test_empty_payload() {
        let frames = collect(scatter(&[], 0xffff, Mtu::Classic));
        assert_eq!(frames, [[0b1110_0000 + 27].to_vec()]);
    }

    #[test]
    fn test_single_frame() {
        let frames = collect(scatter(&[0, 1, 2, 3, 4, 5, 6], 0x28c2, Mtu::Classic));
        assert_eq!(frames, [[0, 1, 2, 3, 4, 5, 6, 0b1110_0000 + 27].to_vec()]);
    }

    #[test]
    fn test_minimum_double_frame() {
        // One byte over the single-frame limit forces a second frame carrying
        // the spill byte and the CRC.
        let frames = collect(scatter(&[0, 1, 2, 3, 4, 5, 6, 7], 0x178d, Mtu::Classic));
        assert_eq!(
            frames,
            [
                [0, 1, 2, 3, 4, 5, 6, 0b1010_0000 + 27].to_vec(),
                [7, 0x17, 0x8d, 0b0100_0000 + 27].to_vec(),
            ]
        );
    }

    #[test]
    fn test_triple_frame_split_crc() {
        // Thirteen payload bytes leave room for only one CRC byte in the
        // second frame; the second CRC byte spills into a third.
        let payload: [u8; 13] = core::array::from_fn(|i| i as u8);
        let frames = collect(scatter(&payload, 0xacdd, Mtu::Classic));
        assert_eq!(
            frames,
            [
                [0, 1, 2, 3, 4, 5, 6, 0b1010_0000 + 27].to_vec(),
                [7, 8, 9, 10, 11, 12, 0xac, 0b0000_0000 + 27].to_vec(),
                [0xdd, 0b0110_0000 + 27].to_vec(),
            ]
        );
    }

    #[test]
    fn test_crc_only_last_frame() {
        let payload: [u8; 14] = core::array::from_fn(|i| i as u8);
        let frames = collect(scatter(&payload, 0x78cb, Mtu::Classic));
        assert_eq!(
            frames,
            [
                [0, 1, 2, 3, 4, 5, 6, 0b1010_0000 + 27].to_vec(),
                [7, 8, 9, 10, 11, 12, 13, 0b0000_0000 + 27].to_vec(),
                [0x78, 0xcb, 0b0110_0000 + 27].to_vec(),
            ]
        );
    }

    #[test]
    fn test_fd_single_frame_padding() {
        // 8 payload bytes round up to a 12-byte FD frame with zero padding.
        let frames = collect(scatter(&[0, 1, 2, 3, 4, 5, 6, 7], 0x178d, Mtu::Fd));
        assert_eq!(
            frames,
            [[0, 1, 2, 3, 4, 5, 6, 7, 0, 0, 0, 0b1110_0000 + 27].to_vec()]
        );
    }

    #[test]
    fn test_fd_multi_frame_padding_extends_crc() {
        let payload: [u8; 69] = core::array::from_fn(|i| i as u8);
        let frames = collect(scatter(&payload, 0xd7de, Mtu::Fd));

        let first: std::vec::Vec<u8> = (0u8..63).chain([0b1010_0000 + 27]).collect();
        assert_eq!(
            frames,
            [
                first,
                [63, 64, 65, 66, 67, 68, 0, 0, 0, 0xd6, 0x2c, 0b0100_0000 + 27].to_vec(),
            ]
        );
    }

    #[test]
    fn test_toggle_alternates() {
        let payload: [u8; 20] = [0; 20];
        let toggles: std::vec::Vec<bool> = scatter(&payload, 0, Mtu::Classic)
            .map(|data| Tail::parse(*data.last().unwrap()).toggle)
            .collect();
        assert_eq!(toggles, [true, false, true]);
    }
}
