//! The send ring: one slot per unacknowledged segment, indexed by sequence
//! number modulo the peer's advertised capacity.
//!
//! Slot headers are precomputed once when the segment is queued and live in a
//! single contiguous block; only the cumulative ack, the advertised window
//! and the EACK flag are patched at (re)transmission time. Payloads are
//! cheap `Bytes` slices of the application's message, and the head-fragment
//! slot keeps the whole message alive until its completion callback fired.

use bytes::Bytes;

use crate::error::{ArdpError, ArdpResult};
use crate::wire::{SegmentHeader, FIXED_HEADER_LEN, IP_UDP_OVERHEAD};

#[derive(Debug, Default)]
pub struct SendSlot {
    pub seq: u32,
    pub som: u32,
    pub fcnt: u16,
    pub dlen: u16,
    pub payload: Bytes,
    /// The complete original message; present on the head-fragment slot only.
    pub message: Option<Bytes>,
    pub ttl: u32,
    pub t_start: u32,
    pub on_the_wire: bool,
    pub in_use: bool,
}

#[derive(Debug)]
pub struct SendRing {
    slots: Vec<SendSlot>,
    header_block: Vec<u8>,
    /// Largest payload that fits a single segment given the peer's segment
    /// buffer, IP/UDP overhead and our header length.
    pub max_dlen: usize,
    /// Number of in-use slots, always `NXT - UNA`.
    pub pending: u16,
}

impl SendRing {
    /// `snd_max` and `segbmax` are the peer's advertised capacities from its
    /// SYN; `snd_hdr_len` is our full send header length (fixed prefix plus
    /// our EACK mask).
    pub fn new(snd_max: u32, segbmax: u32, snd_hdr_len: usize) -> ArdpResult<SendRing> {
        if snd_max == 0 {
            return Err(ArdpError::InvalidData);
        }
        if (segbmax as usize) < IP_UDP_OVERHEAD + snd_hdr_len + 1 {
            return Err(ArdpError::Failed);
        }
        let block_len = (snd_max as usize)
            .checked_mul(FIXED_HEADER_LEN)
            .ok_or(ArdpError::OutOfMemory)?;

        let mut slots = Vec::new();
        slots.resize_with(snd_max as usize, SendSlot::default);

        Ok(SendRing {
            slots,
            header_block: vec![0; block_len],
            max_dlen: segbmax as usize - IP_UDP_OVERHEAD - snd_hdr_len,
            pending: 0,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn index(&self, seq: u32) -> usize {
        (seq % self.capacity()) as usize
    }

    pub fn slot(&self, seq: u32) -> &SendSlot {
        &self.slots[self.index(seq)]
    }

    pub fn slot_mut(&mut self, seq: u32) -> &mut SendSlot {
        let idx = self.index(seq);
        &mut self.slots[idx]
    }

    pub fn slot_at(&self, idx: usize) -> &SendSlot {
        &self.slots[idx]
    }

    pub fn slot_at_mut(&mut self, idx: usize) -> &mut SendSlot {
        &mut self.slots[idx]
    }

    pub fn header(&self, seq: u32) -> &[u8] {
        let idx = self.index(seq);
        &self.header_block[idx * FIXED_HEADER_LEN..(idx + 1) * FIXED_HEADER_LEN]
    }

    pub fn header_mut(&mut self, seq: u32) -> &mut [u8] {
        let idx = self.index(seq);
        &mut self.header_block[idx * FIXED_HEADER_LEN..(idx + 1) * FIXED_HEADER_LEN]
    }

    pub fn write_header(&mut self, seq: u32, header: &SegmentHeader) {
        let mut region = self.header_mut(seq);
        header.ser(&mut region);
        debug_assert!(region.is_empty());
    }

    /// Smallest peer window that can carry a maximum-size message in one
    /// burst; below this the sender may stall mid-message, which the window
    /// check probes against.
    pub fn min_send_window(&self, max_message_len: u32) -> u16 {
        ((max_message_len as usize + self.max_dlen - 1) / self.max_dlen) as u16
    }
}

impl SendSlot {
    pub fn clear(&mut self) {
        *self = SendSlot::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_max_dlen() {
        // 28 bytes IP/UDP overhead, 28 + 4 header
        let ring = SendRing::new(4, 1024, FIXED_HEADER_LEN + 4).unwrap();
        assert_eq!(ring.max_dlen, 1024 - 28 - 32);
    }

    #[rstest]
    #[case::no_room(50)]
    #[case::only_headers(28 + 32)]
    fn test_segbmax_too_small(#[case] segbmax: u32) {
        assert_eq!(
            SendRing::new(4, segbmax, FIXED_HEADER_LEN + 4).unwrap_err(),
            ArdpError::Failed
        );
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert_eq!(
            SendRing::new(0, 1024, FIXED_HEADER_LEN).unwrap_err(),
            ArdpError::InvalidData
        );
    }

    #[rstest]
    #[case::exact(964, 1)]
    #[case::one_more(965, 2)]
    #[case::many(10_000, 11)]
    fn test_min_send_window(#[case] max_message_len: u32, #[case] expected: u16) {
        let ring = SendRing::new(4, 1024, FIXED_HEADER_LEN + 4).unwrap();
        assert_eq!(ring.min_send_window(max_message_len), expected);
    }

    #[test]
    fn test_header_block_is_per_slot() {
        let mut ring = SendRing::new(4, 1024, FIXED_HEADER_LEN).unwrap();
        let header = SegmentHeader {
            flags: SegmentHeader::FLAG_ACK | SegmentHeader::FLAG_VER,
            hlen: (FIXED_HEADER_LEN / 2) as u8,
            src: 1,
            dst: 2,
            dlen: 3,
            seq: 6,
            ack: 0,
            ttl: 0,
            som: 6,
            fcnt: 1,
            window: 0,
        };
        ring.write_header(6, &header);

        let mut b = ring.header(6);
        assert_eq!(SegmentHeader::deser(&mut b).unwrap(), header);
        // slot 6 % 4 == 2; neighbours untouched
        assert!(ring.header(5).iter().all(|&x| x == 0));
        assert!(ring.header(7).iter().all(|&x| x == 0));
    }

    #[test]
    fn test_index_wraps_with_sequence_space() {
        let ring = SendRing::new(4, 1024, FIXED_HEADER_LEN).unwrap();
        assert_eq!(ring.index(0xffff_fffe), 2);
        assert_eq!(ring.index(0xffff_ffff), 3);
        assert_eq!(ring.index(0), 0);
    }
}
