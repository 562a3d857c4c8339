use bytes::{Buf, BufMut};

use crate::error::{ArdpError, ArdpResult};

/// Length of the fixed segment header, without the EACK mask suffix.
pub const FIXED_HEADER_LEN: usize = 28;
/// Length of a SYN header: the fixed prefix with the EACK suffix replaced by
/// `segmax | segbmax | options`.
pub const SYN_HEADER_LEN: usize = FIXED_HEADER_LEN + 6;
/// IP plus UDP header overhead that eats into the peer's advertised segment
/// buffer.
pub const IP_UDP_OVERHEAD: usize = 20 + 8;
/// Largest datagram the ingress path will accept.
pub const MAX_DATAGRAM_LEN: usize = 65536;

/// Decoded view of a segment header.
///
/// All fields are kept in host order; `ser`/`deser` are the only places that
/// touch network byte order. `hlen` is the full header length in units of two
/// octets, so a data header on a connection with a two-word EACK mask has
/// `hlen = (28 + 8) / 2 = 18`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    pub flags: u8,
    pub hlen: u8,
    pub src: u16,
    pub dst: u16,
    pub dlen: u16,
    pub seq: u32,
    pub ack: u32,
    pub ttl: u32,
    pub som: u32,
    pub fcnt: u16,
    pub window: u16,
}

impl SegmentHeader {
    pub const FLAG_SYN: u8 = 0x01;
    pub const FLAG_ACK: u8 = 0x02;
    pub const FLAG_EACK: u8 = 0x04;
    pub const FLAG_RST: u8 = 0x08;
    pub const FLAG_NUL: u8 = 0x10;
    pub const FLAG_FRAG: u8 = 0x20;
    pub const FLAG_VER: u8 = 0x40;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.flags);
        buf.put_u8(self.hlen);
        buf.put_u16(self.src);
        buf.put_u16(self.dst);
        buf.put_u16(self.dlen);
        buf.put_u32(self.seq);
        buf.put_u32(self.ack);
        buf.put_u32(self.ttl);
        buf.put_u32(self.som);
        buf.put_u16(self.fcnt);
        buf.put_u16(self.window);
    }

    pub fn deser(buf: &mut impl Buf) -> ArdpResult<SegmentHeader> {
        if buf.remaining() < FIXED_HEADER_LEN {
            return Err(ArdpError::InvalidData);
        }
        Ok(SegmentHeader {
            flags: buf.get_u8(),
            hlen: buf.get_u8(),
            src: buf.get_u16(),
            dst: buf.get_u16(),
            dlen: buf.get_u16(),
            seq: buf.get_u32(),
            ack: buf.get_u32(),
            ttl: buf.get_u32(),
            som: buf.get_u32(),
            fcnt: buf.get_u16(),
            window: buf.get_u16(),
        })
    }

    pub fn header_len_bytes(&self) -> usize {
        self.hlen as usize * 2
    }

    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// The connection parameters a SYN carries in place of the EACK suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynParams {
    /// Number of segments the sender of the SYN can buffer on receive.
    pub segmax: u16,
    /// Largest segment (including headers and IP/UDP overhead) the sender of
    /// the SYN is willing to receive.
    pub segbmax: u16,
    pub options: u16,
}

impl SynParams {
    /// Sequenced delivery mode. The only defined option, always set.
    pub const OPTION_SDM: u16 = 0x0001;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.segmax);
        buf.put_u16(self.segbmax);
        buf.put_u16(self.options);
    }

    pub fn deser(buf: &mut impl Buf) -> ArdpResult<SynParams> {
        if buf.remaining() < SYN_HEADER_LEN - FIXED_HEADER_LEN {
            return Err(ArdpError::InvalidData);
        }
        Ok(SynParams {
            segmax: buf.get_u16(),
            segbmax: buf.get_u16(),
            options: buf.get_u16(),
        })
    }
}

/// Extract (local, foreign) ARDP ports from a raw datagram without decoding
/// the rest of the header. The local port is the segment's destination, the
/// foreign port its source.
pub fn demux(buf: &[u8]) -> Option<(u16, u16)> {
    if buf.len() < FIXED_HEADER_LEN {
        return None;
    }
    let foreign = u16::from_be_bytes([buf[2], buf[3]]);
    let local = u16::from_be_bytes([buf[4], buf[5]]);
    Some((local, foreign))
}

/// Patch the per-transmission fields of a precomputed header in place: the
/// cumulative ack, the advertised receive window, and the EACK flag. These
/// are the only fields that change between the original transmission of a
/// segment and its retransmissions.
pub fn patch_for_transmit(hdr: &mut [u8], ack: u32, window: u16, eack: bool) {
    debug_assert!(hdr.len() >= FIXED_HEADER_LEN);
    if eack {
        hdr[0] |= SegmentHeader::FLAG_EACK;
    } else {
        hdr[0] &= !SegmentHeader::FLAG_EACK;
    }
    hdr[12..16].copy_from_slice(&ack.to_be_bytes());
    hdr[26..28].copy_from_slice(&window.to_be_bytes());
}
