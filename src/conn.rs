use std::net::SocketAddr;

use tracing::trace;

use crate::eack::EackMask;
use crate::rbuf::RecvRing;
use crate::sbuf::SendRing;
use crate::timer::TimerList;
use crate::wire::FIXED_HEADER_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// No session. Freshly created records and terminated ones.
    Closed,
    /// Passive record holding a peer's SYN, waiting for the host to accept.
    Listen,
    /// Active open in flight, SYN sent.
    SynSent,
    /// Passive open acknowledged with SYN-ACK, waiting for the final ACK.
    SynRcvd,
    /// Data flows.
    Open,
    /// Draining before the record disappears.
    CloseWait,
}

/// Send-side sequence control: what we manage locally and may tell the peer.
#[derive(Debug, Default, Clone, Copy)]
pub struct SndCtrl {
    /// Next sequence to assign.
    pub nxt: u32,
    /// Oldest unacknowledged sequence.
    pub una: u32,
    /// Initial send sequence, carried in our SYN.
    pub iss: u32,
    /// Peer's receive capacity in segments; our send ring size.
    pub max: u32,
}

/// Receive-side sequence control: what the peer manages, copies of which we
/// learn from its segments.
#[derive(Debug, Default, Clone, Copy)]
pub struct RcvCtrl {
    /// Last sequence received correctly and in order.
    pub cur: u32,
    /// Our receive capacity in segments.
    pub max: u32,
    /// Peer's initial sequence, from its SYN.
    pub irs: u32,
}

/// Everything there is to know about one reliable link.
pub struct Connection {
    pub state: ConnState,
    pub passive: bool,
    pub local: u16,
    pub foreign: u16,
    pub peer: SocketAddr,

    pub snd: SndCtrl,
    pub rcv: RcvCtrl,

    /// Send ring, allocated once the peer's capacities are known.
    pub sbuf: Option<SendRing>,
    /// Peer's segbmax: the largest segment it accepts.
    pub sbuf_max: u32,
    /// Receive ring, allocated at active connect or at accept.
    pub rbuf: Option<RecvRing>,

    /// Our out-of-order tracking, advertised to the peer.
    pub rcv_msk: EackMask,
    /// Number of 32-bit mask words in headers the peer sends us.
    pub remote_msk_words: usize,

    pub snd_hdr_len: usize,
    pub rcv_hdr_len: usize,

    /// Peer's most recently advertised receive window.
    pub peer_window: u16,
    /// Window below which the window check starts probing.
    pub min_send_window: u16,

    /// Engine-clock timestamp of the last segment from the peer.
    pub last_seen: u32,

    pub timers: TimerList,

    /// Opaque host tag.
    pub token: u64,
}

impl Connection {
    pub fn new(peer: SocketAddr, local: u16, foreign: u16, iss: u32) -> Connection {
        Connection {
            state: ConnState::Closed,
            passive: false,
            local,
            foreign,
            peer,
            snd: SndCtrl {
                iss,
                nxt: iss.wrapping_add(1),
                una: iss,
                max: 0,
            },
            rcv: RcvCtrl::default(),
            sbuf: None,
            sbuf_max: 0,
            rbuf: None,
            rcv_msk: EackMask::new(0),
            remote_msk_words: 0,
            snd_hdr_len: FIXED_HEADER_LEN,
            rcv_hdr_len: FIXED_HEADER_LEN,
            peer_window: 0,
            min_send_window: 0,
            last_seen: 0,
            timers: TimerList::default(),
            token: 0,
        }
    }

    pub fn set_state(&mut self, state: ConnState) {
        trace!(local = self.local, foreign = self.foreign, "{:?} => {:?}", self.state, state);
        self.state = state;
    }
}
