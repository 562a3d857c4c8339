//! ARDP is a reliable datagram protocol: it layers reliable, ordered,
//! message-oriented delivery with flow control on top of a plain UDP socket,
//! while leaving scheduling in the hands of its host.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages* (defined-length chunks
//!   of data as opposed to streams of bytes)
//!   * big messages are fragmented below IP level - the protocol takes care
//!     of splitting, buffering and reassembling, and delivers a message in
//!     one piece exactly once
//! * Connection-oriented with an explicit three-way handshake
//!   * several connections share one UDP socket pair; an additional pair of
//!     'port numbers' in the segment header multiplexes them
//!   * each side declares its receive capacities (segment count and segment
//!     size) in the handshake, and the peer sizes its send state from them
//! * Buffer incoming data when segments are missing, delaying delivery to
//!   the application until gaps are filled
//!   * segments have 32-bit wrap-around sequence numbers, cumulative
//!     acknowledgement, and a selective-acknowledgement bitmask (EACK) that
//!     lets the sender skip retransmitting what already arrived
//! * Flow control by receiver-advertised window credits, in segments; the
//!   application releases delivered messages explicitly to open the window
//! * Per-message time-to-live: a message that could not reach the wire in
//!   time is dropped locally, never half-delivered
//! * Keep-alive probing and link-death detection, driven by per-connection
//!   timers
//! * Single-threaded cooperative engine: no internal threads, no internal
//!   blocking; the owner calls [`engine::ArdpEngine::run`] on socket
//!   readability or deadline expiry and sleeps with the returned bound
//!
//! Explicitly *not* goals: congestion control (the retransmission timeout is
//! fixed), encryption, multi-path or multihoming.
//!
//! ## Header
//!
//! Fixed segment header (all numbers in network byte order, BE):
//!
//! ```ascii
//! 0:  flags (u8): SYN 01 | ACK 02 | EACK 04 | RST 08 | NUL 10 | FRAG 20 | VER 40
//! 1:  header length in units of two octets, including the EACK suffix (u8)
//! 2:  source port (u16)
//! 4:  destination port (u16)
//! 6:  payload length (u16)
//! 8:  sequence number (u32)
//! 12: cumulative acknowledgement (u32)
//! 16: time-to-live in ms, 0 = infinite (u32)
//! 20: start-of-message sequence for fragmented messages (u32)
//! 24: fragment count of the message (u16)
//! 26: advertised receive window in segments (u16)
//! 28: EACK mask, fixed number of u32 words sized by the receive capacity;
//!      bit 0 (MSB of the first word) is sequence `ack + 2`
//! ```
//!
//! A SYN replaces the EACK suffix with its connection parameters:
//!
//! ```ascii
//! 28: segmax (u16) - receive capacity in segments
//! 30: segbmax (u16) - largest acceptable segment in bytes
//! 32: options (u16) - always 'sequenced delivery mode'
//! ```
//!
//! The SYN payload is an opaque handshake blob handed to the accept /
//! connect callbacks on the other side.
//!
//! ## Control segments
//!
//! *SYN / SYN-ACK / ACK*: the classic three-way open. Both sides learn the
//! peer's capacities from the SYN exchange and allocate their rings from
//! them: the send ring is sized by the peer's `segmax`, receive buffers are
//! `segmax * segbmax` bytes allocated once.
//!
//! *NUL*: header-only keep-alive probe, sent when the link has been quiet
//! for a persist period or the peer's window is too small to make progress.
//! The receiver answers with a bare ACK carrying its current window.
//!
//! *RST*: refuses segments that match no usable connection state, and
//! initiates teardown; the resetting side lingers in a drain state before
//! its record disappears so late segments die quietly.
//!
//! ## Related
//!
//! * TCP: same handshake shape and cumulative-ack discipline, but TCP is a
//!   byte stream - it has no message boundaries to preserve and its windows
//!   count bytes, not segments
//! * SCTP: message-oriented with selective acks like this protocol, but far
//!   bigger (multi-streaming, multihoming)
//! * QUIC: connection-based with streams and mandatory encryption; solves a
//!   superset of this problem with a very different cost profile

pub mod config;
pub mod conn;
pub mod eack;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod events;
pub mod rbuf;
pub mod sbuf;
pub mod seq;
pub mod socket;
pub mod timer;
pub mod wire;

pub use config::ArdpConfig;
pub use endpoint::ArdpEndpoint;
pub use engine::{ArdpEngine, ConnId, ConnInfo};
pub use error::{ArdpError, ArdpResult, Status};
pub use events::{ArdpEvents, RecvMessage};
pub use socket::DatagramSocket;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
