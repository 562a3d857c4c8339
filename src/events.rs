use std::net::SocketAddr;

use bytes::Bytes;

use crate::engine::ConnId;
use crate::error::Status;

/// A message ready for delivery: the head fragment's sequence plus one
/// payload view per fragment, in order. Views borrow the connection's
/// receive ring; the slots stay occupied until the host calls `recv_ready`
/// with the head sequence.
#[derive(Debug)]
pub struct RecvMessage<'a> {
    pub seq: u32,
    pub fcnt: u16,
    pub segments: Vec<&'a [u8]>,
}

impl RecvMessage<'_> {
    pub fn total_len(&self) -> usize {
        self.segments.iter().map(|s| s.len()).sum()
    }

    /// Concatenated payload. Copies; hosts that can consume the fragment
    /// views directly should prefer those.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_len());
        for segment in &self.segments {
            out.extend_from_slice(segment);
        }
        out
    }
}

/// How the engine talks back to its host. All callbacks run synchronously
/// from inside `run()` or the API call that caused the transition, in the
/// order the transitions occur. They must not call back into the engine;
/// hosts queue the `ConnId`s and act after the call returns.
pub trait ArdpEvents: Send {
    /// An unsolicited SYN arrived while the engine was accepting. Return
    /// `true` to keep the embryonic connection around (the host is then
    /// expected to call `accept` or let the connect timeout reap it),
    /// `false` to drop it on the floor.
    fn on_accept(&mut self, peer: SocketAddr, conn: ConnId, data: &[u8], status: Status) -> bool;

    /// A connect attempt concluded. `passive` tells which side this is;
    /// `data` is the peer's piggybacked handshake payload, if any.
    fn on_connect(&mut self, conn: ConnId, passive: bool, data: &[u8], status: Status);

    /// The connection is gone; its `ConnId` is dead after this returns.
    fn on_disconnect(&mut self, conn: ConnId, status: Status);

    /// An in-order message is ready. Return `false` to refuse it; the engine
    /// then retries after a delay and tears the connection down when its
    /// patience runs out. The host must call `recv_ready(conn, message.seq)`
    /// once it is done with an accepted message.
    fn on_receive(&mut self, conn: ConnId, message: RecvMessage<'_>, status: Status) -> bool;

    /// A previously queued message left the send ring: acknowledged by the
    /// peer (`Ok`), expired, or given up on after retransmit exhaustion.
    fn on_send_complete(&mut self, conn: ConnId, message: Bytes, status: Status);

    /// The peer advertised a different receive window. Status is
    /// `Err(Backpressure)` when the window closed entirely.
    fn on_send_window(&mut self, conn: ConnId, window: u16, status: Status);
}
