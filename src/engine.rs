//! The protocol engine: a registry of connections over one datagram socket,
//! driven cooperatively by its owner.
//!
//! The owner calls [`ArdpEngine::run`] whenever the socket signals
//! readability or the previously returned deadline elapses. Everything
//! happens synchronously inside that call (or inside the API call that
//! causes a transition): datagrams are drained and dispatched to their
//! connection's state machine, expired timers fire, and host callbacks are
//! invoked in transition order.
//!
//! Connections are held in a slot table and addressed by [`ConnId`], an
//! index plus a generation. Timers reference ring slots by index. This keeps
//! the timer / connection / buffer web free of ownership cycles: a handler
//! that tears its own connection down simply invalidates the id, and the
//! sweep revalidates after every handler call.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::config::{
    ArdpConfig, MIN_SEGMENT_BMAX, RECV_RETRIES, RECV_TIMEOUT_MS, RETRANSMIT_RETRIES,
    RETRANSMIT_TIMEOUT_MS, URGENT_RETRANSMIT_TIMEOUT_MS,
};
use crate::conn::{ConnState, Connection};
use crate::eack::{self, EackMask};
use crate::error::{ArdpError, ArdpResult, Status};
use crate::events::{ArdpEvents, RecvMessage};
use crate::rbuf::RecvRing;
use crate::sbuf::SendRing;
use crate::seq::{in_window, seq_le, seq_lt};
use crate::socket::DatagramSocket;
use crate::timer::{TimerContext, TimerKind, RETRY_ALWAYS};
use crate::wire::{self, SegmentHeader, SynParams, FIXED_HEADER_LEN, MAX_DATAGRAM_LEN, SYN_HEADER_LEN};

/// Monotonic milliseconds for timers and TTL accounting. The engine owns its
/// clock so tests can drive time by hand.
pub trait Clock: Send {
    fn now_ms(&self) -> u32;
}

pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> MonotonicClock {
        MonotonicClock { start: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u32 {
        self.start.elapsed().as_millis() as u32
    }
}

/// Non-owning connection handle. Stale ids (the connection was destroyed,
/// possibly replaced) fail validation instead of aliasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId {
    idx: u32,
    gen: u32,
}

/// Introspection snapshot, mainly for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct ConnInfo {
    pub state: ConnState,
    pub passive: bool,
    pub local: u16,
    pub foreign: u16,
    pub peer: SocketAddr,
    pub snd_nxt: u32,
    pub snd_una: u32,
    pub snd_iss: u32,
    pub rcv_cur: u32,
    pub peer_window: u16,
    pub recv_window: u16,
    pub last_seen: u32,
    pub pending: u16,
}

struct ConnEntry {
    gen: u32,
    conn: Option<Connection>,
}

pub struct ArdpEngine {
    config: ArdpConfig,
    events: Box<dyn ArdpEvents>,
    socket: Arc<dyn DatagramSocket>,
    clock: Box<dyn Clock>,
    rng: Box<dyn RngCore + Send>,
    entries: Vec<ConnEntry>,
    by_ports: FxHashMap<(u16, u16), ConnId>,
    accepting: bool,
    recv_buf: Vec<u8>,
}

impl ArdpEngine {
    pub fn new(
        config: ArdpConfig,
        events: Box<dyn ArdpEvents>,
        socket: Arc<dyn DatagramSocket>,
    ) -> anyhow::Result<ArdpEngine> {
        Self::with_parts(
            config,
            events,
            socket,
            Box::new(MonotonicClock::new()),
            Box::new(StdRng::from_entropy()),
        )
    }

    /// Constructor with an explicit clock and RNG, for hosts that want
    /// deterministic time or sequence numbers (tests, simulations).
    pub fn with_parts(
        config: ArdpConfig,
        events: Box<dyn ArdpEvents>,
        socket: Arc<dyn DatagramSocket>,
        clock: Box<dyn Clock>,
        rng: Box<dyn RngCore + Send>,
    ) -> anyhow::Result<ArdpEngine> {
        config.validate()?;
        Ok(ArdpEngine {
            config,
            events,
            socket,
            clock,
            rng,
            entries: Vec::new(),
            by_ports: FxHashMap::default(),
            accepting: false,
            recv_buf: vec![0; MAX_DATAGRAM_LEN],
        })
    }

    pub fn now_ms(&self) -> u32 {
        self.clock.now_ms()
    }

    /// Allow unsolicited SYNs to create passive connections.
    pub fn start_passive(&mut self) {
        self.accepting = true;
    }

    pub fn is_valid(&self, cid: ConnId) -> bool {
        self.conn(cid).is_some()
    }

    pub fn conn_info(&self, cid: ConnId) -> Option<ConnInfo> {
        self.conn(cid).map(|c| ConnInfo {
            state: c.state,
            passive: c.passive,
            local: c.local,
            foreign: c.foreign,
            peer: c.peer,
            snd_nxt: c.snd.nxt,
            snd_una: c.snd.una,
            snd_iss: c.snd.iss,
            rcv_cur: c.rcv.cur,
            peer_window: c.peer_window,
            recv_window: c.rbuf.as_ref().map(|r| r.window).unwrap_or(0),
            last_seen: c.last_seen,
            pending: c.sbuf.as_ref().map(|s| s.pending).unwrap_or(0),
        })
    }

    pub fn peer_addr(&self, cid: ConnId) -> Option<SocketAddr> {
        self.conn(cid).map(|c| c.peer)
    }

    pub fn set_token(&mut self, cid: ConnId, token: u64) {
        if let Some(conn) = self.conn_mut(cid) {
            conn.token = token;
        }
    }

    pub fn token(&self, cid: ConnId) -> Option<u64> {
        self.conn(cid).map(|c| c.token)
    }

    /// Active open: allocate the receive side, send a SYN carrying our
    /// capacities and `syn_data`, and wait for the peer. The outcome arrives
    /// through the connect callback (or its timeout).
    pub fn connect(
        &mut self,
        peer: SocketAddr,
        segmax: u16,
        segbmax: u16,
        syn_data: &[u8],
    ) -> ArdpResult<ConnId> {
        if segmax == 0 || segbmax < MIN_SEGMENT_BMAX {
            return Err(ArdpError::InvalidData);
        }

        let local = self.random_local_port();
        let iss = self.rng.next_u32();
        let mut conn = Connection::new(peer, local, 0, iss);
        conn.rbuf = Some(RecvRing::new(segmax as u32, segbmax as u32)?);
        conn.rcv.max = segmax as u32;

        let cid = self.insert_conn(conn);
        debug!(local, ?peer, "active open");
        self.send_syn(cid, false, 0, syn_data);
        Ok(cid)
    }

    /// Accept a connection previously surfaced through the accept callback:
    /// allocate both buffer sides and answer with SYN-ACK.
    pub fn accept(
        &mut self,
        cid: ConnId,
        segmax: u16,
        segbmax: u16,
        syn_data: &[u8],
    ) -> ArdpResult<()> {
        if segmax == 0 || segbmax < MIN_SEGMENT_BMAX {
            return Err(ArdpError::InvalidData);
        }
        let state = self.conn(cid).map(|c| c.state).ok_or(ArdpError::InvalidState)?;
        match state {
            ConnState::Listen => {
                let mut result = RecvRing::new(segmax as u32, segbmax as u32).map(|ring| {
                    let conn = self.conn_mut(cid).unwrap();
                    conn.rbuf = Some(ring);
                    conn.rcv.max = segmax as u32;
                });
                if result.is_ok() {
                    result = self.init_sbuf(cid);
                }
                if let Err(e) = result {
                    self.conn_mut(cid).unwrap().set_state(ConnState::Closed);
                    self.destroy(cid);
                    return Err(e);
                }

                let ack = self.conn(cid).unwrap().rcv.cur;
                self.conn_mut(cid).unwrap().set_state(ConnState::SynRcvd);
                self.send_syn(cid, true, ack, syn_data);
                Ok(())
            }
            // simultaneous open: the receive ring exists from our own
            // connect, the send side was set up when the peer's SYN arrived
            ConnState::SynSent => {
                let ack = self.conn(cid).unwrap().rcv.cur;
                self.conn_mut(cid).unwrap().set_state(ConnState::SynRcvd);
                self.send_syn(cid, true, ack, syn_data);
                Ok(())
            }
            _ => Err(ArdpError::InvalidState),
        }
    }

    /// Orderly teardown: RST to the peer, CLOSE_WAIT until the disconnect
    /// delay elapses, then the disconnect callback and the record is gone.
    pub fn disconnect(&mut self, cid: ConnId) -> ArdpResult<()> {
        self.disconnect_conn(cid)
    }

    /// Queue `message` for reliable delivery. `ttl_ms` of zero means the
    /// message never expires; otherwise it is dropped (with a TTL_EXPIRED
    /// completion) if it could not reach the wire in time.
    pub fn send(&mut self, cid: ConnId, message: Bytes, ttl_ms: u32) -> ArdpResult<()> {
        {
            let conn = self.conn(cid).ok_or(ArdpError::InvalidState)?;
            if conn.state != ConnState::Open {
                return Err(ArdpError::InvalidState);
            }
            if message.is_empty() || message.len() > self.config.max_message_len as usize {
                return Err(ArdpError::InvalidData);
            }
            if conn.peer_window == 0
                || conn.snd.nxt.wrapping_sub(conn.snd.una) >= conn.peer_window as u32
            {
                return Err(ArdpError::Backpressure);
            }
        }
        self.send_data(cid, message, ttl_ms)
    }

    /// Release a delivered message's slots, expanding the advertised window.
    /// `seq` must be the head sequence the receive callback reported;
    /// releases must happen in sequence order.
    pub fn recv_ready(&mut self, cid: ConnId, seq: u32) -> ArdpResult<()> {
        let conn = self.conn_mut(cid).ok_or(ArdpError::InvalidState)?;
        let rbuf = conn.rbuf.as_mut().ok_or(ArdpError::InvalidState)?;
        rbuf.release(seq)
    }

    /// Drive the engine: drain the socket if it is ready, then fire expired
    /// timers. Returns the number of milliseconds until the next deadline,
    /// or `None` when no timer is scheduled; the caller sleeps or selects
    /// with that bound.
    pub fn run(&mut self, socket_ready: bool) -> Option<u32> {
        if socket_ready {
            let socket = self.socket.clone();
            let mut buf = std::mem::take(&mut self.recv_buf);
            loop {
                match socket.recv_from(&mut buf) {
                    Ok((n, from)) => {
                        if n >= FIXED_HEADER_LEN && n <= MAX_DATAGRAM_LEN {
                            self.on_datagram(&buf[..n], from);
                        } else if n > 0 {
                            trace!("dropping runt datagram of {} bytes", n);
                        }
                    }
                    Err(ArdpError::WouldBlock) => break,
                    Err(e) => {
                        warn!("socket receive error: {}", e);
                        break;
                    }
                }
            }
            self.recv_buf = buf;
        }
        self.check_timers()
    }

    // ---- connection table ----------------------------------------------

    fn conn(&self, cid: ConnId) -> Option<&Connection> {
        self.entries
            .get(cid.idx as usize)
            .filter(|e| e.gen == cid.gen)
            .and_then(|e| e.conn.as_ref())
    }

    fn conn_mut(&mut self, cid: ConnId) -> Option<&mut Connection> {
        self.entries
            .get_mut(cid.idx as usize)
            .filter(|e| e.gen == cid.gen)
            .and_then(|e| e.conn.as_mut())
    }

    /// Connection plus the event sink as disjoint borrows, so callbacks can
    /// be fed views of connection state.
    fn conn_and_events(&mut self, cid: ConnId) -> Option<(&mut Connection, &mut dyn ArdpEvents)> {
        let ArdpEngine { entries, events, .. } = self;
        let entry = entries.get_mut(cid.idx as usize)?;
        if entry.gen != cid.gen {
            return None;
        }
        let conn = entry.conn.as_mut()?;
        Some((conn, events.as_mut()))
    }

    fn conn_ids(&self) -> Vec<ConnId> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.conn.is_some())
            .map(|(i, e)| ConnId { idx: i as u32, gen: e.gen })
            .collect()
    }

    fn insert_conn(&mut self, conn: Connection) -> ConnId {
        let key = (conn.local, conn.foreign);
        let cid = match self.entries.iter().position(|e| e.conn.is_none()) {
            Some(i) => {
                let entry = &mut self.entries[i];
                entry.conn = Some(conn);
                ConnId { idx: i as u32, gen: entry.gen }
            }
            None => {
                self.entries.push(ConnEntry { gen: 0, conn: Some(conn) });
                ConnId { idx: (self.entries.len() - 1) as u32, gen: 0 }
            }
        };
        self.by_ports.insert(key, cid);
        cid
    }

    fn rekey_foreign(&mut self, cid: ConnId, new_foreign: u16) {
        let Some((local, old_foreign)) = self.conn(cid).map(|c| (c.local, c.foreign)) else {
            return;
        };
        if let Some(conn) = self.conn_mut(cid) {
            conn.foreign = new_foreign;
        }
        self.by_ports.remove(&(local, old_foreign));
        self.by_ports.insert((local, new_foreign), cid);
    }

    fn destroy(&mut self, cid: ConnId) {
        let Some((local, foreign)) = self.conn(cid).map(|c| (c.local, c.foreign)) else {
            return;
        };
        for key in [(local, foreign), (local, 0)] {
            if self.by_ports.get(&key) == Some(&cid) {
                self.by_ports.remove(&key);
            }
        }
        let entry = &mut self.entries[cid.idx as usize];
        entry.conn = None;
        entry.gen = entry.gen.wrapping_add(1);
        trace!(local, foreign, "connection record destroyed");
    }

    fn random_local_port(&mut self) -> u16 {
        loop {
            let port = (self.rng.next_u32() % 65534 + 1) as u16;
            let clash = self
                .entries
                .iter()
                .any(|e| e.conn.as_ref().map(|c| c.local == port).unwrap_or(false));
            if !clash {
                return port;
            }
        }
    }

    fn now(&self) -> u32 {
        self.clock.now_ms()
    }

    // ---- egress ---------------------------------------------------------

    /// Header-only segment (ACK, NUL, RST) on an established record. Carries
    /// the EACK mask words; the EACK flag rides along when any are set.
    fn send_header(&self, cid: ConnId, flags: u8, seq: u32, ack: u32, window: u16) {
        let Some(conn) = self.conn(cid) else { return };
        let mut flags = flags;
        if !conn.rcv_msk.is_empty() {
            flags |= SegmentHeader::FLAG_EACK;
        }
        let header = SegmentHeader {
            flags,
            hlen: (conn.snd_hdr_len / 2) as u8,
            src: conn.local,
            dst: conn.foreign,
            dlen: 0,
            seq,
            ack,
            ttl: 0,
            som: 0,
            fcnt: 0,
            window,
        };
        let mut buf = BytesMut::with_capacity(conn.snd_hdr_len);
        header.ser(&mut buf);
        buf.extend_from_slice(conn.rcv_msk.wire_bytes());

        if let Err(e) = self.socket.send_to(&buf, conn.peer) {
            debug!("failed to send control segment to {:?}: {}", conn.peer, e);
        }
    }

    /// RST for a datagram that matches no connection at all.
    fn send_rst_raw(&self, to: SocketAddr, local: u16, foreign: u16) {
        let header = SegmentHeader {
            flags: SegmentHeader::FLAG_RST | SegmentHeader::FLAG_VER,
            hlen: (FIXED_HEADER_LEN / 2) as u8,
            src: local,
            dst: foreign,
            dlen: 0,
            seq: 0,
            ack: 0,
            ttl: 0,
            som: 0,
            fcnt: 0,
            window: 0,
        };
        let mut buf = BytesMut::with_capacity(FIXED_HEADER_LEN);
        header.ser(&mut buf);
        if let Err(e) = self.socket.send_to(&buf, to) {
            debug!("failed to send reset to {:?}: {}", to, e);
        }
    }

    /// SYN or SYN-ACK with our capacities and the handshake payload. Also
    /// arms the connect deadline.
    fn send_syn(&mut self, cid: ConnId, synack: bool, ack: u32, data: &[u8]) {
        let now = self.now();
        let connect_timeout = self.config.connect_timeout;
        let Some(conn) = self.conn_mut(cid) else { return };

        if !synack {
            conn.set_state(ConnState::SynSent);
        }

        let mut flags = SegmentHeader::FLAG_SYN | SegmentHeader::FLAG_VER;
        if synack {
            flags |= SegmentHeader::FLAG_ACK;
        }
        let segbmax = conn.rbuf.as_ref().map(|r| r.seg_bmax()).unwrap_or(0);
        let header = SegmentHeader {
            flags,
            hlen: (SYN_HEADER_LEN / 2) as u8,
            src: conn.local,
            dst: conn.foreign,
            dlen: data.len() as u16,
            seq: conn.snd.iss,
            ack,
            ttl: 0,
            som: 0,
            fcnt: 0,
            window: conn.rcv.max as u16,
        };
        let params = SynParams {
            segmax: conn.rcv.max as u16,
            segbmax: segbmax as u16,
            options: SynParams::OPTION_SDM,
        };

        // a simultaneous open re-arms the deadline; never keep two
        conn.timers.cancel(TimerKind::Connect, TimerContext::None);
        conn.timers.schedule(
            TimerKind::Connect,
            TimerContext::None,
            now,
            connect_timeout,
            0,
        );

        let mut buf = BytesMut::with_capacity(SYN_HEADER_LEN + data.len());
        header.ser(&mut buf);
        params.ser(&mut buf);
        buf.extend_from_slice(data);

        let peer = conn.peer;
        if let Err(e) = self.socket.send_to(&buf, peer) {
            debug!("failed to send SYN to {:?}: {}", peer, e);
        }
    }

    /// Put one send slot on the wire: patch the precomputed header with the
    /// current ack/window/EACK state, splice in the mask, and hand the whole
    /// thing to the socket. A slot that never reached the wire and whose TTL
    /// has run out is refused here, before anything is transmitted.
    fn transmit_slot(&mut self, cid: ConnId, seq: u32) -> ArdpResult<()> {
        let now = self.now();
        let socket = self.socket.clone();
        let conn = self.conn_mut(cid).ok_or(ArdpError::InvalidState)?;
        let rcv_cur = conn.rcv.cur;
        let window = conn.rbuf.as_ref().map(|r| r.window).unwrap_or(0);
        let eack = !conn.rcv_msk.is_empty();
        let snd_hdr_len = conn.snd_hdr_len;
        let peer = conn.peer;

        let sbuf = conn.sbuf.as_mut().ok_or(ArdpError::InvalidState)?;
        {
            let slot = sbuf.slot(seq);
            if !slot.on_the_wire && slot.ttl != 0 && now.wrapping_sub(slot.t_start) >= slot.ttl {
                debug!(seq, "dropping expired message before transmission");
                return Err(ArdpError::TtlExpired);
            }
        }
        wire::patch_for_transmit(sbuf.header_mut(seq), rcv_cur, window, eack);

        let mut pkt = BytesMut::with_capacity(snd_hdr_len + sbuf.slot(seq).payload.len());
        pkt.extend_from_slice(sbuf.header(seq));
        pkt.extend_from_slice(conn.rcv_msk.wire_bytes());
        pkt.extend_from_slice(&sbuf.slot(seq).payload);

        match socket.send_to(&pkt, peer) {
            Ok(()) => {
                sbuf.slot_mut(seq).on_the_wire = true;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Fragment and queue a message, transmitting each segment as it is
    /// placed in its slot.
    fn send_data(&mut self, cid: ConnId, message: Bytes, ttl: u32) -> ArdpResult<()> {
        let now = self.now();
        let (max_dlen, snd_max, peer_window, som, local, foreign, snd_hdr_len) = {
            let conn = self.conn(cid).ok_or(ArdpError::InvalidState)?;
            let sbuf = conn.sbuf.as_ref().ok_or(ArdpError::InvalidState)?;
            (
                sbuf.max_dlen,
                conn.snd.max,
                conn.peer_window,
                conn.snd.nxt,
                conn.local,
                conn.foreign,
                conn.snd_hdr_len,
            )
        };

        let len = message.len();
        let fcnt = (len + max_dlen - 1) / max_dlen;
        if fcnt > u16::MAX as usize {
            return Err(ArdpError::InvalidData);
        }
        let fcnt = fcnt as u16;
        if fcnt > 1 {
            debug!(len, fcnt, "partitioning large message");
            if fcnt as u32 > snd_max {
                return Err(ArdpError::Failed);
            }
            if fcnt > peer_window {
                return Err(ArdpError::Backpressure);
            }
        }

        for i in 0..fcnt {
            let seq = self.conn(cid).unwrap().snd.nxt;
            let start = i as usize * max_dlen;
            let end = (start + max_dlen).min(len);
            let payload = message.slice(start..end);

            let mut flags = SegmentHeader::FLAG_ACK | SegmentHeader::FLAG_VER;
            if fcnt > 1 {
                flags |= SegmentHeader::FLAG_FRAG;
            }
            let header = SegmentHeader {
                flags,
                hlen: (snd_hdr_len / 2) as u8,
                src: local,
                dst: foreign,
                dlen: payload.len() as u16,
                seq,
                ack: 0,
                ttl,
                som,
                fcnt,
                window: 0,
            };

            {
                let conn = self.conn_mut(cid).unwrap();
                let sbuf = conn.sbuf.as_mut().unwrap();
                sbuf.write_header(seq, &header);
                let dlen = payload.len() as u16;
                let slot = sbuf.slot_mut(seq);
                slot.seq = seq;
                slot.som = som;
                slot.fcnt = fcnt;
                slot.dlen = dlen;
                slot.payload = payload;
                slot.message = if i == 0 { Some(message.clone()) } else { None };
                slot.ttl = ttl;
                slot.t_start = now;
                slot.on_the_wire = false;
                slot.in_use = false;
            }

            let delta = match self.transmit_slot(cid, seq) {
                Ok(()) => RETRANSMIT_TIMEOUT_MS,
                Err(ArdpError::WouldBlock) => URGENT_RETRANSMIT_TIMEOUT_MS,
                Err(ArdpError::TtlExpired) => return Err(ArdpError::TtlExpired),
                Err(_) => {
                    let _ = self.disconnect_conn(cid);
                    return Err(ArdpError::Failed);
                }
            };

            let conn = self.conn_mut(cid).unwrap();
            let idx = conn.sbuf.as_ref().unwrap().index(seq);
            conn.timers.schedule(
                TimerKind::Retransmit,
                TimerContext::SendSlot(idx),
                now,
                delta,
                RETRANSMIT_RETRIES + 1,
            );
            let sbuf = conn.sbuf.as_mut().unwrap();
            sbuf.slot_mut(seq).in_use = true;
            sbuf.pending += 1;
            conn.snd.nxt = seq.wrapping_add(1);
        }
        Ok(())
    }

    // ---- ingress --------------------------------------------------------

    fn on_datagram(&mut self, buf: &[u8], from: SocketAddr) {
        let Some((local, foreign)) = wire::demux(buf) else { return };

        if local == 0 {
            // unaddressed segment: an unsolicited SYN if we are accepting
            if self.accepting {
                self.on_unsolicited_syn(buf, from, foreign);
            } else {
                self.send_rst_raw(from, local, foreign);
            }
            return;
        }

        let cid = self
            .by_ports
            .get(&(local, foreign))
            .copied()
            // half-open connection still waiting to learn the peer's port
            .or_else(|| self.by_ports.get(&(local, 0)).copied());
        let Some(cid) = cid else {
            trace!(local, foreign, "no connection for segment, ignoring");
            return;
        };

        let now = self.now();
        match self.conn_mut(cid) {
            Some(conn) => conn.last_seen = now,
            None => return,
        }
        self.receive(cid, buf);
    }

    fn on_unsolicited_syn(&mut self, buf: &[u8], from: SocketAddr, foreign: u16) {
        let mut b = buf;
        let Ok(header) = SegmentHeader::deser(&mut b) else { return };
        if header.flags != (SegmentHeader::FLAG_SYN | SegmentHeader::FLAG_VER) {
            debug!(flags = header.flags, "unaddressed segment is not a plain SYN");
            self.send_rst_raw(from, 0, foreign);
            return;
        }
        if header.header_len_bytes() != SYN_HEADER_LEN {
            return;
        }
        let Ok(params) = SynParams::deser(&mut b) else { return };
        let dlen = header.dlen as usize;
        if buf.len() < SYN_HEADER_LEN + dlen {
            return;
        }
        let payload = &buf[SYN_HEADER_LEN..SYN_HEADER_LEN + dlen];

        let local = self.random_local_port();
        let iss = self.rng.next_u32();
        let now = self.now();
        let mut conn = Connection::new(from, local, foreign, iss);
        conn.passive = true;
        conn.state = ConnState::Listen;
        conn.last_seen = now;
        let cid = self.insert_conn(conn);
        debug!(local, foreign, ?from, "passive open");

        self.on_segment(cid, &header, Some(params), &[], payload);
    }

    fn receive(&mut self, cid: ConnId, buf: &[u8]) {
        let mut b = buf;
        let Ok(header) = SegmentHeader::deser(&mut b) else { return };

        if header.has(SegmentHeader::FLAG_SYN) {
            if header.header_len_bytes() != SYN_HEADER_LEN {
                debug!(hlen = header.hlen, "SYN with unexpected header length");
                return;
            }
            let Ok(params) = SynParams::deser(&mut b) else { return };
            let dlen = header.dlen as usize;
            if buf.len() < SYN_HEADER_LEN + dlen {
                return;
            }
            let payload = &buf[SYN_HEADER_LEN..SYN_HEADER_LEN + dlen];
            self.on_segment(cid, &header, Some(params), &[], payload);
            return;
        }

        let (expected_hdr_len, mask_words) = match self.conn(cid) {
            Some(c) => (c.rcv_hdr_len, c.remote_msk_words),
            None => return,
        };
        if header.header_len_bytes() != expected_hdr_len {
            debug_assert!(
                false,
                "declared header length {} does not match expected {}",
                header.header_len_bytes(),
                expected_hdr_len
            );
            debug!(
                declared = header.header_len_bytes(),
                expected = expected_hdr_len,
                "header length mismatch, acking current state"
            );
            self.ack_current_state(cid);
            return;
        }
        let hdr_len = header.header_len_bytes();
        let dlen = header.dlen as usize;
        if buf.len() < hdr_len + dlen {
            debug!("truncated segment, dropping");
            return;
        }
        let mask_len = (mask_words * 4).min(hdr_len - FIXED_HEADER_LEN);
        let mask = buf[FIXED_HEADER_LEN..FIXED_HEADER_LEN + mask_len].to_vec();
        let payload = &buf[hdr_len..hdr_len + dlen];
        self.on_segment(cid, &header, None, &mask, payload);
    }

    fn ack_current_state(&self, cid: ConnId) {
        let Some(conn) = self.conn(cid) else { return };
        let window = conn.rbuf.as_ref().map(|r| r.window).unwrap_or(0);
        self.send_header(
            cid,
            SegmentHeader::FLAG_ACK | SegmentHeader::FLAG_VER,
            conn.snd.nxt,
            conn.rcv.cur,
            window,
        );
    }

    // ---- the state machine ----------------------------------------------

    fn on_segment(
        &mut self,
        cid: ConnId,
        seg: &SegmentHeader,
        syn: Option<SynParams>,
        mask: &[u8],
        payload: &[u8],
    ) {
        let Some(state) = self.conn(cid).map(|c| c.state) else { return };
        trace!(?state, seq = seg.seq, flags = seg.flags, "segment");

        match state {
            ConnState::Closed => self.segment_in_closed(cid, seg),
            ConnState::Listen => self.segment_in_listen(cid, seg, syn, payload),
            ConnState::SynSent => self.segment_in_syn_sent(cid, seg, syn, payload),
            ConnState::SynRcvd => self.segment_in_syn_rcvd(cid, seg, payload),
            ConnState::Open => self.segment_in_open(cid, seg, mask, payload),
            ConnState::CloseWait => {
                // only the disconnect delay moves us out of here
            }
        }
    }

    fn segment_in_closed(&mut self, cid: ConnId, seg: &SegmentHeader) {
        if seg.has(SegmentHeader::FLAG_RST) {
            return;
        }
        let rcv_max = self.conn(cid).map(|c| c.rcv.max).unwrap_or(0) as u16;
        if seg.has(SegmentHeader::FLAG_ACK) || seg.has(SegmentHeader::FLAG_NUL) {
            self.send_header(
                cid,
                SegmentHeader::FLAG_RST | SegmentHeader::FLAG_VER,
                0,
                seg.ack.wrapping_add(1),
                rcv_max,
            );
        } else {
            self.send_header(
                cid,
                SegmentHeader::FLAG_RST | SegmentHeader::FLAG_ACK | SegmentHeader::FLAG_VER,
                0,
                seg.seq,
                rcv_max,
            );
        }
    }

    fn segment_in_listen(
        &mut self,
        cid: ConnId,
        seg: &SegmentHeader,
        syn: Option<SynParams>,
        payload: &[u8],
    ) {
        if seg.has(SegmentHeader::FLAG_RST) {
            return;
        }
        if seg.has(SegmentHeader::FLAG_ACK) || seg.has(SegmentHeader::FLAG_NUL) {
            self.send_header(
                cid,
                SegmentHeader::FLAG_RST | SegmentHeader::FLAG_VER,
                seg.ack.wrapping_add(1),
                0,
                0,
            );
            return;
        }
        if seg.has(SegmentHeader::FLAG_SYN) {
            let Some(params) = syn else { return };
            {
                let conn = self.conn_mut(cid).unwrap();
                conn.rcv.cur = seg.seq;
                conn.rcv.irs = seg.seq;
                conn.snd.max = params.segmax as u32;
                conn.remote_msk_words = ((conn.snd.max + 31) / 32) as usize;
                conn.rcv_hdr_len = FIXED_HEADER_LEN + conn.remote_msk_words * 4;
                conn.peer_window = params.segmax;
                conn.sbuf_max = params.segbmax as u32;
            }
            let (peer, accepted) = {
                let (conn, events) = self.conn_and_events(cid).unwrap();
                let peer = conn.peer;
                (peer, events.on_accept(peer, cid, payload, Ok(())))
            };
            if !accepted {
                debug!(?peer, "host refused inbound connection");
                self.conn_mut(cid).unwrap().set_state(ConnState::Closed);
                self.destroy(cid);
            }
        }
    }

    fn segment_in_syn_sent(
        &mut self,
        cid: ConnId,
        seg: &SegmentHeader,
        syn: Option<SynParams>,
        payload: &[u8],
    ) {
        let now = self.now();

        if seg.has(SegmentHeader::FLAG_RST) {
            debug!("connection refused");
            let (_, events) = self.conn_and_events(cid).unwrap();
            events.on_connect(cid, false, &[], Err(ArdpError::Failed));
            self.conn_mut(cid).unwrap().set_state(ConnState::Closed);
            self.destroy(cid);
            return;
        }

        if seg.has(SegmentHeader::FLAG_SYN) {
            let Some(params) = syn else { return };
            {
                let conn = self.conn_mut(cid).unwrap();
                conn.snd.max = params.segmax as u32;
                conn.remote_msk_words = ((conn.snd.max + 31) / 32) as usize;
                conn.rcv_hdr_len = FIXED_HEADER_LEN + conn.remote_msk_words * 4;
                conn.peer_window = params.segmax;
                conn.rcv.cur = seg.seq;
                conn.rcv.irs = seg.seq;
                conn.sbuf_max = params.segbmax as u32;
            }
            self.rekey_foreign(cid, seg.src);
            if let Err(e) = self.init_sbuf(cid) {
                warn!("cannot set up send buffers: {}", e);
                let (_, events) = self.conn_and_events(cid).unwrap();
                events.on_connect(cid, false, &[], Err(e));
                self.conn_mut(cid).unwrap().set_state(ConnState::Closed);
                self.destroy(cid);
                return;
            }

            if seg.has(SegmentHeader::FLAG_ACK) {
                if seg.ack != self.conn(cid).unwrap().snd.iss {
                    debug!("SYN-ACK does not acknowledge our ISS");
                    self.send_header(
                        cid,
                        SegmentHeader::FLAG_RST | SegmentHeader::FLAG_VER,
                        seg.ack.wrapping_add(1),
                        0,
                        self.conn(cid).unwrap().rcv.max as u16,
                    );
                    self.conn_mut(cid).unwrap().set_state(ConnState::Closed);
                    self.destroy(cid);
                    return;
                }
                let persist = self.config.persist_timeout;
                {
                    let conn = self.conn_mut(cid).unwrap();
                    conn.snd.una = seg.ack.wrapping_add(1);
                    let cur = conn.rcv.cur;
                    conn.rbuf.as_mut().unwrap().post_open(cur);
                    conn.set_state(ConnState::Open);
                    conn.timers.cancel(TimerKind::Connect, TimerContext::None);
                    conn.last_seen = now;
                    conn.timers.schedule(
                        TimerKind::WindowCheck,
                        TimerContext::None,
                        now,
                        persist,
                        RETRY_ALWAYS,
                    );
                }
                {
                    let (_, events) = self.conn_and_events(cid).unwrap();
                    events.on_connect(cid, false, payload, Ok(()));
                }
                let conn = self.conn(cid).unwrap();
                self.send_header(
                    cid,
                    SegmentHeader::FLAG_ACK | SegmentHeader::FLAG_VER,
                    conn.snd.nxt,
                    conn.rcv.cur,
                    conn.rcv.max as u16,
                );
            } else {
                // simultaneous open; the host answers with accept()
                debug!("simultaneous open");
                let (conn, events) = self.conn_and_events(cid).unwrap();
                let peer = conn.peer;
                events.on_accept(peer, cid, payload, Ok(()));
            }
            return;
        }

        if seg.has(SegmentHeader::FLAG_ACK) && seg.ack != self.conn(cid).unwrap().snd.iss {
            debug!("stray ACK in SYN_SENT");
            self.send_header(
                cid,
                SegmentHeader::FLAG_RST | SegmentHeader::FLAG_VER,
                seg.ack.wrapping_add(1),
                0,
                self.conn(cid).unwrap().rcv.max as u16,
            );
            self.conn_mut(cid).unwrap().set_state(ConnState::Closed);
            self.destroy(cid);
        }
    }

    fn segment_in_syn_rcvd(&mut self, cid: ConnId, seg: &SegmentHeader, payload: &[u8]) {
        let now = self.now();
        let (cur, rcv_max) = {
            let conn = self.conn(cid).unwrap();
            (conn.rcv.cur, conn.rcv.max)
        };

        if !in_window(cur.wrapping_add(1), rcv_max, seg.seq) {
            debug!(seq = seg.seq, "unacceptable sequence in SYN_RCVD");
            self.ack_current_state(cid);
            return;
        }

        if seg.has(SegmentHeader::FLAG_RST) {
            let passive = self.conn(cid).unwrap().passive;
            if passive {
                self.conn_mut(cid).unwrap().set_state(ConnState::Listen);
            } else {
                // the open never completed, so this is a failed connect,
                // not a disconnect
                debug!("reset during active open");
                let (_, events) = self.conn_and_events(cid).unwrap();
                events.on_connect(cid, false, &[], Err(ArdpError::Failed));
                self.conn_mut(cid).unwrap().set_state(ConnState::Closed);
                self.destroy(cid);
            }
            return;
        }

        if seg.has(SegmentHeader::FLAG_SYN) {
            debug!("colliding SYN, refusing");
            self.send_header(
                cid,
                SegmentHeader::FLAG_RST | SegmentHeader::FLAG_VER,
                seg.ack.wrapping_add(1),
                0,
                rcv_max as u16,
            );
            // as with the reset above, the connect callback never fired for
            // this record, so the teardown reports a failed connect
            let passive = self.conn(cid).unwrap().passive;
            let (_, events) = self.conn_and_events(cid).unwrap();
            events.on_connect(cid, passive, &[], Err(ArdpError::Failed));
            self.conn_mut(cid).unwrap().set_state(ConnState::Closed);
            self.destroy(cid);
            return;
        }

        if seg.has(SegmentHeader::FLAG_EACK) {
            self.send_header(
                cid,
                SegmentHeader::FLAG_RST | SegmentHeader::FLAG_VER,
                seg.ack.wrapping_add(1),
                0,
                rcv_max as u16,
            );
            return;
        }

        if !seg.has(SegmentHeader::FLAG_ACK) {
            return;
        }

        if seg.ack != self.conn(cid).unwrap().snd.iss {
            self.send_header(
                cid,
                SegmentHeader::FLAG_RST | SegmentHeader::FLAG_VER,
                seg.ack.wrapping_add(1),
                0,
                rcv_max as u16,
            );
            return;
        }

        let persist = self.config.persist_timeout;
        {
            let conn = self.conn_mut(cid).unwrap();
            let cur = conn.rcv.cur;
            conn.rbuf.as_mut().unwrap().post_open(cur);
            conn.set_state(ConnState::Open);
            conn.timers.cancel(TimerKind::Connect, TimerContext::None);
            conn.last_seen = now;
            conn.timers.schedule(
                TimerKind::WindowCheck,
                TimerContext::None,
                now,
                persist,
                RETRY_ALWAYS,
            );
        }
        {
            let (_, events) = self.conn_and_events(cid).unwrap();
            events.on_connect(cid, true, &[], Ok(()));
        }

        // the final handshake ACK may piggyback the first data
        if seg.dlen > 0 || seg.has(SegmentHeader::FLAG_NUL) {
            if seg.dlen > 0 {
                let cur = self.conn(cid).unwrap().rcv.cur;
                let ordered = seg.seq == cur.wrapping_add(1);
                if let Err(e) = self.add_rcv_buffer(cid, seg, payload, ordered) {
                    warn!("failed to buffer handshake data: {}", e);
                }
            }
            self.ack_current_state(cid);
        }
    }

    fn segment_in_open(&mut self, cid: ConnId, seg: &SegmentHeader, mask: &[u8], payload: &[u8]) {
        let now = self.now();
        let (cur, rcv_max, timewait) = {
            let conn = self.conn(cid).unwrap();
            (conn.rcv.cur, conn.rcv.max, self.config.timewait)
        };

        if !in_window(cur.wrapping_add(1), rcv_max, seg.seq) {
            debug!(
                seq = seg.seq,
                cur, "unacceptable sequence in OPEN, acking current state"
            );
            self.ack_current_state(cid);
            return;
        }

        if seg.has(SegmentHeader::FLAG_RST) {
            debug!("peer reset, draining");
            let conn = self.conn_mut(cid).unwrap();
            conn.timers
                .schedule(TimerKind::Disconnect, TimerContext::None, now, timewait, 0);
            conn.set_state(ConnState::CloseWait);
            return;
        }

        if seg.has(SegmentHeader::FLAG_SYN) {
            let passive = self.conn(cid).unwrap().passive;
            let window = self.recv_window(cid);
            if passive {
                self.conn_mut(cid).unwrap().set_state(ConnState::Listen);
            } else {
                let conn = self.conn_mut(cid).unwrap();
                conn.set_state(ConnState::Closed);
                conn.timers.schedule(TimerKind::Disconnect, TimerContext::None, now, 0, 0);
            }
            self.send_header(
                cid,
                SegmentHeader::FLAG_RST | SegmentHeader::FLAG_VER,
                seg.ack.wrapping_add(1),
                0,
                window,
            );
            return;
        }

        if seg.has(SegmentHeader::FLAG_NUL) {
            trace!("probe, acking current state");
            self.ack_current_state(cid);
            return;
        }

        if seg.has(SegmentHeader::FLAG_ACK) {
            let (una, nxt) = {
                let conn = self.conn(cid).unwrap();
                (conn.snd.una, conn.snd.nxt)
            };
            if in_window(una, nxt.wrapping_sub(una).wrapping_add(1), seg.ack) {
                self.flush_acked(cid, seg.ack);
            }
        }

        if seg.has(SegmentHeader::FLAG_EACK) {
            self.process_eack(cid, mask);
        }

        if seg.dlen > 0 {
            let cur = self.conn(cid).unwrap().rcv.cur;
            let mut ok = true;
            if seq_lt(cur, seg.seq) {
                ok = self
                    .add_rcv_buffer(cid, seg, payload, seg.seq == cur.wrapping_add(1))
                    .is_ok();
            }
            if ok {
                self.ack_current_state(cid);
            }
        }

        let peer_window = self.conn(cid).map(|c| c.peer_window);
        if peer_window.is_some() && peer_window != Some(seg.window) {
            let (conn, events) = self.conn_and_events(cid).unwrap();
            conn.peer_window = seg.window;
            let status = if seg.window == 0 { Err(ArdpError::Backpressure) } else { Ok(()) };
            events.on_send_window(cid, seg.window, status);
        }
    }

    // ---- send-side bookkeeping -----------------------------------------

    /// Cumulative ack: retire every in-use slot up to and including `ack`,
    /// in sequence order, firing completions as logical messages finish.
    fn flush_acked(&mut self, cid: ConnId, ack: u32) {
        let Some((conn, events)) = self.conn_and_events(cid) else { return };
        let Some(sbuf) = conn.sbuf.as_mut() else { return };

        let mut s = conn.snd.una;
        while seq_le(s, ack) {
            let (in_use, seq_match, fcnt, som) = {
                let slot = sbuf.slot(s);
                (slot.in_use, slot.seq == s, slot.fcnt, slot.som)
            };
            if in_use && seq_match {
                let idx = sbuf.index(s);
                conn.timers.cancel(TimerKind::Retransmit, TimerContext::SendSlot(idx));
                {
                    let slot = sbuf.slot_mut(s);
                    slot.in_use = false;
                    slot.on_the_wire = false;
                    slot.payload = Bytes::new();
                }
                sbuf.pending = sbuf.pending.saturating_sub(1);

                let last_of_message = if fcnt <= 1 {
                    s
                } else {
                    som.wrapping_add(fcnt as u32).wrapping_sub(1)
                };
                if s == last_of_message {
                    // the head slot holds the original message across all
                    // its fragments
                    let head = if fcnt <= 1 { s } else { som };
                    if let Some(message) = sbuf.slot_mut(head).message.take() {
                        trace!(seq = s, "message acknowledged");
                        events.on_send_complete(cid, message, Ok(()));
                    }
                }
            }
            s = s.wrapping_add(1);
        }
        conn.snd.una = ack.wrapping_add(1);
    }

    /// Selective ack: the peer has the segments whose bits are set, so their
    /// retransmissions are pointless. The slot at UNA is known lost (later
    /// segments arrived, it did not), so its timer is pulled forward to fire
    /// on the next sweep.
    fn process_eack(&mut self, cid: ConnId, mask: &[u8]) {
        let Some(conn) = self.conn_mut(cid) else { return };
        let Some(sbuf) = conn.sbuf.as_ref() else { return };
        let una = conn.snd.una;

        let una_idx = sbuf.index(una);
        if let Some(timer) = conn
            .timers
            .find_mut(TimerKind::Retransmit, TimerContext::SendSlot(una_idx))
        {
            trace!(seq = una, "fast retransmit");
            timer.when = timer.when.wrapping_sub(timer.delta);
        }

        for bit in eack::wire_set_bits(mask) {
            let s = una.wrapping_add(1).wrapping_add(bit);
            let idx = sbuf.index(s);
            if sbuf.slot(s).in_use && sbuf.slot(s).seq == s {
                conn.timers.cancel(TimerKind::Retransmit, TimerContext::SendSlot(idx));
            }
        }
    }

    /// Retire a whole logical message from the send ring without an ack:
    /// retransmissions exhausted or TTL expired before the wire. All
    /// fragment slots are invalidated and the completion fires once with the
    /// original buffer.
    fn fail_message(&mut self, cid: ConnId, seq: u32, status: Status) {
        let Some((conn, events)) = self.conn_and_events(cid) else { return };
        let Some(sbuf) = conn.sbuf.as_mut() else { return };

        let (fcnt, som) = {
            let slot = sbuf.slot(seq);
            (slot.fcnt.max(1), slot.som)
        };

        let mut message = None;
        let mut any_wired = false;
        for i in 0..fcnt as u32 {
            let s = som.wrapping_add(i);
            let (in_use, seq_match, wired) = {
                let slot = sbuf.slot(s);
                (slot.in_use, slot.seq == s, slot.on_the_wire)
            };
            if !(in_use && seq_match) {
                continue;
            }
            any_wired |= wired;
            let idx = sbuf.index(s);
            conn.timers.cancel(TimerKind::Retransmit, TimerContext::SendSlot(idx));
            let slot = sbuf.slot_mut(s);
            slot.in_use = false;
            slot.on_the_wire = false;
            slot.payload = Bytes::new();
            if let Some(m) = slot.message.take() {
                message = Some(m);
            }
            sbuf.pending = sbuf.pending.saturating_sub(1);
        }

        // sequences the peer never saw can be taken back, as long as nothing
        // newer sits behind them; this keeps a dropped message from leaving
        // a hole the receiver would wait on forever
        if !any_wired && som.wrapping_add(fcnt as u32) == conn.snd.nxt {
            conn.snd.nxt = som;
        }

        if let Some(message) = message {
            events.on_send_complete(cid, message, status);
        }
    }

    // ---- receive-side bookkeeping --------------------------------------

    /// Buffer an in-window data segment and, when it is the in-order
    /// successor, walk the slot chain delivering everything that became
    /// contiguous.
    fn add_rcv_buffer(
        &mut self,
        cid: ConnId,
        seg: &SegmentHeader,
        payload: &[u8],
        ordered: bool,
    ) -> ArdpResult<()> {
        let now = self.now();
        {
            let conn = self.conn_mut(cid).ok_or(ArdpError::InvalidState)?;
            let cur = conn.rcv.cur;
            let rbuf = conn.rbuf.as_mut().ok_or(ArdpError::InvalidState)?;

            // a closed window only accepts segments that fill existing gaps
            if rbuf.window == 0 && !seq_lt(seg.seq, rbuf.last) {
                debug_assert!(false, "segment beyond a closed receive window");
                return Err(ArdpError::Failed);
            }
            if seg.dlen as usize > rbuf.seg_bmax() {
                debug!(dlen = seg.dlen, "segment larger than negotiated maximum");
                return Err(ArdpError::Failed);
            }
            if rbuf.slot(seg.seq).in_use {
                trace!(seq = seg.seq, "duplicate of a buffered segment");
                return Ok(());
            }

            rbuf.store(seg.seq, seg.fcnt.max(1), seg.som, payload)?;

            if !ordered {
                let bit = seg.seq.wrapping_sub(cur.wrapping_add(2));
                conn.rcv_msk.set(bit);
            }
        }

        if ordered {
            self.deliver_in_order(cid, seg.seq, now);
        }

        if let Some(conn) = self.conn_mut(cid) {
            if let Some(rbuf) = conn.rbuf.as_mut() {
                rbuf.update_window();
            }
        }
        Ok(())
    }

    /// Walk forward from `start_seq` over consecutive buffered slots:
    /// advance CUR over each, deliver every fragment group whose last
    /// fragment is reached, and stop handing messages up (but keep folding
    /// CUR) once the host refuses one. Afterwards the EACK mask slides by
    /// the distance CUR moved.
    fn deliver_in_order(&mut self, cid: ConnId, start_seq: u32, now: u32) {
        let Some((conn, events)) = self.conn_and_events(cid) else { return };
        let Some(rbuf) = conn.rbuf.as_mut() else { return };

        let mut refused = false;
        let mut s = start_seq;
        let mut advanced: u32 = 0;
        loop {
            let (in_use, slot_seq, fcnt, som, delivered) = {
                let slot = rbuf.slot(s);
                (slot.in_use, slot.seq, slot.fcnt.max(1), slot.som, slot.delivered)
            };
            if !in_use || slot_seq != s {
                break;
            }

            conn.rcv.cur = s;
            advanced += 1;

            // a message goes up when its last fragment is folded in, gated
            // by the slot before the group: delivered, or already released
            // by the host (a released slot was delivered by definition)
            let group_end = som.wrapping_add(fcnt as u32).wrapping_sub(1);
            if s == group_end && !delivered && !refused {
                let gate = {
                    let prev = rbuf.slot(som.wrapping_sub(1));
                    !prev.in_use || prev.delivered
                };
                if gate && !Self::deliver_group(rbuf, events, cid, som) {
                    let idx = rbuf.index(som);
                    conn.timers.schedule(
                        TimerKind::Recv,
                        TimerContext::RecvSlot(idx),
                        now,
                        RECV_TIMEOUT_MS,
                        RECV_RETRIES,
                    );
                    refused = true;
                }
            }

            s = s.wrapping_add(1);
        }

        if advanced > 0 {
            conn.rcv_msk.shift_left(advanced);
        }
    }

    /// Hand one complete message (fragment group or single segment) to the
    /// host. Marks the slots delivered when the host takes it.
    fn deliver_group(
        rbuf: &mut RecvRing,
        events: &mut dyn ArdpEvents,
        cid: ConnId,
        som: u32,
    ) -> bool {
        let fcnt = rbuf.slot(som).fcnt.max(1);
        for i in 0..fcnt as u32 {
            let slot = rbuf.slot(som.wrapping_add(i));
            if !slot.in_use || slot.delivered || slot.som != som {
                // should be unreachable: delivery only runs on contiguous
                // undelivered runs
                tracing::error!(
                    som,
                    seq = slot.seq,
                    "inconsistent fragment run on delivery"
                );
            }
        }

        let mut segments = Vec::with_capacity(fcnt as usize);
        for i in 0..fcnt as u32 {
            segments.push(rbuf.slot_data(som.wrapping_add(i)));
        }
        let accepted = events.on_receive(cid, RecvMessage { seq: som, fcnt, segments }, Ok(()));

        if accepted {
            for i in 0..fcnt as u32 {
                rbuf.slot_mut(som.wrapping_add(i)).delivered = true;
            }
        }
        accepted
    }

    /// Group completeness for the re-delivery walk: all fragments of the
    /// group headed at `som` are buffered consecutively.
    fn group_complete(rbuf: &RecvRing, som: u32) -> Option<u16> {
        let head = rbuf.slot(som);
        if !head.in_use || head.seq != som || head.delivered {
            return None;
        }
        let fcnt = head.fcnt.max(1);
        for i in 1..fcnt as u32 {
            let s = som.wrapping_add(i);
            let slot = rbuf.slot(s);
            if !slot.in_use || slot.seq != s {
                return None;
            }
        }
        Some(fcnt)
    }

    // ---- timers ---------------------------------------------------------

    fn check_timers(&mut self) -> Option<u32> {
        let now = self.now();

        for cid in self.conn_ids() {
            loop {
                if !self.is_valid(cid) {
                    break;
                }
                let due = self.conn(cid).and_then(|c| c.timers.peek_due(now));
                let Some((tid, kind, ctx)) = due else { break };

                match (kind, ctx) {
                    (TimerKind::Connect, _) => self.on_connect_timer(cid),
                    (TimerKind::Disconnect, _) => self.on_disconnect_timer(cid),
                    (TimerKind::Retransmit, TimerContext::SendSlot(idx)) => {
                        self.on_retransmit_timer(cid, idx, tid)
                    }
                    (TimerKind::Recv, TimerContext::RecvSlot(idx)) => {
                        self.on_recv_timer(cid, idx, tid, now)
                    }
                    (TimerKind::WindowCheck, _) => self.on_window_check(cid, now),
                    (kind, ctx) => {
                        debug_assert!(false, "timer {:?} with context {:?}", kind, ctx);
                        if let Some(conn) = self.conn_mut(cid) {
                            conn.timers.remove(tid);
                        }
                    }
                }

                // connect/disconnect expiry destroys the record from inside
                // the handler
                if !self.is_valid(cid) {
                    break;
                }
                if let Some(conn) = self.conn_mut(cid) {
                    conn.timers.after_fire(tid, now);
                }
            }
        }

        let mut next: Option<u32> = None;
        for entry in &self.entries {
            let Some(conn) = entry.conn.as_ref() else { continue };
            if let Some(deadline) = conn.timers.next_deadline() {
                let delta = deadline.wrapping_sub(now) as i32;
                let ms = if delta <= 0 { 0 } else { delta as u32 };
                next = Some(next.map_or(ms, |n: u32| n.min(ms)));
            }
        }
        next
    }

    fn on_connect_timer(&mut self, cid: ConnId) {
        debug!("connect timed out");
        let Some((conn, events)) = self.conn_and_events(cid) else { return };
        let passive = conn.passive;
        events.on_connect(cid, passive, &[], Err(ArdpError::Timeout));
        self.conn_mut(cid).unwrap().set_state(ConnState::Closed);
        self.destroy(cid);
    }

    fn on_disconnect_timer(&mut self, cid: ConnId) {
        let Some((conn, events)) = self.conn_and_events(cid) else { return };
        conn.set_state(ConnState::Closed);
        events.on_disconnect(cid, Ok(()));
        self.destroy(cid);
    }

    fn on_retransmit_timer(&mut self, cid: ConnId, slot_idx: usize, tid: u64) {
        let (seq, retry) = {
            let Some(conn) = self.conn_mut(cid) else { return };
            let Some(sbuf) = conn.sbuf.as_ref() else { return };
            let slot = sbuf.slot_at(slot_idx);
            if !slot.in_use {
                // flushed while the timer was pending
                conn.timers.remove(tid);
                return;
            }
            let retry = conn.timers.get_mut(tid).map(|t| t.retry).unwrap_or(0);
            (slot.seq, retry)
        };

        if retry > 1 {
            trace!(seq, retry, "retransmit");
            let delta = match self.transmit_slot(cid, seq) {
                Ok(()) => Some(RETRANSMIT_TIMEOUT_MS),
                Err(ArdpError::WouldBlock) => Some(URGENT_RETRANSMIT_TIMEOUT_MS),
                Err(ArdpError::TtlExpired) => {
                    self.fail_message(cid, seq, Err(ArdpError::TtlExpired));
                    return;
                }
                Err(e) => {
                    warn!("socket write failed during retransmit: {}", e);
                    None
                }
            };
            if let Some(conn) = self.conn_mut(cid) {
                if let Some(timer) = conn.timers.get_mut(tid) {
                    if let Some(delta) = delta {
                        timer.delta = delta;
                    }
                    timer.retry -= 1;
                }
            }
        } else {
            debug!(seq, "retransmissions exhausted");
            self.fail_message(cid, seq, Err(ArdpError::Failed));
        }
    }

    fn on_recv_timer(&mut self, cid: ConnId, slot_idx: usize, tid: u64, now: u32) {
        let give_up = {
            let Some((conn, events)) = self.conn_and_events(cid) else { return };
            let Some(rbuf) = conn.rbuf.as_mut() else { return };

            let (som, stale) = {
                let slot = rbuf.slot_at(slot_idx);
                (slot.seq, !slot.in_use || slot.delivered)
            };
            if stale {
                conn.timers.remove(tid);
                return;
            }

            if Self::deliver_group(rbuf, events, cid, som) {
                if let Some(timer) = conn.timers.get_mut(tid) {
                    timer.retry = 0;
                }
                // delivery unblocked: try the groups that queued up behind
                let mut s = som.wrapping_add(rbuf.slot(som).fcnt.max(1) as u32);
                while let Some(fcnt) = Self::group_complete(rbuf, s) {
                    if !Self::deliver_group(rbuf, events, cid, s) {
                        let idx = rbuf.index(s);
                        conn.timers.schedule(
                            TimerKind::Recv,
                            TimerContext::RecvSlot(idx),
                            now,
                            RECV_TIMEOUT_MS,
                            RECV_RETRIES,
                        );
                        break;
                    }
                    s = s.wrapping_add(fcnt as u32);
                }
                false
            } else {
                let retry = conn
                    .timers
                    .get_mut(tid)
                    .map(|t| {
                        t.retry = t.retry.saturating_sub(1);
                        t.retry
                    })
                    .unwrap_or(0);
                retry == 0
            }
        };

        if give_up {
            warn!("host keeps refusing delivery, tearing the connection down");
            let _ = self.disconnect_conn(cid);
        }
    }

    fn on_window_check(&mut self, cid: ConnId, now: u32) {
        let link_timeout = self.config.probe_timeout.saturating_mul(10);
        let persist = self.config.persist_timeout;

        let Some(conn) = self.conn(cid) else { return };
        if conn.state != ConnState::Open {
            return;
        }
        let quiet = now.wrapping_sub(conn.last_seen);
        if quiet >= link_timeout {
            debug!(quiet, "link is dead");
            let _ = self.disconnect_conn(cid);
            return;
        }

        if quiet >= persist || conn.peer_window < conn.min_send_window {
            trace!("sending probe");
            let window = conn.rbuf.as_ref().map(|r| r.window).unwrap_or(0);
            self.send_header(
                cid,
                SegmentHeader::FLAG_ACK | SegmentHeader::FLAG_VER | SegmentHeader::FLAG_NUL,
                conn.snd.nxt,
                conn.rcv.cur,
                window,
            );
        }
    }

    // ---- teardown -------------------------------------------------------

    fn disconnect_conn(&mut self, cid: ConnId) -> ArdpResult<()> {
        let now = self.now();
        let timewait = self.config.timewait;
        let conn = self.conn_mut(cid).ok_or(ArdpError::InvalidState)?;
        match conn.state {
            ConnState::Closed | ConnState::CloseWait => Err(ArdpError::InvalidState),
            ConnState::Open => {
                conn.timers
                    .schedule(TimerKind::Disconnect, TimerContext::None, now, timewait, 0);
                conn.set_state(ConnState::CloseWait);
                let (nxt, cur) = (conn.snd.nxt, conn.rcv.cur);
                let window = conn.rbuf.as_ref().map(|r| r.window).unwrap_or(0);
                self.send_header(
                    cid,
                    SegmentHeader::FLAG_RST | SegmentHeader::FLAG_VER,
                    nxt,
                    cur,
                    window,
                );
                Ok(())
            }
            _ => {
                conn.set_state(ConnState::Closed);
                conn.timers
                    .schedule(TimerKind::Disconnect, TimerContext::None, now, 0, 0);
                Ok(())
            }
        }
    }

    fn init_sbuf(&mut self, cid: ConnId) -> ArdpResult<()> {
        let max_message_len = self.config.max_message_len;
        let conn = self.conn_mut(cid).ok_or(ArdpError::InvalidState)?;

        let mask_words = ((conn.rcv.max + 31) / 32) as usize;
        conn.snd_hdr_len = FIXED_HEADER_LEN + mask_words * 4;
        conn.rcv_msk = EackMask::new(conn.rcv.max);

        let ring = SendRing::new(conn.snd.max, conn.sbuf_max, conn.snd_hdr_len)?;
        conn.min_send_window = ring.min_send_window(max_message_len);
        conn.sbuf = Some(ring);
        Ok(())
    }

    fn recv_window(&self, cid: ConnId) -> u16 {
        self.conn(cid)
            .and_then(|c| c.rbuf.as_ref())
            .map(|r| r.window)
            .unwrap_or(0)
    }
}
