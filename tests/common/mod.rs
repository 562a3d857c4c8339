//! Shared harness: two engines joined by an in-memory datagram network with
//! packet logging, selective loss and send blocking, plus a hand-driven
//! clock and an event-recording sink.
#![allow(dead_code)] // each test binary uses its own slice of the harness

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use ardp::engine::{ArdpEngine, Clock, ConnId};
use ardp::error::{ArdpError, ArdpResult, Status};
use ardp::events::{ArdpEvents, RecvMessage};
use ardp::socket::DatagramSocket;
use ardp::wire::SegmentHeader;
use ardp::ArdpConfig;

pub struct ManualClock(pub Arc<AtomicU32>);

impl Clock for ManualClock {
    fn now_ms(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoggedPacket {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub bytes: Vec<u8>,
}

impl LoggedPacket {
    pub fn header(&self) -> SegmentHeader {
        let mut b: &[u8] = &self.bytes;
        SegmentHeader::deser(&mut b).unwrap()
    }
}

#[derive(Default)]
struct NetInner {
    queues: HashMap<SocketAddr, VecDeque<(SocketAddr, Vec<u8>)>>,
    log: Vec<LoggedPacket>,
    drop_data_seqs: HashSet<u32>,
    blocked: HashSet<SocketAddr>,
}

#[derive(Clone, Default)]
pub struct TestNet {
    inner: Arc<Mutex<NetInner>>,
}

impl TestNet {
    pub fn new() -> TestNet {
        TestNet::default()
    }

    pub fn socket(&self, local: SocketAddr) -> Arc<TestSocket> {
        Arc::new(TestSocket { net: self.inner.clone(), local })
    }

    /// Drop the next data segment carrying this sequence number (once).
    pub fn drop_data_seq(&self, seq: u32) {
        self.inner.lock().unwrap().drop_data_seqs.insert(seq);
    }

    /// All sends from `addr` fail with would-block until unblocked.
    pub fn block(&self, addr: SocketAddr) {
        self.inner.lock().unwrap().blocked.insert(addr);
    }

    pub fn unblock(&self, addr: SocketAddr) {
        self.inner.lock().unwrap().blocked.remove(&addr);
    }

    pub fn any_pending(&self) -> bool {
        self.inner
            .lock()
            .unwrap()
            .queues
            .values()
            .any(|q| !q.is_empty())
    }

    pub fn clear_queues(&self) {
        self.inner.lock().unwrap().queues.clear();
    }

    pub fn log(&self) -> Vec<LoggedPacket> {
        self.inner.lock().unwrap().log.clone()
    }
}

pub struct TestSocket {
    net: Arc<Mutex<NetInner>>,
    local: SocketAddr,
}

impl DatagramSocket for TestSocket {
    fn send_to(&self, buf: &[u8], to: SocketAddr) -> ArdpResult<()> {
        let mut net = self.net.lock().unwrap();
        if net.blocked.contains(&self.local) {
            return Err(ArdpError::WouldBlock);
        }
        if buf.len() >= 28 {
            let flags = buf[0];
            let dlen = u16::from_be_bytes([buf[6], buf[7]]);
            let seq = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
            let is_data = flags & SegmentHeader::FLAG_SYN == 0 && dlen > 0;
            if is_data && net.drop_data_seqs.remove(&seq) {
                return Ok(());
            }
        }
        net.log.push(LoggedPacket { from: self.local, to, bytes: buf.to_vec() });
        net.queues.entry(to).or_default().push_back((self.local, buf.to_vec()));
        Ok(())
    }

    fn recv_from(&self, buf: &mut [u8]) -> ArdpResult<(usize, SocketAddr)> {
        let mut net = self.net.lock().unwrap();
        match net.queues.entry(self.local).or_default().pop_front() {
            Some((from, bytes)) => {
                buf[..bytes.len()].copy_from_slice(&bytes);
                Ok((bytes.len(), from))
            }
            None => Err(ArdpError::WouldBlock),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Accept { conn: ConnId, peer: SocketAddr, data: Vec<u8> },
    Connect { conn: ConnId, passive: bool, data: Vec<u8>, status: Status },
    Disconnect { conn: ConnId, status: Status },
    Recv { conn: ConnId, seq: u32, fcnt: u16, data: Vec<u8> },
    Refused { conn: ConnId, seq: u32 },
    SendComplete { conn: ConnId, len: usize, status: Status },
    SendWindow { conn: ConnId, window: u16 },
}

/// Handle over the recorded event stream of one engine.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<Event>>>,
    accept_recv: Arc<AtomicBool>,
}

impl EventLog {
    pub fn new() -> EventLog {
        let log = EventLog::default();
        log.accept_recv.store(true, Ordering::SeqCst);
        log
    }

    pub fn sink(&self) -> Box<dyn ArdpEvents> {
        Box::new(EventSink { events: self.events.clone(), accept_recv: self.accept_recv.clone() })
    }

    /// Refuse (or resume accepting) message delivery.
    pub fn set_accept_recv(&self, accept: bool) {
        self.accept_recv.store(accept, Ordering::SeqCst);
    }

    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    pub fn all(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

struct EventSink {
    events: Arc<Mutex<Vec<Event>>>,
    accept_recv: Arc<AtomicBool>,
}

impl EventSink {
    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl ArdpEvents for EventSink {
    fn on_accept(&mut self, peer: SocketAddr, conn: ConnId, data: &[u8], _status: Status) -> bool {
        self.push(Event::Accept { conn, peer, data: data.to_vec() });
        true
    }

    fn on_connect(&mut self, conn: ConnId, passive: bool, data: &[u8], status: Status) {
        self.push(Event::Connect { conn, passive, data: data.to_vec(), status });
    }

    fn on_disconnect(&mut self, conn: ConnId, status: Status) {
        self.push(Event::Disconnect { conn, status });
    }

    fn on_receive(&mut self, conn: ConnId, message: RecvMessage<'_>, _status: Status) -> bool {
        if !self.accept_recv.load(Ordering::SeqCst) {
            self.push(Event::Refused { conn, seq: message.seq });
            return false;
        }
        self.push(Event::Recv {
            conn,
            seq: message.seq,
            fcnt: message.fcnt,
            data: message.to_vec(),
        });
        true
    }

    fn on_send_complete(&mut self, conn: ConnId, message: Bytes, status: Status) {
        self.push(Event::SendComplete { conn, len: message.len(), status });
    }

    fn on_send_window(&mut self, conn: ConnId, window: u16, status: Status) {
        let _ = status;
        self.push(Event::SendWindow { conn, window });
    }
}

pub struct Node {
    pub engine: ArdpEngine,
    pub events: EventLog,
    pub addr: SocketAddr,
}

impl Node {
    pub fn new(net: &TestNet, port: u16, clock: Arc<AtomicU32>, seed: u64) -> Node {
        Node::with_rng(net, port, clock, Box::new(StdRng::seed_from_u64(seed)))
    }

    pub fn with_rng(
        net: &TestNet,
        port: u16,
        clock: Arc<AtomicU32>,
        rng: Box<dyn RngCore + Send>,
    ) -> Node {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let events = EventLog::new();
        let engine = ArdpEngine::with_parts(
            ArdpConfig::default(),
            events.sink(),
            net.socket(addr),
            Box::new(ManualClock(clock)),
            rng,
        )
        .unwrap();
        Node { engine, events, addr }
    }

    /// Drain this node's inbound queue and fire due timers.
    pub fn run(&mut self) -> Option<u32> {
        self.engine.run(true)
    }

    /// Pop recorded events, releasing every accepted message so the window
    /// reopens; returns the payloads delivered in order.
    pub fn drain_and_release(&mut self) -> Vec<Vec<u8>> {
        let mut delivered = Vec::new();
        for event in self.events.take() {
            if let Event::Recv { conn, seq, data, .. } = event {
                self.engine.recv_ready(conn, seq).unwrap();
                delivered.push(data);
            }
        }
        delivered
    }
}

/// Shuttle datagrams until the network is quiet.
pub fn pump(net: &TestNet, nodes: &mut [&mut Node]) {
    for _ in 0..1000 {
        for node in nodes.iter_mut() {
            node.run();
        }
        if !net.any_pending() {
            return;
        }
    }
    panic!("network never quiesced");
}

/// Three-way open between `a` (active) and `b` (passive); returns the
/// connection ids on each side.
pub fn open_pair(
    net: &TestNet,
    a: &mut Node,
    b: &mut Node,
    segmax: u16,
    segbmax: u16,
) -> (ConnId, ConnId) {
    b.engine.start_passive();
    let ca = a.engine.connect(b.addr, segmax, segbmax, b"hello").unwrap();
    pump(net, &mut [a, b]);

    let cb = b
        .events
        .all()
        .iter()
        .find_map(|e| match e {
            Event::Accept { conn, .. } => Some(*conn),
            _ => None,
        })
        .expect("no accept event on the passive side");
    b.engine.accept(cb, segmax, segbmax, b"welcome").unwrap();
    pump(net, &mut [a, b]);

    assert!(a.events.all().iter().any(|e| matches!(
        e,
        Event::Connect { conn, passive: false, status: Ok(()), .. } if *conn == ca
    )));
    assert!(b.events.all().iter().any(|e| matches!(
        e,
        Event::Connect { conn, passive: true, status: Ok(()), .. } if *conn == cb
    )));

    (ca, cb)
}
