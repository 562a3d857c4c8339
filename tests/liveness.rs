mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use ardp::conn::ConnState;
use ardp::wire::SegmentHeader;
use common::{open_pair, pump, Event, Node, TestNet};

fn pair(net: &TestNet, clock: &Arc<AtomicU32>) -> (Node, Node) {
    (
        Node::new(net, 9001, clock.clone(), 1),
        Node::new(net, 9002, clock.clone(), 2),
    )
}

#[test]
fn quiet_link_is_probed_and_stays_up() {
    let net = TestNet::new();
    let clock = Arc::new(AtomicU32::new(0));
    let (mut a, mut b) = pair(&net, &clock);
    let (ca, _cb) = open_pair(&net, &mut a, &mut b, 4, 1024);

    // a persist period of silence
    clock.fetch_add(5_000, Ordering::SeqCst);
    a.engine.run(false);

    let probe = net
        .log()
        .iter()
        .map(|p| p.header())
        .find(|h| h.has(SegmentHeader::FLAG_NUL))
        .expect("no probe went out");
    assert!(probe.has(SegmentHeader::FLAG_ACK));
    assert_eq!(probe.dlen, 0);

    pump(&net, &mut [&mut a, &mut b]);

    // the probe reply refreshed the liveness stamp
    let info = a.engine.conn_info(ca).unwrap();
    assert_eq!(info.state, ConnState::Open);
    assert_eq!(info.last_seen, clock.load(Ordering::SeqCst));
}

#[test]
fn unresponsive_peer_is_torn_down() {
    let net = TestNet::new();
    let clock = Arc::new(AtomicU32::new(0));
    let (mut a, mut b) = pair(&net, &clock);
    let (ca, _cb) = open_pair(&net, &mut a, &mut b, 4, 1024);
    a.events.take();

    // b goes silent; a's window checks fire every persist period until the
    // quiet time passes the link-death threshold (10 * probe timeout)
    for _ in 0..6 {
        clock.fetch_add(5_000, Ordering::SeqCst);
        a.engine.run(false);
        net.clear_queues();
    }
    assert_eq!(a.engine.conn_info(ca).unwrap().state, ConnState::CloseWait);

    // the disconnect delay runs out
    clock.fetch_add(1_000, Ordering::SeqCst);
    a.engine.run(false);

    assert!(a.events.all().iter().any(|e| matches!(
        e,
        Event::Disconnect { conn, status: Ok(()) } if *conn == ca
    )));
    assert!(!a.engine.is_valid(ca));
}

#[test]
fn refused_delivery_is_retried() {
    let net = TestNet::new();
    let clock = Arc::new(AtomicU32::new(0));
    let (mut a, mut b) = pair(&net, &clock);
    let (ca, cb) = open_pair(&net, &mut a, &mut b, 4, 1024);
    a.events.take();
    b.events.take();

    b.events.set_accept_recv(false);
    a.engine.send(ca, Bytes::from_static(b"patience"), 0).unwrap();
    pump(&net, &mut [&mut a, &mut b]);

    // refused and parked
    assert!(b.events.all().iter().any(|e| matches!(e, Event::Refused { .. })));
    assert!(b.drain_and_release().is_empty());

    // the host recovers before the re-delivery deadline
    b.events.set_accept_recv(true);
    clock.fetch_add(300, Ordering::SeqCst);
    b.engine.run(false);

    assert_eq!(b.drain_and_release(), vec![b"patience".to_vec()]);
    assert!(b.engine.is_valid(cb));

    // later traffic flows normally
    pump(&net, &mut [&mut a, &mut b]);
    a.engine.send(ca, Bytes::from_static(b"more"), 0).unwrap();
    pump(&net, &mut [&mut a, &mut b]);
    assert_eq!(b.drain_and_release(), vec![b"more".to_vec()]);
}

#[test]
fn persistent_refusal_kills_the_connection() {
    let net = TestNet::new();
    let clock = Arc::new(AtomicU32::new(0));
    let (mut a, mut b) = pair(&net, &clock);
    let (ca, cb) = open_pair(&net, &mut a, &mut b, 4, 1024);
    a.events.take();
    b.events.take();

    b.events.set_accept_recv(false);
    a.engine.send(ca, Bytes::from_static(b"unwanted"), 0).unwrap();
    pump(&net, &mut [&mut a, &mut b]);

    // four re-delivery attempts, all refused
    for _ in 0..4 {
        clock.fetch_add(300, Ordering::SeqCst);
        b.engine.run(false);
    }
    assert_eq!(b.engine.conn_info(cb).unwrap().state, ConnState::CloseWait);

    clock.fetch_add(1_000, Ordering::SeqCst);
    b.engine.run(false);
    assert!(b.events.all().iter().any(|e| matches!(
        e,
        Event::Disconnect { conn, status: Ok(()) } if *conn == cb
    )));
    assert!(!b.engine.is_valid(cb));
}
