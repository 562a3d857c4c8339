//! End-to-end over real UDP loopback sockets, driven by the tokio endpoint.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use ardp::{ArdpConfig, ArdpEndpoint, ConnId};
use common::{Event, EventLog};

async fn endpoint(events: &EventLog) -> Arc<ArdpEndpoint> {
    let endpoint = ArdpEndpoint::bind(
        std::net::SocketAddr::from(([127, 0, 0, 1], 0)),
        ArdpConfig::default(),
        events.sink(),
    )
    .await
    .unwrap();
    let endpoint = Arc::new(endpoint);

    let driver = endpoint.clone();
    tokio::spawn(async move {
        let _ = driver.run().await;
    });
    endpoint
}

async fn wait_for<T>(log: &EventLog, mut pick: impl FnMut(&Event) -> Option<T>) -> T {
    for _ in 0..200 {
        if let Some(found) = log.all().iter().find_map(&mut pick) {
            return found;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("event never arrived; log: {:?}", log.all());
}

#[tokio::test(flavor = "multi_thread")]
async fn open_and_transfer_over_loopback() {
    let a_events = EventLog::new();
    let b_events = EventLog::new();
    let a = endpoint(&a_events).await;
    let b = endpoint(&b_events).await;

    b.engine().lock().unwrap().start_passive();

    let ca: ConnId = {
        let a_engine = a.engine();
        let mut engine = a_engine.lock().unwrap();
        let cid = engine
            .connect(b.local_addr().unwrap(), 8, 1024, b"hello")
            .unwrap();
        drop(engine);
        a.poke();
        cid
    };

    let cb = wait_for(&b_events, |e| match e {
        Event::Accept { conn, data, .. } if data == b"hello" => Some(*conn),
        _ => None,
    })
    .await;

    b.engine().lock().unwrap().accept(cb, 8, 1024, b"welcome").unwrap();
    b.poke();

    wait_for(&a_events, |e| match e {
        Event::Connect { conn, passive: false, status: Ok(()), .. } if *conn == ca => Some(()),
        _ => None,
    })
    .await;
    wait_for(&b_events, |e| match e {
        Event::Connect { conn, passive: true, status: Ok(()), .. } if *conn == cb => Some(()),
        _ => None,
    })
    .await;

    // a fragmented message across the real socket
    let message: Vec<u8> = (0..3000u32).map(|i| (i * 7) as u8).collect();
    a.engine()
        .lock()
        .unwrap()
        .send(ca, Bytes::from(message.clone()), 0)
        .unwrap();
    a.poke();

    let (seq, data) = wait_for(&b_events, |e| match e {
        Event::Recv { seq, data, .. } => Some((*seq, data.clone())),
        _ => None,
    })
    .await;
    assert_eq!(data, message);

    b.engine().lock().unwrap().recv_ready(cb, seq).unwrap();
    b.poke();

    wait_for(&a_events, |e| match e {
        Event::SendComplete { conn, len: 3000, status: Ok(()), .. } if *conn == ca => Some(()),
        _ => None,
    })
    .await;
}
