//! Integration tests for the tunnel protocol: the end-to-end scenarios from
//! the design notes, exercised over real loopback sockets on both sides of
//! the link rather than mocks.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::config::Timings;
use crate::link;
use crate::link::engine::CommandHandler;
use crate::role::{accept_local, AcceptorHandler, InitiatorHandler};
use crate::slot::SlotTable;

/// Timings compressed enough that a test exercising quarantine or slot
/// acquisition doesn't have to wait out the real 60-second windows.
fn fast_timings() -> Timings {
    Timings {
        quarantine: Duration::from_millis(20),
        slot_acquire_deadline: Duration::from_millis(200),
        slot_acquire_poll: Duration::from_millis(5),
        dial_retry_interval: Duration::from_millis(10),
        drain_grace: Duration::from_millis(10),
        ..Timings::default()
    }
}

/// Builds a connected loopback socket pair standing in for "the link".
async fn connected_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (a, (b, _)) = tokio::join!(TcpStream::connect(addr), async {
        listener.accept().await.unwrap()
    });
    (a.unwrap(), b)
}

/// Scenario 1 from the design notes: a local CONNECT client tunnels bytes
/// through to a real upstream listener and gets the upstream's reply back.
#[tokio::test]
async fn hello_world_tunnel() {
    let timings = fast_timings();

    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream_listener.local_addr().unwrap();

    let (initiator_link, acceptor_link) = connected_pair().await;

    let initiator_slots = Arc::new(SlotTable::new());
    let (init_send_tx, _running, _init_engine) = link::spawn(
        initiator_link,
        |_send_tx| InitiatorHandler::new(initiator_slots.clone()),
        initiator_slots.clone(),
        timings.clone(),
    );

    let acceptor_slots = Arc::new(SlotTable::new());
    let (_acc_send_tx, _running2, _acc_engine) = link::spawn(
        acceptor_link,
        |send_tx| AcceptorHandler::new(acceptor_slots.clone(), send_tx, timings.clone()),
        acceptor_slots.clone(),
        timings.clone(),
    );

    let local_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_addr = local_listener.local_addr().unwrap();

    let client_task = tokio::spawn(async move {
        let mut client = TcpStream::connect(local_addr).await.unwrap();
        client
            .write_all(format!("CONNECT {upstream_addr} HTTP/1.0\r\nHost: x\r\n\r\n").as_bytes())
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"HTTP/1.0 200 Established\r\n\r\n");

        client.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
        client
    });

    let (local_socket, _) = local_listener.accept().await.unwrap();
    tokio::spawn(accept_local(
        local_socket,
        initiator_slots.clone(),
        init_send_tx.clone(),
        timings.clone(),
    ));

    let (mut upstream_socket, _) = upstream_listener.accept().await.unwrap();
    let mut buf = [0u8; 64];
    let n = upstream_socket.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"GET / HTTP/1.0\r\n\r\n");

    client_task.await.unwrap();
}

/// Scenario 2: the acceptor can't reach the requested upstream, so the
/// initiator's local client gets a 400 and the slot is released rather than
/// left occupied.
#[tokio::test]
async fn failed_upstream_dial_yields_bad_request() {
    let timings = fast_timings();

    // A target address with nothing listening: bind then drop immediately
    // so the port is refused rather than merely closed-but-lingering.
    let dead_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead_listener.local_addr().unwrap();
    drop(dead_listener);

    let (initiator_link, acceptor_link) = connected_pair().await;

    let initiator_slots = Arc::new(SlotTable::new());
    let (init_send_tx, _running, _init_engine) = link::spawn(
        initiator_link,
        |_send_tx| InitiatorHandler::new(initiator_slots.clone()),
        initiator_slots.clone(),
        timings.clone(),
    );

    let acceptor_slots = Arc::new(SlotTable::new());
    let (_acc_send_tx, _running2, _acc_engine) = link::spawn(
        acceptor_link,
        |send_tx| AcceptorHandler::new(acceptor_slots.clone(), send_tx, timings.clone()),
        acceptor_slots.clone(),
        timings.clone(),
    );

    let local_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_addr = local_listener.local_addr().unwrap();

    let client_task = tokio::spawn(async move {
        let mut client = TcpStream::connect(local_addr).await.unwrap();
        client
            .write_all(format!("CONNECT {dead_addr} HTTP/1.0\r\nHost: x\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"HTTP/1.0 400 Bad Request\r\n\r\n");
    });

    let (local_socket, _) = local_listener.accept().await.unwrap();
    tokio::spawn(accept_local(
        local_socket,
        initiator_slots.clone(),
        init_send_tx.clone(),
        timings.clone(),
    ));

    client_task.await.unwrap();

    // The released slot should be reusable again within the (compressed)
    // quarantine window instead of being stuck occupied.
    tokio::time::sleep(timings.quarantine * 3).await;
    assert!(acceptor_slots.get_free().is_some());
}

/// Scenario 4: a second `Connect` for a slot the acceptor already has
/// reserved is silently dropped, and the first dial is unaffected.
#[tokio::test]
async fn duplicate_connect_is_ignored() {
    let timings = fast_timings();

    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream_listener.local_addr().unwrap();

    let slots = Arc::new(SlotTable::new());
    let (tx, mut rx) = tokio::sync::mpsc::channel(8);
    let handler = AcceptorHandler::new(slots.clone(), tx, timings.clone());

    handler
        .handle_connect(5, upstream_addr.to_string())
        .await;
    let (_upstream_socket, _) = upstream_listener.accept().await.unwrap();

    // First Connect should have produced exactly one ConnectAck(5, true).
    let first_ack = rx.recv().await.unwrap();
    let (frame, _) = crate::frame::Frame::parse(&first_ack).unwrap();
    assert_eq!(
        frame,
        crate::frame::Frame::ConnectAck {
            conn_id: 5,
            ok: true
        }
    );

    assert!(slots.get(5).unwrap().is_used());

    // A duplicate Connect for the same now-used slot must not produce a
    // second ConnectAck, nor disturb the slot's occupancy.
    handler
        .handle_connect(5, upstream_addr.to_string())
        .await;
    assert!(rx.try_recv().is_err());
    assert!(slots.get(5).unwrap().is_used());
}

/// Scenario 3: the local client closes its end mid-stream. The initiator's
/// worker sees EOF on the local socket, emits `Disconnect`, and the
/// acceptor's worker for that stream tears down and quarantines the slot.
#[tokio::test]
async fn local_close_propagates_disconnect_and_quarantines_peer_slot() {
    let timings = fast_timings();

    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream_listener.local_addr().unwrap();

    let (initiator_link, acceptor_link) = connected_pair().await;

    let initiator_slots = Arc::new(SlotTable::new());
    let (init_send_tx, _running, _init_engine) = link::spawn(
        initiator_link,
        |_send_tx| InitiatorHandler::new(initiator_slots.clone()),
        initiator_slots.clone(),
        timings.clone(),
    );

    let acceptor_slots = Arc::new(SlotTable::new());
    let (_acc_send_tx, _running2, _acc_engine) = link::spawn(
        acceptor_link,
        |send_tx| AcceptorHandler::new(acceptor_slots.clone(), send_tx, timings.clone()),
        acceptor_slots.clone(),
        timings.clone(),
    );

    let local_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_addr = local_listener.local_addr().unwrap();

    let client_task = tokio::spawn(async move {
        let mut client = TcpStream::connect(local_addr).await.unwrap();
        client
            .write_all(format!("CONNECT {upstream_addr} HTTP/1.0\r\nHost: x\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"HTTP/1.0 200 Established\r\n\r\n");
        // Closing here is the local-close trigger the scenario exercises.
    });

    let (local_socket, _) = local_listener.accept().await.unwrap();
    tokio::spawn(accept_local(
        local_socket,
        initiator_slots.clone(),
        init_send_tx.clone(),
        timings.clone(),
    ));

    let (_upstream_socket, _) = upstream_listener.accept().await.unwrap();
    client_task.await.unwrap();

    // Give the Disconnect frame time to cross the link and both sides'
    // workers time to quarantine, then both slot 0s should be reusable.
    tokio::time::sleep(timings.quarantine * 4).await;
    assert!(initiator_slots.get_free().is_some());
    assert!(acceptor_slots.get_free().is_some());
}

/// Scenario 5: the link itself is lost while streams are active. Both
/// sides' `clean_all` must drain every in-use slot rather than leaving
/// workers running against a dead link.
#[tokio::test]
async fn link_loss_cancels_every_in_use_slot() {
    let timings = fast_timings();
    let slots = Arc::new(SlotTable::new());

    let a = slots.get_free().unwrap();
    let b = slots.get_free().unwrap();
    let c = slots.get_free().unwrap();
    slots.flush_inbox(a);
    slots.flush_inbox(b);
    slots.flush_inbox(c);
    assert!(slots.get(a).unwrap().is_used());
    assert!(slots.get(b).unwrap().is_used());
    assert!(slots.get(c).unwrap().is_used());

    // No worker is actually driving these slots in this test; clean_all
    // only cancels and waits, so simulate a worker's own response to
    // cancellation by freeing once cancelled.
    for id in [a, b, c] {
        let slots = slots.clone();
        let cancel = slots.get(id).unwrap().cancel_token();
        let timings = timings.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            slots.free(id, timings.quarantine);
        });
    }

    tokio::time::timeout(Duration::from_secs(1), slots.clean_all())
        .await
        .expect("clean_all should return once every slot drains");

    for id in [a, b, c] {
        assert!(!slots.get(id).unwrap().is_used());
    }
}
