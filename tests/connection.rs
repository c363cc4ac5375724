//! End-to-end connection tests over localhost TCP
//!
//! Drives real client/listener pairs through the request/response cycle,
//! heartbeat enforcement, pause/resume flow control, and cryption
//! renegotiation, plus a hand-rolled raw peer for wire-level assertions.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use bytes::BytesMut;
use peer_protocol::config::{ConnectionConfig, ListenerConfig};
use peer_protocol::connection::{Connection, ConnectionState, Listener};
use peer_protocol::core::{Bulk, Direction, FrameCodec, Kind};
use peer_protocol::crypto::CryptionVariant;
use peer_protocol::error::ProtocolError;
use peer_protocol::protocol::ConnectionHandlers;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};

/// Handler answering every request with `{"ok": true}` and recording
/// notifications
#[derive(Default)]
struct OkHandlers {
    notified: Mutex<Vec<(Value, Value)>>,
}

impl ConnectionHandlers for OkHandlers {
    fn handle_request(&self, _request: Value) -> Value {
        json!({"ok": true})
    }

    fn notification(&self, shape: &Value, value: &Value) {
        self.notified
            .lock()
            .unwrap()
            .push((shape.clone(), value.clone()));
    }
}

fn fast_config(timeout_secs: u64) -> ConnectionConfig {
    ConnectionConfig {
        timeout_secs,
        ..ConnectionConfig::default()
    }
}

async fn echo_listener(timeout_secs: u64) -> Listener {
    let config = ListenerConfig::default_with_overrides(|c| {
        c.bind_address = "127.0.0.1".into();
        c.port = 0;
        c.connection.timeout_secs = timeout_secs;
    });
    Listener::bind(config, Arc::new(OkHandlers::default()))
        .await
        .expect("listener binds")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn request_resolves_within_one_round_trip() {
    let listener = echo_listener(10).await;
    let client = Connection::connect(
        listener.local_addr(),
        Arc::new(OkHandlers::default()),
        fast_config(10),
    )
    .await
    .expect("client connects");

    let reply = client.issue_request(json!({"op": "ping"})).unwrap();
    let answer = timeout(Duration::from_secs(5), reply.recv())
        .await
        .expect("answer in time")
        .expect("answer ok");
    assert_eq!(answer, json!({"ok": true}));

    client.close();
    listener.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn heartbeats_keep_the_connection_alive() {
    let listener = echo_listener(2).await;
    let client = Connection::connect(
        listener.local_addr(),
        Arc::new(OkHandlers::default()),
        fast_config(2),
    )
    .await
    .expect("client connects");

    // Twice the lease window plus grace: only heartbeats keep this alive.
    sleep(Duration::from_secs(6)).await;

    assert_ne!(client.state(), ConnectionState::Closed);
    assert_eq!(listener.connections(), 1);

    // An explicit liveness probe goes through like any control traffic.
    client.ping().unwrap();
    sleep(Duration::from_millis(500)).await;
    assert!(client.metrics().snapshot().heartbeats_received >= 1);

    let reply = client.issue_request(json!({"still": "alive"})).unwrap();
    assert!(timeout(Duration::from_secs(5), reply.recv()).await.is_ok());

    client.close();
    listener.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn silent_peer_is_closed_when_the_lease_expires() {
    let listener = echo_listener(2).await;

    // A raw socket that speaks no protocol at all.
    let _mute = TcpStream::connect(listener.local_addr())
        .await
        .expect("raw connect");
    sleep(Duration::from_millis(300)).await;
    assert_eq!(listener.connections(), 1);

    // Lease (2s) + grace (2s) + slack.
    let mut closed = false;
    for _ in 0..16 {
        sleep(Duration::from_millis(500)).await;
        if listener.connections() == 0 {
            closed = true;
            break;
        }
    }
    assert!(closed, "leased-out connection was not closed");

    listener.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_fails_pending_replies_and_further_sends() {
    // A peer that accepts and then never answers anything.
    let mute = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = mute.local_addr().unwrap();
    tokio::spawn(async move {
        let (_stream, _) = mute.accept().await.unwrap();
        sleep(Duration::from_secs(30)).await;
    });

    let client = Connection::connect(addr, Arc::new(OkHandlers::default()), fast_config(10))
        .await
        .expect("client connects");

    let reply = client.issue_request(json!({"op": "never-answered"})).unwrap();

    client.close();
    client.close(); // idempotent

    assert!(matches!(
        reply.recv().await,
        Err(ProtocolError::ConnectionClosed)
    ));
    assert!(matches!(
        client.send(Bulk::single(
            Kind::Data,
            Direction::Request,
            100,
            json!(null)
        )),
        Err(ProtocolError::SendWhileNotOpen(ConnectionState::Closed))
    ));
}

/// Raw-peer helpers: frame/unframe bulks by hand (none cryption).
async fn send_raw(stream: &mut TcpStream, codec: &FrameCodec, bulk: &Bulk) {
    let wire = bulk.to_wire().unwrap();
    let mut out = BytesMut::new();
    codec.encode_frame(&wire, &mut out).unwrap();
    stream.write_all(&out).await.unwrap();
}

async fn read_raw(
    stream: &mut TcpStream,
    codec: &FrameCodec,
    buf: &mut BytesMut,
    window: Duration,
) -> Vec<Bulk> {
    let deadline = tokio::time::Instant::now() + window;
    let mut bulks = Vec::new();
    loop {
        while let Some(frame) = codec.decode_frame(buf).unwrap() {
            bulks.push(Bulk::from_wire(&frame).unwrap());
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            break;
        }
        match timeout(deadline - now, stream.read_buf(buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(_)) => {}
            Ok(Err(_)) | Err(_) => break,
        }
    }
    bulks
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pause_withholds_data_until_resume() {
    let raw = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = raw.local_addr().unwrap();

    let client_task = tokio::spawn(async move {
        Connection::connect(addr, Arc::new(OkHandlers::default()), fast_config(10))
            .await
            .expect("client connects")
    });

    let (mut peer, _) = raw.accept().await.unwrap();
    let client = client_task.await.unwrap();
    let codec = FrameCodec::new(4).unwrap();
    let mut buf = BytesMut::new();

    // Sanity: a data request is answered while open.
    send_raw(
        &mut peer,
        &codec,
        &Bulk::single(Kind::Data, Direction::Request, 300, json!({"q": 1})),
    )
    .await;
    let bulks = read_raw(&mut peer, &codec, &mut buf, Duration::from_secs(2)).await;
    assert!(
        bulks
            .iter()
            .any(|b| b.kind == Kind::Data && b.direction == Direction::Response),
        "expected a data response while open"
    );

    // Pause the client.
    send_raw(
        &mut peer,
        &codec,
        &Bulk::single(Kind::Communication, Direction::Request, 500, json!({"op": "pause"})),
    )
    .await;
    let bulks = read_raw(&mut peer, &codec, &mut buf, Duration::from_secs(2)).await;
    assert!(
        bulks
            .iter()
            .any(|b| b.kind == Kind::Communication && b.direction == Direction::Response),
        "expected a pause acknowledgement"
    );
    assert_eq!(client.state(), ConnectionState::Paused);

    // A request processed while paused must not produce wire traffic...
    send_raw(
        &mut peer,
        &codec,
        &Bulk::single(Kind::Data, Direction::Request, 301, json!({"q": 2})),
    )
    .await;
    let withheld = read_raw(&mut peer, &codec, &mut buf, Duration::from_millis(1500)).await;
    assert!(
        !withheld.iter().any(|b| b.kind == Kind::Data),
        "data frame escaped while paused"
    );

    // ...until the peer resumes, which releases the buffered response.
    send_raw(
        &mut peer,
        &codec,
        &Bulk::single(Kind::Communication, Direction::Request, 501, json!({"op": "resume"})),
    )
    .await;
    let released = read_raw(&mut peer, &codec, &mut buf, Duration::from_secs(2)).await;
    let data: Vec<&Bulk> = released.iter().filter(|b| b.kind == Kind::Data).collect();
    assert_eq!(data.len(), 1, "buffered response must flush on resume");
    assert_eq!(data[0].data[0].id, 301);
    assert_eq!(client.state(), ConnectionState::Open);

    client.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cryption_renegotiation_keeps_traffic_flowing() {
    let listener = echo_listener(10).await;
    let client = Connection::connect(
        listener.local_addr(),
        Arc::new(OkHandlers::default()),
        fast_config(10),
    )
    .await
    .expect("client connects");

    // Switch the whole stream to symmetric encryption.
    client.send_cryption_change(CryptionVariant::Symmetric);
    sleep(Duration::from_secs(2)).await;
    assert_eq!(client.state(), ConnectionState::Open);

    let reply = client.issue_request(json!({"after": "symmetric"})).unwrap();
    assert_eq!(
        timeout(Duration::from_secs(5), reply.recv()).await.unwrap().unwrap(),
        json!({"ok": true})
    );

    // Rotate the key under the new variant.
    client.send_key_exchange();
    sleep(Duration::from_secs(2)).await;
    assert_eq!(client.state(), ConnectionState::Open);

    let reply = client.issue_request(json!({"after": "rotation"})).unwrap();
    assert_eq!(
        timeout(Duration::from_secs(5), reply.recv()).await.unwrap().unwrap(),
        json!({"ok": true})
    );

    // And again under asymmetric agreement.
    client.send_cryption_change(CryptionVariant::Asymmetric);
    sleep(Duration::from_secs(2)).await;

    let reply = client.issue_request(json!({"after": "asymmetric"})).unwrap();
    assert_eq!(
        timeout(Duration::from_secs(5), reply.recv()).await.unwrap().unwrap(),
        json!({"ok": true})
    );

    client.close();
    listener.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn max_bytes_renegotiation_survives_round_trips() {
    let listener = echo_listener(10).await;
    let client = Connection::connect(
        listener.local_addr(),
        Arc::new(OkHandlers::default()),
        fast_config(10),
    )
    .await
    .expect("client connects");

    client.request_max_bytes(2).unwrap();
    sleep(Duration::from_secs(2)).await;
    assert_eq!(client.state(), ConnectionState::Open);

    let reply = client.issue_request(json!({"width": 2})).unwrap();
    assert!(timeout(Duration::from_secs(5), reply.recv()).await.is_ok());

    // An oversize bulk is refused at enqueue time under the narrow width.
    let huge = json!({ "blob": "x".repeat(70_000) });
    assert!(matches!(
        client.issue_request(huge),
        Err(ProtocolError::Oversize { .. })
    ));

    // Back to the default width; big payloads fit again.
    client.request_max_bytes(4).unwrap();
    sleep(Duration::from_secs(2)).await;

    let huge = json!({ "blob": "y".repeat(70_000) });
    let reply = client.issue_request(huge).unwrap();
    assert!(timeout(Duration::from_secs(5), reply.recv()).await.is_ok());

    client.close();
    listener.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn provide_data_reaches_only_matching_subscribers() {
    let listener = echo_listener(10).await;

    let observer_a = Arc::new(OkHandlers::default());
    let client_a = Connection::connect(
        listener.local_addr(),
        observer_a.clone(),
        fast_config(10),
    )
    .await
    .expect("client a connects");

    let observer_b = Arc::new(OkHandlers::default());
    let client_b = Connection::connect(
        listener.local_addr(),
        observer_b.clone(),
        fast_config(10),
    )
    .await
    .expect("client b connects");

    let shape = json!({"topic": "metrics"});
    client_a.subscribe(shape.clone()).unwrap();
    sleep(Duration::from_secs(1)).await;

    let delivered = listener.provide_data(&shape, &json!(42));
    assert_eq!(delivered, 1, "only the subscribed connection is notified");

    sleep(Duration::from_secs(1)).await;
    {
        let notified = observer_a.notified.lock().unwrap();
        assert_eq!(notified.len(), 1);
        assert_eq!(notified[0].0, shape);
        assert_eq!(notified[0].1, json!(42));
    }
    assert!(observer_b.notified.lock().unwrap().is_empty());

    // Unsubscribing stops delivery.
    client_a.unsubscribe(shape.clone()).unwrap();
    sleep(Duration::from_secs(1)).await;
    assert_eq!(listener.provide_data(&shape, &json!(43)), 0);

    client_a.close();
    client_b.close();
    listener.shutdown();
}
