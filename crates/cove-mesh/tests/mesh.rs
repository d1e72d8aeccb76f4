//! End-to-end tests: adapters negotiating real WebRTC transports through an
//! in-process rendezvous.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::SinkExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use cove_buoy::server::{router, SignalingState};
use cove_mesh::envelope::EnvelopeKey;
use cove_mesh::protocol::{ExchangePayload, SignalingMessage};
use cove_mesh::{AcceptedChannel, AdapterConfig, PeerAdapter, SignalingConfig};

const MESH_KEY: &str = "mesh envelope key";
const CONNECT_WINDOW: Duration = Duration::from_secs(30);

async fn start_buoy() -> SocketAddr {
    let state = SignalingState::new(Duration::from_secs(2));
    let app = router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("serve");
    });
    addr
}

fn adapter(addr: SocketAddr, id: &str, password: &str) -> PeerAdapter {
    PeerAdapter::new(
        SignalingConfig {
            url: format!("ws://{addr}"),
            community: "c".to_string(),
            password: password.to_string(),
        },
        MESH_KEY,
        AdapterConfig {
            id: Some(id.to_string()),
            channels: vec!["x".to_string()],
            ..Default::default()
        },
    )
    .expect("adapter")
}

async fn expect_channel(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<AcceptedChannel>,
) -> AcceptedChannel {
    timeout(CONNECT_WINDOW, rx.recv())
        .await
        .expect("channel within the connect window")
        .expect("accept stream open")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_peers_converge_on_one_channel_and_exchange_bytes() {
    let addr = start_buoy().await;
    let mut a = adapter(addr, "aaaa", "pw");
    let mut b = adapter(addr, "bbbb", "pw");
    let mut a_accept = a.accept().expect("accept once");
    let mut b_accept = b.accept().expect("accept once");

    let mut a_ids = a.open().expect("open");
    let mut b_ids = b.open().expect("open");
    assert_eq!(
        timeout(Duration::from_secs(10), a_ids.recv()).await.expect("id"),
        Some("aaaa".to_string())
    );
    assert_eq!(
        timeout(Duration::from_secs(10), b_ids.recv()).await.expect("id"),
        Some("bbbb".to_string())
    );

    let mut chan_a = expect_channel(&mut a_accept).await;
    let mut chan_b = expect_channel(&mut b_accept).await;
    assert_eq!(chan_a.peer_id, "bbbb");
    assert_eq!(chan_a.channel, "x");
    assert_eq!(chan_b.peer_id, "aaaa");
    assert_eq!(chan_b.channel, "x");

    chan_a.stream.write_all(b"ping from a").await.expect("write a");
    let mut buf = [0u8; 11];
    timeout(Duration::from_secs(10), chan_b.stream.read_exact(&mut buf))
        .await
        .expect("read within deadline")
        .expect("read b");
    assert_eq!(&buf, b"ping from a");

    chan_b.stream.write_all(b"pong from b").await.expect("write b");
    timeout(Duration::from_secs(10), chan_a.stream.read_exact(&mut buf))
        .await
        .expect("read within deadline")
        .expect("read a");
    assert_eq!(&buf, b"pong from b");

    a.close().await;
    b.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn large_writes_survive_chunking() {
    let addr = start_buoy().await;
    let mut a = adapter(addr, "aaaa", "pw");
    let mut b = adapter(addr, "bbbb", "pw");
    let mut a_accept = a.accept().expect("accept once");
    let mut b_accept = b.accept().expect("accept once");
    let _a_ids = a.open().expect("open");
    let _b_ids = b.open().expect("open");

    let mut chan_a = expect_channel(&mut a_accept).await;
    let mut chan_b = expect_channel(&mut b_accept).await;

    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();
    tokio::spawn(async move {
        chan_a.stream.write_all(&payload).await.expect("bulk write");
    });

    let mut received = vec![0u8; expected.len()];
    timeout(Duration::from_secs(20), chan_b.stream.read_exact(&mut received))
        .await
        .expect("bulk read within deadline")
        .expect("bulk read");
    assert_eq!(received, expected);

    a.close().await;
    b.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn late_joiner_connects_to_every_existing_peer() {
    let addr = start_buoy().await;
    let mut a = adapter(addr, "aaaa", "pw");
    let mut b = adapter(addr, "bbbb", "pw");
    let mut a_accept = a.accept().expect("accept once");
    let mut b_accept = b.accept().expect("accept once");
    let _a_ids = a.open().expect("open");
    let _b_ids = b.open().expect("open");

    // Established pair first.
    let _ab = expect_channel(&mut a_accept).await;
    let _ba = expect_channel(&mut b_accept).await;

    let mut c = adapter(addr, "cccc", "pw");
    let mut c_accept = c.accept().expect("accept once");
    let _c_ids = c.open().expect("open");

    let from_a = expect_channel(&mut a_accept).await;
    assert_eq!(from_a.peer_id, "cccc");
    let from_b = expect_channel(&mut b_accept).await;
    assert_eq!(from_b.peer_id, "cccc");

    let first = expect_channel(&mut c_accept).await;
    let second = expect_channel(&mut c_accept).await;
    let mut peers = vec![first.peer_id.clone(), second.peer_id.clone()];
    peers.sort();
    assert_eq!(peers, vec!["aaaa".to_string(), "bbbb".to_string()]);

    a.close().await;
    b.close().await;
    c.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wrong_password_peer_never_appears() {
    let addr = start_buoy().await;
    let mut a = adapter(addr, "aaaa", "pw");
    let mut intruder = adapter(addr, "bbbb", "not-the-password");
    let mut a_accept = a.accept().expect("accept once");
    let mut intruder_accept = intruder.accept().expect("accept once");
    let _a_ids = a.open().expect("open");
    let _i_ids = intruder.open().expect("open");

    let outcome = timeout(Duration::from_secs(3), a_accept.recv()).await;
    assert!(outcome.is_err(), "rejected peer must not reach the mesh: {outcome:?}");
    let outcome = timeout(Duration::from_millis(100), intruder_accept.recv()).await;
    assert!(outcome.is_err());

    a.close().await;
    intruder.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn force_relay_without_turn_never_connects() {
    let addr = start_buoy().await;
    let relay_only = |id: &str| {
        PeerAdapter::new(
            SignalingConfig {
                url: format!("ws://{addr}"),
                community: "c".to_string(),
                password: "pw".to_string(),
            },
            MESH_KEY,
            AdapterConfig {
                id: Some(id.to_string()),
                channels: vec!["x".to_string()],
                timeout: Duration::from_secs(2),
                force_relay: true,
                ..Default::default()
            },
        )
        .expect("adapter")
    };
    let mut a = relay_only("aaaa");
    let mut b = relay_only("bbbb");
    let mut a_accept = a.accept().expect("accept once");
    let mut b_accept = b.accept().expect("accept once");
    let _a_ids = a.open().expect("open");
    let _b_ids = b.open().expect("open");

    // With no TURN server every candidate is filtered, so negotiation can
    // only time out and retry, never connect.
    let outcome = timeout(Duration::from_secs(6), a_accept.recv()).await;
    assert!(outcome.is_err(), "relay-only peers must not connect: {outcome:?}");
    let outcome = timeout(Duration::from_millis(100), b_accept.recv()).await;
    assert!(outcome.is_err());

    a.close().await;
    b.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hostile_frames_do_not_disturb_the_mesh() {
    let addr = start_buoy().await;

    let mut a = adapter(addr, "aaaa", "pw");
    let mut b = adapter(addr, "bbbb", "pw");
    let mut a_accept = a.accept().expect("accept once");
    let mut b_accept = b.accept().expect("accept once");
    let mut a_ids = a.open().expect("open");
    let mut b_ids = b.open().expect("open");
    timeout(Duration::from_secs(10), a_ids.recv()).await.expect("id");
    timeout(Duration::from_secs(10), b_ids.recv()).await.expect("id");

    // A member of the community that speaks everything but the truth: raw
    // junk, envelopes under the wrong key, and misaddressed exchanges under
    // the right key. All of it lands while the adapters negotiate.
    let (mut hostile, _) = connect_async(format!("ws://{addr}/c?password=pw"))
        .await
        .expect("hostile join");
    hostile
        .send(Message::Binary(b"complete garbage".to_vec()))
        .await
        .expect("send");
    let wrong_key = EnvelopeKey::derive("wrong key").expect("key");
    let forged = wrong_key
        .seal(&SignalingMessage::Introduction {
            from: "mallory".to_string(),
        })
        .expect("seal");
    hostile.send(Message::Binary(forged)).await.expect("send");
    let right_key = EnvelopeKey::derive(MESH_KEY).expect("key");
    let misaddressed = right_key
        .seal(&SignalingMessage::Exchange {
            from: "0000".to_string(),
            to: "nobody-here".to_string(),
            channel: "x".to_string(),
            payload: ExchangePayload::Offer {
                sdp: "v=0\r\n".to_string(),
            },
        })
        .expect("seal");
    hostile.send(Message::Binary(misaddressed)).await.expect("send");

    let mut chan_a = expect_channel(&mut a_accept).await;
    let mut chan_b = expect_channel(&mut b_accept).await;
    assert_eq!(chan_a.peer_id, "bbbb");
    assert_eq!(chan_b.peer_id, "aaaa");

    chan_a.stream.write_all(b"still fine").await.expect("write");
    let mut buf = [0u8; 10];
    timeout(Duration::from_secs(10), chan_b.stream.read_exact(&mut buf))
        .await
        .expect("read within deadline")
        .expect("read");
    assert_eq!(&buf, b"still fine");

    a.close().await;
    b.close().await;
}
