//! Loss, garbage and peer restarts.

use crate::*;
use std::collections::HashSet;
use std::net::SocketAddr;

use tokio::net::UdpSocket as TokioUdpSocket;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(3);

// ── Lossy relay ─────────────────────────────────────────────────────────────

/// Forwards datagrams to `target`, dropping every `drop_every`-th one.
/// The task ends when the returned handle is aborted or dropped with the
/// test runtime.
pub async fn lossy_relay(target: SocketAddr, drop_every: usize) -> (u16, JoinHandle<()>) {
    let socket = TokioUdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let port = socket.local_addr().unwrap().port();
    let task = tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        let mut seen = 0usize;
        while let Ok((n, _)) = socket.recv_from(&mut buf).await {
            seen += 1;
            if seen % drop_every == 0 {
                continue;
            }
            let _ = socket.send_to(&buf[..n], target).await;
        }
    });
    (port, task)
}

#[tokio::test]
async fn test_loss_never_yields_partial_frames() {
    let base = free_port_block(2 * PORTS_PER_PEER);
    let (a_port, b_port) = (base, base + PORTS_PER_PEER);
    let (relay_port, relay) =
        lossy_relay(SocketAddr::from((Ipv4Addr::LOCALHOST, b_port)), 5).await;

    let a = Peer::start(peer_config(TransportMode::Shared, a_port, relay_port))
        .await
        .unwrap();
    let b = Peer::start(peer_config(TransportMode::Shared, b_port, a_port))
        .await
        .unwrap();

    let sent: HashSet<Bytes> = (0..40u8).map(|seed| pattern(seed, 4000)).collect();
    for seed in 0..40u8 {
        a.session.submit(StreamId::Front, pattern(seed, 4000)).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    eventually(WAIT, || b.session.stats()[&StreamId::Front].frames_completed > 0)
        .await
        .unwrap();
    // Let the tail of the stream settle.
    tokio::time::sleep(Duration::from_millis(200)).await;

    for payload in b.sink.front_payloads() {
        assert!(sent.contains(&payload), "rendered a frame that was never sent");
    }
    let stats = b.session.stats()[&StreamId::Front];
    assert!(
        stats.superseded + stats.timed_out > 0,
        "lossy link should abandon some frames: {stats:?}"
    );
    assert!(stats.frames_completed < 40);
    relay.abort();
}

#[tokio::test]
async fn test_garbage_does_not_stop_the_receive_loop() {
    let (a, b) = peer_pair(TransportMode::Dedicated).await;
    let b_front = b.session.local_addr(StreamId::Front).unwrap().port();

    let junk = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    for datagram in [&[0u8][..], &[0, 0, 0, 1, 0, 0, 0, 0], &[0xff; 3]] {
        junk.send_to(datagram, (Ipv4Addr::LOCALHOST, b_front)).unwrap();
    }

    eventually(WAIT, || b.session.stats()[&StreamId::Front].malformed >= 3)
        .await
        .unwrap();

    a.session.submit(StreamId::Front, pattern(5, 2000)).unwrap();
    eventually(WAIT, || !b.sink.front_payloads().is_empty())
        .await
        .unwrap();
    assert_eq!(b.sink.front_payloads()[0], pattern(5, 2000));
}

// ── Peer restart ────────────────────────────────────────────────────────────

async fn start_with_retry(config: TandemConfig) -> Peer {
    let mut last = None;
    for _ in 0..50 {
        match Peer::start(config.clone()).await {
            Ok(peer) => return peer,
            Err(e) => last = Some(e),
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("peer did not restart: {last:?}");
}

#[tokio::test]
async fn test_restarted_peer_is_accepted_after_silence() {
    let (mut ca, mut cb) = config_pair(TransportMode::Dedicated);
    ca.transport.frame_timeout_ms = 100;
    cb.transport.frame_timeout_ms = 100;

    let a = Peer::start(ca.clone()).await.unwrap();
    let b = Peer::start(cb).await.unwrap();

    for seed in 0..3u8 {
        a.session.submit(StreamId::Front, pattern(seed, 1000)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    eventually(WAIT, || {
        b.sink
            .front_payloads()
            .last()
            .is_some_and(|p| *p == pattern(2, 1000))
    })
    .await
    .unwrap();

    // Restart A: its frame ids start over at zero.
    drop(a);
    tokio::time::sleep(Duration::from_millis(500)).await;
    let a = start_with_retry(ca).await;

    a.session.submit(StreamId::Front, pattern(99, 1000)).unwrap();
    eventually(WAIT, || {
        b.sink
            .front_payloads()
            .last()
            .is_some_and(|p| *p == pattern(99, 1000))
    })
    .await
    .expect("frames from the restarted peer should be accepted");
}
