//! Media delivery between two peers.

use crate::*;

const WAIT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn test_front_frame_arrives_intact() {
    let (a, b) = peer_pair(TransportMode::Dedicated).await;
    let payload = pattern(1, 4000);

    assert!(a.session.submit(StreamId::Front, payload.clone()).unwrap());
    eventually(WAIT, || !b.sink.front_payloads().is_empty())
        .await
        .unwrap();

    let rendered = b.sink.renders();
    assert_eq!(rendered[0].mode, RenderMode::SoloFront);
    assert_eq!(rendered[0].primary.payload, payload);
    assert_eq!(rendered[0].primary.stream_id, StreamId::Front);

    let sent = a.session.stats()[&StreamId::Front];
    assert_eq!(sent.frames_sent, 1);
    assert_eq!(sent.chunks_sent, 3);
    let received = b.session.stats()[&StreamId::Front];
    assert_eq!(received.frames_completed, 1);
    assert_eq!(received.malformed, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slow_renderer_always_catches_up_to_newest_frame() {
    let (ca, cb) = config_pair(TransportMode::Dedicated);
    let a = Peer::start(ca).await.unwrap();
    let b = Peer::start_with_sink(cb, RecordingSink::slow(Duration::from_millis(30)))
        .await
        .unwrap();

    const FRAMES: u8 = 150;
    for seed in 0..FRAMES {
        a.session.submit(StreamId::Front, pattern(seed, 100)).unwrap();
        tokio::task::yield_now().await;
    }
    let last = pattern(FRAMES - 1, 100);

    eventually(WAIT, || b.sink.front_payloads().last() == Some(&last))
        .await
        .expect("newest frame should be rendered");

    let sent = a.session.stats()[&StreamId::Front].frames_sent;
    let renders = b.sink.renders();
    let newest = renders.last().unwrap();
    assert_eq!(u64::from(newest.primary.frame_id), sent - 1);
    assert!(
        renders.len() < usize::from(FRAMES),
        "a slow renderer skips superseded frames instead of queueing them"
    );
}

#[tokio::test]
async fn test_audio_goes_to_the_player() {
    let (a, b) = peer_pair(TransportMode::Dedicated).await;
    a.session
        .submit(StreamId::Audio, pattern(9, 2048))
        .unwrap();

    eventually(WAIT, || !b.sink.audio().is_empty()).await.unwrap();
    let audio = b.sink.audio();
    assert_eq!(audio[0].payload, pattern(9, 2048));
    assert!(b.sink.renders().is_empty(), "audio must not trigger a render");
}

#[tokio::test]
async fn test_shared_socket_carries_every_stream() {
    let (a, b) = peer_pair(TransportMode::Shared).await;
    assert_eq!(
        a.session.local_addr(StreamId::Front),
        a.session.local_addr(StreamId::Control)
    );

    a.session.submit(StreamId::Front, pattern(3, 5000)).unwrap();
    a.session.submit(StreamId::Audio, pattern(4, 100)).unwrap();
    a.session.send_control(vec![1.5, -2.0]).await.unwrap();

    eventually(WAIT, || {
        !b.sink.front_payloads().is_empty()
            && !b.sink.audio().is_empty()
            && !b.sink.control().is_empty()
    })
    .await
    .unwrap();
    assert_eq!(b.sink.front_payloads()[0], pattern(3, 5000));
    assert_eq!(b.sink.control()[0], vec![1.5, -2.0]);
}

#[tokio::test]
async fn test_frames_render_in_increasing_order() {
    let (a, b) = peer_pair(TransportMode::Dedicated).await;
    for seed in 0..20u8 {
        a.session.submit(StreamId::Front, pattern(seed, 3000)).unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    eventually(WAIT, || {
        b.sink
            .front_payloads()
            .last()
            .is_some_and(|p| *p == pattern(19, 3000))
    })
    .await
    .unwrap();

    let ids: Vec<u32> = b
        .sink
        .renders()
        .iter()
        .map(|r| r.primary.frame_id)
        .collect();
    assert!(ids.windows(2).all(|w| w[0] <= w[1]), "ids went backwards: {ids:?}");
}

#[tokio::test]
async fn test_control_values_reach_the_peer() {
    let (a, b) = peer_pair(TransportMode::Dedicated).await;
    a.session.send_control(vec![0.25, 0.5, 0.75]).await.unwrap();
    eventually(WAIT, || !b.sink.control().is_empty()).await.unwrap();
    assert_eq!(b.sink.control()[0], vec![0.25, 0.5, 0.75]);
}
