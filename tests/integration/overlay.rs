//! Overlay agreement and the blended render path.

use crate::*;

const WAIT: Duration = Duration::from_secs(3);

async fn both_active(a: &Peer, b: &Peer) {
    a.session.set_overlay(true);
    b.session.set_overlay(true);
    eventually(WAIT, || {
        a.session.toggle_state().overlay_active() && b.session.toggle_state().overlay_active()
    })
    .await
    .expect("both peers should agree on the overlay");
}

#[tokio::test]
async fn test_one_sided_toggle_never_activates() {
    let (a, b) = peer_pair(TransportMode::Dedicated).await;
    a.session.set_overlay(true);

    eventually(WAIT, || b.session.toggle_state().remote).await.unwrap();
    let sa = a.session.toggle_state();
    let sb = b.session.toggle_state();
    assert!(sa.local && !sa.remote && !sa.overlay_active());
    assert!(!sb.local && sb.remote && !sb.overlay_active());

    // The back camera stays off the wire.
    assert!(!a.session.submit(StreamId::Back, pattern(0, 10)).unwrap());
    assert_eq!(a.session.stats()[&StreamId::Back].gated, 1);
}

#[tokio::test]
async fn test_blending_uses_local_front_and_remote_back() {
    let (a, b) = peer_pair(TransportMode::Dedicated).await;
    both_active(&a, &b).await;

    b.session.submit_local_front(pattern(10, 1200)).unwrap();
    assert!(a.session.submit(StreamId::Back, pattern(20, 4000)).unwrap());

    within(WAIT, b.session.wait_for_render_mode(RenderMode::Blending))
        .await
        .unwrap();
    let blended = b
        .sink
        .renders()
        .into_iter()
        .find(|r| r.mode == RenderMode::Blending)
        .unwrap();
    assert_eq!(blended.primary.payload, pattern(10, 1200));
    assert_eq!(blended.secondary.unwrap().payload, pattern(20, 4000));
}

#[tokio::test]
async fn test_turning_off_returns_both_sides_to_solo_front() {
    let (a, b) = peer_pair(TransportMode::Dedicated).await;
    both_active(&a, &b).await;
    a.session.submit(StreamId::Front, pattern(4, 100)).unwrap();
    b.session.submit_local_front(pattern(1, 100)).unwrap();
    a.session.submit(StreamId::Back, pattern(2, 100)).unwrap();
    within(WAIT, b.session.wait_for_render_mode(RenderMode::Blending))
        .await
        .unwrap();

    a.session.set_overlay(false);
    eventually(WAIT, || !b.session.toggle_state().overlay_active())
        .await
        .unwrap();
    within(WAIT, b.session.wait_for_render_mode(RenderMode::SoloFront))
        .await
        .unwrap();
    let last = b.sink.renders().pop().unwrap();
    assert_eq!(last.primary.payload, pattern(4, 100), "remote front while inactive");
    assert!(!a.session.submit(StreamId::Back, pattern(3, 100)).unwrap());
}

#[tokio::test]
async fn test_toggle_flips_are_idempotent() {
    let (a, b) = peer_pair(TransportMode::Shared).await;
    for _ in 0..5 {
        a.session.toggle_overlay();
    }
    // Odd number of flips: final value is on.
    assert!(a.session.toggle_state().local);
    eventually(WAIT, || b.session.toggle_state().remote).await.unwrap();
}
