//! Toggle self-healing across lost updates and late peers.

use crate::*;

#[tokio::test]
async fn test_late_peer_learns_toggle_from_resend() {
    let (ca, cb) = config_pair(TransportMode::Dedicated);
    let resend = ca.state.resend_interval();
    let a = Peer::start(ca).await.unwrap();

    // B is not running yet; the change notification goes nowhere.
    a.session.set_overlay(true);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let b = Peer::start(cb).await.unwrap();
    // One resend interval plus the poll step and loopback latency.
    eventually(resend + Duration::from_millis(100), || {
        b.session.toggle_state().remote
    })
        .await
        .expect("resend should heal the lost update");
    assert!(b.session.toggle_state().last_remote_update.is_some());
}

#[tokio::test]
async fn test_remote_toggle_tracks_last_value() {
    let (a, b) = peer_pair(TransportMode::Dedicated).await;
    a.session.set_overlay(true);
    eventually(Duration::from_secs(2), || b.session.toggle_state().remote)
        .await
        .unwrap();
    a.session.set_overlay(false);
    eventually(Duration::from_secs(2), || !b.session.toggle_state().remote)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_remote_update_timestamp_keeps_refreshing() {
    let (_a, b) = peer_pair(TransportMode::Shared).await;
    eventually(Duration::from_secs(2), || {
        b.session.toggle_state().last_remote_update.is_some()
    })
    .await
    .unwrap();
    let first = b.session.toggle_state().last_remote_update.unwrap();
    eventually(Duration::from_secs(2), || {
        b.session
            .toggle_state()
            .last_remote_update
            .is_some_and(|t| t > first)
    })
    .await
    .expect("periodic resend should refresh the timestamp");
}
