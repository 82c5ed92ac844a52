//! Synthetic capture — stand-in for camera and microphone.
//!
//! Produces deterministic test-pattern payloads so two daemons can be run
//! against each other without any devices. Byte `i` of frame `n` on stream
//! `s` is `(n + i + s) mod 256`, which makes a corrupted reassembly easy to
//! spot in a hex dump.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast;

use tandem_core::config::CaptureConfig;
use tandem_core::StreamId;
use tandem_services::{PeerSession, SendError};

pub fn pattern(stream: StreamId, seq: u32, len: usize) -> Bytes {
    let base = seq.wrapping_add(u32::from(u8::from(stream)));
    (0..len)
        .map(|i| (base.wrapping_add(i as u32) & 0xff) as u8)
        .collect::<Vec<u8>>()
        .into()
}

pub async fn run(
    session: Arc<PeerSession>,
    config: CaptureConfig,
    mut shutdown: broadcast::Receiver<()>,
) {
    if config.synthetic_fps == 0 {
        tracing::info!("synthetic capture disabled");
        let _ = shutdown.recv().await;
        return;
    }
    let period = Duration::from_secs(1) / config.synthetic_fps;
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    tracing::info!(
        fps = config.synthetic_fps,
        frame_bytes = config.synthetic_frame_bytes,
        audio_bytes = config.synthetic_audio_bytes,
        "synthetic capture running"
    );

    let mut seq: u32 = 0;
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = tick.tick() => {}
        }

        let front = pattern(StreamId::Front, seq, config.synthetic_frame_bytes);
        report(StreamId::Front, session.submit_local_front(front));
        let back = pattern(StreamId::Back, seq, config.synthetic_frame_bytes);
        report(StreamId::Back, session.submit(StreamId::Back, back));
        let audio = pattern(StreamId::Audio, seq, config.synthetic_audio_bytes);
        report(StreamId::Audio, session.submit(StreamId::Audio, audio));

        seq = seq.wrapping_add(1);
    }
}

fn report(stream: StreamId, result: Result<bool, SendError>) {
    if let Err(e) = result {
        tracing::debug!(%stream, error = %e, "capture frame not queued");
    }
}
