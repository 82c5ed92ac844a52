//! Tandem integration test harness.
//!
//! Every test runs two in-process peers talking over loopback UDP, so no
//! privileges or external setup are needed:
//!
//!   cargo test --test integration
//!
//! Port blocks are reserved with trial binds, so tests can run in parallel.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use bytes::Bytes;

use tandem_core::{StreamId, TandemConfig, TransportMode};
use tandem_services::{Frame, MediaSink, PeerSession, RenderDecision, RenderMode};

mod fault;
mod overlay;
mod state;
mod streaming;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Ports per peer: one per stream in dedicated mode.
pub const PORTS_PER_PEER: u16 = 5;

/// Find `count` consecutive free UDP ports on loopback.
pub fn free_port_block(count: u16) -> u16 {
    for _ in 0..100 {
        let Ok(first) = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)) else {
            continue;
        };
        let Ok(addr) = first.local_addr() else {
            continue;
        };
        let base = addr.port();
        if base.checked_add(count).is_none() {
            continue;
        }
        let held: Vec<_> = (1..count)
            .map_while(|i| UdpSocket::bind((Ipv4Addr::UNSPECIFIED, base + i)).ok())
            .collect();
        if held.len() == usize::from(count - 1) {
            return base;
        }
    }
    panic!("no free block of {count} UDP ports");
}

pub fn peer_config(mode: TransportMode, local_port: u16, remote_port: u16) -> TandemConfig {
    let mut config = TandemConfig::default();
    config.peer.remote_address = IpAddr::V4(Ipv4Addr::LOCALHOST);
    config.peer.local_port = local_port;
    config.peer.remote_port = remote_port;
    config.transport.mode = mode;
    config.api.enabled = false;
    config
}

/// Configs for two peers pointed at each other.
pub fn config_pair(mode: TransportMode) -> (TandemConfig, TandemConfig) {
    let base = free_port_block(2 * PORTS_PER_PEER);
    let a = base;
    let b = base + PORTS_PER_PEER;
    (peer_config(mode, a, b), peer_config(mode, b, a))
}

/// A running peer plus everything its sink has seen.
pub struct Peer {
    pub session: PeerSession,
    pub sink: Arc<RecordingSink>,
}

impl Peer {
    pub async fn start(config: TandemConfig) -> Result<Self> {
        Self::start_with_sink(config, RecordingSink::default()).await
    }

    pub async fn start_with_sink(config: TandemConfig, sink: RecordingSink) -> Result<Self> {
        let sink = Arc::new(sink);
        let session = PeerSession::start(config, sink.clone()).await?;
        Ok(Self { session, sink })
    }
}

pub async fn peer_pair(mode: TransportMode) -> (Peer, Peer) {
    let (ca, cb) = config_pair(mode);
    let a = Peer::start(ca).await.expect("peer A should start");
    let b = Peer::start(cb).await.expect("peer B should start");
    (a, b)
}

/// Byte `i` is `(seed + i) mod 256`.
pub fn pattern(seed: u8, len: usize) -> Bytes {
    (0..len)
        .map(|i| seed.wrapping_add(i as u8))
        .collect::<Vec<u8>>()
        .into()
}

/// Poll `cond` every 10ms until it holds or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, mut cond: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn within<T>(timeout: Duration, fut: impl Future<Output = T>) -> Result<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| anyhow::anyhow!("timed out after {timeout:?}"))
}

// ── Recording sink ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Rendered {
    pub mode: RenderMode,
    pub primary: Frame,
    pub secondary: Option<Frame>,
}

#[derive(Debug, Default)]
pub struct RecordingSink {
    renders: Mutex<Vec<Rendered>>,
    audio: Mutex<Vec<Frame>>,
    control: Mutex<Vec<Vec<f32>>>,
    /// Time each `render` call blocks for.
    render_delay: Duration,
}

impl RecordingSink {
    /// A sink whose renderer takes `delay` per frame.
    pub fn slow(delay: Duration) -> Self {
        Self {
            render_delay: delay,
            ..Self::default()
        }
    }

    pub fn renders(&self) -> Vec<Rendered> {
        self.renders.lock().unwrap().clone()
    }

    pub fn audio(&self) -> Vec<Frame> {
        self.audio.lock().unwrap().clone()
    }

    pub fn control(&self) -> Vec<Vec<f32>> {
        self.control.lock().unwrap().clone()
    }

    /// Remote front payloads rendered so far, in render order.
    pub fn front_payloads(&self) -> Vec<Bytes> {
        self.renders()
            .into_iter()
            .filter(|r| r.mode == RenderMode::SoloFront)
            .map(|r| r.primary.payload)
            .collect()
    }
}

impl MediaSink for RecordingSink {
    fn render(&self, decision: &RenderDecision) {
        if !self.render_delay.is_zero() {
            std::thread::sleep(self.render_delay);
        }
        self.renders.lock().unwrap().push(Rendered {
            mode: decision.mode,
            primary: decision.primary.clone(),
            secondary: decision.secondary.clone(),
        });
    }

    fn play(&self, frame: &Frame) {
        self.audio.lock().unwrap().push(frame.clone());
    }

    fn control(&self, values: &[f32]) {
        self.control.lock().unwrap().push(values.to_vec());
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_sessions_bind_all_dedicated_ports() {
    let (a, b) = peer_pair(TransportMode::Dedicated).await;
    for (peer, other) in [(&a, &b), (&b, &a)] {
        let front = peer.session.local_addr(StreamId::Front).unwrap().port();
        for id in StreamId::ALL {
            let port = peer.session.local_addr(id).unwrap().port();
            assert_eq!(port, front + id.port_offset());
        }
        assert_ne!(front, other.session.local_addr(StreamId::Front).unwrap().port());
    }
}

#[tokio::test]
async fn test_port_conflict_aborts_startup() {
    let (ca, _) = config_pair(TransportMode::Dedicated);
    let _a = Peer::start(ca.clone()).await.unwrap();
    let err = Peer::start(ca).await.err().expect("second bind must fail");
    assert!(format!("{err:#}").contains("failed to bind"));
}
