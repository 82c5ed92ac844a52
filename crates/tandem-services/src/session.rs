//! Peer session — the running set of tasks for one peer.
//!
//! Task layout:
//!   - one receive loop per socket (per stream in dedicated mode, one in
//!     shared mode), feeding completed frames and control values onward
//!   - one send task per media stream, draining that stream's outbox
//!   - the state synchronizer's send loop
//!   - the render task, owning the `OverlaySession` and the sink
//!
//! Everything stops when the shutdown broadcast fires, either through
//! `shutdown()` or when the session is dropped.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use tandem_core::codec::chunk_count_for;
use tandem_core::wire::ControlDatagram;
use tandem_core::{StreamId, TandemConfig, TransportMode, WireError};

use crate::frame::{Frame, LatestFrames};
use crate::mux::{InboundRoutes, StreamMultiplexer, StreamStatus};
use crate::outbox::Outbox;
use crate::overlay::{OverlaySession, RenderMode};
use crate::sink::MediaSink;
use crate::stats::{StatsRegistry, StatsSnapshot};
use crate::toggle::{StateSynchronizer, ToggleState};
use crate::transport::SendError;

const CONTROL_QUEUE_DEPTH: usize = 16;

pub struct PeerSession {
    mux: Arc<StreamMultiplexer>,
    sync: Arc<StateSynchronizer>,
    outboxes: HashMap<StreamId, Outbox>,
    routes: InboundRoutes,
    max_chunk_size: usize,
    local_front: watch::Sender<Option<Frame>>,
    local_seq: AtomicU32,
    render_mode: watch::Receiver<Option<RenderMode>>,
    receivers: Mutex<HashMap<StreamId, JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl PeerSession {
    /// Bind every endpoint and spawn the session's tasks. Bind failures
    /// abort startup.
    pub async fn start(config: TandemConfig, sink: Arc<dyn MediaSink>) -> Result<Self> {
        config.validate().context("invalid session config")?;

        let stats = StatsRegistry::new();
        let mux = Arc::new(
            StreamMultiplexer::bind(&config, stats).context("failed to bind stream endpoints")?,
        );
        let sync = Arc::new(StateSynchronizer::new(config.state.resend_interval()));
        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        let frames = Arc::new(LatestFrames::new());
        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE_DEPTH);
        let routes = InboundRoutes {
            frames: frames.clone(),
            control: control_tx,
            state: sync.clone(),
        };

        // ── Receive loops ───────────────────────────────────────────────────
        let receivers: HashMap<_, _> = mux
            .receive_streams()
            .into_iter()
            .map(|id| {
                let handle = spawn_receiver(mux.clone(), id, routes.clone(), shutdown_tx.subscribe());
                (id, handle)
            })
            .collect();

        // ── Send tasks ──────────────────────────────────────────────────────
        let mut outboxes = HashMap::new();
        for id in StreamId::MEDIA {
            let outbox = Outbox::new(config.transport.outbox_depth);
            tokio::spawn(send_task(
                mux.clone(),
                id,
                outbox.clone(),
                shutdown_tx.subscribe(),
            ));
            outboxes.insert(id, outbox);
        }

        tokio::spawn(sync.clone().send_loop(mux.clone(), shutdown_tx.subscribe()));

        // ── Render task ─────────────────────────────────────────────────────
        let (local_front, local_front_rx) = watch::channel(None);
        let (mode_tx, render_mode) = watch::channel(None);
        tokio::spawn(
            RenderTask {
                overlay: OverlaySession::new(config.overlay.alpha_weight),
                sync: sync.clone(),
                front: frames.subscribe(StreamId::Front).context("no front frame slot")?,
                back: frames.subscribe(StreamId::Back).context("no back frame slot")?,
                audio: frames.subscribe(StreamId::Audio).context("no audio frame slot")?,
                control: control_rx,
                local_front: local_front_rx,
                sink,
                mode: mode_tx,
                shutdown: shutdown_tx.subscribe(),
            }
            .run(),
        );

        tracing::info!(
            mode = ?mux.mode(),
            remote = %config.peer.remote_address,
            remote_port = config.peer.remote_port,
            local_port = config.peer.local_port,
            "peer session started"
        );

        Ok(Self {
            mux,
            sync,
            outboxes,
            routes,
            max_chunk_size: config.transport.max_chunk_size,
            local_front,
            local_seq: AtomicU32::new(0),
            render_mode,
            receivers: Mutex::new(receivers),
            shutdown_tx,
        })
    }

    // ── Capture side ────────────────────────────────────────────────────────

    /// Queue an encoded payload for transmission on a media stream.
    ///
    /// Returns `Ok(false)` when the stream is gated by the overlay state and
    /// the payload was discarded. A full outbox drops its oldest entry.
    pub fn submit(&self, stream: StreamId, payload: Bytes) -> Result<bool, SendError> {
        let outbox = self
            .outboxes
            .get(&stream)
            .ok_or(WireError::NotChunked(stream))?;
        if self.mux.status(stream) == StreamStatus::Down {
            return Err(SendError::StreamUnavailable(stream));
        }
        let chunks = chunk_count_for(payload.len(), self.max_chunk_size);
        if chunks > usize::from(u16::MAX) {
            return Err(WireError::PayloadTooLarge {
                len: payload.len(),
                chunks,
            }
            .into());
        }

        let stats = self.mux.stats().stream(stream);
        if !OverlaySession::should_send(stream, &self.sync.snapshot()) {
            stats.record_gated();
            return Ok(false);
        }
        if outbox.push(payload) {
            stats.record_outbox_drop();
        }
        Ok(true)
    }

    /// Submit a locally captured front frame and hand it to the overlay as
    /// the local primary.
    pub fn submit_local_front(&self, payload: Bytes) -> Result<bool, SendError> {
        let seq = self.local_seq.fetch_add(1, Ordering::Relaxed);
        self.local_front
            .send_replace(Some(Frame::new(StreamId::Front, seq, payload.clone())));
        self.submit(StreamId::Front, payload)
    }

    // ── Command surface ─────────────────────────────────────────────────────

    pub fn set_overlay(&self, active: bool) -> bool {
        let changed = self.sync.set_local(active);
        if !active {
            self.discard_back();
        }
        changed
    }

    pub fn toggle_overlay(&self) -> bool {
        let active = self.sync.toggle_local();
        if !active {
            self.discard_back();
        }
        active
    }

    fn discard_back(&self) {
        if let Some(outbox) = self.outboxes.get(&StreamId::Back) {
            outbox.clear();
        }
    }

    pub async fn send_control(&self, values: Vec<f32>) -> Result<(), SendError> {
        let datagram = ControlDatagram::new(values)?;
        self.mux
            .send_datagram(StreamId::Control, &datagram.encode())
            .await
    }

    // ── Introspection ───────────────────────────────────────────────────────

    pub fn toggle_state(&self) -> ToggleState {
        self.sync.snapshot()
    }

    pub fn render_mode(&self) -> Option<RenderMode> {
        *self.render_mode.borrow()
    }

    /// Wait until the render task reports `mode`.
    pub async fn wait_for_render_mode(&self, mode: RenderMode) -> bool {
        let mut rx = self.render_mode.clone();
        let reached = rx.wait_for(|m| *m == Some(mode)).await.is_ok();
        reached
    }

    pub fn stats(&self) -> BTreeMap<StreamId, StatsSnapshot> {
        self.mux.stats().snapshot()
    }

    pub fn stats_registry(&self) -> &StatsRegistry {
        self.mux.stats()
    }

    pub fn stream_status(&self) -> BTreeMap<StreamId, StreamStatus> {
        StreamId::ALL
            .iter()
            .map(|&id| (id, self.mux.status(id)))
            .collect()
    }

    pub fn transport_mode(&self) -> TransportMode {
        self.mux.mode()
    }

    pub fn local_addr(&self, stream: StreamId) -> Option<SocketAddr> {
        self.mux.local_addr(stream)
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Rebind a stream's socket and restart its receive loop.
    pub async fn reopen(&self, stream: StreamId) -> Result<()> {
        let socket_stream = match self.mux.mode() {
            TransportMode::Dedicated => stream,
            TransportMode::Shared => StreamId::Front,
        };

        // The old loop must release the socket before the port can be rebound.
        self.mux.mark_down(stream);
        let old = self
            .receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&socket_stream);
        if let Some(handle) = old {
            let _ = handle.await;
        }

        self.mux
            .reopen(stream)
            .with_context(|| format!("failed to reopen stream {stream}"))?;
        let handle = spawn_receiver(
            self.mux.clone(),
            socket_stream,
            self.routes.clone(),
            self.shutdown_tx.subscribe(),
        );
        self.receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(socket_stream, handle);
        Ok(())
    }

    /// Receiver that fires when the session is asked to stop.
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Signal every task to stop after its current operation.
    pub fn shutdown(&self) {
        tracing::info!("peer session shutting down");
        let _ = self.shutdown_tx.send(());
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

fn spawn_receiver(
    mux: Arc<StreamMultiplexer>,
    id: StreamId,
    routes: InboundRoutes,
    shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = mux.receive_loop(id, routes, shutdown).await {
            tracing::error!(stream = %id, error = %e, "receive loop stopped");
        }
    })
}

async fn send_task(
    mux: Arc<StreamMultiplexer>,
    id: StreamId,
    outbox: Outbox,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let payload = tokio::select! {
            _ = shutdown.recv() => return,
            p = outbox.pop() => p,
        };
        match mux.send(id, payload).await {
            Ok(_) => {}
            Err(SendError::StreamUnavailable(_)) => {
                tracing::trace!(stream = %id, "stream down, dropping frame");
            }
            Err(SendError::Io { source, .. }) => {
                tracing::debug!(stream = %id, error = %source, "transient send failure");
            }
            Err(e) => tracing::warn!(stream = %id, error = %e, "frame rejected"),
        }
    }
}

// ── Render task ─────────────────────────────────────────────────────────────

struct RenderTask {
    overlay: OverlaySession,
    sync: Arc<StateSynchronizer>,
    /// Newest remote frame per stream; frames overwritten before the
    /// render loop gets to them are skipped.
    front: watch::Receiver<Option<Frame>>,
    back: watch::Receiver<Option<Frame>>,
    audio: watch::Receiver<Option<Frame>>,
    control: mpsc::Receiver<ControlDatagram>,
    local_front: watch::Receiver<Option<Frame>>,
    sink: Arc<dyn MediaSink>,
    mode: watch::Sender<Option<RenderMode>>,
    shutdown: broadcast::Receiver<()>,
}

impl RenderTask {
    async fn run(mut self) {
        let mut toggles = self.sync.subscribe();
        self.overlay.on_toggle(self.sync.snapshot());

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::debug!("render task shutting down");
                    return;
                }
                Ok(()) = self.front.changed() => {
                    if let Some(frame) = take_latest(&mut self.front) {
                        self.on_remote_frame(frame);
                    }
                }
                Ok(()) = self.back.changed() => {
                    if let Some(frame) = take_latest(&mut self.back) {
                        self.on_remote_frame(frame);
                    }
                }
                Ok(()) = self.audio.changed() => {
                    if let Some(frame) = take_latest(&mut self.audio) {
                        self.sink.play(&frame);
                    }
                }
                Some(control) = self.control.recv() => {
                    self.sink.control(&control.values);
                }
                changed = toggles.changed() => {
                    if !changed {
                        return;
                    }
                    self.overlay.on_toggle(self.sync.snapshot());
                    self.render();
                }
                Ok(()) = self.local_front.changed() => {
                    if let Some(frame) = take_latest(&mut self.local_front) {
                        self.overlay.on_local_frame(frame);
                        self.render();
                    }
                }
            }
        }
    }

    fn on_remote_frame(&mut self, frame: Frame) {
        if self.overlay.on_frame(frame) {
            self.render();
        }
    }

    fn render(&mut self) {
        if let Some(decision) = self.overlay.evaluate() {
            self.sink.render(&decision);
            self.mode.send_replace(Some(decision.mode));
        }
    }
}

fn take_latest(rx: &mut watch::Receiver<Option<Frame>>) -> Option<Frame> {
    rx.borrow_and_update().clone()
}
