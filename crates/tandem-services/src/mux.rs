//! Stream multiplexer — owns the transport channels for every logical
//! stream, chunks and sends outgoing frames, and routes inbound datagrams
//! to the reassembler (or state/control handler) for their stream.
//!
//! Per-datagram problems never stop a receive loop: malformed and stale
//! datagrams are counted and dropped, transient socket errors are retried
//! after a short backoff. Only a non-transient socket error marks the
//! stream `Down`, after which sends fail fast until `reopen`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

use tandem_core::codec::{self, Chunk};
use tandem_core::wire::{ControlDatagram, StateDatagram, MAX_DATAGRAM};
use tandem_core::{StreamEndpoint, StreamId, TandemConfig, TransportMode};

use crate::frame::LatestFrames;
use crate::reassembly::{FrameReassembler, ReassemblyError};
use crate::stats::StatsRegistry;
use crate::toggle::StateSynchronizer;
use crate::transport::{is_transient, SendError, TransportChannel, TransportError};

/// Pause after a transient receive error before reading again.
const RECV_BACKOFF: Duration = Duration::from_millis(10);

/// Whether a stream's endpoint can currently carry traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Up,
    Down,
}

/// Where decoded inbound traffic goes.
#[derive(Clone)]
pub struct InboundRoutes {
    /// Newest completed frame per media stream.
    pub frames: Arc<LatestFrames>,
    /// Received control values.
    pub control: mpsc::Sender<ControlDatagram>,
    /// Remote toggle updates are applied here.
    pub state: Arc<StateSynchronizer>,
}

/// Multiplexer settings taken from the session config.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    pub mode: TransportMode,
    pub max_chunk_size: usize,
    pub frame_timeout: Duration,
    pub socket_buffer_bytes: usize,
}

impl From<&TandemConfig> for MuxConfig {
    fn from(c: &TandemConfig) -> Self {
        Self {
            mode: c.transport.mode,
            max_chunk_size: c.transport.max_chunk_size,
            frame_timeout: c.transport.frame_timeout(),
            socket_buffer_bytes: c.transport.socket_buffer_bytes,
        }
    }
}

pub struct StreamMultiplexer {
    config: MuxConfig,
    endpoints: HashMap<StreamId, StreamEndpoint>,
    /// In shared mode every stream maps to the same channel.
    channels: DashMap<StreamId, Arc<TransportChannel>>,
    status: DashMap<StreamId, StreamStatus>,
    next_frame_id: HashMap<StreamId, AtomicU32>,
    stats: StatsRegistry,
}

impl StreamMultiplexer {
    /// Bind every stream's endpoint. Any bind failure aborts setup.
    pub fn bind(config: &TandemConfig, stats: StatsRegistry) -> Result<Self, TransportError> {
        for id in StreamId::ALL {
            stats.stream(id);
        }
        let endpoints: HashMap<_, _> = StreamId::ALL
            .iter()
            .map(|&id| (id, config.endpoint(id)))
            .collect();
        let mux = Self {
            config: MuxConfig::from(config),
            endpoints,
            channels: DashMap::new(),
            status: DashMap::new(),
            next_frame_id: StreamId::MEDIA
                .iter()
                .map(|&id| (id, AtomicU32::new(0)))
                .collect(),
            stats,
        };

        match mux.config.mode {
            TransportMode::Dedicated => {
                for id in StreamId::ALL {
                    mux.bind_stream(id)?;
                }
            }
            TransportMode::Shared => {
                mux.bind_shared()?;
            }
        }

        tracing::info!(
            mode = ?mux.config.mode,
            max_chunk_size = mux.config.max_chunk_size,
            "stream multiplexer bound"
        );
        Ok(mux)
    }

    fn bind_stream(&self, id: StreamId) -> Result<(), TransportError> {
        let endpoint = self.endpoints[&id];
        let channel = Arc::new(TransportChannel::bind(
            endpoint,
            self.config.socket_buffer_bytes,
        )?);
        self.channels.insert(id, channel);
        self.status.insert(id, StreamStatus::Up);
        Ok(())
    }

    fn bind_shared(&self) -> Result<(), TransportError> {
        // All endpoints share the base ports in shared mode.
        let endpoint = self.endpoints[&StreamId::Front];
        let channel = Arc::new(TransportChannel::bind(
            endpoint,
            self.config.socket_buffer_bytes,
        )?);
        for id in StreamId::ALL {
            self.channels.insert(id, channel.clone());
            self.status.insert(id, StreamStatus::Up);
        }
        Ok(())
    }

    pub fn mode(&self) -> TransportMode {
        self.config.mode
    }

    fn tagged(&self) -> bool {
        self.config.mode == TransportMode::Shared
    }

    pub fn stats(&self) -> &StatsRegistry {
        &self.stats
    }

    /// Streams that own a receive loop: one per socket.
    pub fn receive_streams(&self) -> Vec<StreamId> {
        match self.config.mode {
            TransportMode::Dedicated => StreamId::ALL.to_vec(),
            TransportMode::Shared => vec![StreamId::Front],
        }
    }

    pub fn status(&self, id: StreamId) -> StreamStatus {
        self.status.get(&id).map_or(StreamStatus::Down, |s| *s)
    }

    /// Bound local address of a stream's socket.
    pub fn local_addr(&self, id: StreamId) -> Option<std::net::SocketAddr> {
        self.channels.get(&id).map(|c| c.local_addr())
    }

    /// Mark a stream down. In shared mode this takes every stream down.
    pub fn mark_down(&self, id: StreamId) {
        let affected: Vec<StreamId> = match self.config.mode {
            TransportMode::Dedicated => vec![id],
            TransportMode::Shared => StreamId::ALL.to_vec(),
        };
        for s in affected {
            self.status.insert(s, StreamStatus::Down);
            if let Some((_, channel)) = self.channels.remove(&s) {
                channel.close();
            }
        }
        tracing::warn!(stream = %id, "stream marked down");
    }

    /// Rebind a stream. Any receive loop still reading the old socket is
    /// told to stop; the caller starts a new one for the stream's socket.
    pub fn reopen(&self, id: StreamId) -> Result<(), TransportError> {
        match self.config.mode {
            TransportMode::Dedicated => {
                if let Some((_, old)) = self.channels.remove(&id) {
                    old.close();
                }
                self.bind_stream(id)?;
            }
            TransportMode::Shared => {
                for s in StreamId::ALL {
                    if let Some((_, old)) = self.channels.remove(&s) {
                        old.close();
                    }
                }
                self.bind_shared()?;
            }
        }
        tracing::info!(stream = %id, "stream reopened");
        Ok(())
    }

    fn channel(&self, id: StreamId) -> Result<Arc<TransportChannel>, SendError> {
        if self.status(id) == StreamStatus::Down {
            return Err(SendError::StreamUnavailable(id));
        }
        self.channels
            .get(&id)
            .map(|c| c.clone())
            .ok_or(SendError::StreamUnavailable(id))
    }

    /// Chunk a media payload and transmit every chunk. Returns the frame id
    /// assigned to the payload.
    pub async fn send(&self, id: StreamId, payload: Bytes) -> Result<u32, SendError> {
        let channel = self.channel(id)?;
        let counter = self
            .next_frame_id
            .get(&id)
            .ok_or(tandem_core::WireError::NotChunked(id))?;
        let frame_id = counter.fetch_add(1, Ordering::Relaxed);
        let chunks = codec::split(id, frame_id, &payload, self.config.max_chunk_size)?;

        let stats = self.stats.stream(id);
        let tagged = self.tagged();
        let count = chunks.len();
        for chunk in chunks {
            self.transmit(&channel, id, &chunk.encode(tagged)).await?;
        }
        stats.record_chunks_sent(count);
        stats.record_frame_sent();
        tracing::trace!(stream = %id, frame_id, bytes = payload.len(), chunks = count, "frame sent");
        Ok(frame_id)
    }

    /// Send a single unchunked datagram (state or control).
    pub async fn send_datagram(&self, id: StreamId, body: &[u8]) -> Result<(), SendError> {
        let channel = self.channel(id)?;
        let datagram = if self.tagged() {
            codec::tag(id, body)
        } else {
            Bytes::copy_from_slice(body)
        };
        self.transmit(&channel, id, &datagram).await
    }

    async fn transmit(
        &self,
        channel: &TransportChannel,
        id: StreamId,
        datagram: &[u8],
    ) -> Result<(), SendError> {
        match channel.send(datagram).await {
            Ok(_) => Ok(()),
            Err(e) if is_transient(&e) => {
                self.stats.stream(id).record_send_failure();
                Err(SendError::Io {
                    stream: id,
                    source: e,
                })
            }
            Err(e) => {
                tracing::warn!(stream = %id, error = %e, "send failed, taking stream down");
                self.stats.stream(id).record_send_failure();
                self.mark_down(id);
                Err(SendError::StreamUnavailable(id))
            }
        }
    }

    /// Read datagrams from `id`'s socket until shutdown or a non-transient
    /// socket error, routing each to its stream's handler.
    pub async fn receive_loop(
        self: Arc<Self>,
        id: StreamId,
        routes: InboundRoutes,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), TransportError> {
        let channel = self
            .channel(id)
            .map_err(|_| TransportError::StreamUnavailable(id))?;

        let served: Vec<StreamId> = match self.config.mode {
            TransportMode::Dedicated => vec![id],
            TransportMode::Shared => StreamId::ALL.to_vec(),
        };
        let mut reassemblers: HashMap<StreamId, FrameReassembler> = served
            .iter()
            .filter(|s| s.is_chunked())
            .map(|&s| {
                let r = FrameReassembler::with_stats(
                    s,
                    self.config.frame_timeout,
                    self.stats.stream(s),
                );
                (s, r)
            })
            .collect();

        let mut buf = vec![0u8; MAX_DATAGRAM + 1];
        let mut purge = tokio::time::interval((self.config.frame_timeout / 2).max(Duration::from_millis(1)));
        purge.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(stream = %id, local = %channel.local_addr(), "receive loop starting");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(stream = %id, "receive loop shutting down");
                    return Ok(());
                }

                _ = channel.closed() => {
                    tracing::info!(stream = %id, "channel closed, receive loop exiting");
                    return Ok(());
                }

                _ = purge.tick(), if !reassemblers.is_empty() => {
                    let now = Instant::now();
                    for r in reassemblers.values_mut() {
                        r.purge_expired(now);
                    }
                }

                received = channel.recv(&mut buf) => match received {
                    Ok((len, _from)) => {
                        self.handle_datagram(id, &buf[..len], &mut reassemblers, &routes);
                    }
                    Err(e) if is_transient(&e) => {
                        tracing::debug!(stream = %id, error = %e, "transient receive error, retrying");
                        tokio::time::sleep(RECV_BACKOFF).await;
                    }
                    Err(e) => {
                        tracing::warn!(stream = %id, error = %e, "receive failed, taking stream down");
                        self.mark_down(id);
                        return Err(TransportError::Io { stream: id, source: e });
                    }
                },
            }
        }
    }

    fn handle_datagram(
        &self,
        socket_stream: StreamId,
        datagram: &[u8],
        reassemblers: &mut HashMap<StreamId, FrameReassembler>,
        routes: &InboundRoutes,
    ) {
        let (stream, body) = if self.tagged() {
            match codec::untag(datagram) {
                Ok(parts) => parts,
                Err(e) => {
                    self.stats.stream(socket_stream).record_malformed();
                    tracing::trace!(error = %e, "untaggable datagram, discarding");
                    return;
                }
            }
        } else {
            (socket_stream, datagram)
        };

        let stats = self.stats.stream(stream);
        stats.record_datagram();

        match stream {
            StreamId::State => match StateDatagram::decode(body) {
                Ok(update) => routes.state.apply_remote(update, Instant::now()),
                Err(e) => {
                    stats.record_malformed();
                    tracing::debug!(error = %e, "malformed state datagram, discarding");
                }
            },
            StreamId::Control => match ControlDatagram::decode(body) {
                Ok(control) => {
                    if routes.control.try_send(control).is_err() {
                        tracing::debug!("control consumer busy, dropping values");
                    }
                }
                Err(e) => {
                    stats.record_malformed();
                    tracing::debug!(error = %e, "malformed control datagram, discarding");
                }
            },
            media => {
                let chunk = match Chunk::decode(media, body) {
                    Ok(c) => c,
                    Err(e) => {
                        stats.record_malformed();
                        tracing::trace!(stream = %media, error = %e, "malformed chunk, discarding");
                        return;
                    }
                };
                let Some(reassembler) = reassemblers.get_mut(&media) else {
                    return;
                };
                let now = Instant::now();
                reassembler.purge_expired(now);
                match reassembler.ingest(chunk, now) {
                    Ok(Some(frame)) => {
                        routes.frames.publish(frame);
                    }
                    Ok(None) => {}
                    Err(ReassemblyError::StaleChunk { frame_id, newest }) => {
                        tracing::trace!(stream = %media, frame_id, newest, "stale chunk, discarding");
                    }
                    Err(e) => {
                        stats.record_malformed();
                        tracing::debug!(stream = %media, error = %e, "inconsistent chunk, discarding");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    /// Config whose sockets bind ephemeral ports and point at `remote_port`.
    fn loopback_config(mode: TransportMode, remote_port: u16) -> TandemConfig {
        let mut config = TandemConfig::default();
        config.peer.remote_address = IpAddr::V4(Ipv4Addr::LOCALHOST);
        config.peer.local_port = 0;
        config.peer.remote_port = remote_port;
        config.transport.mode = mode;
        config
    }

    fn routes() -> (InboundRoutes, mpsc::Receiver<ControlDatagram>) {
        let frames = Arc::new(LatestFrames::new());
        let (control, control_rx) = mpsc::channel(16);
        let state = Arc::new(StateSynchronizer::new(Duration::from_millis(200)));
        (InboundRoutes { frames, control, state }, control_rx)
    }

    async fn next_frame(routes: &InboundRoutes, stream: StreamId) -> crate::frame::Frame {
        let mut rx = routes.frames.subscribe(stream).unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(Option::is_some))
            .await
            .expect("frame should arrive")
            .unwrap()
            .clone();
        frame.unwrap()
    }

    #[tokio::test]
    async fn shared_mode_round_trips_a_frame() {
        let rx_mux = Arc::new(
            StreamMultiplexer::bind(&loopback_config(TransportMode::Shared, 9), StatsRegistry::new())
                .unwrap(),
        );
        let rx_port = rx_mux.local_addr(StreamId::Front).unwrap().port();
        let tx_mux = StreamMultiplexer::bind(
            &loopback_config(TransportMode::Shared, rx_port),
            StatsRegistry::new(),
        )
        .unwrap();

        let (routes, _control) = routes();
        let (shutdown_tx, _) = broadcast::channel(1);
        let task = tokio::spawn(rx_mux.clone().receive_loop(
            StreamId::Front,
            routes.clone(),
            shutdown_tx.subscribe(),
        ));

        let payload = Bytes::from(vec![7u8; 4000]);
        let frame_id = tx_mux.send(StreamId::Back, payload.clone()).await.unwrap();
        assert_eq!(frame_id, 0);

        let frame = next_frame(&routes, StreamId::Back).await;
        assert_eq!(frame.stream_id, StreamId::Back);
        assert_eq!(frame.payload, payload);
        assert_eq!(tx_mux.stats().snapshot()[&StreamId::Back].chunks_sent, 3);

        shutdown_tx.send(()).unwrap();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn frame_ids_increase_per_stream() {
        let mux = StreamMultiplexer::bind(
            &loopback_config(TransportMode::Shared, 9),
            StatsRegistry::new(),
        )
        .unwrap();
        let a = mux.send(StreamId::Front, Bytes::from_static(b"a")).await.unwrap();
        let b = mux.send(StreamId::Front, Bytes::from_static(b"b")).await.unwrap();
        let c = mux.send(StreamId::Audio, Bytes::from_static(b"c")).await.unwrap();
        assert_eq!((a, b, c), (0, 1, 0));
    }

    #[tokio::test]
    async fn down_stream_fails_fast_until_reopened() {
        let mux = StreamMultiplexer::bind(
            &loopback_config(TransportMode::Shared, 9),
            StatsRegistry::new(),
        )
        .unwrap();
        mux.mark_down(StreamId::Front);
        assert_eq!(mux.status(StreamId::Audio), StreamStatus::Down);
        assert!(matches!(
            mux.send(StreamId::Front, Bytes::from_static(b"x")).await,
            Err(SendError::StreamUnavailable(StreamId::Front))
        ));

        mux.reopen(StreamId::Front).unwrap();
        assert_eq!(mux.status(StreamId::Front), StreamStatus::Up);
        assert!(mux.send(StreamId::Front, Bytes::from_static(b"x")).await.is_ok());
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected_before_sending() {
        let mut config = loopback_config(TransportMode::Shared, 9);
        config.transport.max_chunk_size = 1;
        let mux = StreamMultiplexer::bind(&config, StatsRegistry::new()).unwrap();
        let err = mux
            .send(StreamId::Front, Bytes::from(vec![0u8; 70_000]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SendError::Wire(tandem_core::WireError::PayloadTooLarge { .. })
        ));
        assert!(mux.stats().snapshot().get(&StreamId::Front).map_or(true, |s| s.chunks_sent == 0));
    }

    #[tokio::test]
    async fn garbage_is_counted_and_loop_survives() {
        let rx_mux = Arc::new(
            StreamMultiplexer::bind(&loopback_config(TransportMode::Shared, 9), StatsRegistry::new())
                .unwrap(),
        );
        let rx_port = rx_mux.local_addr(StreamId::Front).unwrap().port();
        let tx_mux = StreamMultiplexer::bind(
            &loopback_config(TransportMode::Shared, rx_port),
            StatsRegistry::new(),
        )
        .unwrap();

        let (routes, mut control) = routes();
        let state = routes.state.clone();
        let (shutdown_tx, _) = broadcast::channel(1);
        tokio::spawn(rx_mux.clone().receive_loop(
            StreamId::Front,
            routes.clone(),
            shutdown_tx.subscribe(),
        ));

        // Truncated chunk header, then a bad state datagram.
        tx_mux.send_datagram(StreamId::Front, &[0, 0]).await.unwrap();
        tx_mux.send_datagram(StreamId::State, &[9, 9, 9]).await.unwrap();
        // Then valid traffic on every kind of stream.
        tx_mux
            .send_datagram(StreamId::State, &StateDatagram { overlay: true }.encode())
            .await
            .unwrap();
        tx_mux
            .send_datagram(
                StreamId::Control,
                &ControlDatagram::new(vec![0.5]).unwrap().encode(),
            )
            .await
            .unwrap();
        tx_mux.send(StreamId::Audio, Bytes::from_static(b"pcm")).await.unwrap();

        let frame = next_frame(&routes, StreamId::Audio).await;
        assert_eq!(frame.stream_id, StreamId::Audio);
        let values = tokio::time::timeout(Duration::from_secs(2), control.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(values.values, vec![0.5]);
        assert!(state.snapshot().remote);

        let snap = rx_mux.stats().snapshot();
        assert_eq!(snap[&StreamId::Front].malformed, 1);
        assert_eq!(snap[&StreamId::State].malformed, 1);
        shutdown_tx.send(()).unwrap();
    }
}
