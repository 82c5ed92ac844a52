//! Transport channel — one UDP socket and the peer address it talks to.
//!
//! In dedicated mode every logical stream gets its own channel; in shared
//! mode all streams use one channel and tag their datagrams.

use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;

use tandem_core::{StreamEndpoint, StreamId, WireError};

/// Errors from the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("stream {0} is unavailable")]
    StreamUnavailable(StreamId),

    #[error("socket error on stream {stream}: {source}")]
    Io {
        stream: StreamId,
        #[source]
        source: io::Error,
    },
}

/// Errors surfaced to a caller sending on a stream.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// Payload could not be chunked (too large, or wrong stream kind).
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The endpoint is down; the caller decides whether to reopen.
    #[error("stream {0} is unavailable")]
    StreamUnavailable(StreamId),

    /// A transient socket error; the stream stays up.
    #[error("send failed on stream {stream}: {source}")]
    Io {
        stream: StreamId,
        #[source]
        source: io::Error,
    },
}

/// A bound UDP socket plus its fixed remote address.
#[derive(Debug)]
pub struct TransportChannel {
    endpoint: StreamEndpoint,
    socket: UdpSocket,
    local_addr: SocketAddr,
    closed: watch::Sender<bool>,
}

impl TransportChannel {
    /// Bind the endpoint's local port and size its kernel buffers.
    /// `buffer_bytes` of 0 keeps the OS defaults.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(endpoint: StreamEndpoint, buffer_bytes: usize) -> Result<Self, TransportError> {
        let addr = endpoint.local_addr();
        let socket = make_socket(addr, buffer_bytes)
            .and_then(|s| UdpSocket::from_std(s.into()))
            .map_err(|source| TransportError::Bind { addr, source })?;
        let local_addr = socket
            .local_addr()
            .map_err(|source| TransportError::Bind { addr, source })?;
        tracing::debug!(
            stream = %endpoint.stream_id,
            local = %local_addr,
            remote = %endpoint.remote_addr(),
            "transport channel bound"
        );
        Ok(Self {
            endpoint,
            socket,
            local_addr,
            closed: watch::Sender::new(false),
        })
    }

    /// Actual bound address (resolves an OS-assigned port).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.endpoint.remote_addr()
    }

    pub async fn send(&self, datagram: &[u8]) -> io::Result<usize> {
        self.socket.send_to(datagram, self.remote_addr()).await
    }

    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    /// Tell the task reading this channel to let go of the socket.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once `close` has been called.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// Create a non-blocking UDP socket bound to `addr`.
fn make_socket(addr: SocketAddr, buffer_bytes: usize) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if buffer_bytes > 0 {
        socket.set_send_buffer_size(buffer_bytes)?;
        socket.set_recv_buffer_size(buffer_bytes)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket)
}

/// Errors that leave the socket usable. Connection refused/reset on UDP
/// only reflect an ICMP error from an earlier send to a closed peer port.
pub fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
    )
}
