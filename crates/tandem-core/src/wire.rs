//! Tandem wire format — on-wire types for every datagram exchanged between peers.
//!
//! These types ARE the protocol. Every field and every size here is part of
//! the wire format; both peers must agree on it byte for byte.
//!
//! Integers are big-endian. The chunk header is a zerocopy struct built from
//! unaligned big-endian fields, so parsing is a bounds check plus a copy.
//! There is no unsafe code in this module.

use std::fmt;

use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

// ── Stream identifiers ───────────────────────────────────────────────────────

/// Logical stream carried between the two peers.
///
/// Each stream has its own reassembler and, in dedicated mode, its own
/// UDP port (`base + port_offset`). In shared mode the discriminant is
/// written as a one-byte tag in front of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum StreamId {
    /// Front camera video.
    Front = 0x01,
    /// Back camera video. Only transmitted while the overlay is active.
    Back = 0x02,
    /// Microphone audio buffers.
    Audio = 0x03,
    /// Overlay toggle replication. Never chunked.
    State = 0x04,
    /// Short lists of control values. Never chunked.
    Control = 0x05,
}

impl StreamId {
    /// All streams, in port-offset order.
    pub const ALL: [StreamId; 5] = [
        StreamId::Front,
        StreamId::Back,
        StreamId::Audio,
        StreamId::State,
        StreamId::Control,
    ];

    /// Streams whose payloads go through the chunk codec and a reassembler.
    pub const MEDIA: [StreamId; 3] = [StreamId::Front, StreamId::Back, StreamId::Audio];

    /// Offset from the configured base port in dedicated mode.
    pub fn port_offset(self) -> u16 {
        u16::from(self as u8) - 1
    }

    /// Whether payloads on this stream are split into chunks.
    pub fn is_chunked(self) -> bool {
        matches!(self, StreamId::Front | StreamId::Back | StreamId::Audio)
    }

    pub fn name(self) -> &'static str {
        match self {
            StreamId::Front => "front",
            StreamId::Back => "back",
            StreamId::Audio => "audio",
            StreamId::State => "state",
            StreamId::Control => "control",
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u8> for StreamId {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(StreamId::Front),
            0x02 => Ok(StreamId::Back),
            0x03 => Ok(StreamId::Audio),
            0x04 => Ok(StreamId::State),
            0x05 => Ok(StreamId::Control),
            other => Err(WireError::UnknownStream(other)),
        }
    }
}

impl From<StreamId> for u8 {
    fn from(s: StreamId) -> u8 {
        s as u8
    }
}

// ── Chunk Header ─────────────────────────────────────────────────────────────

/// Header preceding every media chunk.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct ChunkHeader {
    /// Monotonic per-stream frame counter. Wraps at u32::MAX.
    pub frame_id: U32<BigEndian>,

    /// Zero-indexed position of this chunk within the frame.
    pub chunk_index: U16<BigEndian>,

    /// Total number of chunks in the frame. Never zero.
    pub chunk_count: U16<BigEndian>,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(ChunkHeader, [u8; 8]);

impl ChunkHeader {
    pub fn new(frame_id: u32, chunk_index: u16, chunk_count: u16) -> Self {
        Self {
            frame_id: U32::new(frame_id),
            chunk_index: U16::new(chunk_index),
            chunk_count: U16::new(chunk_count),
        }
    }

    /// Parse and validate a header from the front of a datagram.
    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        let header = Self::read_from_prefix(bytes).ok_or(WireError::Truncated {
            len: bytes.len(),
            need: CHUNK_HEADER_LEN,
        })?;
        let count = header.chunk_count.get();
        let index = header.chunk_index.get();
        if count == 0 {
            return Err(WireError::ZeroChunkCount);
        }
        if index >= count {
            return Err(WireError::ChunkIndexOutOfRange { index, count });
        }
        Ok(header)
    }
}

// ── State datagram ───────────────────────────────────────────────────────────

/// Overlay toggle replicated between the peers.
///
/// Wire: `[version: u8][flags: u8]`. Bit 0 of `flags` is the toggle; the
/// remaining bits are reserved and must be zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateDatagram {
    pub overlay: bool,
}

impl StateDatagram {
    pub const LEN: usize = 2;

    pub fn encode(&self) -> [u8; Self::LEN] {
        [STATE_VERSION, u8::from(self.overlay) & STATE_FLAG_OVERLAY]
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let [version, flags] = bytes else {
            return Err(WireError::MalformedState("wrong length"));
        };
        if *version != STATE_VERSION {
            return Err(WireError::UnknownVersion(*version));
        }
        if flags & !STATE_FLAG_OVERLAY != 0 {
            return Err(WireError::ReservedFlagsSet(*flags));
        }
        Ok(Self {
            overlay: flags & STATE_FLAG_OVERLAY != 0,
        })
    }
}

// ── Control datagram ─────────────────────────────────────────────────────────

/// A short list of control values (e.g. gyro readings) sent in one datagram.
///
/// Wire: `[version: u8][count: u8][count × f32 BE]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlDatagram {
    pub values: Vec<f32>,
}

impl ControlDatagram {
    pub fn new(values: Vec<f32>) -> Result<Self, WireError> {
        if values.len() > MAX_CONTROL_VALUES {
            return Err(WireError::MalformedControl("too many values"));
        }
        Ok(Self { values })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.values.len() * 4);
        out.push(CONTROL_VERSION);
        // new() bounds the length to MAX_CONTROL_VALUES
        out.push(self.values.len() as u8);
        for v in &self.values {
            out.extend_from_slice(&v.to_be_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let [version, count, body @ ..] = bytes else {
            return Err(WireError::MalformedControl("truncated"));
        };
        if *version != CONTROL_VERSION {
            return Err(WireError::UnknownVersion(*version));
        }
        let count = *count as usize;
        if count > MAX_CONTROL_VALUES {
            return Err(WireError::MalformedControl("too many values"));
        }
        if body.len() != count * 4 {
            return Err(WireError::MalformedControl("length does not match count"));
        }
        let values = body
            .chunks_exact(4)
            .map(|b| f32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        Ok(Self { values })
    }
}

// ── Constants ─────────────────────────────────────────────────────────────────

/// Size of the chunk header on the wire.
pub const CHUNK_HEADER_LEN: usize = 8;

/// Size of the stream tag prepended in shared-socket mode.
pub const STREAM_TAG_LEN: usize = 1;

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM: usize = 65507;

/// Largest chunk payload that still fits a datagram with header and tag.
pub const MAX_CHUNK_PAYLOAD: usize = MAX_DATAGRAM - CHUNK_HEADER_LEN - STREAM_TAG_LEN;

/// Default chunk payload size: typical path MTU minus IP/UDP headers.
pub const DEFAULT_CHUNK_SIZE: usize = 1400;

/// Current state datagram version.
pub const STATE_VERSION: u8 = 0x01;

const STATE_FLAG_OVERLAY: u8 = 0x01;

/// Current control datagram version.
pub const CONTROL_VERSION: u8 = 0x01;

/// Maximum number of values in one control datagram.
pub const MAX_CONTROL_VALUES: usize = 64;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when producing or interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("datagram too short: {len} bytes, need {need}")]
    Truncated { len: usize, need: usize },

    #[error("chunk_count of zero")]
    ZeroChunkCount,

    #[error("chunk index {index} out of range for count {count}")]
    ChunkIndexOutOfRange { index: u16, count: u16 },

    #[error("unknown stream id: 0x{0:02x}")]
    UnknownStream(u8),

    #[error("stream {0} is not chunked")]
    NotChunked(StreamId),

    #[error("payload of {len} bytes needs {chunks} chunks, more than {}", u16::MAX)]
    PayloadTooLarge { len: usize, chunks: usize },

    #[error("invalid max chunk size {0} (must be 1..={})", MAX_CHUNK_PAYLOAD)]
    InvalidChunkSize(usize),

    #[error("unknown datagram version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("reserved flags are non-zero: 0x{0:02x}")]
    ReservedFlagsSet(u8),

    #[error("malformed state datagram: {0}")]
    MalformedState(&'static str),

    #[error("malformed control datagram: {0}")]
    MalformedControl(&'static str),
}

impl WireError {
    /// True for errors that mean a received chunk datagram was unusable.
    pub fn is_malformed_chunk(&self) -> bool {
        matches!(
            self,
            WireError::Truncated { .. }
                | WireError::ZeroChunkCount
                | WireError::ChunkIndexOutOfRange { .. }
                | WireError::UnknownStream(_)
                | WireError::NotChunked(_)
        )
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
