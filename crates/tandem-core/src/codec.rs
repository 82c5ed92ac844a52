//! Chunk codec — splits a frame payload into datagram-sized chunks and
//! joins them back together.
//!
//! Chunk `i` of a payload split at size `S` always carries bytes
//! `[i*S, min((i+1)*S, len))`. An empty payload still produces one
//! (empty) chunk so that `chunk_count >= 1` holds on the wire.

use bytes::{BufMut, Bytes, BytesMut};
use zerocopy::AsBytes;

use crate::wire::{
    ChunkHeader, StreamId, WireError, CHUNK_HEADER_LEN, MAX_CHUNK_PAYLOAD, STREAM_TAG_LEN,
};

/// One fragment of a frame, as sent in a single datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub stream_id: StreamId,
    pub frame_id: u32,
    pub chunk_index: u16,
    pub chunk_count: u16,
    pub data: Bytes,
}

impl Chunk {
    pub fn header(&self) -> ChunkHeader {
        ChunkHeader::new(self.frame_id, self.chunk_index, self.chunk_count)
    }

    /// Encode as a datagram. `tagged` prepends the one-byte stream id used
    /// when several streams share a socket.
    pub fn encode(&self, tagged: bool) -> Bytes {
        let tag_len = if tagged { STREAM_TAG_LEN } else { 0 };
        let mut buf = BytesMut::with_capacity(tag_len + CHUNK_HEADER_LEN + self.data.len());
        if tagged {
            buf.put_u8(self.stream_id.into());
        }
        buf.put_slice(self.header().as_bytes());
        buf.put_slice(&self.data);
        buf.freeze()
    }

    /// Decode an untagged chunk datagram received on `stream_id`'s socket.
    pub fn decode(stream_id: StreamId, datagram: &[u8]) -> Result<Self, WireError> {
        if !stream_id.is_chunked() {
            return Err(WireError::NotChunked(stream_id));
        }
        let header = ChunkHeader::parse(datagram)?;
        Ok(Self {
            stream_id,
            frame_id: header.frame_id.get(),
            chunk_index: header.chunk_index.get(),
            chunk_count: header.chunk_count.get(),
            data: Bytes::copy_from_slice(&datagram[CHUNK_HEADER_LEN..]),
        })
    }
}

/// Split a stream tag off the front of a shared-socket datagram.
pub fn untag(datagram: &[u8]) -> Result<(StreamId, &[u8]), WireError> {
    let (&tag, rest) = datagram.split_first().ok_or(WireError::Truncated {
        len: 0,
        need: STREAM_TAG_LEN,
    })?;
    Ok((StreamId::try_from(tag)?, rest))
}

/// Prepend a stream tag to a non-chunked payload for a shared socket.
pub fn tag(stream_id: StreamId, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(STREAM_TAG_LEN + payload.len());
    buf.put_u8(stream_id.into());
    buf.put_slice(payload);
    buf.freeze()
}

/// Fixed-size encoding of a chunk header.
pub fn chunk_header_bytes(frame_id: u32, chunk_index: u16, chunk_count: u16) -> [u8; CHUNK_HEADER_LEN] {
    let mut out = [0u8; CHUNK_HEADER_LEN];
    out.copy_from_slice(ChunkHeader::new(frame_id, chunk_index, chunk_count).as_bytes());
    out
}

/// Number of chunks `len` bytes split into at `max_chunk_size`.
pub fn chunk_count_for(len: usize, max_chunk_size: usize) -> usize {
    if len == 0 {
        1
    } else {
        len.div_ceil(max_chunk_size)
    }
}

/// Split a payload into ordered chunks.
///
/// Fails with `PayloadTooLarge` when the chunk count would not fit in the
/// 16-bit header field, and with `InvalidChunkSize` when `max_chunk_size`
/// is zero or would overflow a datagram.
pub fn split(
    stream_id: StreamId,
    frame_id: u32,
    payload: &Bytes,
    max_chunk_size: usize,
) -> Result<Vec<Chunk>, WireError> {
    if !stream_id.is_chunked() {
        return Err(WireError::NotChunked(stream_id));
    }
    if max_chunk_size == 0 || max_chunk_size > MAX_CHUNK_PAYLOAD {
        return Err(WireError::InvalidChunkSize(max_chunk_size));
    }
    let count = chunk_count_for(payload.len(), max_chunk_size);
    let chunk_count = u16::try_from(count).map_err(|_| WireError::PayloadTooLarge {
        len: payload.len(),
        chunks: count,
    })?;

    let chunks = (0..chunk_count)
        .map(|i| {
            let start = usize::from(i) * max_chunk_size;
            let end = (start + max_chunk_size).min(payload.len());
            Chunk {
                stream_id,
                frame_id,
                chunk_index: i,
                chunk_count,
                data: payload.slice(start..end),
            }
        })
        .collect();
    Ok(chunks)
}

/// Reassemble a complete chunk set in index order.
///
/// Returns `None` unless every index `0..chunk_count` of a single frame
/// is present. Duplicates are tolerated.
pub fn join(chunks: &[Chunk]) -> Option<Bytes> {
    let first = chunks.first()?;
    let count = usize::from(first.chunk_count);
    let mut slots: Vec<Option<&Bytes>> = vec![None; count];
    for c in chunks {
        if c.frame_id != first.frame_id || c.chunk_count != first.chunk_count {
            return None;
        }
        *slots.get_mut(usize::from(c.chunk_index))? = Some(&c.data);
    }
    let total = slots.iter().map(|s| s.map_or(0, |b| b.len())).sum();
    let mut out = BytesMut::with_capacity(total);
    for slot in slots {
        out.put_slice(slot?);
    }
    Some(out.freeze())
}

/// Serial-number comparison on frame ids: true when `a` is ahead of `b`,
/// accounting for wraparound at `u32::MAX`.
pub fn is_newer(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}
