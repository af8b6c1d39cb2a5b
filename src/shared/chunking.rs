//! Chunked transport for oversized frames.
//!
//! Both sides of a connection agree on a maximum message size. Before a frame
//! larger than that limit is sent, it is zlib-compressed; if the compressed
//! payload still exceeds the limit it is split into fixed-size chunks, each
//! sent as a `chunk {id, seq, total, data, compressed}` event and
//! acknowledged before the next. The receiver buffers chunks per id and hands
//! the reassembled frame to the normal handler when the last chunk arrives.
//! Partial buffers are discarded after a timeout.

use crate::error::{Error, Result};
use crate::types::ChunkMessage;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use dashmap::DashMap;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default frame size limit: 80 MiB.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 80 * 1024 * 1024;

/// Default time after which a partial reassembly buffer is dropped.
pub const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(60);

/// zlib-compress a payload.
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .and_then(|()| encoder.finish())
        .map_err(|e| Error::Protocol(format!("compression failed: {e}")))
}

/// Inverse of [`compress`].
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::Protocol(format!("decompression failed: {e}")))?;
    Ok(out)
}

/// Split a payload into contiguous chunks of `chunk_size` bytes; the last
/// chunk may be shorter.
pub fn split_message_bytes(data: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
    data.chunks(chunk_size.max(1)).map(<[u8]>::to_vec).collect()
}

/// How a serialized frame should go onto the wire.
#[derive(Debug)]
pub enum OutboundPayload {
    /// Fits in one WebSocket message; send as-is.
    Single(Vec<u8>),
    /// Needs the chunk protocol.
    Chunked {
        /// Chunk identifier shared by all parts.
        id: String,
        /// Whether the payload bytes are zlib-compressed.
        compressed: bool,
        /// The chunk payloads, in order.
        chunks: Vec<Vec<u8>>,
    },
}

impl OutboundPayload {
    /// Decide how to transmit `bytes` under the given size limit.
    ///
    /// Compression is applied before the size comparison; when the compressed
    /// payload fits in a single frame it is still sent through the chunk
    /// protocol (as one chunk) so the receiver knows to decompress it.
    pub fn prepare(bytes: Vec<u8>, max_message_size: usize) -> Result<OutboundPayload> {
        if bytes.len() <= max_message_size {
            return Ok(OutboundPayload::Single(bytes));
        }
        let compressed = compress(&bytes)?;
        debug!(
            original = bytes.len(),
            compressed = compressed.len(),
            "compressed oversized message"
        );
        let chunks = split_message_bytes(&compressed, max_message_size);
        if chunks.len() > 1 {
            debug!(chunks = chunks.len(), "splitting message into chunks");
        }
        Ok(OutboundPayload::Chunked {
            id: uuid::Uuid::new_v4().to_string(),
            compressed: true,
            chunks,
        })
    }

    /// Render the chunk events for a chunked payload.
    pub fn chunk_messages(&self) -> Vec<ChunkMessage> {
        match self {
            OutboundPayload::Single(_) => Vec::new(),
            OutboundPayload::Chunked {
                id,
                compressed,
                chunks,
            } => {
                let total = chunks.len() as u32;
                chunks
                    .iter()
                    .enumerate()
                    .map(|(seq, chunk)| ChunkMessage {
                        id: id.clone(),
                        seq: seq as u32,
                        total,
                        data: BASE64.encode(chunk),
                        compressed: *compressed,
                    })
                    .collect()
            },
        }
    }
}

struct PartialMessage {
    parts: Vec<Option<Vec<u8>>>,
    received: usize,
    compressed: bool,
    created_at: Instant,
}

/// Per-connection reassembly buffer for inbound chunks.
pub struct ChunkAssembler {
    buffers: DashMap<String, PartialMessage>,
    timeout: Duration,
}

impl Default for ChunkAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkAssembler {
    /// Assembler with the default reassembly timeout.
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_REASSEMBLY_TIMEOUT)
    }

    /// Assembler with a custom reassembly timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            buffers: DashMap::new(),
            timeout,
        }
    }

    /// Feed one chunk; returns the reassembled (and decompressed) payload
    /// when this chunk completes the message.
    pub fn push(&self, msg: &ChunkMessage) -> Result<Option<Vec<u8>>> {
        self.purge_stale();

        if msg.total == 0 || msg.seq >= msg.total {
            return Err(Error::Protocol(format!(
                "chunk {}/{} out of bounds for id {}",
                msg.seq, msg.total, msg.id
            )));
        }
        let bytes = BASE64
            .decode(&msg.data)
            .map_err(|e| Error::Protocol(format!("invalid chunk encoding: {e}")))?;

        let mut entry = self.buffers.entry(msg.id.clone()).or_insert_with(|| PartialMessage {
            parts: vec![None; msg.total as usize],
            received: 0,
            compressed: msg.compressed,
            created_at: Instant::now(),
        });
        if entry.parts.len() != msg.total as usize {
            return Err(Error::Protocol(format!(
                "chunk total changed mid-stream for id {}",
                msg.id
            )));
        }
        let slot = &mut entry.parts[msg.seq as usize];
        if slot.is_none() {
            *slot = Some(bytes);
            entry.received += 1;
        }
        let complete = entry.received == entry.parts.len();
        drop(entry);

        if !complete {
            return Ok(None);
        }
        let (_, partial) = self
            .buffers
            .remove(&msg.id)
            .ok_or_else(|| Error::Protocol(format!("chunk buffer vanished for id {}", msg.id)))?;
        let mut payload = Vec::new();
        for part in partial.parts {
            payload.extend(part.expect("complete message is missing a part"));
        }
        if partial.compressed {
            payload = decompress(&payload)?;
        }
        Ok(Some(payload))
    }

    /// Number of in-flight partial messages.
    pub fn pending(&self) -> usize {
        self.buffers.len()
    }

    fn purge_stale(&self) {
        let timeout = self.timeout;
        self.buffers.retain(|id, partial| {
            let keep = partial.created_at.elapsed() < timeout;
            if !keep {
                warn!(chunk_id = %id, "dropping stale chunk reassembly buffer");
            }
            keep
        });
    }
}

impl std::fmt::Debug for ChunkAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkAssembler")
            .field("pending", &self.buffers.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bytes that zlib cannot shrink meaningfully.
    fn noisy_bytes(len: usize) -> Vec<u8> {
        let mut state = 0x2545_f491_4f6c_dd1du64;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state & 0xff) as u8
            })
            .collect()
    }

    #[test]
    fn split_into_even_chunks() {
        let message = vec![b'x'; 1000];
        let chunks = split_message_bytes(&message, 100);
        assert_eq!(chunks.len(), 10);
        assert!(chunks.iter().all(|c| c.len() == 100));
        let reassembled: Vec<u8> = chunks.concat();
        assert_eq!(reassembled, message);
    }

    #[test]
    fn split_with_short_tail() {
        let message = vec![b'x'; 1050];
        let chunks = split_message_bytes(&message, 100);
        assert_eq!(chunks.len(), 11);
        assert!(chunks[..10].iter().all(|c| c.len() == 100));
        assert_eq!(chunks[10].len(), 50);
        assert_eq!(chunks.concat(), message);
    }

    #[test]
    fn compress_round_trip() {
        let payload = b"hello hello hello hello".repeat(100);
        let compressed = compress(&payload).unwrap();
        assert!(compressed.len() < payload.len());
        assert_eq!(decompress(&compressed).unwrap(), payload);
    }

    #[test]
    fn small_payloads_stay_single() {
        match OutboundPayload::prepare(vec![1, 2, 3], 100).unwrap() {
            OutboundPayload::Single(bytes) => assert_eq!(bytes, vec![1, 2, 3]),
            OutboundPayload::Chunked { .. } => panic!("small payload was chunked"),
        }
    }

    #[test]
    fn compressible_payload_collapses_to_one_chunk() {
        // Repetitive content compresses far below the limit, so a single
        // compressed chunk is enough.
        let payload = vec![b'a'; 4096];
        match OutboundPayload::prepare(payload, 1024).unwrap() {
            OutboundPayload::Chunked {
                compressed, chunks, ..
            } => {
                assert!(compressed);
                assert_eq!(chunks.len(), 1);
            },
            OutboundPayload::Single(_) => panic!("oversized payload sent unchunked"),
        }
    }

    #[test]
    fn incompressible_payload_splits() {
        let payload = noisy_bytes(10_000);
        let outbound = OutboundPayload::prepare(payload.clone(), 1000).unwrap();
        let messages = outbound.chunk_messages();
        assert!(messages.len() > 1, "expected a split, got {} chunk(s)", messages.len());

        let assembler = ChunkAssembler::new();
        let mut result = None;
        for msg in &messages {
            result = assembler.push(msg).unwrap();
        }
        assert_eq!(result.unwrap(), payload);
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn out_of_order_chunks_reassemble() {
        let payload = noisy_bytes(5000);
        let outbound = OutboundPayload::prepare(payload.clone(), 1000).unwrap();
        let mut messages = outbound.chunk_messages();
        messages.reverse();

        let assembler = ChunkAssembler::new();
        let mut result = None;
        for msg in &messages {
            result = assembler.push(msg).unwrap();
        }
        assert_eq!(result.unwrap(), payload);
    }

    #[test]
    fn duplicate_chunk_is_idempotent() {
        let payload = noisy_bytes(3000);
        let outbound = OutboundPayload::prepare(payload.clone(), 1000).unwrap();
        let messages = outbound.chunk_messages();
        assert!(messages.len() >= 2);

        let assembler = ChunkAssembler::new();
        assert!(assembler.push(&messages[0]).unwrap().is_none());
        assert!(assembler.push(&messages[0]).unwrap().is_none());
        let mut result = None;
        for msg in &messages[1..] {
            result = assembler.push(msg).unwrap();
        }
        assert_eq!(result.unwrap(), payload);
    }

    #[test]
    fn stale_buffers_are_purged() {
        let payload = noisy_bytes(3000);
        let outbound = OutboundPayload::prepare(payload, 1000).unwrap();
        let messages = outbound.chunk_messages();

        let assembler = ChunkAssembler::with_timeout(Duration::from_millis(0));
        assert!(assembler.push(&messages[0]).unwrap().is_none());
        std::thread::sleep(Duration::from_millis(5));
        // Pushing an unrelated chunk triggers the purge of the stale buffer.
        let other = OutboundPayload::prepare(noisy_bytes(3000), 1000).unwrap();
        let _ = assembler.push(&other.chunk_messages()[0]).unwrap();
        assert_eq!(assembler.pending(), 1);
    }

    #[test]
    fn rejects_out_of_bounds_sequence() {
        let msg = ChunkMessage {
            id: "x".into(),
            seq: 3,
            total: 3,
            data: BASE64.encode(b"abc"),
            compressed: false,
        };
        assert!(ChunkAssembler::new().push(&msg).is_err());
    }
}
