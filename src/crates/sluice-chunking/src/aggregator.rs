//! Classification of incoming datagrams and the chunk reassembly entry point.

use crate::error::{ChunkError, Result};
use crate::metrics::ChunkMetrics;
use crate::store::{
    Chunk, ChunkStore, ChunkStoreConfig, EvictionReport, FailureReason, MessageId, PutOutcome,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Magic bytes opening every chunk.
pub const CHUNK_MAGIC: [u8; 2] = [0x1e, 0x0f];

/// Magic, 8 byte message id, sequence number, chunk count.
pub const CHUNK_HEADER_LEN: usize = 12;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const UNCOMPRESSED_MAGIC: [u8; 2] = [0x1f, 0x3c];
const ZLIB_CMF: u8 = 0x78;
const ZLIB_FLAGS: [u8; 4] = [0x01, 0x5e, 0x9c, 0xda];

/// What a datagram looks like judging from its leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Chunked,
    Zlib,
    Gzip,
    Uncompressed,
    Unsupported,
}

impl PayloadKind {
    pub fn is_compressed(self) -> bool {
        matches!(self, Self::Zlib | Self::Gzip)
    }
}

pub fn classify(buffer: &[u8]) -> PayloadKind {
    match buffer {
        [a, b, ..] if [*a, *b] == CHUNK_MAGIC => PayloadKind::Chunked,
        [a, b, ..] if [*a, *b] == GZIP_MAGIC => PayloadKind::Gzip,
        [a, b, ..] if [*a, *b] == UNCOMPRESSED_MAGIC => PayloadKind::Uncompressed,
        [ZLIB_CMF, flags, ..] if ZLIB_FLAGS.contains(flags) => PayloadKind::Zlib,
        [b'{', _, ..] => PayloadKind::Uncompressed,
        _ => PayloadKind::Unsupported,
    }
}

/// Parsed fixed chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub id: MessageId,
    pub sequence: u8,
    pub count: u8,
}

pub fn parse_chunk_header(buffer: &[u8]) -> Result<ChunkHeader> {
    if buffer.len() < CHUNK_HEADER_LEN {
        return Err(ChunkError::HeaderTooShort {
            expected: CHUNK_HEADER_LEN,
            actual: buffer.len(),
        });
    }
    if buffer[..2] != CHUNK_MAGIC {
        return Err(ChunkError::InvalidMagic([buffer[0], buffer[1]]));
    }

    let mut id = [0_u8; 8];
    id.copy_from_slice(&buffer[2..10]);
    let sequence = buffer[10];
    let count = buffer[11];

    if count == 0 {
        return Err(ChunkError::ZeroChunkCount);
    }
    if sequence >= count {
        return Err(ChunkError::SequenceOutOfRange { sequence, count });
    }

    Ok(ChunkHeader {
        id: MessageId(id),
        sequence,
        count,
    })
}

/// Outcome of feeding one buffer to the aggregator.
///
/// `valid` is false for anything that was discarded. A valid result without
/// a message means the chunk was stored and the message is still incomplete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkResult {
    pub message: Option<Bytes>,
    pub valid: bool,
}

impl ChunkResult {
    fn complete(message: Bytes) -> Self {
        Self {
            message: Some(message),
            valid: true,
        }
    }

    fn incomplete() -> Self {
        Self {
            message: None,
            valid: true,
        }
    }

    fn invalid() -> Self {
        Self {
            message: None,
            valid: false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.message.is_some()
    }
}

/// Turns raw datagrams into complete payloads.
///
/// Safe to share between I/O workers; all state lives in the [`ChunkStore`].
pub struct ChunkAggregator {
    store: ChunkStore,
    metrics: Arc<ChunkMetrics>,
}

impl Default for ChunkAggregator {
    fn default() -> Self {
        Self::new(ChunkStoreConfig::default())
    }
}

impl ChunkAggregator {
    pub fn new(config: ChunkStoreConfig) -> Self {
        let metrics = Arc::new(ChunkMetrics::default());
        Self {
            store: ChunkStore::new(config, Arc::clone(&metrics)),
            metrics,
        }
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn metrics(&self) -> &ChunkMetrics {
        &self.metrics
    }

    pub fn add_chunk(&self, buffer: Bytes) -> ChunkResult {
        self.add_chunk_at(buffer, now_ms())
    }

    pub fn add_chunk_at(&self, buffer: Bytes, now_ms: u64) -> ChunkResult {
        match classify(&buffer) {
            PayloadKind::Zlib | PayloadKind::Gzip | PayloadKind::Uncompressed => {
                ChunkResult::complete(buffer)
            }
            PayloadKind::Unsupported => {
                tracing::debug!("discarding datagram of {} bytes with unknown marker", buffer.len());
                ChunkResult::invalid()
            }
            PayloadKind::Chunked => {
                self.metrics.chunk_seen();
                match self.handle_chunk(buffer, now_ms) {
                    Ok(result) => result,
                    Err(err) => {
                        self.metrics.invalid();
                        tracing::debug!("discarding invalid chunk: {}", err);
                        ChunkResult::invalid()
                    }
                }
            }
        }
    }

    fn handle_chunk(&self, buffer: Bytes, now_ms: u64) -> Result<ChunkResult> {
        let header = parse_chunk_header(&buffer)?;
        let max = self.store.config().max_chunks;
        if usize::from(header.count) > max {
            if self.store.evict(&header.id) {
                tracing::warn!(
                    "message {} announced {} chunks, evicted its partial state",
                    header.id,
                    header.count
                );
            }
            return Err(ChunkError::TooManyChunks {
                count: usize::from(header.count),
                max,
            });
        }

        let chunk = Chunk {
            id: header.id,
            sequence: usize::from(header.sequence),
            count: usize::from(header.count),
            payload: buffer.slice(CHUNK_HEADER_LEN..),
            arrival_ms: now_ms,
        };

        let result = match self.store.add(chunk) {
            PutOutcome::Complete(message) => ChunkResult::complete(message),
            PutOutcome::Incomplete => ChunkResult::incomplete(),
            PutOutcome::Duplicate => ChunkResult::incomplete(),
            PutOutcome::Failed(FailureReason::TooManyChunks) => {
                return Err(ChunkError::TooManyChunks {
                    count: usize::from(header.count),
                    max,
                });
            }
            PutOutcome::Failed(FailureReason::SequenceOutOfRange) => {
                return Err(ChunkError::SequenceOutOfRange {
                    sequence: header.sequence,
                    count: header.count,
                });
            }
            PutOutcome::Failed(FailureReason::UnknownMessage) => {
                tracing::debug!("message {} vanished while storing a chunk", header.id);
                ChunkResult::invalid()
            }
        };
        Ok(result)
    }

    pub fn evict_expired(&self) -> EvictionReport {
        self.evict_expired_at(now_ms())
    }

    pub fn evict_expired_at(&self, now_ms: u64) -> EvictionReport {
        self.store.evict_expired(now_ms)
    }

    /// Counters plus the gauges derived from the live store.
    pub fn metrics_snapshot(&self) -> HashMap<String, u64> {
        let mut stats = self.metrics.snapshot();
        stats.insert("messages_waiting".to_string(), self.store.len() as u64);
        stats.insert(
            "chunks_waiting".to_string(),
            self.store.waiting_chunks() as u64,
        );
        stats
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    fn chunk_bytes(id: u8, sequence: u8, count: u8, payload: &[u8]) -> Bytes {
        let mut buf = Vec::with_capacity(CHUNK_HEADER_LEN + payload.len());
        buf.extend_from_slice(&CHUNK_MAGIC);
        buf.extend_from_slice(&[id; 8]);
        buf.push(sequence);
        buf.push(count);
        buf.extend_from_slice(payload);
        Bytes::from(buf)
    }

    #[test]
    fn classifies_by_marker() {
        assert_eq!(classify(&[0x1e, 0x0f, 0]), PayloadKind::Chunked);
        assert_eq!(classify(&[0x1f, 0x8b, 8]), PayloadKind::Gzip);
        assert_eq!(classify(&[0x78, 0x9c, 1]), PayloadKind::Zlib);
        assert_eq!(classify(&[0x78, 0xda]), PayloadKind::Zlib);
        assert_eq!(classify(&[0x1f, 0x3c, b'{']), PayloadKind::Uncompressed);
        assert_eq!(classify(b"{\"a\":1}"), PayloadKind::Uncompressed);
        assert_eq!(classify(&[0x78, 0x00]), PayloadKind::Unsupported);
        assert_eq!(classify(b"hello"), PayloadKind::Unsupported);
        assert_eq!(classify(&[0x1e]), PayloadKind::Unsupported);
        assert_eq!(classify(&[]), PayloadKind::Unsupported);
    }

    #[test]
    fn header_errors() {
        assert_eq!(
            parse_chunk_header(&[0x1e, 0x0f, 1, 2]),
            Err(ChunkError::HeaderTooShort {
                expected: 12,
                actual: 4
            })
        );
        assert_eq!(
            parse_chunk_header(&chunk_bytes(1, 0, 0, b"")),
            Err(ChunkError::ZeroChunkCount)
        );
        assert_eq!(
            parse_chunk_header(&chunk_bytes(1, 3, 3, b"")),
            Err(ChunkError::SequenceOutOfRange {
                sequence: 3,
                count: 3
            })
        );
    }

    #[test]
    fn uncompressed_and_compressed_pass_through() {
        let aggregator = ChunkAggregator::default();
        let json = Bytes::from_static(b"{\"short_message\":\"hi\"}");
        let zlib = Bytes::from_static(&[0x78, 0x9c, 0xcb, 0x48]);

        assert_eq!(
            aggregator.add_chunk_at(json.clone(), 0),
            ChunkResult::complete(json)
        );
        assert_eq!(
            aggregator.add_chunk_at(zlib.clone(), 0),
            ChunkResult::complete(zlib)
        );
        assert_eq!(aggregator.metrics().chunks_total.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn unsupported_has_no_side_effects() {
        let aggregator = ChunkAggregator::default();
        let result = aggregator.add_chunk_at(Bytes::from_static(b"<13>hello"), 0);

        assert_eq!(result, ChunkResult::invalid());
        assert!(aggregator.store().is_empty());
        assert!(aggregator.metrics_snapshot().values().all(|v| *v == 0));
    }

    #[test]
    fn reassembles_chunks_out_of_order() {
        let aggregator = ChunkAggregator::default();

        assert_eq!(
            aggregator.add_chunk_at(chunk_bytes(7, 1, 2, b"world"), 0),
            ChunkResult::incomplete()
        );
        let result = aggregator.add_chunk_at(chunk_bytes(7, 0, 2, b"hello "), 1);

        assert_eq!(result.message, Some(Bytes::from_static(b"hello world")));
        assert!(result.valid);
        let stats = aggregator.metrics_snapshot();
        assert_eq!(stats["chunks_total"], 2);
        assert_eq!(stats["messages_completed"], 1);
        assert_eq!(stats["messages_waiting"], 0);
    }

    #[test]
    fn duplicate_chunk_is_incomplete_and_counted() {
        let aggregator = ChunkAggregator::default();
        aggregator.add_chunk_at(chunk_bytes(7, 0, 2, b"first"), 0);

        let result = aggregator.add_chunk_at(chunk_bytes(7, 0, 2, b"second"), 0);
        assert_eq!(result, ChunkResult::incomplete());
        assert!(result.valid);
        assert_eq!(aggregator.metrics().chunks_invalid.load(Ordering::Relaxed), 0);
        assert_eq!(aggregator.metrics().chunks_duplicated.load(Ordering::Relaxed), 1);

        let result = aggregator.add_chunk_at(chunk_bytes(7, 1, 2, b"!"), 0);
        assert_eq!(result.message, Some(Bytes::from_static(b"first!")));
    }

    #[test]
    fn truncated_chunk_is_invalid() {
        let aggregator = ChunkAggregator::default();
        let result = aggregator.add_chunk_at(Bytes::from_static(&[0x1e, 0x0f, 1, 2, 3]), 0);

        assert_eq!(result, ChunkResult::invalid());
        assert_eq!(aggregator.metrics().chunks_invalid.load(Ordering::Relaxed), 1);
        assert!(aggregator.store().is_empty());
    }

    #[test]
    fn too_many_chunks_evicts_partial_state() {
        let aggregator = ChunkAggregator::default();
        aggregator.add_chunk_at(chunk_bytes(3, 0, 2, b"a"), 0);
        assert_eq!(aggregator.store().len(), 1);

        let result = aggregator.add_chunk_at(chunk_bytes(3, 1, 200, b"b"), 0);

        assert_eq!(result, ChunkResult::invalid());
        assert!(aggregator.store().is_empty());
        let stats = aggregator.metrics_snapshot();
        assert_eq!(stats["messages_expired"], 1);
        assert_eq!(stats["chunks_expired"], 1);
    }

    #[test]
    fn single_chunk_message_completes_immediately() {
        let aggregator = ChunkAggregator::default();
        let result = aggregator.add_chunk_at(chunk_bytes(5, 0, 1, b"solo"), 0);

        assert_eq!(result.message, Some(Bytes::from_static(b"solo")));
        assert!(aggregator.store().is_empty());
    }
}
