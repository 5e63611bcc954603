//! Byte-level stages that run before a codec.

use crate::error::{CodecError, Result};
use crate::message::RawPayload;
use flate2::read::{GzDecoder, ZlibDecoder};
use sluice_chunking::{ChunkAggregator, PayloadKind, classify};
use std::io::Read;
use std::sync::Arc;

pub const DEFAULT_MAX_DECOMPRESSED_SIZE: usize = 8 * 1024 * 1024;

/// Result of feeding one datagram to the chunk stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// A whole payload is available
    Ready(RawPayload),
    /// The chunk was stored (or was a duplicate); its message is not
    /// complete yet
    Pending,
    /// The datagram was malformed
    Invalid,
}

/// Reassembles chunked datagrams through a shared aggregator.
#[derive(Clone)]
pub struct ChunkStage {
    aggregator: Arc<ChunkAggregator>,
}

impl ChunkStage {
    pub fn new(aggregator: Arc<ChunkAggregator>) -> Self {
        Self { aggregator }
    }

    pub fn aggregator(&self) -> &Arc<ChunkAggregator> {
        &self.aggregator
    }

    pub fn process(&self, payload: RawPayload) -> ChunkOutcome {
        let result = self.aggregator.add_chunk(payload.bytes.clone());
        match (result.valid, result.message) {
            (true, Some(bytes)) => ChunkOutcome::Ready(payload.with_bytes(bytes)),
            (true, None) => ChunkOutcome::Pending,
            (false, _) => ChunkOutcome::Invalid,
        }
    }
}

/// Inflates zlib and gzip payloads; everything else passes through.
#[derive(Debug, Clone, Copy)]
pub struct DecompressStage {
    max_size: usize,
}

impl DecompressStage {
    pub fn new(max_size: usize) -> Self {
        Self { max_size }
    }

    pub fn process(&self, payload: RawPayload) -> Result<RawPayload> {
        let inflated = match classify(&payload.bytes) {
            PayloadKind::Gzip => self.inflate(GzDecoder::new(&payload.bytes[..]))?,
            PayloadKind::Zlib => self.inflate(ZlibDecoder::new(&payload.bytes[..]))?,
            _ => return Ok(payload),
        };
        Ok(payload.with_bytes(inflated))
    }

    fn inflate(&self, reader: impl Read) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        // Read one byte past the limit to tell "exactly at" from "over".
        reader
            .take(self.max_size as u64 + 1)
            .read_to_end(&mut out)
            .map_err(CodecError::Decompress)?;
        if out.len() > self.max_size {
            return Err(CodecError::DecompressedTooLarge {
                limit: self.max_size,
            });
        }
        Ok(out)
    }
}

impl Default for DecompressStage {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DECOMPRESSED_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::{GzEncoder, ZlibEncoder};
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn inflates_gzip_and_zlib() {
        let stage = DecompressStage::default();
        let body = br#"{"short_message":"compressed"}"#;

        let out = stage.process(RawPayload::new(gzip(body), None)).unwrap();
        assert_eq!(&out.bytes[..], body);

        let out = stage.process(RawPayload::new(zlib(body), None)).unwrap();
        assert_eq!(&out.bytes[..], body);
    }

    #[test]
    fn plain_payloads_pass_through() {
        let stage = DecompressStage::default();
        let out = stage
            .process(RawPayload::new(&b"plain text"[..], None))
            .unwrap();
        assert_eq!(&out.bytes[..], b"plain text");
    }

    #[test]
    fn corrupt_gzip_is_an_error() {
        let stage = DecompressStage::default();
        let err = stage
            .process(RawPayload::new(vec![0x1f, 0x8b, 0x00, 0x01, 0x02], None))
            .unwrap_err();
        assert!(matches!(err, CodecError::Decompress(_)));
    }

    #[test]
    fn inflated_size_is_bounded() {
        let stage = DecompressStage::new(16);
        let err = stage
            .process(RawPayload::new(gzip(&[b'a'; 64]), None))
            .unwrap_err();
        assert!(matches!(err, CodecError::DecompressedTooLarge { limit: 16 }));

        let out = stage
            .process(RawPayload::new(gzip(&[b'a'; 16]), None))
            .unwrap();
        assert_eq!(out.bytes.len(), 16);
    }

    #[test]
    fn chunk_stage_reports_pending_until_complete() {
        let stage = ChunkStage::new(Arc::new(ChunkAggregator::default()));
        let chunk = |seq: u8, body: &[u8]| {
            let mut buf = vec![0x1e, 0x0f, 1, 2, 3, 4, 5, 6, 7, 8, seq, 2];
            buf.extend_from_slice(body);
            RawPayload::new(buf, None)
        };

        assert_eq!(stage.process(chunk(1, b"world")), ChunkOutcome::Pending);
        match stage.process(chunk(0, b"hello ")) {
            ChunkOutcome::Ready(payload) => assert_eq!(&payload.bytes[..], b"hello world"),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(
            stage.process(RawPayload::new(&b"\x00\x00garbage"[..], None)),
            ChunkOutcome::Invalid
        );
    }
}
