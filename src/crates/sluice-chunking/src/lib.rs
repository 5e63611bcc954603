//! Reassembly of chunked datagrams.
//!
//! Large messages sent over UDP are split into chunks that share an 8 byte
//! message id and carry their sequence number and the total chunk count.
//! [`ChunkAggregator`] classifies each datagram, stores chunks in the
//! [`ChunkStore`] and hands back the concatenated payload once every chunk
//! has arrived. Partial messages that do not complete within the validity
//! window are removed by [`ChunkAggregator::evict_expired`], which the host
//! is expected to call on a fixed interval.

pub mod aggregator;
pub mod error;
pub mod metrics;
pub mod store;

pub use aggregator::{
    CHUNK_HEADER_LEN, CHUNK_MAGIC, ChunkAggregator, ChunkHeader, ChunkResult, PayloadKind, classify,
    parse_chunk_header,
};
pub use error::{ChunkError, Result};
pub use metrics::ChunkMetrics;
pub use store::{
    Chunk, ChunkStore, ChunkStoreConfig, DEFAULT_CHECK_INTERVAL, DEFAULT_MAX_CHUNKS,
    DEFAULT_VALIDITY_WINDOW, EvictionReport, FailureReason, MessageId, PartialMessage, PutOutcome,
};
