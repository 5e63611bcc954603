//! Error types for chunk parsing and reassembly

use thiserror::Error;

/// Errors raised while parsing a chunk header.
///
/// These never escape [`crate::ChunkAggregator::add_chunk`]; they are logged and
/// turned into an invalid result.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    /// Buffer is shorter than the fixed chunk header
    #[error("chunk header needs {expected} bytes, got {actual}")]
    HeaderTooShort { expected: usize, actual: usize },

    /// First two bytes are not the chunk magic
    #[error("invalid chunk magic {0:02x?}")]
    InvalidMagic([u8; 2]),

    /// Header declares zero chunks
    #[error("chunk count must not be zero")]
    ZeroChunkCount,

    /// Sequence number is not below the declared chunk count
    #[error("sequence number {sequence} out of range for {count} chunks")]
    SequenceOutOfRange { sequence: u8, count: u8 },

    /// Declared chunk count exceeds the configured cap
    #[error("chunk count {count} exceeds maximum of {max}")]
    TooManyChunks { count: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, ChunkError>;
