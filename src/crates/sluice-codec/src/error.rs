//! Error types for payload decoding

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    /// I/O failure while reading a framed stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Compressed payload could not be inflated
    #[error("failed to decompress payload: {0}")]
    Decompress(#[source] std::io::Error),

    /// Inflated payload is larger than the configured limit
    #[error("decompressed payload exceeds {limit} bytes")]
    DecompressedTooLarge { limit: usize },

    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// JSON payload is valid but is not an object
    #[error("expected a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("invalid syslog message: {0}")]
    Syslog(String),

    #[error("CSV record has {actual} columns, expected {expected}")]
    CsvColumns { expected: usize, actual: usize },

    #[error("invalid CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("NetFlow decoding failed: {0}")]
    Netflow(#[from] sluice_netflow::FlowError),
}

pub type Result<T> = std::result::Result<T, CodecError>;
