//! Error types for NetFlow decoding

use std::path::PathBuf;
use thiserror::Error;

/// Errors that abort decoding of a whole packet, or loading of field definitions.
///
/// A data flow-set that references an unknown template is not an error; it is
/// reported through [`crate::FlowPacket::missing_template`].
#[derive(Debug, Error)]
pub enum FlowError {
    /// Buffer is shorter than the fixed packet header
    #[error("packet too short for NetFlow header: {actual} bytes, need {expected}")]
    HeaderTooShort { expected: usize, actual: usize },

    /// Header carries a version other than the one this parser decodes
    #[error("invalid NetFlow version {actual}, expected {expected}")]
    InvalidVersion { expected: u16, actual: u16 },

    /// Flow-set length is smaller than its own header
    #[error("flow-set {flowset_id} declares invalid length {length}")]
    InvalidFlowSetLength { flowset_id: u16, length: u16 },

    /// Flow-set runs past the end of the packet
    #[error("flow-set {flowset_id} declares {declared} bytes but only {available} remain")]
    TruncatedFlowSet {
        flowset_id: u16,
        declared: usize,
        available: usize,
    },

    /// Template record runs past the end of its flow-set
    #[error("template {template_id} runs past the end of its flow-set")]
    TruncatedTemplate { template_id: u16 },

    /// Definitions file could not be read
    #[error("failed to read field definitions from {path}: {source}")]
    DefinitionsIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Definitions are not valid YAML or use an unknown kind
    #[error("invalid field definitions: {0}")]
    Definitions(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, FlowError>;
