use crate::definition::TimeRange;
use std::time::Duration;
use thiserror::Error;

/// Failure reported by a search backend.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("invalid query '{query}': {reason}")]
    InvalidQuery { query: String, reason: String },

    #[error("search backend failure: {0}")]
    Backend(String),
}

/// Failure reported by an event consumer.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ConsumerError(pub String);

/// Errors of one engine run.
///
/// Search failures carry the definition id and the time range that was
/// queried so the caller can retry the same window.
#[derive(Debug, Error)]
pub enum EventProcessorError {
    #[error("search '{query}' of event definition '{definition_id}' failed for {time_range}")]
    SearchFailed {
        definition_id: String,
        query: String,
        time_range: TimeRange,
        #[source]
        source: SearchError,
    },

    #[error(
        "search '{query}' of event definition '{definition_id}' timed out after {timeout:?} for {time_range}"
    )]
    SearchTimeout {
        definition_id: String,
        query: String,
        time_range: TimeRange,
        timeout: Duration,
    },

    #[error(
        "event definition '{definition_id}' groups by {expected} fields but a result key has {actual} values: {key:?}"
    )]
    KeyFieldMismatch {
        definition_id: String,
        expected: usize,
        actual: usize,
        key: Vec<String>,
    },

    #[error("invalid definition '{definition_id}': {reason}")]
    InvalidDefinition {
        definition_id: String,
        reason: String,
    },

    #[error("condition of event definition '{definition_id}' cannot be evaluated: {reason}")]
    InvalidCondition {
        definition_id: String,
        reason: String,
    },

    #[error("consumer rejected events of definition '{definition_id}'")]
    Consumer {
        definition_id: String,
        #[source]
        source: ConsumerError,
    },
}

impl EventProcessorError {
    pub fn definition_id(&self) -> &str {
        match self {
            Self::SearchFailed { definition_id, .. }
            | Self::SearchTimeout { definition_id, .. }
            | Self::KeyFieldMismatch { definition_id, .. }
            | Self::InvalidDefinition { definition_id, .. }
            | Self::InvalidCondition { definition_id, .. }
            | Self::Consumer { definition_id, .. } => definition_id,
        }
    }

    /// Whether re-running the same window may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SearchFailed { .. } | Self::SearchTimeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, EventProcessorError>;
