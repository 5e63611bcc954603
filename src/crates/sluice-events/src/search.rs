//! What the engine needs from a search backend.

use crate::definition::{SeriesSpec, TimeRange};
use crate::error::SearchError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sluice_codec::Message;
use std::time::Duration;

/// Messages matching `query` in `streams` within `time_range`.
///
/// An empty stream list means all streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub query: String,
    pub streams: Vec<String>,
    pub time_range: TimeRange,
    pub batch_size: usize,
}

/// A grouped search.
///
/// With `bucket` set, rows are first grouped by time buckets of that width
/// starting at `time_range.from`, and the bucket start (RFC 3339) is the
/// first key component of every row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationQuery {
    pub query: String,
    pub streams: Vec<String>,
    pub time_range: TimeRange,
    pub group_by: Vec<String>,
    pub series: Vec<SeriesSpec>,
    pub bucket: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RowSource {
    /// A fully specified group
    Leaf,
    /// A subtotal over several groups
    NonLeaf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PivotValue {
    /// Id of the series this value belongs to
    pub key: String,
    pub value: Option<f64>,
    pub rollup: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PivotRow {
    pub key: Vec<String>,
    pub source: RowSource,
    pub values: Vec<PivotValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PivotResult {
    pub rows: Vec<PivotRow>,
    /// Number of messages the aggregation ran over
    pub total: u64,
}

#[async_trait]
pub trait ScrollCursor: Send {
    /// Next batch of matches, `None` once the result set is exhausted. An
    /// empty batch also ends the scroll.
    async fn next_batch(&mut self) -> Result<Option<Vec<Message>>, SearchError>;
}

#[async_trait]
pub trait SearchEngine: Send + Sync {
    async fn scroll(&self, query: &SearchQuery) -> Result<Box<dyn ScrollCursor>, SearchError>;

    async fn aggregate(&self, query: &AggregationQuery) -> Result<PivotResult, SearchError>;
}
